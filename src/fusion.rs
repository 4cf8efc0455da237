//! Fused decompress-and-accumulate: the inner loop behind every dot product.
//!
//! Walks a packed stream and an uncompressed vector four vectors at a time,
//! handing decoded lanes to an accumulation kernel. Tails are decoded
//! through stack buffers that the codecs zero-pad, so the kernel always
//! sees whole, well-defined vectors and needs no masking.

use wide::f32x8;

use crate::codec::{decompress2, decompress_and_zero_pad, Codec};
use crate::kernel_types::{KernelFloat, LANES};
use crate::simd::{load_f32, load_kf};
use crate::span::PackedSpan;

/// An accumulation kernel: four-way unrolled f32 sums plus compensation
/// vectors for kernels that carry a Kahan-style error term.
pub trait DotKernel {
    fn update4(
        &self,
        w: [f32x8; 4],
        v: [f32x8; 4],
        sum: &mut [f32x8; 4],
        comp: &mut [f32x8; 4],
    );
    fn update1(&self, w0: f32x8, v0: f32x8, sum0: &mut f32x8, comp0: &mut f32x8);
    fn reduce(&self, sum: [f32x8; 4], comp: [f32x8; 4]) -> f32;
}

/// Plain fused multiply-add; compensation vectors stay zero.
pub struct MulAddKernel;

impl DotKernel for MulAddKernel {
    #[inline(always)]
    fn update4(
        &self,
        w: [f32x8; 4],
        v: [f32x8; 4],
        sum: &mut [f32x8; 4],
        _comp: &mut [f32x8; 4],
    ) {
        for k in 0..4 {
            sum[k] = w[k].mul_add(v[k], sum[k]);
        }
    }

    #[inline(always)]
    fn update1(&self, w0: f32x8, v0: f32x8, sum0: &mut f32x8, _comp0: &mut f32x8) {
        *sum0 = w0.mul_add(v0, *sum0);
    }

    #[inline(always)]
    fn reduce(&self, sum: [f32x8; 4], _comp: [f32x8; 4]) -> f32 {
        ((sum[0] + sum[1]) + (sum[2] + sum[3])).reduce_add()
    }
}

/// Kahan-compensated accumulation: each product is added with an error
/// term recovered into the compensation vector.
pub struct CompensatedKernel;

#[inline(always)]
fn kahan_add(x: f32x8, sum: &mut f32x8, comp: &mut f32x8) {
    let y = x - *comp;
    let t = *sum + y;
    *comp = (t - *sum) - y;
    *sum = t;
}

impl DotKernel for CompensatedKernel {
    #[inline(always)]
    fn update4(
        &self,
        w: [f32x8; 4],
        v: [f32x8; 4],
        sum: &mut [f32x8; 4],
        comp: &mut [f32x8; 4],
    ) {
        for k in 0..4 {
            kahan_add(w[k] * v[k], &mut sum[k], &mut comp[k]);
        }
    }

    #[inline(always)]
    fn update1(&self, w0: f32x8, v0: f32x8, sum0: &mut f32x8, comp0: &mut f32x8) {
        kahan_add(w0 * v0, sum0, comp0);
    }

    #[inline(always)]
    fn reduce(&self, sum: [f32x8; 4], comp: [f32x8; 4]) -> f32 {
        let lo = (sum[0] - comp[0]) + (sum[1] - comp[1]);
        let hi = (sum[2] - comp[2]) + (sum[3] - comp[3]);
        (lo + hi).reduce_add()
    }
}

/// Decodes `num` samples from the packed stream `w` (starting at `w_ofs`)
/// and from `vec` in lockstep, feeding the kernel; returns its reduction.
///
/// `num` need not be a vector multiple; the tail is decoded into
/// zero-padded stack buffers and fed one vector at a time.
pub fn decompress_and_call<C: Codec, V: KernelFloat, K: DotKernel>(
    w: PackedSpan<'_, C::Packed>,
    w_ofs: usize,
    vec: &[V],
    num: usize,
    kernel: &K,
) -> f32 {
    assert!(vec.len() >= num, "vector shorter than num");

    let mut sum = [f32x8::ZERO; 4];
    let mut comp = [f32x8::ZERO; 4];

    let mut i = 0;
    if num >= 4 * LANES {
        while i <= num - 4 * LANES {
            let (w0, w1) = decompress2::<C>(w, w_ofs + i);
            let (w2, w3) = decompress2::<C>(w, w_ofs + i + 2 * LANES);
            let v0 = load_kf(&vec[i..]);
            let v1 = load_kf(&vec[i + LANES..]);
            let v2 = load_kf(&vec[i + 2 * LANES..]);
            let v3 = load_kf(&vec[i + 3 * LANES..]);
            kernel.update4([w0, w1, w2, w3], [v0, v1, v2, v3], &mut sum, &mut comp);
            i += 4 * LANES;
        }
    }

    let remaining = num - i;
    if remaining != 0 {
        let mut padded_w = [0.0f32; 4 * LANES];
        let mut padded_v = [0.0f32; 4 * LANES];
        decompress_and_zero_pad::<C, f32>(w, w_ofs + i, &mut padded_w, remaining);
        for (p, x) in padded_v.iter_mut().zip(&vec[i..num]) {
            *p = x.to_f32();
        }

        // 1..4 whole vectors, zero-padded past the logical end.
        let mut pos = 0;
        while pos < remaining {
            let w0 = load_f32(&padded_w[pos..]);
            let v0 = load_f32(&padded_v[pos..]);
            kernel.update1(w0, v0, &mut sum[0], &mut comp[0]);
            pos += LANES;
        }
    }

    kernel.reduce(sum, comp)
}

/// Single-input variant: the decoded vectors are passed as both the `w` and
/// `v` kernel arguments (the self-dot convention used by RMSNorm-style
/// reductions).
pub fn decompress_and_call_single<V: KernelFloat, K: DotKernel>(
    vec: &[V],
    num: usize,
    kernel: &K,
) -> f32 {
    assert!(vec.len() >= num, "vector shorter than num");

    let mut sum = [f32x8::ZERO; 4];
    let mut comp = [f32x8::ZERO; 4];

    let mut i = 0;
    if num >= 4 * LANES {
        while i <= num - 4 * LANES {
            let v0 = load_kf(&vec[i..]);
            let v1 = load_kf(&vec[i + LANES..]);
            let v2 = load_kf(&vec[i + 2 * LANES..]);
            let v3 = load_kf(&vec[i + 3 * LANES..]);
            kernel.update4([v0, v1, v2, v3], [v0, v1, v2, v3], &mut sum, &mut comp);
            i += 4 * LANES;
        }
    }

    let remaining = num - i;
    if remaining != 0 {
        let mut padded_v = [0.0f32; 4 * LANES];
        for (p, x) in padded_v.iter_mut().zip(&vec[i..num]) {
            *p = x.to_f32();
        }
        let mut pos = 0;
        while pos < remaining {
            let v0 = load_f32(&padded_v[pos..]);
            kernel.update1(v0, v0, &mut sum[0], &mut comp[0]);
            pos += LANES;
        }
    }

    kernel.reduce(sum, comp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::F32Codec;
    use crate::span::make_span;

    fn reference_dot(a: &[f32], b: &[f32]) -> f64 {
        a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
    }

    #[test]
    fn matches_reference_at_awkward_lengths() {
        for num in [1, 7, 8, 9, 31, 32, 33, 100, 256] {
            let w: Vec<f32> = (0..num).map(|i| (i as f32 * 0.3).sin()).collect();
            let v: Vec<f32> = (0..num).map(|i| (i as f32 * 0.7).cos()).collect();
            let got = decompress_and_call::<F32Codec, f32, _>(
                make_span(&w, num),
                0,
                &v,
                num,
                &MulAddKernel,
            );
            let want = reference_dot(&w, &v);
            assert!(
                (got as f64 - want).abs() < 1e-4 * want.abs().max(1.0),
                "num={num} got={got} want={want}"
            );
        }
    }

    #[test]
    fn compensated_matches_mul_add_closely() {
        let num = 500;
        let w: Vec<f32> = (0..num).map(|i| ((i * 37) % 101) as f32 - 50.0).collect();
        let v: Vec<f32> = (0..num).map(|i| ((i * 17) % 89) as f32 * 1e-3).collect();
        let span = make_span(&w, num);
        let a = decompress_and_call::<F32Codec, f32, _>(span, 0, &v, num, &MulAddKernel);
        let b = decompress_and_call::<F32Codec, f32, _>(span, 0, &v, num, &CompensatedKernel);
        let want = reference_dot(&w, &v);
        assert!((b as f64 - want).abs() <= (a as f64 - want).abs() + 1e-3);
    }

    #[test]
    fn single_input_is_sum_of_squares() {
        let v: Vec<f32> = (0..40).map(|i| i as f32 * 0.25).collect();
        let got = decompress_and_call_single(&v, v.len(), &MulAddKernel);
        let want: f64 = v.iter().map(|x| (*x as f64) * (*x as f64)).sum();
        assert!((got as f64 - want).abs() < 1e-3);
    }
}
