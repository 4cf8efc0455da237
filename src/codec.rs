//! The uniform codec interface plus the element-sized codecs (F32, BF16).
//!
//! Every codec maps logical sample offsets onto its packed storage and
//! offers the same three operations: bulk encode, a two-vector decode for
//! fused inner loops, and a zero-padding decode for tails. Dispatch is
//! compile-time; the inner loops are monomorphic per codec.

use bytemuck::Pod;
use half::bf16;
use wide::f32x8;

use crate::compress::CompressPerThread;
use crate::kernel_types::{padded_len, KernelFloat, LANES};
use crate::simd::{load_f32, load_kf, store_kf};
use crate::span::{PackedSpan, PackedSpanMut};

/// A packed weight representation.
///
/// Implementations are unit structs; all methods are associated functions so
/// codec choice stays a compile-time parameter of the surrounding kernel.
pub trait Codec {
    /// Storage element: `f32`, `bf16`, or an opaque byte newtype.
    type Packed: Copy + Default + Pod + Send + Sync + 'static;

    /// Blob key suffix identifying the packed type.
    const SUFFIX: &'static str;

    /// Storage elements needed for `num` logical samples.
    fn packed_len(num: usize) -> usize;

    /// Writes `raw.len()` samples at logical offset `ofs`.
    fn encode(
        raw: &[f32],
        tls: &mut CompressPerThread,
        packed: PackedSpanMut<'_, Self::Packed>,
        ofs: usize,
    );

    /// Decodes exactly `2 * LANES` consecutive samples starting at `ofs`.
    fn decode2(packed: PackedSpan<'_, Self::Packed>, ofs: usize) -> (f32x8, f32x8);

    /// Decodes `num` samples starting at `ofs`, then zero-fills `out` up to
    /// the next vector multiple. `out` must hold at least
    /// `padded_len(num)` elements; exactly that many are written.
    fn decode_and_zero_pad<T: KernelFloat>(
        packed: PackedSpan<'_, Self::Packed>,
        ofs: usize,
        out: &mut [T],
        num: usize,
    );
}

/// Verbatim f32 storage.
pub struct F32Codec;

impl F32Codec {
    /// Stores two vectors at `ofs`; used by normalization layers that write
    /// activations straight into packed buffers.
    pub fn store2(v0: f32x8, v1: f32x8, packed: &mut PackedSpanMut<'_, f32>, ofs: usize) {
        packed.bounds_check(ofs, 2 * LANES);
        packed.data[ofs..ofs + LANES].copy_from_slice(&v0.to_array());
        packed.data[ofs + LANES..ofs + 2 * LANES].copy_from_slice(&v1.to_array());
    }
}

impl Codec for F32Codec {
    type Packed = f32;
    const SUFFIX: &'static str = "_f32";

    #[inline]
    fn packed_len(num: usize) -> usize {
        num
    }

    fn encode(
        raw: &[f32],
        _tls: &mut CompressPerThread,
        mut packed: PackedSpanMut<'_, f32>,
        ofs: usize,
    ) {
        packed.bounds_check(ofs, raw.len());
        packed.data[ofs..ofs + raw.len()].copy_from_slice(raw);
    }

    #[inline]
    fn decode2(packed: PackedSpan<'_, f32>, ofs: usize) -> (f32x8, f32x8) {
        (
            load_f32(&packed.data[ofs..]),
            load_f32(&packed.data[ofs + LANES..]),
        )
    }

    fn decode_and_zero_pad<T: KernelFloat>(
        packed: PackedSpan<'_, f32>,
        ofs: usize,
        out: &mut [T],
        num: usize,
    ) {
        let padded = padded_len(num);
        assert!(out.len() >= padded, "output not padded to a vector");
        for (o, &x) in out.iter_mut().zip(&packed.data[ofs..ofs + num]) {
            *o = T::from_f32(x);
        }
        for o in out[num..padded].iter_mut() {
            *o = T::zero();
        }
    }
}

/// Brain-float storage: round-to-nearest-even demote on encode.
pub struct Bf16Codec;

impl Bf16Codec {
    /// Stores two f32 vectors as one vector's worth of BF16 elements.
    pub fn store2(v0: f32x8, v1: f32x8, packed: &mut PackedSpanMut<'_, bf16>, ofs: usize) {
        packed.bounds_check(ofs, 2 * LANES);
        store_kf(v0, &mut packed.data[ofs..ofs + LANES]);
        store_kf(v1, &mut packed.data[ofs + LANES..ofs + 2 * LANES]);
    }
}

impl Codec for Bf16Codec {
    type Packed = bf16;
    const SUFFIX: &'static str = "_bf16";

    #[inline]
    fn packed_len(num: usize) -> usize {
        num
    }

    fn encode(
        raw: &[f32],
        tls: &mut CompressPerThread,
        mut packed: PackedSpanMut<'_, bf16>,
        ofs: usize,
    ) {
        packed.bounds_check(ofs, raw.len());
        let out = &mut packed.data[ofs..ofs + raw.len()];
        for (o, &x) in out.iter_mut().zip(raw) {
            *o = bf16::from_f32(x);
        }
        if tls.collect_stats {
            for (&x, &o) in raw.iter().zip(out.iter()) {
                tls.stats.notify(x, o.to_f32());
            }
        }
    }

    #[inline]
    fn decode2(packed: PackedSpan<'_, bf16>, ofs: usize) -> (f32x8, f32x8) {
        (
            load_kf(&packed.data[ofs..]),
            load_kf(&packed.data[ofs + LANES..]),
        )
    }

    fn decode_and_zero_pad<T: KernelFloat>(
        packed: PackedSpan<'_, bf16>,
        ofs: usize,
        out: &mut [T],
        num: usize,
    ) {
        let padded = padded_len(num);
        assert!(out.len() >= padded, "output not padded to a vector");
        for (o, &x) in out.iter_mut().zip(&packed.data[ofs..ofs + num]) {
            *o = T::from_f32(x.to_f32());
        }
        for o in out[num..padded].iter_mut() {
            *o = T::zero();
        }
    }
}

/// Decodes two vectors from any packed stream after a bounds check.
#[inline(always)]
pub fn decompress2<C: Codec>(packed: PackedSpan<'_, C::Packed>, ofs: usize) -> (f32x8, f32x8) {
    packed.bounds_check(ofs, 2 * LANES);
    C::decode2(packed, ofs)
}

/// Decodes `num` samples and zero-pads `out` to the next vector multiple.
pub fn decompress_and_zero_pad<C: Codec, T: KernelFloat>(
    packed: PackedSpan<'_, C::Packed>,
    ofs: usize,
    out: &mut [T],
    num: usize,
) {
    packed.bounds_check(ofs, num);
    C::decode_and_zero_pad(packed, ofs, out, num);
}
