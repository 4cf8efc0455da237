//! Switching floating point: an 8-bit weight format.
//!
//! One byte per sample: a sign bit plus a 7-bit magnitude code that switches
//! between 3 mantissa bits (magnitudes in `[2^-7, 1.875]`) and 2 mantissa
//! bits (below `2^-7`), trading precision for dynamic range exactly where
//! weight distributions are dense. The magnitude code is monotone, so
//! encoding is a nearest-neighbor search over a 128-entry table and decoded
//! values re-encode bit-exactly.
//!
//! Callers must pre-scale tensors so magnitudes stay within [`SFP_MAX`];
//! see `Compressor::add_scales` for where the scale factors are recorded.

use std::sync::OnceLock;

use bytemuck::{Pod, Zeroable};

use crate::codec::Codec;
use crate::compress::CompressPerThread;
use crate::kernel_types::{padded_len, KernelFloat, LANES};
use crate::span::{PackedSpan, PackedSpanMut};
use wide::f32x8;

/// Largest encodable magnitude.
pub const SFP_MAX: f32 = 1.875;

/// One packed SFP sample.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SfpByte(pub u8);

const MAG_CODES: usize = 128;

/// Magnitude of code `m` in `[0, 128)`. Code 0 is zero; codes `[1, 0x40)`
/// carry 2 mantissa bits with exponents `2^-23..2^-8`; codes `[0x40, 0x80)`
/// carry 3 mantissa bits with exponents `2^-7..2^0`.
fn magnitude(m: usize) -> f32 {
    debug_assert!(m < MAG_CODES);
    if m == 0 {
        0.0
    } else if m < 0x40 {
        let e = (m >> 2) as i32;
        let f = (m & 3) as f32;
        (1.0 + f / 4.0) * exp2i(e - 23)
    } else {
        let e = ((m >> 3) & 7) as i32;
        let f = (m & 7) as f32;
        (1.0 + f / 8.0) * exp2i(e - 7)
    }
}

#[inline(always)]
fn exp2i(e: i32) -> f32 {
    f32::from_bits(((127 + e) as u32) << 23)
}

fn mag_table() -> &'static [f32; MAG_CODES] {
    static TABLE: OnceLock<[f32; MAG_CODES]> = OnceLock::new();
    TABLE.get_or_init(|| core::array::from_fn(magnitude))
}

/// Full byte -> f32 decode table, sign included.
fn dec_table() -> &'static [f32; 256] {
    static TABLE: OnceLock<[f32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        core::array::from_fn(|b| {
            let mag = magnitude(b & 0x7F);
            if b & 0x80 != 0 {
                -mag
            } else {
                mag
            }
        })
    })
}

/// Encodes one sample. Magnitudes above [`SFP_MAX`] are clamped; staying in
/// range is the caller's contract.
pub fn enc_one(x: f32) -> SfpByte {
    debug_assert!(x.abs() <= SFP_MAX, "SFP input {x} exceeds {SFP_MAX}");
    let table = mag_table();
    let mag = x.abs().min(SFP_MAX);

    // The table is monotone: find the first code >= mag, then pick the
    // nearer neighbor, ties to the even code.
    let hi = table.partition_point(|&t| t < mag);
    let m = if hi == 0 {
        0
    } else if hi >= MAG_CODES {
        MAG_CODES - 1
    } else {
        let lo = hi - 1;
        let d_lo = mag - table[lo];
        let d_hi = table[hi] - mag;
        if d_lo < d_hi || (d_lo == d_hi && lo % 2 == 0) {
            lo
        } else {
            hi
        }
    };
    if m == 0 {
        return SfpByte(0);
    }
    let sign = if x < 0.0 { 0x80 } else { 0 };
    SfpByte(sign | m as u8)
}

/// Decodes one sample.
#[inline(always)]
pub fn dec_one(b: SfpByte) -> f32 {
    dec_table()[b.0 as usize]
}

/// SFP codec: 1 byte per sample, offsets are sample counts.
pub struct SfpCodec;

impl Codec for SfpCodec {
    type Packed = SfpByte;
    const SUFFIX: &'static str = "_sfp";

    #[inline]
    fn packed_len(num: usize) -> usize {
        num
    }

    fn encode(
        raw: &[f32],
        tls: &mut CompressPerThread,
        mut packed: PackedSpanMut<'_, SfpByte>,
        ofs: usize,
    ) {
        packed.bounds_check(ofs, raw.len());
        let out = &mut packed.data[ofs..ofs + raw.len()];
        for (o, &x) in out.iter_mut().zip(raw) {
            *o = enc_one(x);
        }
        if tls.collect_stats {
            for (&x, &o) in raw.iter().zip(out.iter()) {
                tls.stats.notify(x, dec_one(o));
            }
        }
    }

    #[inline]
    fn decode2(packed: PackedSpan<'_, SfpByte>, ofs: usize) -> (f32x8, f32x8) {
        let table = dec_table();
        let bytes = &packed.data[ofs..ofs + 2 * LANES];
        let arr: [f32; 2 * LANES] = core::array::from_fn(|i| table[bytes[i].0 as usize]);
        let lo: [f32; LANES] = arr[..LANES].try_into().unwrap();
        let hi: [f32; LANES] = arr[LANES..].try_into().unwrap();
        (f32x8::from(lo), f32x8::from(hi))
    }

    fn decode_and_zero_pad<T: KernelFloat>(
        packed: PackedSpan<'_, SfpByte>,
        ofs: usize,
        out: &mut [T],
        num: usize,
    ) {
        let padded = padded_len(num);
        assert!(out.len() >= padded, "output not padded to a vector");
        let table = dec_table();
        let src = &packed.data[ofs..ofs + num];
        for (o, &b) in out.iter_mut().zip(src) {
            *o = T::from_f32(table[b.0 as usize]);
        }
        for o in out[num..padded].iter_mut() {
            *o = T::zero();
        }
    }
}
