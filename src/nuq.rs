//! Non-uniform quantization: per-group K-means codebooks.
//!
//! The stream is a sequence of groups of [`GROUP_SIZE`] samples. Each group
//! stores its 16 cluster centers as BF16 (32 bytes) followed by 128 bytes of
//! packed 4-bit indices, one nibble per sample. Groups are self-contained,
//! so a group-aligned sub-region can be re-encoded without disturbing its
//! neighbors, and decode only ever touches the groups it overlaps.
//!
//! Logical offsets address samples. Encode offsets must be group-aligned;
//! decode offsets must be aligned to a vector pair (16 samples). Callers
//! needing finer reads re-decode the containing group.

use bytemuck::{Pod, Zeroable};
use half::bf16;
use wide::{f32x8, u16x8};

use crate::cluster::{cluster_exact_l2, ClusterBuf, CLUSTERS, GROUP_SIZE};
use crate::codec::Codec;
use crate::compress::CompressPerThread;
use crate::kernel_types::{padded_len, KernelFloat, LANES};
use crate::nibble::{ordered_pack_u16, ordered_unpack_u16, PACKED_BYTES};
use crate::span::{PackedSpan, PackedSpanMut};

/// Bytes of the per-group center table.
pub const TABLE_BYTES: usize = CLUSTERS * 2;

/// Bytes per packed group: center table plus one nibble per sample.
pub const GROUP_BYTES: usize = TABLE_BYTES + GROUP_SIZE / 2;

/// One byte of NUQ storage.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct NuqByte(pub u8);

/// Total storage bytes for `num` samples; the final group is padded.
#[inline]
pub const fn packed_end(num: usize) -> usize {
    num.div_ceil(GROUP_SIZE) * GROUP_BYTES
}

#[inline(always)]
fn group_base(ofs: usize) -> usize {
    (ofs / GROUP_SIZE) * GROUP_BYTES
}

/// Byte offset of the 8-byte nibble block holding samples
/// `[within, within + 16)` of a group.
#[inline(always)]
fn nibble_base(base: usize, within: usize) -> usize {
    debug_assert_eq!(within % (2 * LANES), 0);
    base + TABLE_BYTES + (within / 32) * PACKED_BYTES + if within % 32 == 16 { LANES } else { 0 }
}

fn store_table(data: &mut [NuqByte], base: usize, centers: &[f32; CLUSTERS]) {
    let table = &mut data[base..base + TABLE_BYTES];
    for (c, pair) in centers.iter().zip(table.chunks_exact_mut(2)) {
        let bits = bf16::from_f32(*c).to_bits().to_le_bytes();
        pair[0].0 = bits[0];
        pair[1].0 = bits[1];
    }
}

fn load_table(data: &[NuqByte], base: usize) -> [f32; CLUSTERS] {
    core::array::from_fn(|c| {
        let lo = data[base + 2 * c].0;
        let hi = data[base + 2 * c + 1].0;
        bf16::from_bits(u16::from_le_bytes([lo, hi])).to_f32()
    })
}

/// Expands 4-bit indices to their centers; the scalar rendering of a SIMD
/// table lookup.
#[inline(always)]
fn expand(table: &[f32; CLUSTERS], idx: u16x8) -> f32x8 {
    let a = idx.to_array();
    let arr: [f32; LANES] = core::array::from_fn(|i| table[(a[i] & 15) as usize]);
    f32x8::from(arr)
}

#[inline(always)]
fn load_half(data: &[NuqByte], nib: usize) -> [u8; LANES] {
    core::array::from_fn(|i| data[nib + i].0)
}

/// NUQ codec: byte stream, group-aligned encode, 4.x bits per sample.
pub struct NuqCodec;

impl NuqCodec {
    /// Encodes `raw` into groups starting at group-aligned sample offset
    /// `ofs`. Returns the total number of unused clusters across groups,
    /// which is zero for weight tensors with enough spread.
    pub fn enc(
        raw: &[f32],
        buf: &mut ClusterBuf,
        packed: &mut PackedSpanMut<'_, NuqByte>,
        ofs: usize,
    ) -> usize {
        assert_eq!(ofs % GROUP_SIZE, 0, "NUQ encode offset must be group-aligned");
        packed.bounds_check(ofs, raw.len());

        let mut centers = [0.0f32; CLUSTERS];
        let mut indices = [0u16; GROUP_SIZE];
        let mut unused_total = 0;

        for (g, group) in raw.chunks(GROUP_SIZE).enumerate() {
            let n = group.len();
            unused_total += cluster_exact_l2(group, buf, &mut centers, &mut indices[..n]);
            indices[n..].fill(0);

            let base = group_base(ofs) + g * GROUP_BYTES;
            store_table(packed.data, base, &centers);

            let nibbles = &mut packed.data[base + TABLE_BYTES..base + GROUP_BYTES];
            for (block, out) in indices
                .chunks_exact(4 * LANES)
                .zip(nibbles.chunks_exact_mut(PACKED_BYTES))
            {
                let v: [u16x8; 4] = core::array::from_fn(|k| {
                    let lanes: [u16; LANES] =
                        block[k * LANES..(k + 1) * LANES].try_into().unwrap();
                    u16x8::from(lanes)
                });
                let bytes = ordered_pack_u16(v[0], v[1], v[2], v[3]);
                for (o, b) in out.iter_mut().zip(bytes) {
                    o.0 = b;
                }
            }
        }
        unused_total
    }
}

impl Codec for NuqCodec {
    type Packed = NuqByte;
    const SUFFIX: &'static str = "_nuq";

    #[inline]
    fn packed_len(num: usize) -> usize {
        packed_end(num)
    }

    fn encode(
        raw: &[f32],
        tls: &mut CompressPerThread,
        mut packed: PackedSpanMut<'_, NuqByte>,
        ofs: usize,
    ) {
        NuqCodec::enc(raw, &mut tls.buf, &mut packed, ofs);

        if tls.collect_stats {
            let mut distorted = vec![0.0f32; padded_len(raw.len())];
            Self::decode_and_zero_pad(packed.as_const(), ofs, &mut distorted, raw.len());
            for (&x, &y) in raw.iter().zip(&distorted) {
                tls.stats.notify(x, y);
            }
        }
    }

    fn decode2(packed: PackedSpan<'_, NuqByte>, ofs: usize) -> (f32x8, f32x8) {
        assert_eq!(
            ofs % (2 * LANES),
            0,
            "NUQ decode offset must be vector-pair aligned"
        );
        let base = group_base(ofs);
        let table = load_table(packed.data, base);
        let half = load_half(packed.data, nibble_base(base, ofs % GROUP_SIZE));
        (
            expand(&table, ordered_unpack_u16::<0>(half)),
            expand(&table, ordered_unpack_u16::<1>(half)),
        )
    }

    fn decode_and_zero_pad<T: KernelFloat>(
        packed: PackedSpan<'_, NuqByte>,
        ofs: usize,
        out: &mut [T],
        num: usize,
    ) {
        assert_eq!(
            ofs % (2 * LANES),
            0,
            "NUQ decode offset must be vector-pair aligned"
        );
        let padded = padded_len(num);
        assert!(out.len() >= padded, "output not padded to a vector");

        let mut i = 0;
        while i < num {
            let pos = ofs + i;
            let within = pos % GROUP_SIZE;
            let base = group_base(pos);
            let table = load_table(packed.data, base);
            let in_group = (GROUP_SIZE - within).min(num - i);

            let mut j = 0;
            while j < in_group {
                let half = load_half(packed.data, nibble_base(base, within + j));
                let v0 = expand(&table, ordered_unpack_u16::<0>(half));
                let v1 = expand(&table, ordered_unpack_u16::<1>(half));
                let mut tmp = [0.0f32; 2 * LANES];
                tmp[..LANES].copy_from_slice(&v0.to_array());
                tmp[LANES..].copy_from_slice(&v1.to_array());

                let take = (in_group - j).min(2 * LANES);
                for k in 0..take {
                    out[i + j + k] = T::from_f32(tmp[k]);
                }
                j += take;
            }
            i += in_group;
        }
        for o in out[num..padded].iter_mut() {
            *o = T::zero();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{make_span, make_span_mut};

    #[test]
    fn packed_end_counts_whole_groups() {
        assert_eq!(packed_end(0), 0);
        assert_eq!(packed_end(1), GROUP_BYTES);
        assert_eq!(packed_end(GROUP_SIZE), GROUP_BYTES);
        assert_eq!(packed_end(GROUP_SIZE + 1), 2 * GROUP_BYTES);
    }

    #[test]
    fn nibble_blocks_do_not_overlap() {
        let mut seen = [false; GROUP_SIZE / 2];
        for within in (0..GROUP_SIZE).step_by(2 * LANES) {
            let nib = nibble_base(0, within) - TABLE_BYTES;
            for b in nib..nib + LANES {
                assert!(!seen[b], "byte {b} hit twice");
                seen[b] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn single_group_round_trip_hits_all_centers() {
        // 16 exact plateau levels survive BF16 center storage untouched.
        let input: Vec<f32> = (0..GROUP_SIZE)
            .map(|i| (i / (GROUP_SIZE / CLUSTERS)) as f32 / 16.0 - 0.5)
            .collect();
        let mut storage = vec![NuqByte(0); packed_end(GROUP_SIZE)];
        let mut span = make_span_mut(&mut storage, GROUP_SIZE);
        let mut buf = ClusterBuf::default();
        let unused = NuqCodec::enc(&input, &mut buf, &mut span, 0);
        assert_eq!(unused, 0);

        let mut out = vec![0.0f32; GROUP_SIZE];
        NuqCodec::decode_and_zero_pad(make_span(&storage, GROUP_SIZE), 0, &mut out, GROUP_SIZE);
        assert_eq!(out, input);
    }

    #[test]
    fn decode2_matches_decode_and_zero_pad() {
        let input: Vec<f32> = (0..GROUP_SIZE).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut storage = vec![NuqByte(0); packed_end(GROUP_SIZE)];
        let mut span = make_span_mut(&mut storage, GROUP_SIZE);
        let mut buf = ClusterBuf::default();
        NuqCodec::enc(&input, &mut buf, &mut span, 0);

        let span = make_span(&storage, GROUP_SIZE);
        let mut all = vec![0.0f32; GROUP_SIZE];
        NuqCodec::decode_and_zero_pad(span, 0, &mut all, GROUP_SIZE);
        for ofs in (0..GROUP_SIZE).step_by(2 * LANES) {
            let (v0, v1) = NuqCodec::decode2(span, ofs);
            assert_eq!(v0.to_array().as_slice(), &all[ofs..ofs + LANES]);
            assert_eq!(v1.to_array().as_slice(), &all[ofs + LANES..ofs + 2 * LANES]);
        }
    }

    #[test]
    #[should_panic(expected = "group-aligned")]
    fn misaligned_encode_panics() {
        let input = [0.0f32; GROUP_SIZE];
        let mut storage = vec![NuqByte(0); packed_end(2 * GROUP_SIZE)];
        let mut span = make_span_mut(&mut storage, 2 * GROUP_SIZE);
        let mut buf = ClusterBuf::default();
        NuqCodec::enc(&input, &mut buf, &mut span, 17);
    }
}
