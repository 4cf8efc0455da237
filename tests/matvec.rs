//! MatVec engine: literal shapes, codec-packed matrices, the two-matrix
//! variant's determinism, and the fused dot product.

use half::bf16;
use rand::prelude::*;

use weightpack::{
    compress, decompress_and_call, decompress_and_zero_pad, make_span, make_span_mut, mat_vec,
    mat_vec_add, padded_len, two_mat_vec, two_mat_vec_add, two_ofs_mat_vec_add, Bf16Codec, Codec,
    Compressor, CompressWorkingSet, F32Codec, MemoryBlobSink, MulAddKernel, NuqByte, NuqCodec,
    SfpCodec,
};

fn pool(threads: usize) -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .unwrap()
}

fn random_vec(n: usize, seed: u64, scale: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| (rng.gen::<f32>() - 0.5) * scale).collect()
}

/// Reference product against the decoded matrix, accumulated in f64.
fn reference_mat_vec(mat: &[f32], vec: &[f32], add: Option<&[f32]>, outer: usize, inner: usize) -> Vec<f32> {
    (0..outer)
        .map(|r| {
            let row = &mat[r * inner..(r + 1) * inner];
            let dot: f64 = row
                .iter()
                .zip(vec)
                .map(|(m, v)| *m as f64 * *v as f64)
                .sum();
            (add.map_or(0.0, |a| a[r] as f64) + dot) as f32
        })
        .collect()
}

// Identity matrix: output equals the vector.
#[test]
fn identity_matrix_passes_vector_through() {
    let outer = 4;
    let inner = 4;
    let mut mat = vec![0.0f32; outer * inner];
    for i in 0..outer {
        mat[i * inner + i] = 1.0;
    }
    let vec = [7.0f32, -1.0, 0.0, 3.0];
    let mut out = vec![0.0f32; outer];
    mat_vec::<F32Codec, f32>(
        make_span(&mat, mat.len()),
        0,
        outer,
        inner,
        &vec,
        &mut out,
        &pool(2),
    );
    assert_eq!(out, vec![7.0, -1.0, 0.0, 3.0]);
}

// All-ones matrix with bias.
#[test]
fn bias_is_added_once() {
    let mat = [1.0f32, 1.0, 1.0, 1.0];
    let vec = [2.0f32, 3.0];
    let add = [10.0f32, -10.0];
    let mut out = vec![0.0f32; 2];
    mat_vec_add::<F32Codec, f32, f32>(
        make_span(&mat, 4),
        0,
        2,
        2,
        &vec,
        &add,
        &mut out,
        &pool(2),
    );
    assert_eq!(out, vec![15.0, -5.0]);
}

// Large f32 matrix spanning several strips and column tiles.
#[test]
fn tiled_f32_matches_reference() {
    let outer = 256;
    let inner = 3000;
    let mat = random_vec(outer * inner, 10, 0.1);
    let vec = random_vec(inner, 11, 1.0);
    let add = random_vec(outer, 12, 2.0);
    let mut out = vec![0.0f32; outer];
    mat_vec_add::<F32Codec, f32, f32>(
        make_span(&mat, mat.len()),
        0,
        outer,
        inner,
        &vec,
        &add,
        &mut out,
        &pool(4),
    );
    let want = reference_mat_vec(&mat, &vec, Some(&add), outer, inner);
    for (r, (a, b)) in out.iter().zip(&want).enumerate() {
        assert!(
            (a - b).abs() <= 1e-3 * b.abs().max(1.0),
            "row {r}: {a} vs {b}"
        );
    }
}

// Packed matrices: the product matches the product of the decoded matrix.
fn packed_matches_decoded<C: Codec>(seed: u64, tol: f32) {
    let outer = 64;
    let inner = 512;
    let raw = random_vec(outer * inner, seed, 1.0);
    let mut packed = vec![C::Packed::default(); C::packed_len(raw.len())];
    let mut work = CompressWorkingSet::default();
    let p = pool(3);
    compress::<C>(&raw, &mut work, make_span_mut(&mut packed, raw.len()), 0, &p);

    let span = make_span(&packed, raw.len());
    let mut decoded = vec![0.0f32; padded_len(raw.len())];
    decompress_and_zero_pad::<C, f32>(span, 0, &mut decoded, raw.len());

    let vec = random_vec(inner, seed + 1, 1.0);
    let mut out = vec![0.0f32; outer];
    mat_vec::<C, f32>(span, 0, outer, inner, &vec, &mut out, &p);

    let want = reference_mat_vec(&decoded[..raw.len()], &vec, None, outer, inner);
    for (r, (a, b)) in out.iter().zip(&want).enumerate() {
        assert!(
            (a - b).abs() <= tol * b.abs().max(1.0),
            "row {r}: {a} vs {b}"
        );
    }
}

#[test]
fn bf16_matrix_matches_decoded() {
    packed_matches_decoded::<Bf16Codec>(20, 1e-4);
}

#[test]
fn sfp_matrix_matches_decoded() {
    packed_matches_decoded::<SfpCodec>(21, 1e-4);
}

#[test]
fn nuq_matrix_matches_decoded() {
    packed_matches_decoded::<NuqCodec>(22, 1e-4);
}

// Row counts that are not a strip multiple leave a remainder processed by
// the caller thread; the split must cover every row exactly once.
#[test]
fn remainder_rows_match_reference() {
    let outer = 100; // 12 strips of 8 plus 4 remainder rows
    let inner = 96;
    let mat = random_vec(outer * inner, 15, 1.0);
    let vec = random_vec(inner, 16, 1.0);
    let mut out = vec![0.0f32; outer];
    mat_vec::<F32Codec, f32>(
        make_span(&mat, mat.len()),
        0,
        outer,
        inner,
        &vec,
        &mut out,
        &pool(3),
    );
    let want = reference_mat_vec(&mat, &vec, None, outer, inner);
    for (r, (a, b)) in out.iter().zip(&want).enumerate() {
        assert!(
            (a - b).abs() <= 1e-4 * b.abs().max(1.0),
            "row {r}: {a} vs {b}"
        );
    }
}

// TwoMatVec equals two independent MatVec calls bit-for-bit, including the
// caller-thread remainder rows.
#[test]
fn two_mat_vec_is_bit_equal_to_two_calls() {
    let outer = 150; // 18 strips of 8 plus 6 remainder rows
    let inner = 256;
    let m0 = random_vec(outer * inner, 30, 1.0);
    let m1 = random_vec(outer * inner, 31, 1.0);
    let vec = random_vec(inner, 32, 1.0);
    let p = pool(4);

    let span0 = make_span(&m0, m0.len());
    let span1 = make_span(&m1, m1.len());
    let mut a0 = vec![0.0f32; outer];
    let mut a1 = vec![0.0f32; outer];
    two_mat_vec::<F32Codec, f32>(span0, span1, 0, outer, inner, &vec, &mut a0, &mut a1, &p);

    let mut b0 = vec![0.0f32; outer];
    let mut b1 = vec![0.0f32; outer];
    mat_vec::<F32Codec, f32>(span0, 0, outer, inner, &vec, &mut b0, &p);
    mat_vec::<F32Codec, f32>(span1, 0, outer, inner, &vec, &mut b1, &p);

    for r in 0..outer {
        assert_eq!(a0[r].to_bits(), b0[r].to_bits(), "row {r}");
        assert_eq!(a1[r].to_bits(), b1[r].to_bits(), "row {r}");
    }
}

#[test]
fn two_mat_vec_add_applies_both_biases() {
    let outer = 16;
    let inner = 32;
    let m0 = random_vec(outer * inner, 40, 1.0);
    let m1 = random_vec(outer * inner, 41, 1.0);
    let vec = random_vec(inner, 42, 1.0);
    let add0 = random_vec(outer, 43, 1.0);
    let add1 = random_vec(outer, 44, 1.0);
    let p = pool(2);

    let mut out0 = vec![0.0f32; outer];
    let mut out1 = vec![0.0f32; outer];
    two_mat_vec_add::<F32Codec, f32, f32>(
        make_span(&m0, m0.len()),
        make_span(&m1, m1.len()),
        0,
        outer,
        inner,
        &vec,
        &add0,
        &add1,
        &mut out0,
        &mut out1,
        &p,
    );

    let want0 = reference_mat_vec(&m0, &vec, Some(&add0), outer, inner);
    let want1 = reference_mat_vec(&m1, &vec, Some(&add1), outer, inner);
    for r in 0..outer {
        assert!((out0[r] - want0[r]).abs() < 1e-4);
        assert!((out1[r] - want1[r]).abs() < 1e-4);
    }
}

#[test]
fn two_ofs_variant_reads_both_halves() {
    let outer = 8;
    let inner = 16;
    // One stream holding two stacked matrices.
    let m = random_vec(2 * outer * inner, 50, 1.0);
    let vec = random_vec(inner, 51, 1.0);
    let add = vec![0.0f32; outer];
    let mut out0 = vec![0.0f32; outer];
    let mut out1 = vec![0.0f32; outer];
    two_ofs_mat_vec_add::<F32Codec, f32, f32>(
        make_span(&m, m.len()),
        0,
        outer * inner,
        outer,
        inner,
        &vec,
        &add,
        &add,
        &mut out0,
        &mut out1,
    );
    let want0 = reference_mat_vec(&m[..outer * inner], &vec, None, outer, inner);
    let want1 = reference_mat_vec(&m[outer * inner..], &vec, None, outer, inner);
    for r in 0..outer {
        assert!((out0[r] - want0[r]).abs() < 1e-4);
        assert!((out1[r] - want1[r]).abs() < 1e-4);
    }
}

// Dot product over two identical BF16 streams of ones.
#[test]
fn fused_dot_of_ones() {
    let ones = [bf16::ONE; 5];
    let packed: Vec<bf16> = ones.to_vec();
    let got = decompress_and_call::<Bf16Codec, bf16, _>(
        make_span(&packed, packed.len()),
        0,
        &ones,
        5,
        &MulAddKernel,
    );
    assert_eq!(got, 5.0);
}

// Offline flow: Compressor builds blobs, inference reads them back.
#[test]
fn compressor_blobs_drive_matvec() {
    let outer = 32;
    let inner = 256;
    let raw = random_vec(outer * inner, 60, 1.0);
    let p = pool(2);

    let mut comp = Compressor::new(&p, MemoryBlobSink::default());
    let mut packed = vec![NuqByte(0); NuqCodec::packed_len(raw.len())];
    comp.insert::<NuqCodec>("ffn_w", &raw, &mut packed).unwrap();
    comp.write_all().unwrap();
    let sink = comp.into_sink();

    let blob = sink.get("ffn_w_nuq").unwrap();
    let restored: &[NuqByte] = bytemuck::cast_slice(blob);
    let span = make_span(restored, raw.len());

    let vec = random_vec(inner, 61, 1.0);
    let mut out = vec![0.0f32; outer];
    mat_vec::<NuqCodec, f32>(span, 0, outer, inner, &vec, &mut out, &p);

    let mut decoded = vec![0.0f32; raw.len()];
    decompress_and_zero_pad::<NuqCodec, f32>(span, 0, &mut decoded, raw.len());
    let want = reference_mat_vec(&decoded, &vec, None, outer, inner);
    for r in 0..outer {
        assert!((out[r] - want[r]).abs() <= 1e-4 * want[r].abs().max(1.0));
    }
}
