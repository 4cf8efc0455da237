//! Tiled, pool-parallel matrix-vector products over packed matrices.
//!
//! The matrix is row-major, `outer` rows by `inner` columns, stored as one
//! packed stream beginning at `mat_ofs`. Rows are partitioned into strips
//! (one pool task each); inside a strip, columns are walked in L1-sized
//! tiles so the vector slice and the row slices stay cache-resident. The
//! first tile initializes the output (plus the optional bias), later tiles
//! accumulate. Rows past the last whole strip run on the caller thread
//! after the pool join.
//!
//! For NUQ matrices, `inner` must be a multiple of the decode alignment
//! (16 samples); transformer layer widths satisfy this by construction.

// Kernel entry points mirror the packed-stream layout, so they carry the
// full coordinate set as arguments.
#![allow(clippy::too_many_arguments)]

use rayon::prelude::*;

use crate::codec::Codec;
use crate::fusion::{decompress_and_call, MulAddKernel};
use crate::kernel_types::{KernelFloat, LANES};
use crate::span::PackedSpan;

/// Column tile width: one vector slice plus a strip's row slices fit a
/// 32 KiB L1 cache.
pub const MAX_COLS: usize = 2048;

/// Rows per pool task: aim for ~128 work items, at least one vector, and a
/// power of two for cheap division.
pub fn rows_per_strip(outer: usize) -> usize {
    if outer < 128 {
        LANES
    } else {
        LANES.max(prev_pow2(outer / 128))
    }
}

#[inline]
fn prev_pow2(x: usize) -> usize {
    debug_assert!(x > 0);
    1 << (usize::BITS - 1 - x.leading_zeros())
}

/// Sets `out[r]` to the first partial dot product (plus `add` if present),
/// avoiding a zero-init pass over the strip.
fn set_first_partial_dot_products<C: Codec, V: KernelFloat, A: KernelFloat>(
    mat: PackedSpan<'_, C::Packed>,
    mat_ofs: usize,
    stride: usize,
    r0: usize,
    c0: usize,
    num_cols: usize,
    vec: &[V],
    add: Option<&[A]>,
    out: &mut [f32],
) {
    for (r, o) in out.iter_mut().enumerate() {
        let row_ofs = mat_ofs + (r0 + r) * stride;
        let init = add.map_or(0.0, |a| a[r0 + r].to_f32());
        *o = init
            + decompress_and_call::<C, V, _>(
                mat,
                row_ofs + c0,
                &vec[c0..c0 + num_cols],
                num_cols,
                &MulAddKernel,
            );
    }
}

/// Adds the partial dot products of one tile into `out`.
fn accumulate_partial_dot_products<C: Codec, V: KernelFloat>(
    mat: PackedSpan<'_, C::Packed>,
    mat_ofs: usize,
    stride: usize,
    r0: usize,
    c0: usize,
    num_cols: usize,
    vec: &[V],
    out: &mut [f32],
) {
    for (r, o) in out.iter_mut().enumerate() {
        let row_ofs = mat_ofs + (r0 + r) * stride;
        *o += decompress_and_call::<C, V, _>(
            mat,
            row_ofs + c0,
            &vec[c0..c0 + num_cols],
            num_cols,
            &MulAddKernel,
        );
    }
}

/// Full dot products for one horizontal strip, walking column tiles.
fn full_dot_products_for_strip<C: Codec, V: KernelFloat, A: KernelFloat>(
    mat: PackedSpan<'_, C::Packed>,
    mat_ofs: usize,
    stride: usize,
    r0: usize,
    vec: &[V],
    add: Option<&[A]>,
    out: &mut [f32],
) {
    // Tall and skinny: a single tile covers the row.
    if stride <= MAX_COLS {
        set_first_partial_dot_products::<C, V, A>(
            mat, mat_ofs, stride, r0, 0, stride, vec, add, out,
        );
        return;
    }

    set_first_partial_dot_products::<C, V, A>(
        mat, mat_ofs, stride, r0, 0, MAX_COLS, vec, add, out,
    );
    let mut c0 = MAX_COLS;
    while c0 + MAX_COLS <= stride {
        accumulate_partial_dot_products::<C, V>(mat, mat_ofs, stride, r0, c0, MAX_COLS, vec, out);
        c0 += MAX_COLS;
    }
    if c0 < stride {
        accumulate_partial_dot_products::<C, V>(mat, mat_ofs, stride, r0, c0, stride - c0, vec, out);
    }
}

fn mat_vec_impl<C: Codec, V: KernelFloat, A: KernelFloat>(
    mat: PackedSpan<'_, C::Packed>,
    mat_ofs: usize,
    outer: usize,
    inner: usize,
    vec: &[V],
    add: Option<&[A]>,
    out: &mut [f32],
    pool: &rayon::ThreadPool,
) {
    assert_eq!(vec.len(), inner, "vector length mismatch");
    assert_eq!(out.len(), outer, "output length mismatch");
    if let Some(a) = add {
        assert_eq!(a.len(), outer, "bias length mismatch");
    }
    mat.bounds_check(mat_ofs, outer * inner);

    let rps = rows_per_strip(outer);
    let num_strips = outer / rps;
    let (strips, rest) = out.split_at_mut(num_strips * rps);

    // For each entire strip.
    pool.install(|| {
        strips
            .par_chunks_exact_mut(rps)
            .enumerate()
            .for_each(|(strip, chunk)| {
                full_dot_products_for_strip::<C, V, A>(
                    mat,
                    mat_ofs,
                    inner,
                    strip * rps,
                    vec,
                    add,
                    chunk,
                );
            });
    });

    // Remaining rows, on the caller thread after the join.
    if !rest.is_empty() {
        full_dot_products_for_strip::<C, V, A>(
            mat,
            mat_ofs,
            inner,
            num_strips * rps,
            vec,
            add,
            rest,
        );
    }
}

/// `out[r] = sum_c mat[r, c] * vec[c]`.
pub fn mat_vec<C: Codec, V: KernelFloat>(
    mat: PackedSpan<'_, C::Packed>,
    mat_ofs: usize,
    outer: usize,
    inner: usize,
    vec: &[V],
    out: &mut [f32],
    pool: &rayon::ThreadPool,
) {
    mat_vec_impl::<C, V, f32>(mat, mat_ofs, outer, inner, vec, None, out, pool);
}

/// `out[r] = add[r] + sum_c mat[r, c] * vec[c]`.
pub fn mat_vec_add<C: Codec, V: KernelFloat, A: KernelFloat>(
    mat: PackedSpan<'_, C::Packed>,
    mat_ofs: usize,
    outer: usize,
    inner: usize,
    vec: &[V],
    add: &[A],
    out: &mut [f32],
    pool: &rayon::ThreadPool,
) {
    mat_vec_impl::<C, V, A>(mat, mat_ofs, outer, inner, vec, Some(add), out, pool);
}

fn two_mat_vec_impl<C: Codec, V: KernelFloat, A: KernelFloat>(
    mat0: PackedSpan<'_, C::Packed>,
    mat1: PackedSpan<'_, C::Packed>,
    mat_ofs: usize,
    outer: usize,
    inner: usize,
    vec: &[V],
    add0: Option<&[A]>,
    add1: Option<&[A]>,
    out0: &mut [f32],
    out1: &mut [f32],
    pool: &rayon::ThreadPool,
) {
    assert_eq!(vec.len(), inner, "vector length mismatch");
    assert_eq!(out0.len(), outer, "output length mismatch");
    assert_eq!(out1.len(), outer, "output length mismatch");
    mat0.bounds_check(mat_ofs, outer * inner);
    mat1.bounds_check(mat_ofs, outer * inner);

    let rps = rows_per_strip(outer);
    let num_strips = outer / rps;
    let (strips0, rest0) = out0.split_at_mut(num_strips * rps);
    let (strips1, rest1) = out1.split_at_mut(num_strips * rps);

    // For each entire strip.
    pool.install(|| {
        strips0
            .par_chunks_exact_mut(rps)
            .zip(strips1.par_chunks_exact_mut(rps))
            .enumerate()
            .for_each(|(strip, (chunk0, chunk1))| {
                let r0 = strip * rps;
                full_dot_products_for_strip::<C, V, A>(
                    mat0, mat_ofs, inner, r0, vec, add0, chunk0,
                );
                full_dot_products_for_strip::<C, V, A>(
                    mat1, mat_ofs, inner, r0, vec, add1, chunk1,
                );
            });
    });

    // Remaining rows, on the caller thread after the join.
    if !rest0.is_empty() {
        let r0 = num_strips * rps;
        full_dot_products_for_strip::<C, V, A>(mat0, mat_ofs, inner, r0, vec, add0, rest0);
        full_dot_products_for_strip::<C, V, A>(mat1, mat_ofs, inner, r0, vec, add1, rest1);
    }
}

/// Two matrices sharing one vector, one pool task per strip. Halves pool
/// overhead for the attention Q/K pattern.
pub fn two_mat_vec<C: Codec, V: KernelFloat>(
    mat0: PackedSpan<'_, C::Packed>,
    mat1: PackedSpan<'_, C::Packed>,
    mat_ofs: usize,
    outer: usize,
    inner: usize,
    vec: &[V],
    out0: &mut [f32],
    out1: &mut [f32],
    pool: &rayon::ThreadPool,
) {
    two_mat_vec_impl::<C, V, f32>(
        mat0, mat1, mat_ofs, outer, inner, vec, None, None, out0, out1, pool,
    );
}

/// As [`two_mat_vec`], with per-matrix bias vectors.
pub fn two_mat_vec_add<C: Codec, V: KernelFloat, A: KernelFloat>(
    mat0: PackedSpan<'_, C::Packed>,
    mat1: PackedSpan<'_, C::Packed>,
    mat_ofs: usize,
    outer: usize,
    inner: usize,
    vec: &[V],
    add0: &[A],
    add1: &[A],
    out0: &mut [f32],
    out1: &mut [f32],
    pool: &rayon::ThreadPool,
) {
    assert_eq!(add0.len(), outer, "bias length mismatch");
    assert_eq!(add1.len(), outer, "bias length mismatch");
    two_mat_vec_impl::<C, V, A>(
        mat0,
        mat1,
        mat_ofs,
        outer,
        inner,
        vec,
        Some(add0),
        Some(add1),
        out0,
        out1,
        pool,
    );
}

/// Serial two-offset variant: dot products of rows from two offsets of the
/// same packed stream, always with bias. Used where both halves of a fused
/// weight tensor feed one layer and pool dispatch would cost more than it
/// saves.
pub fn two_ofs_mat_vec_add<C: Codec, V: KernelFloat, A: KernelFloat>(
    mat: PackedSpan<'_, C::Packed>,
    mat_ofs0: usize,
    mat_ofs1: usize,
    outer: usize,
    inner: usize,
    vec: &[V],
    add0: &[A],
    add1: &[A],
    out0: &mut [f32],
    out1: &mut [f32],
) {
    assert_eq!(vec.len(), inner, "vector length mismatch");
    mat.bounds_check(mat_ofs0, outer * inner);
    mat.bounds_check(mat_ofs1, outer * inner);
    for r in 0..outer {
        out0[r] = add0[r].to_f32()
            + decompress_and_call::<C, V, _>(mat, mat_ofs0 + r * inner, vec, inner, &MulAddKernel);
        out1[r] = add1[r].to_f32()
            + decompress_and_call::<C, V, _>(mat, mat_ofs1 + r * inner, vec, inner, &MulAddKernel);
    }
}
