//! Element types shared across codecs and kernels.

use half::bf16;

/// Number of f32 lanes per SIMD vector on the portable path.
pub const LANES: usize = 8;

/// Rounds `num` up to a whole number of vectors.
#[inline(always)]
pub const fn padded_len(num: usize) -> usize {
    num.div_ceil(LANES) * LANES
}

/// Trait for kernel-compatible floating point types.
/// Implemented for f32 and half::bf16. Zero-cost via monomorphization.
pub trait KernelFloat: Copy + Default + Send + Sync + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
    fn zero() -> Self;
}

impl KernelFloat for f32 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
    #[inline(always)]
    fn zero() -> Self {
        0.0
    }
}

impl KernelFloat for bf16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        // Round-to-nearest-even, not truncation.
        bf16::from_f32(v)
    }
    #[inline(always)]
    fn zero() -> Self {
        bf16::ZERO
    }
}
