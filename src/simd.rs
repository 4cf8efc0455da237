//! Fixed-width lane helpers over the portable `wide` vectors.
//!
//! All compute happens in the f32 domain; BF16 inputs are promoted on load.
//! Public codec and matvec APIs only expose slices, so the vector types stay
//! an implementation detail except for the accumulation-kernel extension
//! point in `fusion`.

use wide::f32x8;

use crate::kernel_types::{KernelFloat, LANES};

/// Loads one vector from the first `LANES` elements of `src`.
#[inline(always)]
pub fn load_f32(src: &[f32]) -> f32x8 {
    let arr: [f32; LANES] = src[..LANES].try_into().unwrap();
    f32x8::from(arr)
}

/// Loads one vector, promoting each element to f32.
#[inline(always)]
pub fn load_kf<T: KernelFloat>(src: &[T]) -> f32x8 {
    let arr: [f32; LANES] = core::array::from_fn(|i| src[i].to_f32());
    f32x8::from(arr)
}

/// Stores one vector into the first `LANES` elements of `dst`.
#[inline(always)]
pub fn store_f32(v: f32x8, dst: &mut [f32]) {
    dst[..LANES].copy_from_slice(&v.to_array());
}

/// Stores one vector, demoting each lane to `T`.
#[inline(always)]
pub fn store_kf<T: KernelFloat>(v: f32x8, dst: &mut [T]) {
    let arr = v.to_array();
    for (d, x) in dst[..LANES].iter_mut().zip(arr) {
        *d = T::from_f32(x);
    }
}
