//! weightpack: weight-compression kernels for dense transformer inference.
//!
//! Encodes f32 weight tensors into packed representations (verbatim f32,
//! BF16, 8-bit switching float, non-uniform 4-bit quantization), decodes
//! arbitrary sub-ranges back into f32 or BF16 vectors, and fuses decoding
//! with accumulation kernels to drive tiled, pool-parallel matrix-vector
//! products. Weights are compressed offline and decompressed online; the
//! packed streams are read-only at inference time.

pub mod cluster;
pub mod codec;
pub mod compress;
pub mod fusion;
pub mod kernel_types;
pub mod matvec;
pub mod nibble;
pub mod nuq;
pub mod sfp;
pub mod simd;
pub mod span;
pub mod stats;

pub use cluster::{cluster_exact_l2, ClusterBuf, CLUSTERS, GROUP_SIZE};
pub use codec::{decompress2, decompress_and_zero_pad, Bf16Codec, Codec, F32Codec};
pub use compress::{
    compress, compress_with, BlobError, BlobSink, Compressor, CompressConfig,
    CompressPerThread, CompressWorkingSet, MemoryBlobSink, BATCH,
};
pub use fusion::{
    decompress_and_call, decompress_and_call_single, CompensatedKernel, DotKernel, MulAddKernel,
};
pub use kernel_types::{padded_len, KernelFloat, LANES};
pub use matvec::{
    mat_vec, mat_vec_add, rows_per_strip, two_mat_vec, two_mat_vec_add, two_ofs_mat_vec_add,
    MAX_COLS,
};
pub use nuq::{packed_end, NuqByte, NuqCodec, GROUP_BYTES};
pub use sfp::{SfpByte, SfpCodec, SFP_MAX};
pub use span::{make_span, make_span_mut, PackedSpan, PackedSpanMut};
pub use stats::DistortionStats;
