//! Parallel batched compression of weight tensors.
//!
//! The driver splits the input into fixed batches, hands each batch and its
//! disjoint slice of the packed output to a pool worker, and merges optional
//! per-worker distortion statistics after the join. Batches are a multiple
//! of the NUQ group size, so every codec sees aligned offsets.

use std::fmt;
use std::time::Instant;

use rayon::prelude::*;

use crate::cluster::ClusterBuf;
use crate::codec::Codec;
use crate::span::{make_span_mut, PackedSpanMut};
use crate::stats::DistortionStats;

/// Samples per pool task. A multiple of the NUQ group size.
pub const BATCH: usize = 8192;

/// Per-worker scratch: cluster buffers reused across groups, plus optional
/// distortion statistics.
#[derive(Default)]
pub struct CompressPerThread {
    pub buf: ClusterBuf,
    pub stats: DistortionStats,
    pub collect_stats: bool,
}

impl CompressPerThread {
    fn with_stats(collect_stats: bool) -> Self {
        Self {
            collect_stats,
            ..Self::default()
        }
    }
}

/// Driver-owned scratch, sized to the pool's worker count on entry.
#[derive(Default)]
pub struct CompressWorkingSet {
    pub tls: Vec<CompressPerThread>,
}

/// Knobs for one compression run.
#[derive(Clone, Default)]
pub struct CompressConfig {
    /// Collect [`DistortionStats`] per worker and merge them after the join.
    pub collect_stats: bool,
}

/// Compresses `raw` into `packed` starting at logical offset `ofs`,
/// batching across `pool`. See [`compress_with`] for statistics collection.
pub fn compress<C: Codec>(
    raw: &[f32],
    work: &mut CompressWorkingSet,
    packed: PackedSpanMut<'_, C::Packed>,
    ofs: usize,
    pool: &rayon::ThreadPool,
) {
    compress_with::<C>(raw, work, packed, ofs, pool, &CompressConfig::default());
}

/// As [`compress`], returning merged distortion statistics (empty unless
/// `config.collect_stats` is set).
pub fn compress_with<C: Codec>(
    raw: &[f32],
    work: &mut CompressWorkingSet,
    mut packed: PackedSpanMut<'_, C::Packed>,
    ofs: usize,
    pool: &rayon::ThreadPool,
    config: &CompressConfig,
) -> DistortionStats {
    packed.bounds_check(ofs, raw.len());
    work.tls
        .resize_with(pool.current_num_threads().max(1), CompressPerThread::default);

    let num = raw.len();
    if num == 0 {
        return DistortionStats::default();
    }

    let collect = config.collect_stats;
    let want_bench = num > (1 << 20) || collect;
    let t0 = Instant::now();

    let storage_ofs = C::packed_len(ofs);
    let stride = C::packed_len(BATCH);
    let out = &mut packed.data[storage_ofs..];

    let stats = pool.install(|| {
        raw.par_chunks(BATCH)
            .zip(out.par_chunks_mut(stride))
            .map_init(
                || CompressPerThread::with_stats(collect),
                |tls, (raw_batch, out_batch)| {
                    C::encode(raw_batch, tls, make_span_mut(out_batch, raw_batch.len()), 0);
                    std::mem::take(&mut tls.stats)
                },
            )
            .reduce(DistortionStats::default, |mut a, b| {
                a.assimilate(&b);
                a
            })
    });

    if want_bench {
        let elapsed = t0.elapsed().as_secs_f64().max(1e-9);
        let mb = num as f64 * core::mem::size_of::<f32>() as f64 * 1e-6;
        log::info!("compress{} {:.1} MB/s", C::SUFFIX, mb / elapsed);
    }

    stats
}

/// Error surfaced by a blob sink. Compression itself never fails; only the
/// writer boundary does.
#[derive(Debug)]
pub enum BlobError {
    Io(std::io::Error),
    DuplicateKey(String),
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "blob I/O: {e}"),
            Self::DuplicateKey(k) => write!(f, "duplicate blob key: {k}"),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Destination for named packed tensors. The actual store (file format,
/// mmap, network) lives outside this crate.
pub trait BlobSink {
    fn add(&mut self, key: &str, bytes: &[u8]) -> Result<(), BlobError>;
    fn write_all(&mut self) -> Result<(), BlobError>;
}

/// In-memory sink for tests and tooling.
#[derive(Default)]
pub struct MemoryBlobSink {
    blobs: Vec<(String, Vec<u8>)>,
}

impl MemoryBlobSink {
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.blobs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, b)| b.as_slice())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.blobs.iter().map(|(k, _)| k.as_str())
    }
}

impl BlobSink for MemoryBlobSink {
    fn add(&mut self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        if self.blobs.iter().any(|(k, _)| k == key) {
            return Err(BlobError::DuplicateKey(key.to_owned()));
        }
        self.blobs.push((key.to_owned(), bytes.to_vec()));
        Ok(())
    }

    fn write_all(&mut self) -> Result<(), BlobError> {
        Ok(())
    }
}

/// Compresses named tensors and stores them, with their scaling factors,
/// into a blob sink. Used by offline model-building tools.
pub struct Compressor<'p, S> {
    pool: &'p rayon::ThreadPool,
    work: CompressWorkingSet,
    sink: S,
}

impl<'p, S: BlobSink> Compressor<'p, S> {
    pub fn new(pool: &'p rayon::ThreadPool, sink: S) -> Self {
        Self {
            pool,
            work: CompressWorkingSet::default(),
            sink,
        }
    }

    /// Compresses `weights` into `packed` and records the blob under
    /// `name` plus the codec's key suffix.
    pub fn insert<C: Codec>(
        &mut self,
        name: &str,
        weights: &[f32],
        packed: &mut [C::Packed],
    ) -> Result<(), BlobError> {
        let needed = C::packed_len(weights.len());
        assert!(
            packed.len() >= needed,
            "packed buffer for {name} holds {} elements, need {needed}",
            packed.len()
        );
        log::info!("compressing {name} ({} samples)", weights.len());
        compress::<C>(
            weights,
            &mut self.work,
            make_span_mut(packed, weights.len()),
            0,
            self.pool,
        );
        self.sink.add(
            &format!("{name}{}", C::SUFFIX),
            bytemuck::cast_slice(&packed[..needed]),
        )
    }

    /// Records per-tensor scaling factors under the `"scales"` key. Tensors
    /// pre-scaled into the SFP range record their factor here.
    pub fn add_scales(&mut self, scales: &[f32]) -> Result<(), BlobError> {
        if scales.is_empty() {
            return Ok(());
        }
        self.sink.add("scales", bytemuck::cast_slice(scales))
    }

    /// Flushes the sink.
    pub fn write_all(&mut self) -> Result<(), BlobError> {
        self.sink.write_all()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}
