//! Exact 1-D L2 K-means over one quantization group.
//!
//! Sorts the group, builds f64 prefix sums of `x` and `x^2` so any
//! interval's optimal center and SSE cost O(1), then runs the standard
//! dynamic program over interval counts. The result is the true optimum
//! over all partitions of the sorted values into contiguous intervals,
//! not a Lloyd-style local minimum.

/// Maximum clusters per group (4-bit indices).
pub const CLUSTERS: usize = 16;

/// Samples per quantization group.
pub const GROUP_SIZE: usize = 256;

/// Scratch reused across groups by one worker.
#[derive(Default)]
pub struct ClusterBuf {
    sorted: Vec<(f32, u16)>,
    prefix: Vec<f64>,
    prefix2: Vec<f64>,
    cost: Vec<f64>,
    boundary: Vec<u16>,
}

/// Clusters `input` (1..=`GROUP_SIZE` samples) into at most [`CLUSTERS`]
/// centers minimizing the summed squared error.
///
/// Returns the number of unused clusters. Unused centers occupy the lowest
/// slots and are 0.0; used centers are stored in ascending order, and every
/// index in `indices` lies in `[unused, CLUSTERS)`. When the input has fewer
/// than [`CLUSTERS`] distinct values, each distinct value becomes its own
/// center and the remainder is unused.
pub fn cluster_exact_l2(
    input: &[f32],
    buf: &mut ClusterBuf,
    centers: &mut [f32; CLUSTERS],
    indices: &mut [u16],
) -> usize {
    let n = input.len();
    assert!(0 < n && n <= GROUP_SIZE, "group size {n} out of range");
    assert_eq!(indices.len(), n, "index buffer mismatch");

    buf.sorted.clear();
    buf.sorted
        .extend(input.iter().enumerate().map(|(i, &x)| (x, i as u16)));
    buf.sorted.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

    let mut distinct = 1;
    for w in buf.sorted.windows(2) {
        if w[0].0 != w[1].0 {
            distinct += 1;
        }
    }
    let used = distinct.min(CLUSTERS);
    let unused = CLUSTERS - used;

    buf.prefix.clear();
    buf.prefix2.clear();
    buf.prefix.push(0.0);
    buf.prefix2.push(0.0);
    for &(x, _) in &buf.sorted {
        let x = x as f64;
        buf.prefix.push(buf.prefix.last().unwrap() + x);
        buf.prefix2.push(buf.prefix2.last().unwrap() + x * x);
    }

    // SSE of the optimal (mean) center for sorted interval [a, b).
    let interval_cost = |a: usize, b: usize| -> f64 {
        let len = (b - a) as f64;
        let s = buf.prefix[b] - buf.prefix[a];
        let s2 = buf.prefix2[b] - buf.prefix2[a];
        (s2 - s * s / len).max(0.0)
    };

    // cost[k][m]: minimal SSE of the first m sorted samples using k
    // intervals; boundary[k][m]: start of the k-th interval in that optimum.
    let width = n + 1;
    buf.cost.clear();
    buf.cost.resize((used + 1) * width, f64::INFINITY);
    buf.boundary.clear();
    buf.boundary.resize((used + 1) * width, 0);

    for m in 1..=n {
        buf.cost[width + m] = interval_cost(0, m);
    }
    for k in 2..=used {
        for m in k..=n {
            let mut best = f64::INFINITY;
            let mut best_t = k - 1;
            for t in (k - 1)..m {
                let c = buf.cost[(k - 1) * width + t] + interval_cost(t, m);
                if c < best {
                    best = c;
                    best_t = t;
                }
            }
            buf.cost[k * width + m] = best;
            buf.boundary[k * width + m] = best_t as u16;
        }
    }

    centers[..unused].fill(0.0);

    let mut end = n;
    for j in (0..used).rev() {
        let start = if j == 0 {
            0
        } else {
            buf.boundary[(j + 1) * width + end] as usize
        };
        let len = (end - start) as f64;
        let mean = (buf.prefix[end] - buf.prefix[start]) / len;
        centers[unused + j] = mean as f32;
        for p in start..end {
            indices[buf.sorted[p].1 as usize] = (unused + j) as u16;
        }
        end = start;
    }
    debug_assert_eq!(end, 0);

    unused
}
