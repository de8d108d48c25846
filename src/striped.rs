//! Cell-indexed dense arrays and the parallel-threaded job-basket pattern.
//!
//! `MeshValue<T>` is the per-cell dense array type used throughout (spins,
//! Ms, gamma, alpha, dm/dt, ...). `StripedArray` pins a fixed block
//! partition of cell indices to thread slots so repeated passes over the
//! same mesh keep the same thread-to-cache-line mapping. `JobBasket` is the
//! dynamic work queue handed to a pool of scoped threads for one kernel
//! phase; threads loop `next_job -> process` until the basket is empty,
//! the only synchronization barrier between kernel phases.

use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ndarray::Array1;

/// Dense per-cell array, e.g. `MeshValue<f64>` for Ms/alpha/gamma, or
/// `MeshValue<Vec3>` for spin/mxH fields.
#[derive(Debug, Clone)]
pub struct MeshValue<T> {
    data: Array1<T>,
}

impl<T: Clone + Default> MeshValue<T> {
    pub fn zeros(size: usize) -> Self {
        Self { data: Array1::from_elem(size, T::default()) }
    }
}

impl<T> MeshValue<T> {
    pub fn from_vec(values: Vec<T>) -> Self {
        Self { data: Array1::from_vec(values) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        self.data
            .as_slice()
            .expect("MeshValue is always contiguous (built from Array1::from_vec/from_elem)")
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.data
            .as_slice_mut()
            .expect("MeshValue is always contiguous (built from Array1::from_vec/from_elem)")
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.as_mut_slice().iter_mut()
    }
}

impl<T> Index<usize> for MeshValue<T> {
    type Output = T;
    #[inline]
    fn index(&self, idx: usize) -> &T {
        &self.data[idx]
    }
}

impl<T> IndexMut<usize> for MeshValue<T> {
    #[inline]
    fn index_mut(&mut self, idx: usize) -> &mut T {
        &mut self.data[idx]
    }
}

/// Fixed contiguous-block partition of `[0, size)` across `num_blocks`
/// threads, used so the same thread owns the same cell range on every
/// pass, for cache locality.
#[derive(Debug, Clone)]
pub struct StripedArray {
    size: usize,
    num_blocks: usize,
}

impl StripedArray {
    pub fn new(size: usize, num_blocks: usize) -> Self {
        Self { size, num_blocks: num_blocks.max(1) }
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Half-open cell range owned by block `block_idx`.
    pub fn block_range(&self, block_idx: usize) -> std::ops::Range<usize> {
        debug_assert!(block_idx < self.num_blocks);
        let base = self.size / self.num_blocks;
        let extra = self.size % self.num_blocks;
        // The first `extra` blocks get one additional cell so the partition
        // covers `size` exactly without a ragged final block.
        let start = block_idx * base + block_idx.min(extra);
        let len = base + usize::from(block_idx < extra);
        start..(start + len)
    }
}

/// Dynamic work queue of `[start, stop)` cell ranges, doled out in
/// `chunk_size`-sized pieces. Threads pull ranges with `next_job` until
/// `None`, then the phase is done (the job-basket synchronization barrier).
pub struct JobBasket {
    end: usize,
    chunk_size: usize,
    cursor: AtomicUsize,
}

impl JobBasket {
    pub fn new(total: usize, chunk_size: usize) -> Self {
        Self {
            end: total,
            chunk_size: chunk_size.max(1),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Claim the next `[start, stop)` range, or `None` if exhausted. Safe to
    /// call concurrently from any number of threads.
    pub fn next_job(&self) -> Option<std::ops::Range<usize>> {
        let start = self.cursor.fetch_add(self.chunk_size, Ordering::Relaxed);
        if start >= self.end {
            return None;
        }
        let stop = (start + self.chunk_size).min(self.end);
        Some(start..stop)
    }
}

/// Number of worker threads a job-basket kernel should spawn for a pass
/// over `size` cells, capped by the machine's available parallelism and
/// never spun up for meshes too small to be worth the thread overhead.
pub fn default_num_threads(size: usize) -> usize {
    const MIN_CELLS_PER_THREAD: usize = 512;
    let hw = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    hw.min((size / MIN_CELLS_PER_THREAD).max(1))
}

/// Parallel per-cell fill: `body(i)` computes cell `i`'s value from shared,
/// read-only state and the result is written straight into `out[i]`. Used
/// by dm/dt kernels so the O(N) per-cell torque evaluation runs on the same
/// job-basket skeleton as every other data-parallel kernel.
///
/// The output slice is pre-split into disjoint `chunk_size` pieces with
/// `chunks_mut`, and threads pull the next piece from a mutex-guarded
/// cursor over that iterator -- each chunk handed out is already a unique,
/// non-overlapping `&mut [T]`, so no thread ever needs to see another's
/// write target.
pub fn parallel_fill_cells<T, F>(out: &mut MeshValue<T>, num_threads: usize, chunk_size: usize, body: F)
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    let size = out.len();
    if size == 0 {
        return;
    }
    let num_threads = num_threads.max(1).min(size);
    let chunk_size = chunk_size.max(1);
    let chunks = Mutex::new(out.as_mut_slice().chunks_mut(chunk_size).enumerate());

    let run_worker = || {
        while let Some((chunk_idx, slice)) = chunks.lock().expect("chunk cursor poisoned").next() {
            let base = chunk_idx * chunk_size;
            for (offset, slot) in slice.iter_mut().enumerate() {
                *slot = body(base + offset);
            }
        }
    };

    if num_threads == 1 {
        run_worker();
        return;
    }
    crossbeam::scope(|scope| {
        for _ in 0..num_threads {
            scope.spawn(|_| run_worker());
        }
    })
    .expect("job-basket worker thread panicked");
}

/// Run `body` over every cell in `[0, size)`, dividing the work across
/// `num_threads` scoped threads pulling from a shared `JobBasket`. `body`
/// receives a single cell index and must be safe to call concurrently for
/// distinct indices (no cross-cell mutation).
///
/// This is the cooperative job-basket pattern for data-parallel kernels:
/// dm/dt evaluation, state advance, and energy reduction all go through
/// this same skeleton.
pub fn parallel_for_cells<F>(size: usize, num_threads: usize, chunk_size: usize, body: F)
where
    F: Fn(usize) + Sync,
{
    if size == 0 {
        return;
    }
    let num_threads = num_threads.max(1).min(size);
    let basket = JobBasket::new(size, chunk_size);
    if num_threads == 1 {
        while let Some(range) = basket.next_job() {
            for i in range {
                body(i);
            }
        }
        return;
    }
    crossbeam::scope(|scope| {
        for _ in 0..num_threads {
            scope.spawn(|_| {
                while let Some(range) = basket.next_job() {
                    for i in range {
                        body(i);
                    }
                }
            });
        }
    })
    .expect("job-basket worker thread panicked");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn striped_partition_covers_every_cell_exactly_once() {
        let striped = StripedArray::new(103, 8);
        let mut seen = vec![0u32; 103];
        for block in 0..striped.num_blocks() {
            for i in striped.block_range(block) {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
    }

    #[test]
    fn job_basket_exhausts_exactly_once() {
        let basket = JobBasket::new(23, 4);
        let mut total = 0usize;
        let mut count = 0usize;
        while let Some(range) = basket.next_job() {
            total += range.len();
            count += 1;
        }
        assert_eq!(total, 23);
        assert!(count >= 6); // ceil(23/4) == 6
    }

    #[test]
    fn parallel_for_cells_visits_every_index() {
        let size = 1000;
        let hits: Vec<AtomicU64> = (0..size).map(|_| AtomicU64::new(0)).collect();
        parallel_for_cells(size, 4, 17, |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn parallel_fill_cells_matches_sequential_map() {
        let size = 777;
        let mut out: MeshValue<f64> = MeshValue::zeros(size);
        parallel_fill_cells(&mut out, 6, 13, |i| (i * i) as f64 - i as f64 * 0.5);
        for i in 0..size {
            assert_eq!(out[i], (i * i) as f64 - i as f64 * 0.5);
        }
    }

    #[test]
    fn default_num_threads_never_exceeds_hardware_and_is_at_least_one() {
        let hw = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert!(default_num_threads(10) >= 1);
        assert!(default_num_threads(1_000_000) <= hw);
        assert_eq!(default_num_threads(0), 1);
    }
}
