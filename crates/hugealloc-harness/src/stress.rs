//! Deterministic multi-threaded huge workload.
//!
//! Each worker owns its allocations and drives them through a seeded mix of
//! allocate, in-place resize, resize-or-move and release. Fill guarantees are
//! checked on every fresh allocation and on every range a resize adds; leaks
//! are checked once all workers have joined.

use hugealloc_core::{
    ChunkPool, HugeAllocator, HugeArenaStats, HugeConfig, HugeError, HugeLogRecord, InPlace,
    config::{ALLOC_JUNK, ConfigError},
};
use serde::Serialize;
use std::ptr::NonNull;
use std::thread;
use thiserror::Error;

/// Workload parameters.
#[derive(Debug, Clone)]
pub struct StressConfig {
    pub threads: usize,
    pub ops: usize,
    pub seed: u64,
    /// Chunks reserved by the backing pool.
    pub pool_chunks: usize,
    /// Largest request, in chunks.
    pub max_chunks_per_alloc: usize,
    pub huge: HugeConfig,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops: 10_000,
            seed: 0x5EED,
            pool_chunks: 1024,
            max_chunks_per_alloc: 4,
            huge: HugeConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StressError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("chunk pool reservation failed: {0}")]
    Pool(#[from] std::io::Error),
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
    #[error("{registered} extents and {chunks} chunks still live after the run")]
    Leak { registered: usize, chunks: usize },
}

/// Summary of one stress run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StressReport {
    pub threads: usize,
    pub ops: usize,
    pub seed: u64,
    pub allocs: usize,
    pub frees: usize,
    pub in_place_resizes: usize,
    pub must_move: usize,
    pub moves: usize,
    pub failures: usize,
    pub fill_violations: usize,
    pub high_chunks: usize,
    pub arenas: Vec<HugeArenaStats>,
    pub log_records: usize,
    pub log_dropped: u64,
}

impl StressReport {
    fn absorb(&mut self, tally: &WorkerTally) {
        self.allocs += tally.allocs;
        self.frees += tally.frees;
        self.in_place_resizes += tally.in_place;
        self.must_move += tally.must_move;
        self.moves += tally.moves;
        self.failures += tally.failures;
        self.fill_violations += tally.fill_violations;
    }
}

#[derive(Debug, Default)]
struct WorkerTally {
    allocs: usize,
    frees: usize,
    in_place: usize,
    must_move: usize,
    moves: usize,
    failures: usize,
    fill_violations: usize,
}

#[derive(Clone, Copy)]
struct Live {
    ptr: NonNull<u8>,
    size: usize,
}

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// Parses a seed given in decimal or `0x` hex, `_` separators allowed.
pub fn parse_seed(raw: &str) -> Result<u64, std::num::ParseIntError> {
    let s = raw.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16)
    } else {
        s.replace('_', "").parse::<u64>()
    }
}

/// Returns true if every byte of `[ptr, ptr + len)` equals `byte`.
///
/// # Safety
///
/// `ptr` must point to at least `len` readable bytes of a live allocation
/// that no other thread writes concurrently.
#[allow(unsafe_code)]
unsafe fn all_bytes_are(ptr: NonNull<u8>, len: usize, byte: u8) -> bool {
    // SAFETY: guaranteed by the caller.
    let view = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) };
    view.iter().all(|&b| b == byte)
}

/// Checks the fill of `[from, to)` inside the worker-owned allocation at
/// `ptr`, which must currently have at least `to` usable bytes.
#[allow(unsafe_code)]
fn check_fill(huge: &HugeAllocator<ChunkPool>, ptr: NonNull<u8>, from: usize, to: usize, zero: bool) -> bool {
    if from >= to {
        return true;
    }
    let config = huge.config();
    let expected = if zero || config.zero {
        0
    } else if config.junk.on_alloc() {
        ALLOC_JUNK
    } else {
        return true;
    };
    // SAFETY: `from < to <= usable size`, and only this worker touches the
    // allocation.
    unsafe { all_bytes_are(ptr.add(from), to - from, expected) }
}

fn worker(huge: &HugeAllocator<ChunkPool>, config: &StressConfig, seed: u64) -> WorkerTally {
    let chunk = huge.classes().chunk_size();
    let max = config.max_chunks_per_alloc.max(1) * chunk;
    let mut rng = XorShift64::new(seed);
    let mut live: Vec<Live> = Vec::new();
    let mut tally = WorkerTally::default();

    for _ in 0..config.ops {
        let op = rng.gen_range(0, 7);
        if live.is_empty() || op <= 2 {
            let size = rng.gen_range(1, max);
            let zero = rng.next_u64() & 1 == 1;
            match huge.allocate(size, zero, None) {
                Ok(ptr) => {
                    let usable = huge.usable_size(ptr).unwrap_or(size);
                    if !check_fill(huge, ptr, 0, usable, zero) {
                        tally.fill_violations += 1;
                    }
                    live.push(Live { ptr, size: usable });
                    tally.allocs += 1;
                }
                Err(HugeError::BackendExhausted { .. } | HugeError::MetadataAllocation { .. }) => {
                    tally.failures += 1;
                }
                Err(_) => tally.failures += 1,
            }
            continue;
        }

        let idx = rng.gen_range(0, live.len() - 1);
        match op {
            3 | 4 => {
                let entry = live[idx];
                let min = rng.gen_range(chunk, max + chunk);
                let upper = min + rng.gen_range(0, chunk);
                let zero = rng.next_u64() & 1 == 1;
                match huge.resize_in_place(entry.ptr, entry.size, min, upper, zero) {
                    InPlace::Resized => {
                        let now = huge.usable_size(entry.ptr).unwrap_or(entry.size);
                        if !check_fill(huge, entry.ptr, entry.size, now, zero) {
                            tally.fill_violations += 1;
                        }
                        live[idx].size = now;
                        tally.in_place += 1;
                    }
                    InPlace::MustMove => tally.must_move += 1,
                }
            }
            5 => {
                let entry = live[idx];
                let new = rng.gen_range(chunk, max + chunk);
                let zero = rng.next_u64() & 1 == 1;
                match huge.resize_or_move(entry.ptr, entry.size, new, chunk, zero, None, None) {
                    Ok(ptr) => {
                        if ptr != entry.ptr {
                            tally.moves += 1;
                        }
                        let now = huge.usable_size(ptr).unwrap_or(new);
                        if !check_fill(huge, ptr, entry.size, now, zero) {
                            tally.fill_violations += 1;
                        }
                        live[idx] = Live { ptr, size: now };
                    }
                    Err(_) => tally.failures += 1,
                }
            }
            _ => {
                let entry = live.swap_remove(idx);
                huge.deallocate(entry.ptr);
                tally.frees += 1;
            }
        }
    }

    for entry in live.drain(..) {
        huge.deallocate(entry.ptr);
        tally.frees += 1;
    }
    tally
}

/// Runs the workload and returns the report together with the drained
/// lifecycle log.
pub fn run(config: &StressConfig) -> Result<(StressReport, Vec<HugeLogRecord>), StressError> {
    let pool = ChunkPool::new(config.huge.lg_chunk, config.pool_chunks)?;
    let huge = HugeAllocator::new(config.huge.clone(), pool)?;

    let mut report = StressReport {
        threads: config.threads,
        ops: config.ops,
        seed: config.seed,
        ..StressReport::default()
    };

    let tallies: Vec<Result<WorkerTally, usize>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|t| {
                let huge = &huge;
                let seed = config.seed ^ (t as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                scope.spawn(move || worker(huge, config, seed))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(t, handle)| handle.join().map_err(|_| t))
            .collect()
    });
    for tally in tallies {
        report.absorb(&tally.map_err(StressError::WorkerPanicked)?);
    }

    let registered = huge.registry().len();
    let chunks = huge.backend().used_chunks();
    if registered != 0 || chunks != 0 {
        return Err(StressError::Leak { registered, chunks });
    }

    report.high_chunks = huge.registry().high_chunks();
    report.arenas = huge.arenas().iter().map(|arena| arena.stats()).collect();
    report.log_dropped = huge.lifecycle_log().dropped();
    let logs = huge.drain_lifecycle_logs();
    report.log_records = logs.len();
    Ok((report, logs))
}
