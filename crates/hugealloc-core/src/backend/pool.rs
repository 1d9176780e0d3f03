//! Reference chunk backend over a single anonymous mapping.
//!
//! The pool reserves `capacity` chunks up front with `mmap` and hands out
//! chunk runs first-fit. Released chunks are retained (never unmapped) and
//! remembered as dirty until purged, so zero-state reporting is exact:
//! a run is reported zeroed only if none of its chunks were handed out
//! since the last purge.

use parking_lot::Mutex;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ChunkBackend, ChunkError, ChunkGrant};
use crate::arena::ArenaId;
use crate::size_class::PAGE;

/// Number of per-arena decay tick counters kept by the pool.
const TICK_SLOTS: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
struct ChunkMeta {
    used: bool,
    /// May hold non-zero bytes.
    dirty: bool,
}

struct PoolState {
    chunks: Vec<ChunkMeta>,
    used: usize,
}

/// Fixed-capacity chunk backend.
pub struct ChunkPool {
    map_base: usize,
    map_len: usize,
    base: usize,
    lg_chunk: u8,
    capacity: usize,
    state: Mutex<PoolState>,
    ticks: Box<[AtomicU64]>,
}

impl ChunkPool {
    /// Reserves `capacity` chunks of `2^lg_chunk` bytes.
    pub fn new(lg_chunk: u8, capacity: usize) -> io::Result<Self> {
        let chunk = 1usize << lg_chunk;
        let map_len = capacity
            .checked_add(1)
            .and_then(|n| n.checked_mul(chunk))
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        // SAFETY: anonymous private mapping with no address hint.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let map_base = raw as usize;
        // One spare chunk of slack lets the usable window start chunk-aligned.
        let base = (map_base + chunk - 1) & !(chunk - 1);
        let ticks: Vec<AtomicU64> = (0..TICK_SLOTS).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            map_base,
            map_len,
            base,
            lg_chunk,
            capacity,
            state: Mutex::new(PoolState {
                chunks: vec![ChunkMeta::default(); capacity],
                used: 0,
            }),
            ticks: ticks.into_boxed_slice(),
        })
    }

    fn chunk_size(&self) -> usize {
        1usize << self.lg_chunk
    }

    fn chunks_for(&self, size: usize) -> usize {
        size.div_ceil(self.chunk_size())
    }

    fn index_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.base) >> self.lg_chunk
    }

    fn addr_of(&self, index: usize) -> usize {
        self.base + (index << self.lg_chunk)
    }

    /// True if `addr` lies inside the pool's usable window.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + (self.capacity << self.lg_chunk)
    }

    /// Total chunks in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks currently handed out.
    #[must_use]
    pub fn used_chunks(&self) -> usize {
        self.state.lock().used
    }

    /// Free chunks that may hold stale bytes.
    #[must_use]
    pub fn dirty_free_chunks(&self) -> usize {
        self.state
            .lock()
            .chunks
            .iter()
            .filter(|c| !c.used && c.dirty)
            .count()
    }

    /// Decay ticks received for `arena`.
    #[must_use]
    pub fn decay_ticks(&self, arena: ArenaId) -> u64 {
        self.ticks[arena.index() % TICK_SLOTS].load(Ordering::Relaxed)
    }
}

// SAFETY: every run handed out lies inside the live mapping, is chunk (or
// more) aligned, and is marked used until released.
unsafe impl ChunkBackend for ChunkPool {
    fn alloc_huge(
        &self,
        _arena: ArenaId,
        size: usize,
        alignment: usize,
        _zero: bool,
    ) -> Result<ChunkGrant, ChunkError> {
        let needed = self.chunks_for(size);
        let alignment = alignment.max(self.chunk_size());
        if needed == 0 || needed > self.capacity {
            return Err(ChunkError::Exhausted);
        }
        let mut state = self.state.lock();
        let mut start = 0;
        while start + needed <= self.capacity {
            if self.addr_of(start) % alignment != 0 {
                start += 1;
                continue;
            }
            match state.chunks[start..start + needed]
                .iter()
                .rposition(|c| c.used)
            {
                Some(busy) => start += busy + 1,
                None => {
                    let run = &mut state.chunks[start..start + needed];
                    let zeroed = run.iter().all(|c| !c.dirty);
                    for chunk in run.iter_mut() {
                        *chunk = ChunkMeta {
                            used: true,
                            dirty: true,
                        };
                    }
                    state.used += needed;
                    let addr = self.addr_of(start) as *mut u8;
                    // SAFETY: addr_of never yields null inside a live mapping.
                    let addr = unsafe { NonNull::new_unchecked(addr) };
                    return Ok(ChunkGrant { addr, zeroed });
                }
            }
        }
        Err(ChunkError::Exhausted)
    }

    fn dalloc_huge(&self, _arena: ArenaId, addr: NonNull<u8>, size: usize) {
        let start = self.index_of(addr.as_ptr() as usize);
        let count = self.chunks_for(size);
        let mut state = self.state.lock();
        for chunk in &mut state.chunks[start..start + count] {
            debug_assert!(chunk.used, "releasing a free chunk");
            chunk.used = false;
        }
        state.used -= count;
    }

    fn expand_huge(
        &self,
        _arena: ArenaId,
        addr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        _zero: bool,
    ) -> Result<bool, ChunkError> {
        let start = self.index_of(addr.as_ptr() as usize);
        let old_end = start + self.chunks_for(old_size);
        let new_end = start + self.chunks_for(new_size);
        if new_end <= old_end {
            return Ok(true);
        }
        if new_end > self.capacity {
            return Err(ChunkError::Exhausted);
        }
        let mut state = self.state.lock();
        let tail = &mut state.chunks[old_end..new_end];
        if tail.iter().any(|c| c.used) {
            return Err(ChunkError::Exhausted);
        }
        let zeroed = tail.iter().all(|c| !c.dirty);
        for chunk in tail.iter_mut() {
            *chunk = ChunkMeta {
                used: true,
                dirty: true,
            };
        }
        state.used += new_end - old_end;
        Ok(zeroed)
    }

    fn shrink_huge(&self, _arena: ArenaId, addr: NonNull<u8>, old_size: usize, new_size: usize) {
        let start = self.index_of(addr.as_ptr() as usize);
        let keep = start + self.chunks_for(new_size);
        let end = start + self.chunks_for(old_size);
        let mut state = self.state.lock();
        for chunk in &mut state.chunks[keep..end] {
            chunk.used = false;
        }
        state.used -= end - keep;
    }

    fn split(
        &self,
        _arena: ArenaId,
        addr: NonNull<u8>,
        total: usize,
        split_at: usize,
    ) -> Result<(), ChunkError> {
        let chunk = self.chunk_size();
        if split_at == 0 || split_at >= total || split_at % chunk != 0 || total % chunk != 0 {
            return Err(ChunkError::SplitRefused);
        }
        let addr = addr.as_ptr() as usize;
        if !self.contains(addr) {
            return Err(ChunkError::SplitRefused);
        }
        let start = self.index_of(addr);
        let end = start + total / chunk;
        if end > self.capacity {
            return Err(ChunkError::SplitRefused);
        }
        let state = self.state.lock();
        if state.chunks[start..end].iter().all(|c| c.used) {
            Ok(())
        } else {
            Err(ChunkError::SplitRefused)
        }
    }

    fn purge(
        &self,
        _arena: ArenaId,
        chunk_base: NonNull<u8>,
        _run_size: usize,
        offset: usize,
        length: usize,
    ) -> bool {
        let first = chunk_base.as_ptr() as usize + offset;
        let last = first + length;
        let start = (first + PAGE - 1) & !(PAGE - 1);
        let end = last & !(PAGE - 1);
        if end <= start {
            return false;
        }
        // SAFETY: [start, end) is page aligned and inside the pool mapping.
        let rc = unsafe {
            libc::madvise(
                start as *mut libc::c_void,
                end - start,
                libc::MADV_DONTNEED,
            )
        };
        if rc != 0 {
            return false;
        }
        // Only Linux guarantees zero pages after MADV_DONTNEED on private mappings.
        let zeroed = cfg!(target_os = "linux");
        if zeroed {
            let chunk = self.chunk_size();
            let first_full = (start + chunk - 1) & !(chunk - 1);
            let mut state = self.state.lock();
            let mut cursor = first_full;
            while cursor + chunk <= end {
                let index = self.index_of(cursor);
                state.chunks[index].dirty = false;
                cursor += chunk;
            }
        }
        zeroed && start == first && end == last
    }

    fn unmaps_on_release(&self) -> bool {
        false
    }

    fn notify_activity(&self, arena: ArenaId) {
        self.ticks[arena.index() % TICK_SLOTS].fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        // SAFETY: map_base/map_len describe the mapping created in `new`.
        unsafe {
            libc::munmap(self.map_base as *mut libc::c_void, self.map_len);
        }
    }
}
