#![allow(dead_code)]

use hugealloc_core::arena::ArenaId;
use hugealloc_core::{ChunkBackend, ChunkError, ChunkGrant, ChunkPool, HugeAllocator, HugeConfig};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const LG: u8 = 16;
pub const CHUNK: usize = 1 << LG;

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }

    pub fn gen_bool(&mut self) -> bool {
        self.next_u64() & 1 == 1
    }
}

/// `ChunkPool` wrapper with switchable failures.
pub struct FaultyPool {
    pub inner: ChunkPool,
    pub fail_alloc: AtomicBool,
    pub fail_expand: AtomicBool,
    pub refuse_split: AtomicBool,
    pub unmaps: AtomicBool,
    pub dss: AtomicBool,
    pub purges: AtomicUsize,
}

impl FaultyPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ChunkPool::new(LG, capacity).unwrap(),
            fail_alloc: AtomicBool::new(false),
            fail_expand: AtomicBool::new(false),
            refuse_split: AtomicBool::new(false),
            unmaps: AtomicBool::new(false),
            dss: AtomicBool::new(false),
            purges: AtomicUsize::new(0),
        }
    }

    pub fn set(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }
}

unsafe impl ChunkBackend for FaultyPool {
    fn alloc_huge(
        &self,
        arena: ArenaId,
        size: usize,
        alignment: usize,
        zero: bool,
    ) -> Result<ChunkGrant, ChunkError> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return Err(ChunkError::Exhausted);
        }
        self.inner.alloc_huge(arena, size, alignment, zero)
    }

    fn dalloc_huge(&self, arena: ArenaId, addr: NonNull<u8>, size: usize) {
        self.inner.dalloc_huge(arena, addr, size)
    }

    fn expand_huge(
        &self,
        arena: ArenaId,
        addr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        zero: bool,
    ) -> Result<bool, ChunkError> {
        if self.fail_expand.load(Ordering::SeqCst) {
            return Err(ChunkError::Exhausted);
        }
        self.inner.expand_huge(arena, addr, old_size, new_size, zero)
    }

    fn shrink_huge(&self, arena: ArenaId, addr: NonNull<u8>, old_size: usize, new_size: usize) {
        self.inner.shrink_huge(arena, addr, old_size, new_size)
    }

    fn split(
        &self,
        arena: ArenaId,
        addr: NonNull<u8>,
        total: usize,
        split_at: usize,
    ) -> Result<(), ChunkError> {
        if self.refuse_split.load(Ordering::SeqCst) {
            return Err(ChunkError::SplitRefused);
        }
        self.inner.split(arena, addr, total, split_at)
    }

    fn purge(
        &self,
        arena: ArenaId,
        chunk_base: NonNull<u8>,
        run_size: usize,
        offset: usize,
        length: usize,
    ) -> bool {
        self.purges.fetch_add(1, Ordering::SeqCst);
        self.inner.purge(arena, chunk_base, run_size, offset, length)
    }

    fn unmaps_on_release(&self) -> bool {
        self.unmaps.load(Ordering::SeqCst)
    }

    fn in_dss(&self, _addr: NonNull<u8>) -> bool {
        self.dss.load(Ordering::SeqCst)
    }

    fn notify_activity(&self, arena: ArenaId) {
        self.inner.notify_activity(arena)
    }
}

pub fn config(opts: &str) -> HugeConfig {
    HugeConfig::parse(&format!("lg_chunk:{LG},narenas:1,{opts}")).unwrap()
}

pub fn pool_allocator(opts: &str, capacity: usize) -> HugeAllocator<ChunkPool> {
    HugeAllocator::new(config(opts), ChunkPool::new(LG, capacity).unwrap()).unwrap()
}

pub fn faulty_allocator(opts: &str, capacity: usize) -> HugeAllocator<FaultyPool> {
    HugeAllocator::new(config(opts), FaultyPool::new(capacity)).unwrap()
}

/// # Safety
/// `ptr` must cover `len` readable bytes.
pub unsafe fn bytes<'a>(ptr: NonNull<u8>, len: usize) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
}

/// # Safety
/// `ptr` must cover `len` writable bytes.
pub unsafe fn paint(ptr: NonNull<u8>, len: usize, byte: u8) {
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), byte, len) }
}
