//! Extent registry: base address to extent lookup.
//!
//! The registry holds a non-owning `(arena, slot)` association for every live
//! huge allocation. It is sharded by address bits, each shard behind its own
//! `parking_lot::Mutex`, so lookups of one address never wait on a register
//! or deregister of an address in another shard.
//!
//! Registration also maintains the `current_chunks` / `high_chunks` gauges.
//! Resizes swap the recorded chunk count in place with `reregister`, under
//! the shard lock, so the gauges follow the new size without a gap.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::arena::ArenaId;

/// Number of registry shards (power of 2).
const NUM_SHARDS: usize = 16;

/// Where an extent record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtentRef {
    pub arena: ArenaId,
    pub slot: usize,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    extent: ExtentRef,
    chunks: usize,
}

/// Registration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry capacity exhausted")]
    Exhausted,
    #[error("address {0:#x} is already registered")]
    AlreadyRegistered(usize),
}

/// Thread-safe address → extent map.
pub struct ExtentRegistry {
    shards: Box<[Mutex<HashMap<usize, Entry>>]>,
    capacity: Option<usize>,
    len: AtomicUsize,
    current_chunks: AtomicUsize,
    high_chunks: AtomicUsize,
}

impl ExtentRegistry {
    /// Creates an empty registry, optionally bounded to `capacity` entries.
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        let shards: Vec<Mutex<HashMap<usize, Entry>>> =
            (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards: shards.into_boxed_slice(),
            capacity,
            len: AtomicUsize::new(0),
            current_chunks: AtomicUsize::new(0),
            high_chunks: AtomicUsize::new(0),
        }
    }

    fn shard_for(&self, addr: usize) -> usize {
        // Chunk-aligned addresses share all their low bits; mix before picking.
        let mut x = addr as u64;
        x ^= x >> 30;
        x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x ^= x >> 27;
        x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
        x ^= x >> 31;
        (x as usize) % NUM_SHARDS
    }

    /// Registers `addr`, counting `chunks` chunks toward the gauges.
    pub fn register(
        &self,
        addr: usize,
        extent: ExtentRef,
        chunks: usize,
    ) -> Result<(), RegistryError> {
        let mut shard = self.shards[self.shard_for(addr)].lock();
        if shard.contains_key(&addr) {
            return Err(RegistryError::AlreadyRegistered(addr));
        }
        if let Some(capacity) = self.capacity {
            // Claim a slot first so concurrent registrations cannot overshoot.
            if self.len.fetch_add(1, Ordering::AcqRel) >= capacity {
                self.len.fetch_sub(1, Ordering::AcqRel);
                return Err(RegistryError::Exhausted);
            }
        } else {
            self.len.fetch_add(1, Ordering::AcqRel);
        }
        if shard.try_reserve(1).is_err() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(RegistryError::Exhausted);
        }
        shard.insert(addr, Entry { extent, chunks });
        drop(shard);

        let current = self.current_chunks.fetch_add(chunks, Ordering::AcqRel) + chunks;
        self.high_chunks.fetch_max(current, Ordering::AcqRel);
        Ok(())
    }

    /// Removes `addr`. Returns the association if it was registered.
    pub fn deregister(&self, addr: usize) -> Option<ExtentRef> {
        let entry = self.shards[self.shard_for(addr)].lock().remove(&addr)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        self.current_chunks.fetch_sub(entry.chunks, Ordering::AcqRel);
        Some(entry.extent)
    }

    /// Deregisters and re-registers `addr` with a new chunk count under one
    /// shard lock, so the capacity slot is never given up in between.
    /// Returns false if `addr` is not registered.
    pub fn reregister(&self, addr: usize, chunks: usize) -> bool {
        let mut shard = self.shards[self.shard_for(addr)].lock();
        let Some(entry) = shard.get_mut(&addr) else {
            return false;
        };
        let old = std::mem::replace(&mut entry.chunks, chunks);
        drop(shard);

        self.current_chunks.fetch_sub(old, Ordering::AcqRel);
        let current = self.current_chunks.fetch_add(chunks, Ordering::AcqRel) + chunks;
        self.high_chunks.fetch_max(current, Ordering::AcqRel);
        true
    }

    /// Looks up the extent registered at exactly `addr`.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<ExtentRef> {
        self.shards[self.shard_for(addr)]
            .lock()
            .get(&addr)
            .map(|entry| entry.extent)
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.lookup(addr).is_some()
    }

    /// Number of registered extents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunks currently accounted to registered extents.
    #[must_use]
    pub fn current_chunks(&self) -> usize {
        self.current_chunks.load(Ordering::Acquire)
    }

    /// High-water mark of [`Self::current_chunks`].
    #[must_use]
    pub fn high_chunks(&self) -> usize {
        self.high_chunks.load(Ordering::Acquire)
    }
}

impl Default for ExtentRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}
