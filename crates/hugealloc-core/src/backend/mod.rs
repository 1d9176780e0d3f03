//! Chunk backend interface.
//!
//! The huge manager never touches virtual memory itself. It asks a
//! [`ChunkBackend`] for runs of chunks, for in-place growth and shrinkage of
//! those runs, and for purging, always on behalf of an arena.

pub mod pool;

use std::ptr::NonNull;
use thiserror::Error;

use crate::arena::ArenaId;

pub use pool::ChunkPool;

/// Backend primitive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// No memory available for the request.
    #[error("no chunks available")]
    Exhausted,
    /// The run could not be split at the requested point.
    #[error("chunk run cannot be split")]
    SplitRefused,
}

/// A run of chunks handed out by [`ChunkBackend::alloc_huge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGrant {
    pub addr: NonNull<u8>,
    /// Every byte of the run is known to be zero.
    pub zeroed: bool,
}

/// Raw chunk provider consumed by the huge manager.
///
/// # Safety
///
/// Implementations must hand out memory that is readable and writable for
/// the chunk ceiling of the requested size, aligned as requested, and not
/// handed out again until released through `dalloc_huge` or `shrink_huge`.
/// The manager writes through these pointers.
pub unsafe trait ChunkBackend: Send + Sync {
    /// Allocates a run covering `size` bytes aligned to `alignment`
    /// (a power of two, at least one chunk). `zero` asks for zeroed memory;
    /// the grant reports whether it actually is.
    fn alloc_huge(
        &self,
        arena: ArenaId,
        size: usize,
        alignment: usize,
        zero: bool,
    ) -> Result<ChunkGrant, ChunkError>;

    /// Releases the run at `addr` covering `size` bytes.
    fn dalloc_huge(&self, arena: ArenaId, addr: NonNull<u8>, size: usize);

    /// Notes a usable-size change that keeps the same chunk run.
    fn ralloc_huge_similar(&self, arena: ArenaId, addr: NonNull<u8>, old_size: usize, new_size: usize) {
        let _ = (arena, addr, old_size, new_size);
    }

    /// Extends the run at `addr` so it covers `new_size` bytes. Returns
    /// whether the added chunks are known zero.
    fn expand_huge(
        &self,
        arena: ArenaId,
        addr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        zero: bool,
    ) -> Result<bool, ChunkError>;

    /// Releases the chunks of the run past the chunk ceiling of `new_size`.
    fn shrink_huge(&self, arena: ArenaId, addr: NonNull<u8>, old_size: usize, new_size: usize);

    /// Splits the run `[addr, addr + total)` at `addr + split_at`.
    fn split(
        &self,
        arena: ArenaId,
        addr: NonNull<u8>,
        total: usize,
        split_at: usize,
    ) -> Result<(), ChunkError>;

    /// Purges `length` bytes at `offset` inside the run of `run_size` bytes
    /// starting at chunk `chunk_base`. Returns whether the range now reads
    /// as zero.
    fn purge(
        &self,
        arena: ArenaId,
        chunk_base: NonNull<u8>,
        run_size: usize,
        offset: usize,
        length: usize,
    ) -> bool;

    /// True if released memory is unmapped rather than retained or decommitted.
    fn unmaps_on_release(&self) -> bool {
        true
    }

    /// True if `addr` comes from the DSS (sbrk) memory source.
    fn in_dss(&self, addr: NonNull<u8>) -> bool {
        let _ = addr;
        false
    }

    /// Decay-tick notification after every completed huge operation.
    fn notify_activity(&self, arena: ArenaId);
}
