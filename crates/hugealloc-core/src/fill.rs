//! Zero-fill and junk-fill decisions.
//!
//! The manager calls into [`FillPolicy`] at the allocation, growth, shrink
//! and release boundaries. The policy owns the byte writes; the manager
//! owns the zero-state bookkeeping.

use std::ptr::{self, NonNull};

use crate::backend::ChunkBackend;
use crate::config::{ALLOC_JUNK, FREE_JUNK, HugeConfig, JunkMode};

/// Fill behavior derived from [`HugeConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillPolicy {
    zero: bool,
    junk: JunkMode,
    have_dss: bool,
    elide_junk_before_unmap: bool,
}

impl FillPolicy {
    #[must_use]
    pub fn from_config(config: &HugeConfig) -> Self {
        Self {
            zero: config.zero,
            junk: config.junk,
            have_dss: config.have_dss,
            elide_junk_before_unmap: config.elide_junk_before_unmap,
        }
    }

    /// The request must read back as zero.
    #[must_use]
    pub fn wants_zero(&self, zero: bool) -> bool {
        zero || self.zero
    }

    #[must_use]
    pub fn junk_on_alloc(&self) -> bool {
        self.junk.on_alloc()
    }

    #[must_use]
    pub fn junk_on_free(&self) -> bool {
        self.junk.on_free()
    }

    /// Fills `len` fresh bytes at `addr`.
    ///
    /// Zeroes them when zero is wanted and they are not `known_zero`,
    /// otherwise writes [`ALLOC_JUNK`] if junk-on-alloc is set.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must be writable and owned by the caller.
    pub unsafe fn fill_new(&self, addr: usize, len: usize, zero: bool, known_zero: bool) {
        if self.wants_zero(zero) {
            if !known_zero {
                // SAFETY: forwarded from the caller.
                unsafe { write(addr, 0, len) };
            }
        } else if self.junk_on_alloc() {
            // SAFETY: forwarded from the caller.
            unsafe { write(addr, ALLOC_JUNK, len) };
        }
    }

    /// Fills the bytes gained by an in-place expansion from `old` to `new`.
    ///
    /// The gain splits at `ceiling_old`: the tail of the last old chunk,
    /// whose state is `subchunk_zeroed`, and the new chunks, whose state is
    /// `chunks_zeroed`.
    ///
    /// # Safety
    ///
    /// `[addr + old, addr + new)` must be writable and owned by the caller.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn fill_expanded(
        &self,
        addr: usize,
        old: usize,
        ceiling_old: usize,
        new: usize,
        zero: bool,
        subchunk_zeroed: bool,
        chunks_zeroed: bool,
    ) {
        debug_assert!(old <= ceiling_old && ceiling_old <= new);
        if self.wants_zero(zero) {
            if !subchunk_zeroed {
                // SAFETY: forwarded from the caller.
                unsafe { write(addr + old, 0, ceiling_old - old) };
            }
            if !chunks_zeroed {
                // SAFETY: forwarded from the caller.
                unsafe { write(addr + ceiling_old, 0, new - ceiling_old) };
            }
        } else if self.junk_on_alloc() {
            // SAFETY: forwarded from the caller.
            unsafe { write(addr + old, ALLOC_JUNK, new - old) };
        }
    }

    /// Whether released bytes at `addr` get [`FREE_JUNK`].
    ///
    /// With `elide_junk_before_unmap` the fill is skipped for memory the
    /// backend will unmap, except DSS memory which is never unmapped.
    pub fn junks_release<B: ChunkBackend + ?Sized>(&self, backend: &B, addr: NonNull<u8>) -> bool {
        if !self.junk_on_free() {
            return false;
        }
        if !self.elide_junk_before_unmap {
            return true;
        }
        !backend.unmaps_on_release() || (self.have_dss && backend.in_dss(addr))
    }

    /// Applies the release junk rule to `[addr, addr + len)`.
    ///
    /// # Safety
    ///
    /// The range must be writable and no longer reachable by any other owner.
    pub unsafe fn junk_release<B: ChunkBackend + ?Sized>(&self, backend: &B, addr: NonNull<u8>, len: usize) {
        if self.junks_release(backend, addr) {
            // SAFETY: forwarded from the caller.
            unsafe { write(addr.as_ptr() as usize, FREE_JUNK, len) };
        }
    }

    /// Writes [`FREE_JUNK`] over `[addr, addr + len)` unconditionally.
    ///
    /// # Safety
    ///
    /// The range must be writable and owned by the caller.
    pub unsafe fn junk_trimmed(&self, addr: usize, len: usize) {
        // SAFETY: forwarded from the caller.
        unsafe { write(addr, FREE_JUNK, len) };
    }
}

unsafe fn write(addr: usize, byte: u8, len: usize) {
    if len == 0 {
        return;
    }
    // SAFETY: callers guarantee the range is writable.
    unsafe { ptr::write_bytes(addr as *mut u8, byte, len) };
}
