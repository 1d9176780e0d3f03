//! Huge allocation manager.
//!
//! Serves every request of at least one chunk. Memory comes from a
//! [`ChunkBackend`]; per-allocation metadata lives in the owning arena's
//! [`HugeList`](crate::extent::HugeList) and is found through the
//! [`ExtentRegistry`].
//!
//! Ordering rules:
//! - an address is registered and linked before it is returned;
//! - it is deregistered and unlinked before its chunks go back to the backend;
//! - every failure undoes whatever the operation acquired.
//!
//! Record fields are only touched under the arena's huge lock. The lock is
//! never held across a backend call or a fill.

use serde::Serialize;
use std::ptr::{self, NonNull};

use crate::arena::{Arena, ArenaId, Arenas, HugeArenaStats};
use crate::backend::ChunkBackend;
use crate::config::{ConfigError, HugeConfig};
use crate::error::HugeError;
use crate::extent::{ExtentRecord, ProfTctx, ReserveError};
use crate::fill::FillPolicy;
use crate::log::{HugeLogLevel, HugeLogRecord, LifecycleLog, LogEvent};
use crate::registry::{ExtentRef, ExtentRegistry};
use crate::size_class::{HUGE_MAXCLASS, SizeClasses, s2u};

/// Outcome of [`HugeAllocator::resize_in_place`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InPlace {
    /// The allocation now has a size in the requested range at the same address.
    Resized,
    /// No in-place strategy applies; allocate, copy and free instead.
    MustMove,
}

impl InPlace {
    #[must_use]
    pub const fn is_resized(self) -> bool {
        matches!(self, Self::Resized)
    }
}

/// Releases the old allocation after a move, e.g. into a thread cache.
pub trait ReleaseHook {
    fn release(&self, ptr: NonNull<u8>, size: usize);
}

impl<F: Fn(NonNull<u8>, usize)> ReleaseHook for F {
    fn release(&self, ptr: NonNull<u8>, size: usize) {
        self(ptr, size)
    }
}

/// One entry of [`HugeAllocator::huge_extents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HugeExtentInfo {
    pub addr: usize,
    pub size: usize,
    pub zeroed: bool,
    pub prof_tctx: ProfTctx,
}

struct Placed {
    ptr: NonNull<u8>,
    size: usize,
    arena: ArenaId,
}

/// The huge allocation path over a chunk backend `B`.
pub struct HugeAllocator<B> {
    config: HugeConfig,
    classes: SizeClasses,
    fill: FillPolicy,
    arenas: Arenas,
    registry: ExtentRegistry,
    log: LifecycleLog,
    backend: B,
}

impl<B: ChunkBackend> HugeAllocator<B> {
    /// Builds the manager after validating `config`.
    pub fn new(config: HugeConfig, backend: B) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            classes: SizeClasses::new(config.lg_chunk),
            fill: FillPolicy::from_config(&config),
            arenas: Arenas::new(config.narenas, config.max_extents_per_arena),
            registry: ExtentRegistry::new(config.registry_capacity),
            log: LifecycleLog::new(config.log_capacity),
            backend,
            config,
        })
    }

    pub fn config(&self) -> &HugeConfig {
        &self.config
    }

    pub fn classes(&self) -> &SizeClasses {
        &self.classes
    }

    pub fn arenas(&self) -> &Arenas {
        &self.arenas
    }

    pub fn registry(&self) -> &ExtentRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn lifecycle_log(&self) -> &LifecycleLog {
        &self.log
    }

    /// Drains buffered lifecycle records.
    pub fn drain_lifecycle_logs(&self) -> Vec<HugeLogRecord> {
        self.log.drain()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates at least `size` bytes, chunk aligned.
    pub fn allocate(
        &self,
        size: usize,
        zero: bool,
        arena: Option<ArenaId>,
    ) -> Result<NonNull<u8>, HugeError> {
        self.palloc("allocate", size, self.classes.chunk_size(), zero, arena)
            .map(|placed| placed.ptr)
    }

    /// Allocates at least `size` bytes aligned to `alignment`.
    pub fn allocate_aligned(
        &self,
        size: usize,
        alignment: usize,
        zero: bool,
        arena: Option<ArenaId>,
    ) -> Result<NonNull<u8>, HugeError> {
        self.palloc("allocate_aligned", size, alignment, zero, arena)
            .map(|placed| placed.ptr)
    }

    fn palloc(
        &self,
        symbol: &'static str,
        size: usize,
        alignment: usize,
        zero: bool,
        hint: Option<ArenaId>,
    ) -> Result<Placed, HugeError> {
        if !alignment.is_power_of_two() {
            return Err(self.denied(symbol, size, HugeError::InvalidAlignment { alignment }));
        }
        let usize = match (size != 0).then(|| self.classes.sa2u(size, alignment)).flatten() {
            Some(usize) if usize <= HUGE_MAXCLASS => usize,
            _ => return Err(self.denied(symbol, size, HugeError::SizeOutOfRange { size, alignment })),
        };
        let Some(arena) = self.arenas.choose(hint) else {
            let arena = hint.unwrap_or(ArenaId::new(0));
            return Err(self.denied(symbol, size, HugeError::ArenaUnavailable { arena }));
        };
        let id = arena.id();

        let reserved = arena.huge.lock().reserve();
        let slot = match reserved {
            Ok(slot) => slot,
            Err(err) => {
                let details = match err {
                    ReserveError::Limit(limit) => format!("extent limit {limit} reached"),
                    ReserveError::Alloc(err) => err.to_string(),
                };
                self.emit(
                    LogEvent::new(HugeLogLevel::Warn, symbol, "alloc")
                        .size(usize)
                        .arena(id)
                        .outcome("oom")
                        .details(details),
                );
                return Err(HugeError::MetadataAllocation { arena: id });
            }
        };

        let alignment = alignment.max(self.classes.chunk_size());
        let grant = match self.backend.alloc_huge(id, usize, alignment, zero) {
            Ok(grant) => grant,
            Err(err) => {
                arena.huge.lock().release(slot);
                self.emit(
                    LogEvent::new(HugeLogLevel::Warn, symbol, "alloc")
                        .size(usize)
                        .arena(id)
                        .outcome("oom")
                        .details(err.to_string()),
                );
                return Err(HugeError::BackendExhausted {
                    size: usize,
                    alignment,
                });
            }
        };

        let addr = grant.addr.as_ptr() as usize;
        let extent = ExtentRef { arena: id, slot };
        if let Err(err) = self.registry.register(addr, extent, self.chunks(usize)) {
            self.backend.dalloc_huge(id, grant.addr, usize);
            arena.huge.lock().release(slot);
            self.emit(
                LogEvent::new(HugeLogLevel::Info, symbol, "rollback")
                    .ptr(addr)
                    .size(usize)
                    .arena(id)
                    .outcome("registration")
                    .details(err.to_string()),
            );
            return Err(HugeError::Registration { addr });
        }
        arena
            .huge
            .lock()
            .link_tail(slot, ExtentRecord::new(addr, id, usize, grant.zeroed));

        // SAFETY: the backend granted chunk_ceiling(usize) writable bytes at addr.
        unsafe { self.fill.fill_new(addr, usize, zero, grant.zeroed) };
        arena.note_malloc(usize);
        self.emit(
            LogEvent::new(HugeLogLevel::Trace, symbol, "alloc")
                .ptr(addr)
                .size(usize)
                .arena(id)
                .details(format!("zeroed={} alignment={alignment}", grant.zeroed)),
        );
        self.backend.notify_activity(id);
        Ok(Placed {
            ptr: grant.addr,
            size: usize,
            arena: id,
        })
    }

    // ------------------------------------------------------------------
    // Resizing
    // ------------------------------------------------------------------

    /// Tries to give the allocation at `ptr` (currently `old` bytes) a usable
    /// size within `[min, max]` without moving it.
    ///
    /// Strategies are tried in order: expand to `max`, expand to `min`,
    /// a resize within the current chunks, shrink to `max`.
    pub fn resize_in_place(
        &self,
        ptr: NonNull<u8>,
        old: usize,
        min: usize,
        max: usize,
        zero: bool,
    ) -> InPlace {
        let outcome = self.ralloc_no_move(ptr, old, min, max, zero);
        if outcome == InPlace::MustMove {
            self.emit(
                LogEvent::new(HugeLogLevel::Trace, "resize_in_place", "must_move")
                    .ptr(ptr.as_ptr() as usize)
                    .size(max)
                    .outcome("must_move")
                    .details(format!("old={old} min={min} max={max}")),
            );
        }
        outcome
    }

    fn ralloc_no_move(
        &self,
        ptr: NonNull<u8>,
        old: usize,
        min: usize,
        max: usize,
        zero: bool,
    ) -> InPlace {
        let chunk = self.classes.chunk_size();
        // Both sizes must be huge to avoid a move.
        if old < chunk || max < chunk {
            return InPlace::MustMove;
        }
        let (Some(min), Some(max)) = (s2u(min.max(chunk)), s2u(max)) else {
            return InPlace::MustMove;
        };
        let max = max.max(min);

        let addr = ptr.as_ptr() as usize;
        let Some((arena, slot)) = self.extent_of(addr) else {
            self.emit(
                LogEvent::new(HugeLogLevel::Warn, "resize_in_place", "unknown_huge_pointer")
                    .ptr(addr)
                    .outcome("must_move"),
            );
            return InPlace::MustMove;
        };
        let recorded = arena.huge.lock().get(slot).map(|record| record.size);
        if recorded != Some(old) {
            self.emit(
                LogEvent::new(HugeLogLevel::Warn, "resize_in_place", "size_mismatch")
                    .ptr(addr)
                    .size(old)
                    .arena(arena.id())
                    .outcome("must_move")
                    .details(format!("recorded={recorded:?}")),
            );
            return InPlace::MustMove;
        }

        let ceiling_old = self.classes.chunk_ceiling(old);
        let ceiling_min = self.classes.chunk_ceiling(min);
        let ceiling_max = self.classes.chunk_ceiling(max);

        if ceiling_max > ceiling_old {
            if self.expand(arena, slot, ptr, old, max, zero) {
                return self.resized(arena);
            }
            // Retry with min; report success only if this expansion takes.
            if min < max && ceiling_min > ceiling_old && self.expand(arena, slot, ptr, old, min, zero) {
                return self.resized(arena);
            }
        }

        if ceiling_old >= ceiling_min && ceiling_old <= ceiling_max {
            self.similar(arena, slot, ptr, old, min, max, zero);
            return self.resized(arena);
        }

        if ceiling_old > ceiling_max && self.shrink(arena, slot, ptr, old, max) {
            return self.resized(arena);
        }
        InPlace::MustMove
    }

    fn resized(&self, arena: &Arena) -> InPlace {
        self.backend.notify_activity(arena.id());
        InPlace::Resized
    }

    /// Grows the run in place so it covers `new` bytes.
    fn expand(
        &self,
        arena: &Arena,
        slot: usize,
        ptr: NonNull<u8>,
        old: usize,
        new: usize,
        zero: bool,
    ) -> bool {
        let id = arena.id();
        let addr = ptr.as_ptr() as usize;
        let Some(subchunk_zeroed) = arena.huge.lock().get(slot).map(|record| record.zeroed) else {
            return false;
        };
        let chunks_zeroed = match self.backend.expand_huge(id, ptr, old, new, zero) {
            Ok(zeroed) => zeroed,
            Err(err) => {
                self.emit(
                    LogEvent::new(HugeLogLevel::Trace, "resize_in_place", "expand")
                        .ptr(addr)
                        .size(new)
                        .arena(id)
                        .outcome("refused")
                        .details(err.to_string()),
                );
                return false;
            }
        };
        // The slack past `new` now lies entirely in the chunks just acquired.
        self.update_extent(arena, slot, addr, new, Some(chunks_zeroed));

        // SAFETY: the run now covers chunk_ceiling(new) writable bytes.
        unsafe {
            self.fill.fill_expanded(
                addr,
                old,
                self.classes.chunk_ceiling(old),
                new,
                zero,
                subchunk_zeroed,
                chunks_zeroed,
            );
        }
        arena.note_resize(old, new);
        self.emit(
            LogEvent::new(HugeLogLevel::Trace, "resize_in_place", "expand")
                .ptr(addr)
                .size(new)
                .arena(id)
                .details(format!("old={old} chunks_zeroed={chunks_zeroed}")),
        );
        true
    }

    /// Resizes within the current chunk run. Always succeeds.
    #[allow(clippy::too_many_arguments)]
    fn similar(
        &self,
        arena: &Arena,
        slot: usize,
        ptr: NonNull<u8>,
        old: usize,
        min: usize,
        max: usize,
        zero: bool,
    ) {
        // Largest class in [min, max] not above old, or min if min > old.
        let mut usize = min;
        while usize < max {
            match self.classes.next_class(usize) {
                Some(next) if next <= old => usize = next,
                _ => break,
            }
        }
        if usize == old {
            return;
        }

        let id = arena.id();
        let addr = ptr.as_ptr() as usize;
        let pre_zeroed = arena
            .huge
            .lock()
            .get(slot)
            .is_some_and(|record| record.zeroed);
        let post_zeroed = if old > usize {
            let trimmed = old - usize;
            if self.fill.junk_on_free() {
                // SAFETY: [usize, old) is still part of this allocation's run.
                unsafe { self.fill.junk_trimmed(addr + usize, trimmed) };
                false
            } else {
                self.backend
                    .purge(id, ptr, self.classes.chunk_ceiling(old), usize, trimmed)
            }
        } else {
            pre_zeroed
        };
        self.update_extent(arena, slot, addr, usize, Some(post_zeroed));
        self.backend.ralloc_huge_similar(id, ptr, old, usize);

        if old < usize {
            // SAFETY: usize stays within the run's existing chunks.
            unsafe { self.fill.fill_new(addr + old, usize - old, zero, pre_zeroed) };
        }
        arena.note_resize(old, usize);
        self.emit(
            LogEvent::new(HugeLogLevel::Trace, "resize_in_place", "similar")
                .ptr(addr)
                .size(usize)
                .arena(id)
                .details(format!("old={old} zeroed={post_zeroed}")),
        );
    }

    /// Releases trailing chunks so the run covers `new` bytes.
    fn shrink(&self, arena: &Arena, slot: usize, ptr: NonNull<u8>, old: usize, new: usize) -> bool {
        let id = arena.id();
        let addr = ptr.as_ptr() as usize;
        let ceiling_old = self.classes.chunk_ceiling(old);
        let ceiling_new = self.classes.chunk_ceiling(new);
        let Some(pre_zeroed) = arena.huge.lock().get(slot).map(|record| record.zeroed) else {
            return false;
        };

        if ceiling_old > ceiling_new {
            if let Err(err) = self.backend.split(id, ptr, ceiling_old, ceiling_new) {
                self.emit(
                    LogEvent::new(HugeLogLevel::Trace, "resize_in_place", "shrink")
                        .ptr(addr)
                        .size(new)
                        .arena(id)
                        .outcome("refused")
                        .details(err.to_string()),
                );
                return false;
            }
        }

        let post_zeroed = if old > new {
            let trimmed = old - new;
            if self.fill.junk_on_free() {
                // SAFETY: new < old, so the tail stays inside the run.
                let tail = unsafe { ptr.add(new) };
                // SAFETY: [new, old) is about to leave the allocation.
                unsafe { self.fill.junk_release(&self.backend, tail, trimmed) };
                false
            } else {
                let tail = addr + new;
                let base_offset = self.classes.chunk_addr_to_base(tail) - addr;
                // SAFETY: the chunk holding the tail lies inside the run.
                let base = unsafe { ptr.add(base_offset) };
                self.backend.purge(
                    id,
                    base,
                    ceiling_old,
                    self.classes.chunk_addr_to_offset(tail),
                    trimmed,
                )
            }
        } else {
            pre_zeroed
        };
        self.update_extent(arena, slot, addr, new, Some(post_zeroed));
        self.backend.shrink_huge(id, ptr, old, new);

        arena.note_resize(old, new);
        self.emit(
            LogEvent::new(HugeLogLevel::Trace, "resize_in_place", "shrink")
                .ptr(addr)
                .size(new)
                .arena(id)
                .details(format!("old={old} zeroed={post_zeroed}")),
        );
        true
    }

    /// Resizes to `new` bytes, moving the allocation if it cannot be resized
    /// in place. The old allocation goes to `release` when given, otherwise
    /// to [`Self::deallocate`]. On failure the old allocation is untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn resize_or_move(
        &self,
        ptr: NonNull<u8>,
        old: usize,
        new: usize,
        alignment: usize,
        zero: bool,
        arena: Option<ArenaId>,
        release: Option<&dyn ReleaseHook>,
    ) -> Result<NonNull<u8>, HugeError> {
        if self.resize_in_place(ptr, old, new, new, zero).is_resized() {
            return Ok(ptr);
        }

        let alignment = if alignment <= self.classes.chunk_size() {
            self.classes.chunk_size()
        } else {
            alignment
        };
        let placed = self.palloc("resize_or_move", new, alignment, zero, arena)?;

        // SAFETY: distinct live allocations; both cover at least the copied length.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), placed.ptr.as_ptr(), old.min(placed.size)) };
        match release {
            Some(hook) => hook.release(ptr, old),
            None => self.deallocate(ptr),
        }

        if let Some(target) = self.arenas.get(placed.arena) {
            target.note_move();
        }
        self.emit(
            LogEvent::new(HugeLogLevel::Trace, "resize_or_move", "resize_move")
                .ptr(placed.ptr.as_ptr() as usize)
                .size(placed.size)
                .arena(placed.arena)
                .details(format!("from={:#x} old={old}", ptr.as_ptr() as usize)),
        );
        Ok(placed.ptr)
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    /// Releases the allocation at `ptr`. Unknown addresses are logged and ignored.
    pub fn deallocate(&self, ptr: NonNull<u8>) {
        self.dalloc(ptr);
    }

    /// Returns false when nothing was released.
    fn dalloc(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let Some(found) = self.registry.lookup(addr) else {
            self.unknown_pointer(addr);
            return false;
        };
        // Resolve the arena first so a bad entry stays registered and linked.
        let Some(arena) = self.arenas.get(found.arena) else {
            self.emit(
                LogEvent::new(HugeLogLevel::Error, "deallocate", "dalloc")
                    .ptr(addr)
                    .arena(found.arena)
                    .outcome("unknown_arena"),
            );
            return false;
        };
        // A concurrent release of the same address wins the deregister.
        let Some(extent) = self.registry.deregister(addr) else {
            self.unknown_pointer(addr);
            return false;
        };
        let record = arena.huge.lock().unlink(extent.slot);

        // SAFETY: the allocation is no longer reachable through the registry.
        unsafe { self.fill.junk_release(&self.backend, ptr, record.size) };
        self.backend.dalloc_huge(arena.id(), ptr, record.size);
        arena.huge.lock().release(extent.slot);

        arena.note_dalloc(record.size);
        self.emit(
            LogEvent::new(HugeLogLevel::Trace, "deallocate", "dalloc")
                .ptr(addr)
                .size(record.size)
                .arena(arena.id()),
        );
        self.backend.notify_activity(arena.id());
        true
    }

    fn unknown_pointer(&self, addr: usize) {
        self.emit(
            LogEvent::new(HugeLogLevel::Warn, "deallocate", "unknown_huge_pointer")
                .ptr(addr)
                .outcome("ignored"),
        );
    }

    /// Releases every huge allocation of `arena`, newest first. Returns the
    /// number released.
    ///
    /// Works from a snapshot of the arena's list: extents released elsewhere
    /// in the meantime are skipped and the walk continues with older ones.
    /// Allocations made after the snapshot survive.
    pub fn reset_arena(&self, arena: ArenaId) -> Result<usize, HugeError> {
        let target = self
            .arenas
            .get(arena)
            .ok_or(HugeError::ArenaUnavailable { arena })?;
        let snapshot: Vec<usize> = target
            .huge
            .lock()
            .iter()
            .map(|(_, record)| record.addr())
            .collect();

        let mut released = 0;
        let mut skipped = 0;
        for addr in snapshot.into_iter().rev() {
            let owned = self
                .registry
                .lookup(addr)
                .is_some_and(|extent| extent.arena == arena);
            match NonNull::new(addr as *mut u8) {
                Some(ptr) if owned && self.dalloc(ptr) => released += 1,
                _ => skipped += 1,
            }
        }
        self.emit(
            LogEvent::new(HugeLogLevel::Info, "reset_arena", "arena_reset")
                .arena(arena)
                .details(format!("released={released} skipped={skipped}")),
        );
        Ok(released)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Arena owning the allocation at `ptr`. Takes no huge lock.
    pub fn owning_arena(&self, ptr: NonNull<u8>) -> Option<ArenaId> {
        self.registry
            .lookup(ptr.as_ptr() as usize)
            .map(|extent| extent.arena)
    }

    /// Usable size of the allocation at `ptr`.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.with_record(ptr, |record| record.size)
    }

    pub fn prof_tctx(&self, ptr: NonNull<u8>) -> Option<ProfTctx> {
        self.with_record(ptr, |record| record.prof_tctx)
    }

    /// Attaches a profiling context. Returns false for unknown addresses.
    pub fn set_prof_tctx(&self, ptr: NonNull<u8>, tctx: ProfTctx) -> bool {
        self.with_record(ptr, |record| record.prof_tctx = tctx)
            .is_some()
    }

    /// Stores the reset marker [`ProfTctx::RESET`].
    pub fn reset_prof_tctx(&self, ptr: NonNull<u8>) -> bool {
        self.set_prof_tctx(ptr, ProfTctx::RESET)
    }

    /// Snapshot of an arena's huge extents in allocation order.
    pub fn huge_extents(&self, arena: ArenaId) -> Option<Vec<HugeExtentInfo>> {
        let target = self.arenas.get(arena)?;
        let list = target.huge.lock();
        Some(
            list.iter()
                .map(|(_, record)| HugeExtentInfo {
                    addr: record.addr(),
                    size: record.size,
                    zeroed: record.zeroed,
                    prof_tctx: record.prof_tctx,
                })
                .collect(),
        )
    }

    pub fn stats(&self, arena: ArenaId) -> Option<HugeArenaStats> {
        self.arenas.get(arena).map(Arena::stats)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn chunks(&self, size: usize) -> usize {
        self.classes.chunk_ceiling(size) >> self.classes.lg_chunk()
    }

    fn extent_of(&self, addr: usize) -> Option<(&Arena, usize)> {
        let extent = self.registry.lookup(addr)?;
        let arena = self.arenas.get(extent.arena)?;
        Some((arena, extent.slot))
    }

    fn with_record<T>(&self, ptr: NonNull<u8>, f: impl FnOnce(&mut ExtentRecord) -> T) -> Option<T> {
        let (arena, slot) = self.extent_of(ptr.as_ptr() as usize)?;
        let mut list = arena.huge.lock();
        list.get_mut(slot).map(f)
    }

    /// Applies a new size (and zero state) under the huge lock, then moves
    /// the registry's chunk accounting to match.
    fn update_extent(&self, arena: &Arena, slot: usize, addr: usize, size: usize, zeroed: Option<bool>) {
        {
            let mut list = arena.huge.lock();
            if let Some(record) = list.get_mut(slot) {
                record.size = size;
                if let Some(zeroed) = zeroed {
                    record.zeroed = zeroed;
                }
            }
        }
        self.registry.reregister(addr, self.chunks(size));
    }

    fn denied(&self, symbol: &'static str, size: usize, err: HugeError) -> HugeError {
        self.emit(
            LogEvent::new(HugeLogLevel::Debug, symbol, "alloc")
                .size(size)
                .outcome("denied")
                .details(err.to_string()),
        );
        err
    }

    fn emit(&self, event: LogEvent) {
        self.log
            .record(event, self.registry.len(), self.registry.current_chunks());
    }
}
