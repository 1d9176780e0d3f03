//! Arenas as seen by the huge path.
//!
//! Each arena owns one huge lock guarding its [`HugeList`] and every mutable
//! field of the records in it. Counters are atomics updated outside the lock.
//! Threads are bound to an arena round-robin on first use.

use parking_lot::Mutex;
use serde::Serialize;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::extent::HugeList;

/// Arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ArenaId(u32);

impl ArenaId {
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Point-in-time huge statistics of one arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HugeArenaStats {
    pub nmalloc: u64,
    pub ndalloc: u64,
    pub nresize_in_place: u64,
    pub nmoves: u64,
    /// Usable bytes currently allocated.
    pub allocated: usize,
    /// Live extents in the arena list.
    pub live: usize,
}

/// One arena's huge state.
pub struct Arena {
    id: ArenaId,
    pub(crate) huge: Mutex<HugeList>,
    nmalloc: AtomicU64,
    ndalloc: AtomicU64,
    nresize_in_place: AtomicU64,
    nmoves: AtomicU64,
    allocated: AtomicUsize,
}

impl Arena {
    pub(crate) fn new(id: ArenaId, max_extents: Option<usize>) -> Self {
        Self {
            id,
            huge: Mutex::new(HugeList::new(max_extents)),
            nmalloc: AtomicU64::new(0),
            ndalloc: AtomicU64::new(0),
            nresize_in_place: AtomicU64::new(0),
            nmoves: AtomicU64::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> ArenaId {
        self.id
    }

    pub(crate) fn note_malloc(&self, size: usize) {
        self.nmalloc.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn note_dalloc(&self, size: usize) {
        self.ndalloc.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_sub(size, Ordering::Relaxed);
    }

    pub(crate) fn note_resize(&self, old_size: usize, new_size: usize) {
        self.nresize_in_place.fetch_add(1, Ordering::Relaxed);
        if new_size >= old_size {
            self.allocated.fetch_add(new_size - old_size, Ordering::Relaxed);
        } else {
            self.allocated.fetch_sub(old_size - new_size, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_move(&self) {
        self.nmoves.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the arena's huge counters.
    #[must_use]
    pub fn stats(&self) -> HugeArenaStats {
        let live = self.huge.lock().len();
        HugeArenaStats {
            nmalloc: self.nmalloc.load(Ordering::Relaxed),
            ndalloc: self.ndalloc.load(Ordering::Relaxed),
            nresize_in_place: self.nresize_in_place.load(Ordering::Relaxed),
            nmoves: self.nmoves.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            live,
        }
    }
}

thread_local! {
    static BOUND_ARENA: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Fixed set of arenas with automatic choice.
pub struct Arenas {
    arenas: Box<[Arena]>,
    next_bind: AtomicUsize,
}

impl Arenas {
    pub(crate) fn new(count: usize, max_extents: Option<usize>) -> Self {
        let arenas: Vec<Arena> = (0..count)
            .map(|i| Arena::new(ArenaId::new(i as u32), max_extents))
            .collect();
        Self {
            arenas: arenas.into_boxed_slice(),
            next_bind: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arenas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: ArenaId) -> Option<&Arena> {
        self.arenas.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arena> {
        self.arenas.iter()
    }

    /// Resolves an arena hint. `None` picks the calling thread's arena,
    /// binding the thread round-robin on first use.
    pub fn choose(&self, hint: Option<ArenaId>) -> Option<&Arena> {
        if let Some(id) = hint {
            return self.get(id);
        }
        if self.arenas.is_empty() {
            return None;
        }
        let index = BOUND_ARENA.with(|bound| match bound.get() {
            Some(index) => index,
            None => {
                let index = self.next_bind.fetch_add(1, Ordering::Relaxed);
                bound.set(Some(index));
                index
            }
        });
        // The binding is global to the thread; fold it into this set's range.
        self.arenas.get(index % self.arenas.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn explicit_hint_resolves_or_fails() {
        let arenas = Arenas::new(3, None);
        assert_eq!(arenas.choose(Some(ArenaId::new(2))).unwrap().id(), ArenaId::new(2));
        assert!(arenas.choose(Some(ArenaId::new(3))).is_none());
    }

    #[test]
    fn automatic_choice_is_sticky_per_thread() {
        let arenas = Arenas::new(4, None);
        let first = arenas.choose(None).unwrap().id();
        for _ in 0..10 {
            assert_eq!(arenas.choose(None).unwrap().id(), first);
        }
    }

    #[test]
    fn automatic_choice_spreads_threads() {
        let arenas = Arc::new(Arenas::new(4, None));
        let ids: HashSet<ArenaId> = (0..8)
            .map(|_| {
                let arenas = Arc::clone(&arenas);
                thread::spawn(move || arenas.choose(None).unwrap().id())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert!(ids.len() > 1, "8 fresh threads should not all bind to one arena");
    }

    #[test]
    fn empty_set_has_no_choice() {
        let arenas = Arenas::new(0, None);
        assert!(arenas.is_empty());
        assert!(arenas.choose(None).is_none());
    }

    #[test]
    fn stats_track_counters() {
        let arena = Arena::new(ArenaId::new(0), None);
        arena.note_malloc(4 << 20);
        arena.note_resize(4 << 20, 6 << 20);
        arena.note_resize(6 << 20, 2 << 20);
        arena.note_move();
        arena.note_dalloc(2 << 20);
        let stats = arena.stats();
        assert_eq!(stats.nmalloc, 1);
        assert_eq!(stats.ndalloc, 1);
        assert_eq!(stats.nresize_in_place, 2);
        assert_eq!(stats.nmoves, 1);
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.live, 0);
    }
}
