//! Extent metadata records and the per-arena huge list.
//!
//! Records live in a slab owned by their arena and are linked into an
//! index-based doubly linked list in insertion order. The slab grows with
//! fallible reservation, so running out of metadata memory surfaces as an
//! error instead of an abort. Every method on [`HugeList`] runs under the
//! arena's huge lock.

use std::collections::TryReserveError;

use serde::Serialize;

use crate::arena::ArenaId;

/// Opaque profiling context attached to an extent.
///
/// `0` means no context was ever attached and `1` is the reserved "reset"
/// marker. Both are distinct from every real context pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProfTctx(usize);

impl ProfTctx {
    /// No context attached.
    pub const UNSET: Self = Self(0);
    /// Explicitly reset.
    pub const RESET: Self = Self(1);

    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// True for a real context (neither unset nor the reset marker).
    #[must_use]
    pub const fn is_sampled(self) -> bool {
        self.0 > Self::RESET.0
    }
}

impl Default for ProfTctx {
    fn default() -> Self {
        Self::UNSET
    }
}

/// Metadata for one live huge allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentRecord {
    addr: usize,
    arena: ArenaId,
    /// Usable size.
    pub size: usize,
    /// Bytes past `size` within the backing chunks are known to be zero.
    pub zeroed: bool,
    pub prof_tctx: ProfTctx,
}

impl ExtentRecord {
    pub fn new(addr: usize, arena: ArenaId, size: usize, zeroed: bool) -> Self {
        Self {
            addr,
            arena,
            size,
            zeroed,
            prof_tctx: ProfTctx::UNSET,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn arena(&self) -> ArenaId {
        self.arena
    }
}

#[derive(Debug)]
struct Node {
    record: ExtentRecord,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
enum Slot {
    Vacant { next_free: Option<usize> },
    /// Storage handed out but not yet linked.
    Reserved,
    Linked(Node),
}

/// Why a slot could not be reserved.
#[derive(Debug)]
pub enum ReserveError {
    /// The configured extent limit is reached.
    Limit(usize),
    Alloc(TryReserveError),
}

/// Per-arena list of huge extents.
#[derive(Debug, Default)]
pub struct HugeList {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    linked: usize,
    reserved: usize,
    limit: Option<usize>,
}

impl HugeList {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Number of linked extents.
    pub fn len(&self) -> usize {
        self.linked
    }

    pub fn is_empty(&self) -> bool {
        self.linked == 0
    }

    /// Slots reserved but not yet linked.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Reserves storage for one record and returns its slot.
    pub fn reserve(&mut self) -> Result<usize, ReserveError> {
        if let Some(limit) = self.limit {
            if self.linked + self.reserved >= limit {
                return Err(ReserveError::Limit(limit));
            }
        }
        let slot = match self.free_head {
            Some(idx) => {
                let Slot::Vacant { next_free } = self.slots[idx] else {
                    unreachable!("free list points at an occupied slot");
                };
                self.free_head = next_free;
                self.slots[idx] = Slot::Reserved;
                idx
            }
            None => {
                self.slots.try_reserve(1).map_err(ReserveError::Alloc)?;
                self.slots.push(Slot::Reserved);
                self.slots.len() - 1
            }
        };
        self.reserved += 1;
        Ok(slot)
    }

    /// Returns a reserved slot to the free list.
    pub fn release(&mut self, slot: usize) {
        debug_assert!(matches!(self.slots[slot], Slot::Reserved));
        self.slots[slot] = Slot::Vacant {
            next_free: self.free_head,
        };
        self.free_head = Some(slot);
        self.reserved -= 1;
    }

    /// Links `record` at the tail using a previously reserved slot.
    pub fn link_tail(&mut self, slot: usize, record: ExtentRecord) {
        debug_assert!(matches!(self.slots[slot], Slot::Reserved));
        let prev = self.tail;
        self.slots[slot] = Slot::Linked(Node {
            record,
            prev,
            next: None,
        });
        match prev {
            Some(p) => self.node_mut(p).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.reserved -= 1;
        self.linked += 1;
    }

    /// Unlinks a record; its slot stays reserved until [`Self::release`].
    pub fn unlink(&mut self, slot: usize) -> ExtentRecord {
        let Slot::Linked(node) = std::mem::replace(&mut self.slots[slot], Slot::Reserved) else {
            unreachable!("unlink of an unlinked slot {slot}");
        };
        match node.prev {
            Some(p) => self.node_mut(p).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.node_mut(n).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.linked -= 1;
        self.reserved += 1;
        node.record
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        match &mut self.slots[slot] {
            Slot::Linked(node) => node,
            _ => unreachable!("list link to an unlinked slot {slot}"),
        }
    }

    /// Record in `slot`, if linked.
    pub fn get(&self, slot: usize) -> Option<&ExtentRecord> {
        match self.slots.get(slot)? {
            Slot::Linked(node) => Some(&node.record),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ExtentRecord> {
        match self.slots.get_mut(slot)? {
            Slot::Linked(node) => Some(&mut node.record),
            _ => None,
        }
    }

    /// Iterates `(slot, record)` in insertion order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }
}

/// Insertion-order iterator over a [`HugeList`].
pub struct Iter<'a> {
    list: &'a HugeList,
    cursor: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (usize, &'a ExtentRecord);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        match &self.list.slots[slot] {
            Slot::Linked(node) => {
                self.cursor = node.next;
                Some((slot, &node.record))
            }
            _ => None,
        }
    }
}
