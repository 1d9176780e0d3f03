//! Size classes and chunk arithmetic for the huge path.
//!
//! Classes follow a geometric progression with four classes per doubling.
//! Below the first full group the spacing is one quantum (16 bytes). Above
//! it, the spacing inside the group `(2^(n-1), 2^n]` is `2^(n-3)`:
//!
//! ```text
//! chunk = 2 MiB:  2M, 2.5M, 3M, 3.5M, 4M, 5M, 6M, 7M, 8M, 10M, ...
//! ```
//!
//! Huge classes are therefore not chunk multiples in general, which is why
//! the resize logic compares chunk ceilings rather than sizes.

/// Log2 of the minimum class spacing.
pub const LG_QUANTUM: u32 = 4;

/// Minimum class spacing (bytes).
pub const QUANTUM: usize = 1 << LG_QUANTUM;

/// Log2 of the number of classes per size doubling.
pub const LG_SIZE_CLASS_GROUP: u32 = 2;

/// Log2 of the page size assumed for purge granularity.
pub const LG_PAGE: u32 = 12;

/// Page size (bytes).
pub const PAGE: usize = 1 << LG_PAGE;

/// Largest huge size class: `2^(B-2) + 3 * 2^(B-4)` for pointer width `B`.
pub const HUGE_MAXCLASS: usize = (1 << (usize::BITS - 2)) + (3 << (usize::BITS - 4));

/// Smallest supported `lg_chunk`. Class spacing at the chunk size must be
/// at least a page so every huge boundary can be purged.
pub const MIN_LG_CHUNK: u8 = 14;

/// Largest supported `lg_chunk`.
pub const MAX_LG_CHUNK: u8 = (usize::BITS - 3) as u8;

/// Floor of log2; `x` must be non-zero.
#[inline]
fn lg_floor(x: usize) -> u32 {
    usize::BITS - 1 - x.leading_zeros()
}

/// Rounds `size` up to its size class.
///
/// Returns `None` for zero and for sizes above [`HUGE_MAXCLASS`].
pub fn s2u(size: usize) -> Option<usize> {
    if size == 0 || size > HUGE_MAXCLASS {
        return None;
    }
    if size <= QUANTUM {
        return Some(QUANTUM);
    }
    // (size << 1) cannot overflow: HUGE_MAXCLASS < 2^(B-1).
    let x = lg_floor((size << 1) - 1);
    let lg_delta = if x < LG_SIZE_CLASS_GROUP + LG_QUANTUM + 1 {
        LG_QUANTUM
    } else {
        x - LG_SIZE_CLASS_GROUP - 1
    };
    let delta_mask = (1usize << lg_delta) - 1;
    Some((size + delta_mask) & !delta_mask)
}

/// Chunk geometry derived from `lg_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClasses {
    lg_chunk: u8,
    chunk_size: usize,
    chunk_mask: usize,
}

impl SizeClasses {
    /// Builds the geometry for `2^lg_chunk` byte chunks.
    ///
    /// `lg_chunk` is clamped to `[MIN_LG_CHUNK, MAX_LG_CHUNK]`; use
    /// [`crate::config::HugeConfig::validate`] to reject bad values up front.
    pub fn new(lg_chunk: u8) -> Self {
        let lg_chunk = lg_chunk.clamp(MIN_LG_CHUNK, MAX_LG_CHUNK);
        let chunk_size = 1usize << lg_chunk;
        Self {
            lg_chunk,
            chunk_size,
            chunk_mask: chunk_size - 1,
        }
    }

    pub fn lg_chunk(&self) -> u8 {
        self.lg_chunk
    }

    /// Chunk size (bytes); also the smallest huge class.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Rounds `size` up to a chunk multiple. `size` must be at most
    /// [`HUGE_MAXCLASS`], which keeps the addition in range.
    #[inline]
    pub fn chunk_ceiling(&self, size: usize) -> usize {
        (size + self.chunk_mask) & !self.chunk_mask
    }

    /// Base address of the chunk containing `addr`.
    #[inline]
    pub fn chunk_addr_to_base(&self, addr: usize) -> usize {
        addr & !self.chunk_mask
    }

    /// Offset of `addr` within its chunk.
    #[inline]
    pub fn chunk_addr_to_offset(&self, addr: usize) -> usize {
        addr & self.chunk_mask
    }

    /// Size class strictly above `size`, or `None` past the last class.
    pub fn next_class(&self, size: usize) -> Option<usize> {
        s2u(size.checked_add(1)?)
    }

    /// Usable size of a huge request with the given alignment.
    ///
    /// Requests below one chunk round up to exactly one chunk. Returns `None`
    /// if the size or alignment is out of range, or if the worst-case
    /// aligned mapping (`usize + alignment - PAGE`) would overflow.
    pub fn sa2u(&self, size: usize, alignment: usize) -> Option<usize> {
        if alignment > HUGE_MAXCLASS {
            return None;
        }
        let usize = if size <= self.chunk_size {
            self.chunk_size
        } else {
            s2u(size)?
        };
        let alignment = alignment.max(self.chunk_size);
        usize.checked_add(alignment - PAGE)?;
        Some(usize)
    }

    /// Returns true if `size` is served by the huge path.
    #[inline]
    pub fn is_huge(&self, size: usize) -> bool {
        size >= self.chunk_size
    }
}

impl Default for SizeClasses {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_LG_CHUNK)
    }
}
