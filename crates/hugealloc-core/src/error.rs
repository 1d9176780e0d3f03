//! Huge-path error taxonomy.
//!
//! Every fallible operation either completes or leaves the registry, the
//! arena lists and the backend exactly as they were. Nothing is retried
//! here; the allocator front end decides whether to purge and try again.

use thiserror::Error;

use crate::arena::ArenaId;

/// Failure of a huge allocation or move-resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HugeError {
    /// The request rounds to zero or beyond the largest huge class.
    #[error("size {size} with alignment {alignment} is outside the huge size classes")]
    SizeOutOfRange { size: usize, alignment: usize },
    #[error("alignment {alignment} is not a power of two")]
    InvalidAlignment { alignment: usize },
    /// The arena hint names no arena.
    #[error("arena {arena:?} is not available")]
    ArenaUnavailable { arena: ArenaId },
    /// No storage for the extent record.
    #[error("extent metadata allocation failed in arena {arena:?}")]
    MetadataAllocation { arena: ArenaId },
    /// The chunk backend could not supply memory.
    #[error("chunk backend exhausted for {size} bytes (alignment {alignment})")]
    BackendExhausted { size: usize, alignment: usize },
    /// The registry rejected the new address.
    #[error("extent registration failed for {addr:#x}")]
    Registration { addr: usize },
}

impl HugeError {
    /// Stable label used in lifecycle logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SizeOutOfRange { .. } => "size_out_of_range",
            Self::InvalidAlignment { .. } => "invalid_alignment",
            Self::ArenaUnavailable { .. } => "arena_unavailable",
            Self::MetadataAllocation { .. } => "metadata_allocation",
            Self::BackendExhausted { .. } => "backend_exhausted",
            Self::Registration { .. } => "registration",
        }
    }

    /// True for failures caused by resource exhaustion rather than a bad request.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::MetadataAllocation { .. } | Self::BackendExhausted { .. } | Self::Registration { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_values() {
        let err = HugeError::BackendExhausted {
            size: 4096,
            alignment: 2048,
        };
        let text = err.to_string();
        assert!(text.contains("4096"));
        assert!(text.contains("2048"));
        assert_eq!(
            HugeError::Registration { addr: 0x200000 }.to_string(),
            "extent registration failed for 0x200000"
        );
    }

    #[test]
    fn exhaustion_classification() {
        assert!(HugeError::MetadataAllocation { arena: ArenaId::new(0) }.is_exhaustion());
        assert!(HugeError::Registration { addr: 1 }.is_exhaustion());
        assert!(
            !HugeError::SizeOutOfRange {
                size: 0,
                alignment: 0
            }
            .is_exhaustion()
        );
        assert_eq!(
            HugeError::InvalidAlignment { alignment: 3 }.as_str(),
            "invalid_alignment"
        );
    }
}
