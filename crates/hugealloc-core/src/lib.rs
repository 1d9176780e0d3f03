//! # hugealloc-core
//!
//! The huge (chunk-granular) allocation path of a general-purpose memory
//! allocator.
//!
//! Requests of at least one chunk are served by [`HugeAllocator`]: it rounds
//! them to huge size classes, obtains chunk runs from a [`ChunkBackend`],
//! keeps side-table metadata per allocation, and resizes in place (expand,
//! same-run, shrink) before falling back to a move. Zero-fill and junk-fill
//! guarantees hold across every size change.
//!
//! Unsafe code is confined to the backend, fill and manager modules.

#![deny(unsafe_code)]

pub mod arena;
#[allow(unsafe_code)]
pub mod backend;
pub mod config;
pub mod error;
pub mod extent;
#[allow(unsafe_code)]
pub mod fill;
#[allow(unsafe_code)]
pub mod huge;
pub mod log;
pub mod registry;
pub mod size_class;

pub use arena::{ArenaId, HugeArenaStats};
pub use backend::{ChunkBackend, ChunkError, ChunkGrant, ChunkPool};
pub use config::{HugeConfig, JunkMode};
pub use error::HugeError;
pub use extent::ProfTctx;
pub use huge::{HugeAllocator, HugeExtentInfo, InPlace, ReleaseHook};
pub use log::{HugeLogLevel, HugeLogRecord};
