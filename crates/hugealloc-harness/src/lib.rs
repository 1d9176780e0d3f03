//! Stress and configuration harness for hugealloc.
//!
//! This crate provides:
//! - Stress: a deterministic multi-threaded workload over a [`ChunkPool`]
//!   that checks zero/junk fill and registry consistency as it runs
//! - Reports: a serializable summary plus the allocator's lifecycle log
//!
//! [`ChunkPool`]: hugealloc_core::ChunkPool

pub mod stress;

pub use stress::{StressConfig, StressError, StressReport, parse_seed};
