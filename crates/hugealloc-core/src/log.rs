//! Structured lifecycle logging for the huge path.
//!
//! Every allocation, resize, move and release appends one
//! [`HugeLogRecord`] to a bounded ring. When the ring is full the oldest
//! record is dropped. Callers drain the ring and may export it as JSONL.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::ArenaId;

/// Huge lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HugeLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured huge lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HugeLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    /// Severity level.
    pub level: HugeLogLevel,
    /// API symbol (`allocate`, `resize_in_place`, `deallocate`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `expand`, `dalloc`, ...).
    pub event: &'static str,
    /// Address involved in the event.
    pub ptr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Arena the event ran against.
    pub arena: Option<ArenaId>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: registered extents.
    pub live_extents: usize,
    /// Snapshot: chunks accounted to registered extents.
    pub registered_chunks: usize,
}

/// Fields of one event before it is stamped with ids.
#[derive(Debug, Clone)]
pub(crate) struct LogEvent {
    pub level: HugeLogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    pub arena: Option<ArenaId>,
    pub outcome: &'static str,
    pub details: String,
}

impl LogEvent {
    pub(crate) fn new(level: HugeLogLevel, symbol: &'static str, event: &'static str) -> Self {
        Self {
            level,
            symbol,
            event,
            ptr: None,
            size: None,
            arena: None,
            outcome: "ok",
            details: String::new(),
        }
    }

    pub(crate) fn ptr(mut self, ptr: usize) -> Self {
        self.ptr = Some(ptr);
        self
    }

    pub(crate) fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub(crate) fn arena(mut self, arena: ArenaId) -> Self {
        self.arena = Some(arena);
        self
    }

    pub(crate) fn outcome(mut self, outcome: &'static str) -> Self {
        self.outcome = outcome;
        self
    }

    pub(crate) fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Bounded ring of lifecycle records.
pub struct LifecycleLog {
    capacity: usize,
    next_decision_id: AtomicU64,
    dropped: AtomicU64,
    records: Mutex<VecDeque<HugeLogRecord>>,
}

impl LifecycleLog {
    /// A log keeping at most `capacity` records; `0` disables logging.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_decision_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            records: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub(crate) fn record(&self, event: LogEvent, live_extents: usize, registered_chunks: usize) {
        if !self.is_enabled() {
            return;
        }
        let decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let trace_id = format!("huge::{}::{:016x}", event.symbol, decision_id);
        let record = HugeLogRecord {
            decision_id,
            trace_id,
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            ptr: event.ptr,
            size: event.size,
            arena: event.arena,
            outcome: event.outcome,
            details: event.details,
            live_extents,
            registered_chunks,
        };
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record);
    }

    /// Records evicted because the ring was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the buffered records without removing them.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HugeLogRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Removes and returns every buffered record, oldest first.
    pub fn drain(&self) -> Vec<HugeLogRecord> {
        self.records.lock().drain(..).collect()
    }
}

/// Serializes records as one JSON object per line.
pub fn to_jsonl(records: &[HugeLogRecord]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(out)
}
