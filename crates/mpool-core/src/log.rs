//! Structured pool lifecycle records.
//!
//! A pool emits a [`PoolLogRecord`] for every arena build, bypass mapping,
//! release and failure, and a trace-level record for each cell handed out
//! or returned. Records go to an injected [`PoolObserver`]; without one,
//! no record is built at all.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use serde::Serialize;

/// Record severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolLogRecord {
    /// Monotonic per-pool event id.
    pub decision_id: u64,
    /// Correlation id: `mpool::<symbol>::<decision_id as hex>`.
    pub trace_id: String,
    pub level: PoolLogLevel,
    /// API entry point (`allocate`, `repool`, `resize`, `teardown`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `repool`, `arena_build`, `large_map`, ...).
    pub event: &'static str,
    /// Address involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<usize>,
    /// Byte count involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Size class index, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
    /// Snapshot: registered arenas at emission time.
    pub arenas: usize,
}

/// Receiver for pool lifecycle records.
pub trait PoolObserver {
    /// Records below this level are never built for this observer.
    fn min_level(&self) -> PoolLogLevel {
        PoolLogLevel::Trace
    }

    fn record(&mut self, record: &PoolLogRecord);
}

/// Keeps every record in memory.
///
/// Clones share one buffer: hand a clone to the pool and read the records
/// through the one you kept.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    records: Rc<RefCell<Vec<PoolLogRecord>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record so far.
    pub fn records(&self) -> Vec<PoolLogRecord> {
        self.records.borrow().clone()
    }

    /// Number of records whose `event` matches.
    pub fn count_events(&self, event: &str) -> usize {
        self.records
            .borrow()
            .iter()
            .filter(|r| r.event == event)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }
}

impl PoolObserver for RecordingObserver {
    fn record(&mut self, record: &PoolLogRecord) {
        self.records.borrow_mut().push(record.clone());
    }
}

/// Writes one JSON object per line.
///
/// Write failures are swallowed: logging never changes allocator behavior.
#[derive(Debug)]
pub struct JsonlObserver<W: Write> {
    writer: W,
    min_level: PoolLogLevel,
}

impl<W: Write> JsonlObserver<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            min_level: PoolLogLevel::Debug,
        }
    }

    /// Only emit records at or above `level`.
    #[must_use]
    pub fn with_min_level(mut self, level: PoolLogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> PoolObserver for JsonlObserver<W> {
    fn min_level(&self) -> PoolLogLevel {
        self.min_level
    }

    fn record(&mut self, record: &PoolLogRecord) {
        if let Ok(line) = serde_json::to_string(record) {
            let _ = writeln!(self.writer, "{line}");
        }
    }
}

/// Pool-side emitter: owns the optional observer and the id counter.
pub(crate) struct Emitter {
    observer: Option<Box<dyn PoolObserver>>,
    next_decision_id: u64,
}

impl Emitter {
    pub(crate) fn new(observer: Option<Box<dyn PoolObserver>>) -> Self {
        Self {
            observer,
            next_decision_id: 1,
        }
    }

    pub(crate) fn enabled(&self, level: PoolLogLevel) -> bool {
        self.observer
            .as_ref()
            .is_some_and(|observer| level >= observer.min_level())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn emit(
        &mut self,
        level: PoolLogLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        class: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
        arenas: usize,
    ) {
        if !self.enabled(level) {
            return;
        }
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        let record = PoolLogRecord {
            decision_id,
            trace_id: format!("mpool::{symbol}::{decision_id:016x}"),
            level,
            symbol,
            event,
            ptr,
            size,
            class,
            outcome,
            details: details.into(),
            arenas,
        };
        if let Some(observer) = self.observer.as_mut() {
            observer.record(&record);
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("observer", &self.observer.is_some())
            .field("next_decision_id", &self.next_decision_id)
            .finish()
    }
}
