//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Energy integration engine and lifecycle primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io;
use std::sync::Arc;

use emeter_persistence::{PersistenceError, ReportLogWriter, ReportRecord};
use parking_lot::Mutex;

/// Destination for closed periods.
///
/// Every record must be durable once `flush` returns. An error from either
/// method means the period was not externalised.
pub trait ReportSink: Send {
    fn append_record(&mut self, record: &ReportRecord) -> Result<(), PersistenceError>;

    fn flush(&mut self) -> Result<(), PersistenceError>;
}

/// Records are buffered by `append_record`; `flush` performs the single sync.
impl ReportSink for ReportLogWriter {
    fn append_record(&mut self, record: &ReportRecord) -> Result<(), PersistenceError> {
        self.write_record(record).map(|_| ())
    }

    fn flush(&mut self) -> Result<(), PersistenceError> {
        ReportLogWriter::flush(self)
    }
}

impl<S: ReportSink + ?Sized> ReportSink for Box<S> {
    fn append_record(&mut self, record: &ReportRecord) -> Result<(), PersistenceError> {
        (**self).append_record(record)
    }

    fn flush(&mut self) -> Result<(), PersistenceError> {
        (**self).flush()
    }
}

/// In-memory sink whose clones share one record list.
///
/// Used by tests and replay tooling. `failing_after` turns it into a sink
/// that rejects appends once a number of records has been accepted.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkState>>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    records: Vec<ReportRecord>,
    flushes: usize,
    fail_after: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `accepted` records, then fail every further append.
    pub fn failing_after(accepted: usize) -> Self {
        let sink = Self::default();
        sink.inner.lock().fail_after = Some(accepted);
        sink
    }

    pub fn records(&self) -> Vec<ReportRecord> {
        self.inner.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush_count(&self) -> usize {
        self.inner.lock().flushes
    }
}

impl ReportSink for MemorySink {
    fn append_record(&mut self, record: &ReportRecord) -> Result<(), PersistenceError> {
        let mut state = self.inner.lock();
        if state.fail_after.is_some_and(|limit| state.records.len() >= limit) {
            return Err(PersistenceError::Io(io::Error::new(
                io::ErrorKind::Other,
                "memory sink refused record",
            )));
        }
        state.records.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PersistenceError> {
        self.inner.lock().flushes += 1;
        Ok(())
    }
}
