//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{self, Counter, Histogram, HistogramOpts, IntCounter, Opts, Registry};

use crate::Result;

/// Metrics published by the report log.
#[derive(Clone)]
pub struct PersistenceMetrics {
    records_written: IntCounter,
    write_failures: IntCounter,
    bytes_written: Counter,
    sync_duration: Histogram,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let records_written = IntCounter::with_opts(Opts::new(
            "emeter_report_records_total",
            "Total number of period records durably appended to the report log",
        ))?;
        registry.register(Box::new(records_written.clone()))?;

        let write_failures = IntCounter::with_opts(Opts::new(
            "emeter_report_write_failures_total",
            "Total number of report log appends that failed",
        ))?;
        registry.register(Box::new(write_failures.clone()))?;

        let bytes_written = Counter::with_opts(Opts::new(
            "emeter_report_bytes_total",
            "Total bytes appended to the report log",
        ))?;
        registry.register(Box::new(bytes_written.clone()))?;

        let sync_duration = Histogram::with_opts(
            HistogramOpts::new(
                "emeter_report_sync_seconds",
                "Time spent syncing buffered records to stable storage",
            )
            .buckets(prometheus::exponential_buckets(0.0001, 2.0, 14)?),
        )?;
        registry.register(Box::new(sync_duration.clone()))?;

        Ok(Self {
            records_written,
            write_failures,
            bytes_written,
            sync_duration,
        })
    }

    /// Record one sync that made `records` records (`bytes` bytes) durable.
    pub fn record_sync(&self, records: u64, bytes: usize, seconds: f64) {
        self.records_written.inc_by(records);
        self.bytes_written.inc_by(bytes as f64);
        self.sync_duration.observe(seconds);
    }

    /// Record a failed append.
    pub fn record_failure(&self) {
        self.write_failures.inc();
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}
