//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Append-only storage for closed metering periods.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing the report log.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A line in the report log could not be interpreted as a record.
    #[error("malformed report line {line}: {reason}")]
    MalformedRecord {
        /// One-based line number within the log file.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },
    /// The log was already closed with its sentinel line.
    #[error("report log already finished")]
    Finished,
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub mod metrics;
pub mod report_log;

pub use metrics::PersistenceMetrics;
pub use report_log::replay as replay_report_log;
pub use report_log::{ReportLogReader, ReportLogWriter, ReportRecord, REPORT_HEADER, REPORT_SENTINEL};
