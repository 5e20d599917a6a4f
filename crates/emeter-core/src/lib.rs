//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Energy integration engine and lifecycle primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Streaming energy integration.
//!
//! Power readings are integrated with the trapezoidal rule into calendar
//! aligned 15-minute periods. Each closed period is written to a
//! [`ReportSink`] and a calendar-month rollover raises a
//! [`TerminationSignal`] that releases the daemon's [`CancellableWait`].

pub mod accumulator;
pub mod ingest;
pub mod sample_clock;
pub mod sink;
pub mod wait;

use chrono::{DateTime, Utc};
use emeter_msg::MessagingError;
use emeter_persistence::PersistenceError;

pub use accumulator::{AccumulatorPhase, AccumulatorState, EnergyAccumulator, IngestOutcome};
pub use ingest::{run_ingest, IngestSummary, StopReason};
pub use sample_clock::{SampleClock, BOOTSTRAP_ELAPSED_MS};
pub use sink::{MemorySink, ReportSink};
pub use wait::{CancellableWait, TerminationSignal, WaitOutcome};

/// Shared result type for the engine.
pub type Result<T> = std::result::Result<T, MeterError>;

/// Errors raised by the integration engine. All of them are fatal to the ingest loop.
#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    /// The report sink rejected a closed period; it cannot be externalised.
    #[error("report sink failed while closing period {period}: {source}")]
    Sink {
        period: String,
        #[source]
        source: PersistenceError,
    },
    /// A previous sink failure left the accumulator unusable.
    #[error("accumulator halted after an earlier sink failure")]
    Halted,
    /// A flush already crossed into the next calendar month; the report is complete.
    #[error("reporting month is closed; no further readings are accepted")]
    MonthClosed,
    /// The initial period bound is not on the 15-minute grid.
    #[error("period bound {0} is not aligned to a 15-minute boundary")]
    UnalignedBound(DateTime<Utc>),
    /// The event source failed.
    #[error(transparent)]
    Source(#[from] MessagingError),
}
