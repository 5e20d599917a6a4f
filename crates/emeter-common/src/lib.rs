//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the metering runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the emeter workspace.
//! This crate exposes configuration loading, logging setup, and the calendar
//! helpers that keep reporting periods aligned to wall-clock time.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{AppConfig, BrokerConfig, LoadedAppConfig, LoggingConfig, MeterConfig, MetricsConfig};
pub use logging::{init_tracing, LogFormat};
pub use time::{period_length, ReportZone, LABEL_FORMAT, PERIOD_SECONDS};
