//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Inbound message model, routing, and event sources."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One message as delivered by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// When the message reached this process.
    pub arrival: DateTime<Utc>,
}

impl InboundEvent {
    /// Construct an event.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, arrival: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            arrival,
        }
    }

    /// Payload rendered for traces; non UTF-8 bytes are replaced.
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// One instantaneous power measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Instantaneous power in watts.
    pub watts: f64,
    /// When the measurement was observed.
    pub observed_at: DateTime<Utc>,
}

impl Reading {
    /// Construct a reading.
    pub fn new(watts: f64, observed_at: DateTime<Utc>) -> Self {
        Self { watts, observed_at }
    }
}

/// Interpret a payload as a watt value.
///
/// The payload must be UTF-8 text holding one finite decimal number,
/// surrounding whitespace allowed. Negative values are accepted (export).
pub fn parse_watts(payload: &[u8]) -> Result<f64, String> {
    let text = std::str::from_utf8(payload).map_err(|_| "payload is not UTF-8".to_owned())?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("payload is empty".to_owned());
    }
    let watts = trimmed
        .parse::<f64>()
        .map_err(|err| format!("'{}' is not a number: {}", trimmed, err))?;
    if !watts.is_finite() {
        return Err(format!("'{}' is not a finite value", trimmed));
    }
    Ok(watts)
}
