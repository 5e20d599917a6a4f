//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Inbound message model, routing, and event sources."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Everything between the message bus and the integration engine: the event
//! envelope, payload validation, topic routing, and the sources that produce
//! events (MQTT, in-process channels, recorded files).

pub mod mqtt;
pub mod replay;
pub mod router;
pub mod source;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised while receiving or interpreting inbound events.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// A power-topic payload was not a finite decimal number.
    #[error("invalid payload on '{topic}': {reason}")]
    InvalidPayload {
        /// Topic the payload arrived on.
        topic: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The broker refused the session.
    #[error("broker refused connection: {0}")]
    Refused(String),
    /// The broker could not be reached or the session broke before it was established.
    #[error("broker connection failed: {0}")]
    Connection(String),
    /// The MQTT client request queue rejected a request.
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    /// Wrapper for IO errors encountered while reading recorded events.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON problems in recorded events.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Configuration for a source was incomplete.
    #[error("invalid source configuration: {0}")]
    Config(String),
}

pub use mqtt::MqttEventSource;
pub use replay::{RecordedEvent, ReplayEventSource};
pub use router::{Routed, TopicRouter};
pub use source::{ChannelEventSource, EventSource};
pub use types::{parse_watts, InboundEvent, Reading};
