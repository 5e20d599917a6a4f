//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Inbound message model, routing, and event sources."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::InboundEvent;
use crate::Result;

/// Source abstraction used by all event backends.
///
/// Events are pulled one at a time, so whoever drives a source never sees two
/// deliveries in flight.
#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next event. `Ok(None)` means the source is exhausted.
    async fn next_event(&mut self) -> Result<Option<InboundEvent>>;

    /// Release the source (disconnect from the broker, close files).
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Human-readable source name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Source fed from an in-process channel, primarily for tests and embedding.
#[derive(Debug)]
pub struct ChannelEventSource {
    rx: mpsc::Receiver<InboundEvent>,
}

impl ChannelEventSource {
    /// Create a bounded channel and return the sending half with the source.
    pub fn channel(capacity: usize) -> (mpsc::Sender<InboundEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next_event(&mut self) -> Result<Option<InboundEvent>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}
