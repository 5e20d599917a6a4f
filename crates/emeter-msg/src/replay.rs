//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Inbound message model, routing, and event sources."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::debug;

use crate::source::EventSource;
use crate::types::InboundEvent;
use crate::Result;

/// One line of a recorded event file.
///
/// The recorded `arrival` is replayed verbatim, which makes recomputing a
/// report from a capture fully deterministic. `delay_ms` optionally paces the
/// replay in real time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Topic the message was published on.
    pub topic: String,
    /// Payload as text.
    pub payload: String,
    /// Arrival time of the original delivery.
    pub arrival: DateTime<Utc>,
    /// Pause before delivering this event.
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

impl From<RecordedEvent> for InboundEvent {
    fn from(record: RecordedEvent) -> Self {
        InboundEvent::new(record.topic, record.payload, record.arrival)
    }
}

/// Replay events from a newline-delimited JSON file.
#[derive(Debug)]
pub struct ReplayEventSource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    pending: Option<RecordedEvent>,
}

impl ReplayEventSource {
    /// Open a recording for replay.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
            pending: None,
        })
    }

    /// Arrival time of the next recorded event, without consuming it.
    pub async fn peek_arrival(&mut self) -> Result<Option<DateTime<Utc>>> {
        if self.pending.is_none() {
            self.pending = self.read_record().await?;
        }
        Ok(self.pending.as_ref().map(|record| record.arrival))
    }

    async fn read_record(&mut self) -> Result<Option<RecordedEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
        Ok(None)
    }
}

#[async_trait]
impl EventSource for ReplayEventSource {
    async fn next_event(&mut self) -> Result<Option<InboundEvent>> {
        let record = match self.pending.take() {
            Some(record) => Some(record),
            None => self.read_record().await?,
        };
        if let Some(record) = record {
            if let Some(delay) = record.delay_ms {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            return Ok(Some(record.into()));
        }
        debug!(path = %self.path.display(), lines = self.line_no, "recording exhausted");
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "replay"
    }
}
