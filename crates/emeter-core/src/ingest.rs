//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Energy integration engine and lifecycle primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Event loop driving an [`EnergyAccumulator`] from an [`EventSource`].
use emeter_msg::{EventSource, Routed, TopicRouter};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::accumulator::EnergyAccumulator;
use crate::sink::ReportSink;
use crate::Result;

/// Why the ingest loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stop channel fired or its sender was dropped.
    Requested,
    /// The source reported end of stream.
    SourceExhausted,
    /// A flush crossed into the next calendar month.
    MonthRollover,
}

/// Counters collected over one ingest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub events: u64,
    pub readings: u64,
    pub rejected: u64,
    pub stop: StopReason,
}

/// Pump events from `source` into `accumulator` until `stop` fires, the
/// source ends or the reporting month rolls over.
///
/// Payloads on the power topic that do not parse as watts are logged and
/// skipped. Source and sink failures end the loop with an error. The source
/// is closed on every exit path.
pub async fn run_ingest<E, S>(
    source: &mut E,
    router: &TopicRouter,
    accumulator: &mut EnergyAccumulator<S>,
    mut stop: oneshot::Receiver<()>,
) -> Result<IngestSummary>
where
    E: EventSource + ?Sized,
    S: ReportSink,
{
    let mut events = 0u64;
    let mut readings = 0u64;
    let mut rejected = 0u64;
    info!(source = source.name(), topic = router.power_topic(), "ingest started");

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop => break Ok(StopReason::Requested),
            next = source.next_event() => next,
        };
        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => break Ok(StopReason::SourceExhausted),
            Err(err) => break Err(err.into()),
        };
        events += 1;

        match router.route(&event) {
            Ok(Routed::Reading(reading)) => {
                let outcome = match accumulator.ingest(reading) {
                    Ok(outcome) => outcome,
                    Err(err) => break Err(err),
                };
                readings += 1;
                if outcome.month_rollover() {
                    break Ok(StopReason::MonthRollover);
                }
            }
            Ok(Routed::Passthrough) => {}
            Err(err) => {
                rejected += 1;
                warn!(error = %err, "discarding power reading");
                if let Some(metrics) = accumulator.metrics() {
                    metrics.record_rejected();
                }
            }
        }
    };

    if let Err(err) = source.close().await {
        warn!(source = source.name(), error = %err, "failed to close event source");
    }

    let stop = outcome?;
    info!(?stop, events, readings, rejected, "ingest stopped");
    Ok(IngestSummary {
        events,
        readings,
        rejected,
        stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::MeterError;
    use chrono::{DateTime, Utc};
    use emeter_common::ReportZone;
    use emeter_msg::{ChannelEventSource, InboundEvent};

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn runs_until_source_exhausted() {
        let (tx, mut source) = ChannelEventSource::channel(8);
        let router = TopicRouter::new("emon/emonesp/W", false);
        let sink = MemorySink::new();
        let mut acc =
            EnergyAccumulator::new(sink.clone(), ReportZone::utc(), at("2024-05-01T10:15:00Z"))
                .unwrap();

        tx.send(InboundEvent::new("emon/emonesp/W", "100", at("2024-05-01T10:00:00Z")))
            .await
            .unwrap();
        tx.send(InboundEvent::new("emon/emonesp/W", "abc", at("2024-05-01T10:01:00Z")))
            .await
            .unwrap();
        tx.send(InboundEvent::new("emon/emonesp/V", "230", at("2024-05-01T10:02:00Z")))
            .await
            .unwrap();
        tx.send(InboundEvent::new("emon/emonesp/W", "100", at("2024-05-01T10:15:00Z")))
            .await
            .unwrap();
        drop(tx);

        let (_stop_tx, stop_rx) = oneshot::channel();
        let summary = run_ingest(&mut source, &router, &mut acc, stop_rx)
            .await
            .unwrap();
        assert_eq!(
            summary,
            IngestSummary {
                events: 4,
                readings: 2,
                rejected: 1,
                stop: StopReason::SourceExhausted,
            }
        );
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn stop_request_ends_loop() {
        let (_tx, mut source) = ChannelEventSource::channel(1);
        let router = TopicRouter::new("emon/emonesp/W", false);
        let mut acc = EnergyAccumulator::new(
            MemorySink::new(),
            ReportZone::utc(),
            at("2024-05-01T10:15:00Z"),
        )
        .unwrap();
        let (stop_tx, stop_rx) = oneshot::channel();
        stop_tx.send(()).unwrap();
        let summary = run_ingest(&mut source, &router, &mut acc, stop_rx)
            .await
            .unwrap();
        assert_eq!(summary.stop, StopReason::Requested);
        assert_eq!(summary.events, 0);
    }

    #[tokio::test]
    async fn sink_failure_is_fatal() {
        let (tx, mut source) = ChannelEventSource::channel(4);
        let router = TopicRouter::new("emon/emonesp/W", false);
        let mut acc = EnergyAccumulator::new(
            MemorySink::failing_after(0),
            ReportZone::utc(),
            at("2024-05-01T10:15:00Z"),
        )
        .unwrap();
        tx.send(InboundEvent::new("emon/emonesp/W", "100", at("2024-05-01T10:00:00Z")))
            .await
            .unwrap();
        tx.send(InboundEvent::new("emon/emonesp/W", "100", at("2024-05-01T10:20:00Z")))
            .await
            .unwrap();

        let (_stop_tx, stop_rx) = oneshot::channel();
        let err = run_ingest(&mut source, &router, &mut acc, stop_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, MeterError::Sink { .. }));
    }

    #[tokio::test]
    async fn month_rollover_ends_loop_before_next_month() {
        let (tx, mut source) = ChannelEventSource::channel(64);
        let router = TopicRouter::new("emon/emonesp/W", false);
        let sink = MemorySink::new();
        let mut acc = EnergyAccumulator::starting_at(
            sink.clone(),
            ReportZone::utc(),
            at("2024-01-31T23:20:00Z"),
        );

        // 23:20 on 31 January through 01:50 on 1 February, every five minutes.
        let start = at("2024-01-31T23:20:00Z");
        for step in 0..=30 {
            let arrival = start + chrono::TimeDelta::minutes(5 * step);
            tx.send(InboundEvent::new("emon/emonesp/W", "800", arrival))
                .await
                .unwrap();
        }
        drop(tx);

        let (_stop_tx, stop_rx) = oneshot::channel();
        let summary = run_ingest(&mut source, &router, &mut acc, stop_rx)
            .await
            .unwrap();
        assert_eq!(summary.stop, StopReason::MonthRollover);
        // 23:20, 23:25, 23:30, 23:35, 23:40, 23:45.
        assert_eq!(summary.readings, 6);

        let labels: Vec<_> = sink
            .records()
            .into_iter()
            .map(|r| r.period_start_label)
            .collect();
        assert_eq!(labels, ["2024-01-31_23:15", "2024-01-31_23:30"]);
        assert!(labels.iter().all(|label| !label.starts_with("2024-02")));
    }
}
