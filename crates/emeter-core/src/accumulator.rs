//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Energy integration engine and lifecycle primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Trapezoidal integration of power readings into 15-minute periods.
use chrono::{DateTime, Utc};
use emeter_common::{period_length, ReportZone};
use emeter_metrics::MeterMetrics;
use emeter_msg::Reading;
use emeter_persistence::ReportRecord;
use tracing::{debug, error, info};

use crate::sample_clock::SampleClock;
use crate::sink::ReportSink;
use crate::wait::TerminationSignal;
use crate::{MeterError, Result};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;
const WATT_HOURS_PER_KWH: f64 = 1000.0;

/// Integration state carried between readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumulatorState {
    /// Last integrated power value; 0 before the first reading.
    pub previous_watts: f64,
    /// Timestamp of the last integrated reading.
    pub previous_sample_time: Option<DateTime<Utc>>,
    /// Energy integrated into the open period, in watt-hours.
    pub accumulated_watt_hours: f64,
    /// Exclusive end of the open period; always on the 15-minute grid.
    pub period_upper_bound: DateTime<Utc>,
}

/// Result of one [`EnergyAccumulator::ingest`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The reading was integrated into the open period.
    Accumulated,
    /// The reading closed one or more periods.
    Flushed {
        records: Vec<ReportRecord>,
        month_rollover: bool,
    },
}

impl IngestOutcome {
    pub fn records(&self) -> &[ReportRecord] {
        match self {
            IngestOutcome::Accumulated => &[],
            IngestOutcome::Flushed { records, .. } => records,
        }
    }

    pub fn month_rollover(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Flushed {
                month_rollover: true,
                ..
            }
        )
    }
}

/// Phase reached by the most recent [`EnergyAccumulator::ingest`].
///
/// `Flushed` is transient: the next reading puts the accumulator back into
/// `Accumulating` for the period that just opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccumulatorPhase {
    #[default]
    Accumulating,
    Flushed,
}

/// Integrates readings and emits one record per closed period.
#[derive(Debug)]
pub struct EnergyAccumulator<S> {
    sink: S,
    zone: ReportZone,
    clock: SampleClock,
    state: AccumulatorState,
    phase: AccumulatorPhase,
    termination: Option<TerminationSignal>,
    metrics: Option<MeterMetrics>,
    periods_closed: u64,
    halted: bool,
    month_closed: bool,
}

impl<S: ReportSink> EnergyAccumulator<S> {
    /// Start with an explicit first period bound, which must sit on the grid.
    pub fn new(sink: S, zone: ReportZone, period_upper_bound: DateTime<Utc>) -> Result<Self> {
        if !zone.is_aligned(period_upper_bound) {
            return Err(MeterError::UnalignedBound(period_upper_bound));
        }
        Ok(Self::with_bound(sink, zone, period_upper_bound))
    }

    /// Start at `now`: the first period ends at the next 15-minute boundary.
    pub fn starting_at(sink: S, zone: ReportZone, now: DateTime<Utc>) -> Self {
        let bound = zone.align_up(now);
        Self::with_bound(sink, zone, bound)
    }

    fn with_bound(sink: S, zone: ReportZone, period_upper_bound: DateTime<Utc>) -> Self {
        Self {
            sink,
            zone,
            clock: SampleClock::new(),
            state: AccumulatorState {
                previous_watts: 0.0,
                previous_sample_time: None,
                accumulated_watt_hours: 0.0,
                period_upper_bound,
            },
            phase: AccumulatorPhase::Accumulating,
            termination: None,
            metrics: None,
            periods_closed: 0,
            halted: false,
            month_closed: false,
        }
    }

    /// Raise `signal` whenever a flush moves the period bound into a new month.
    pub fn with_termination(mut self, signal: TerminationSignal) -> Self {
        self.termination = Some(signal);
        self
    }

    pub fn with_metrics(mut self, metrics: MeterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Integrate one reading.
    ///
    /// The reading is integrated into the open period using the trapezoid
    /// between it and the previous reading, so a reading that straddles a
    /// boundary is credited to the closing period. Then every period whose
    /// bound is at or before the reading is closed, in order; after a gap the
    /// skipped periods are reported with 0 kWh.
    ///
    /// Catch-up stops at the flush that moves the bound into the next
    /// calendar month. That month is closed: later calls return
    /// [`MeterError::MonthClosed`] and nothing after the edge is reported.
    ///
    /// A sink failure halts the accumulator: the failing period stays open
    /// and every later call returns [`MeterError::Halted`].
    pub fn ingest(&mut self, reading: Reading) -> Result<IngestOutcome> {
        if self.halted {
            return Err(MeterError::Halted);
        }
        if self.month_closed {
            return Err(MeterError::MonthClosed);
        }

        let previous = self
            .state
            .previous_sample_time
            .unwrap_or(reading.observed_at);
        let elapsed_ms = self.clock.elapsed_millis(previous, reading.observed_at);
        let average_watts = (reading.watts + self.state.previous_watts) / 2.0;
        let watt_hours = average_watts * elapsed_ms as f64 / MILLIS_PER_HOUR;
        self.state.accumulated_watt_hours += watt_hours;
        self.state.previous_watts = reading.watts;
        self.state.previous_sample_time = Some(reading.observed_at);
        self.phase = AccumulatorPhase::Accumulating;

        debug!(
            watts = reading.watts,
            elapsed_ms,
            watt_hours,
            accumulated_wh = self.state.accumulated_watt_hours,
            "reading integrated"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_reading();
        }

        let mut records = Vec::new();
        let mut month_rollover = false;
        while reading.observed_at >= self.state.period_upper_bound {
            let (record, crossed) = self.flush()?;
            records.push(record);
            if crossed {
                month_rollover = true;
                break;
            }
        }

        if records.is_empty() {
            Ok(IngestOutcome::Accumulated)
        } else {
            self.phase = AccumulatorPhase::Flushed;
            Ok(IngestOutcome::Flushed {
                records,
                month_rollover,
            })
        }
    }

    /// Close the open period: persist it, reset the energy, advance the bound.
    fn flush(&mut self) -> Result<(ReportRecord, bool)> {
        let closing_bound = self.state.period_upper_bound;
        let period_start = closing_bound - period_length();
        let record = ReportRecord::new(
            self.zone.label(period_start),
            self.state.accumulated_watt_hours / WATT_HOURS_PER_KWH,
        );

        let written = self
            .sink
            .append_record(&record)
            .and_then(|()| self.sink.flush());
        if let Err(source) = written {
            self.halted = true;
            error!(period = %record.period_start_label, error = %source, "failed to persist period");
            return Err(MeterError::Sink {
                period: record.period_start_label,
                source,
            });
        }

        self.state.accumulated_watt_hours = 0.0;
        self.state.period_upper_bound = closing_bound + period_length();
        self.periods_closed += 1;
        info!(period = %record.period_start_label, kwh = record.kwh, "period closed");
        if let Some(metrics) = &self.metrics {
            metrics.record_period(record.kwh);
        }

        // Only the flush that moves the bound across the month boundary counts.
        let crossed =
            self.zone.month(closing_bound) != self.zone.month(self.state.period_upper_bound);
        if crossed {
            self.month_closed = true;
            info!(
                bound = %self.zone.label(self.state.period_upper_bound),
                "calendar month rolled over"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_rollover();
            }
            if let Some(signal) = &self.termination {
                signal.signal();
            }
        }
        Ok((record, crossed))
    }

    pub fn state(&self) -> &AccumulatorState {
        &self.state
    }

    pub fn phase(&self) -> AccumulatorPhase {
        self.phase
    }

    pub fn period_upper_bound(&self) -> DateTime<Utc> {
        self.state.period_upper_bound
    }

    /// Start of the open period.
    pub fn period_start(&self) -> DateTime<Utc> {
        self.state.period_upper_bound - period_length()
    }

    pub fn zone(&self) -> ReportZone {
        self.zone
    }

    pub fn periods_closed(&self) -> u64 {
        self.periods_closed
    }

    pub fn metrics(&self) -> Option<&MeterMetrics> {
        self.metrics.as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// True once a flush has crossed into the next calendar month.
    pub fn is_month_closed(&self) -> bool {
        self.month_closed
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use chrono::TimeDelta;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn accumulator(bound: &str) -> (EnergyAccumulator<MemorySink>, MemorySink) {
        let sink = MemorySink::new();
        let acc = EnergyAccumulator::new(sink.clone(), ReportZone::utc(), at(bound)).unwrap();
        (acc, sink)
    }

    #[test]
    fn rejects_unaligned_bound() {
        let err = EnergyAccumulator::new(
            MemorySink::new(),
            ReportZone::utc(),
            at("2024-05-01T10:07:00Z"),
        )
        .unwrap_err();
        assert!(matches!(err, MeterError::UnalignedBound(_)));
    }

    #[test]
    fn starting_at_aligns_up() {
        let acc = EnergyAccumulator::starting_at(
            MemorySink::new(),
            ReportZone::utc(),
            at("2024-05-01T10:07:31.5Z"),
        );
        assert_eq!(acc.period_upper_bound(), at("2024-05-01T10:15:00Z"));
        assert_eq!(acc.period_start(), at("2024-05-01T10:00:00Z"));
    }

    #[test]
    fn first_reading_uses_bootstrap_weight() {
        let (mut acc, sink) = accumulator("2024-05-01T10:15:00Z");
        let outcome = acc
            .ingest(Reading::new(3600.0, at("2024-05-01T10:00:00Z")))
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Accumulated);
        // (3600 + 0) / 2 W for one second.
        assert!((acc.state().accumulated_watt_hours - 0.5).abs() < 1e-12);
        assert!(sink.is_empty());
    }

    #[test]
    fn trapezoid_between_readings() {
        let (mut acc, _) = accumulator("2024-05-01T10:15:00Z");
        acc.ingest(Reading::new(100.0, at("2024-05-01T10:00:00Z")))
            .unwrap();
        let before = acc.state().accumulated_watt_hours;
        acc.ingest(Reading::new(300.0, at("2024-05-01T10:01:00Z")))
            .unwrap();
        // 200 W average over one minute.
        let added = acc.state().accumulated_watt_hours - before;
        assert!((added - 200.0 / 60.0).abs() < 1e-9);
        assert_eq!(acc.state().previous_watts, 300.0);
    }

    #[test]
    fn straddling_reading_is_credited_to_closing_period() {
        let (mut acc, sink) = accumulator("2024-05-01T10:15:00Z");
        acc.ingest(Reading::new(100.0, at("2024-05-01T10:00:00Z")))
            .unwrap();
        assert_eq!(acc.phase(), AccumulatorPhase::Accumulating);
        let outcome = acc
            .ingest(Reading::new(100.0, at("2024-05-01T10:15:00Z")))
            .unwrap();
        assert_eq!(outcome.records().len(), 1);
        assert!(!outcome.month_rollover());
        assert_eq!(acc.phase(), AccumulatorPhase::Flushed);

        let records = sink.records();
        assert_eq!(records[0].period_start_label, "2024-05-01_10:00");
        // 50 W bootstrap second plus 100 W for the full 15 minutes.
        let expected = (50.0 / 3600.0 + 25.0) / 1000.0;
        assert!((records[0].kwh - expected).abs() < 1e-12);
        assert_eq!(acc.period_upper_bound(), at("2024-05-01T10:30:00Z"));
        assert_eq!(acc.state().accumulated_watt_hours, 0.0);
        assert_eq!(sink.flush_count(), 1);

        acc.ingest(Reading::new(100.0, at("2024-05-01T10:16:00Z")))
            .unwrap();
        assert_eq!(acc.phase(), AccumulatorPhase::Accumulating);
    }

    #[test]
    fn skipped_periods_are_reported_as_zero() {
        let (mut acc, sink) = accumulator("2024-05-01T10:15:00Z");
        acc.ingest(Reading::new(0.0, at("2024-05-01T10:00:00Z")))
            .unwrap();
        let outcome = acc
            .ingest(Reading::new(0.0, at("2024-05-01T10:50:00Z")))
            .unwrap();
        let labels: Vec<_> = outcome
            .records()
            .iter()
            .map(|r| r.period_start_label.as_str())
            .collect();
        assert_eq!(
            labels,
            ["2024-05-01_10:00", "2024-05-01_10:15", "2024-05-01_10:30"]
        );
        assert!(sink.records().iter().all(|r| r.kwh == 0.0));
        assert_eq!(acc.period_upper_bound(), at("2024-05-01T11:00:00Z"));
        assert_eq!(acc.periods_closed(), 3);
    }

    #[test]
    fn bound_stays_on_grid_after_many_periods() {
        let (mut acc, _) = accumulator("2024-05-01T00:15:00Z");
        let start = at("2024-05-01T00:00:00Z");
        for minute in (0..24 * 60).step_by(7) {
            acc.ingest(Reading::new(50.0, start + TimeDelta::minutes(minute)))
                .unwrap();
        }
        let closed = acc.periods_closed() as i64;
        assert_eq!(
            acc.period_upper_bound(),
            at("2024-05-01T00:15:00Z") + TimeDelta::minutes(15 * closed)
        );
        assert!(acc.zone().is_aligned(acc.period_upper_bound()));
    }

    #[test]
    fn month_rollover_fires_once_and_raises_signal() {
        let (wait, signal) = crate::wait::CancellableWait::new();
        drop(wait);
        let sink = MemorySink::new();
        let mut acc = EnergyAccumulator::new(
            sink.clone(),
            ReportZone::utc(),
            at("2024-05-31T23:30:00Z"),
        )
        .unwrap()
        .with_termination(signal.clone());

        acc.ingest(Reading::new(10.0, at("2024-05-31T23:20:00Z")))
            .unwrap();
        let first = acc
            .ingest(Reading::new(10.0, at("2024-05-31T23:30:00Z")))
            .unwrap();
        assert!(!first.month_rollover());
        assert!(!signal.is_signalled());

        let second = acc
            .ingest(Reading::new(10.0, at("2024-05-31T23:45:00Z")))
            .unwrap();
        assert!(second.month_rollover());
        assert_eq!(acc.period_upper_bound(), at("2024-06-01T00:00:00Z"));
        assert!(signal.is_signalled());

        assert!(acc.is_month_closed());
        assert_eq!(sink.len(), 2);

        let err = acc
            .ingest(Reading::new(10.0, at("2024-06-01T00:00:00Z")))
            .unwrap_err();
        assert!(matches!(err, MeterError::MonthClosed));
        assert_eq!(sink.len(), 2);
        assert_eq!(acc.period_upper_bound(), at("2024-06-01T00:00:00Z"));
    }

    #[test]
    fn catch_up_stops_at_month_edge() {
        let (mut acc, sink) = accumulator("2024-05-31T23:15:00Z");
        acc.ingest(Reading::new(100.0, at("2024-05-31T23:05:00Z")))
            .unwrap();
        let outcome = acc
            .ingest(Reading::new(100.0, at("2024-06-01T01:10:00Z")))
            .unwrap();
        assert!(outcome.month_rollover());
        let labels: Vec<_> = sink
            .records()
            .into_iter()
            .map(|r| r.period_start_label)
            .collect();
        assert_eq!(labels, ["2024-05-31_23:00", "2024-05-31_23:15", "2024-05-31_23:30"]);
        assert_eq!(acc.period_upper_bound(), at("2024-06-01T00:00:00Z"));
    }

    #[test]
    fn sink_failure_halts() {
        let sink = MemorySink::failing_after(0);
        let mut acc =
            EnergyAccumulator::new(sink, ReportZone::utc(), at("2024-05-01T10:15:00Z")).unwrap();
        acc.ingest(Reading::new(100.0, at("2024-05-01T10:00:00Z")))
            .unwrap();
        let bound = acc.period_upper_bound();

        let err = acc
            .ingest(Reading::new(100.0, at("2024-05-01T10:16:00Z")))
            .unwrap_err();
        assert!(matches!(err, MeterError::Sink { ref period, .. } if period == "2024-05-01_10:00"));
        assert!(acc.is_halted());
        assert_eq!(acc.period_upper_bound(), bound);
        assert!(acc.state().accumulated_watt_hours > 0.0);

        let err = acc
            .ingest(Reading::new(100.0, at("2024-05-01T10:17:00Z")))
            .unwrap_err();
        assert!(matches!(err, MeterError::Halted));
    }
}
