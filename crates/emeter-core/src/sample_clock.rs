//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Energy integration engine and lifecycle primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};

/// Weight given to the very first sample: the upstream sensor publishes
/// roughly once per second.
pub const BOOTSTRAP_ELAPSED_MS: u64 = 1000;

const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Turns consecutive sample timestamps into integration weights.
#[derive(Debug, Default, Clone)]
pub struct SampleClock {
    primed: bool,
}

impl SampleClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whole milliseconds from `previous` to `current`.
    ///
    /// The first call on a clock returns [`BOOTSTRAP_ELAPSED_MS`] whatever the
    /// inputs, since there is no earlier sample to measure from. A backwards
    /// step yields 0.
    pub fn elapsed_millis(&mut self, previous: DateTime<Utc>, current: DateTime<Utc>) -> u64 {
        if !self.primed {
            self.primed = true;
            return BOOTSTRAP_ELAPSED_MS;
        }

        let mut seconds = current.timestamp() - previous.timestamp();
        let mut nanos = i64::from(current.timestamp_subsec_nanos())
            - i64::from(previous.timestamp_subsec_nanos());
        if nanos < 0 {
            seconds -= 1;
            nanos += NANOS_PER_SECOND;
        }
        let millis = seconds
            .saturating_mul(1000)
            .saturating_add(nanos / NANOS_PER_MILLI);
        u64::try_from(millis).unwrap_or(0)
    }

    /// Whether the bootstrap weight has been handed out.
    pub fn is_primed(&self) -> bool {
        self.primed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn first_call_returns_bootstrap_regardless_of_inputs() {
        let mut clock = SampleClock::new();
        let t = at("2024-05-01T10:00:00Z");
        assert!(!clock.is_primed());
        assert_eq!(clock.elapsed_millis(t, t + TimeDelta::hours(5)), 1000);
        assert!(clock.is_primed());
        assert_eq!(clock.elapsed_millis(t, t + TimeDelta::hours(5)), 18_000_000);
    }

    #[test]
    fn bootstrap_fires_once() {
        let mut clock = SampleClock::new();
        let t = at("2024-05-01T10:00:00Z");
        assert_eq!(clock.elapsed_millis(t, t), 1000);
        for _ in 0..5 {
            assert_eq!(clock.elapsed_millis(t, t), 0);
        }
    }

    #[test]
    fn sub_second_borrow() {
        let mut clock = SampleClock::new();
        clock.elapsed_millis(Utc::now(), Utc::now());
        assert_eq!(
            clock.elapsed_millis(at("2024-05-01T10:00:00.900Z"), at("2024-05-01T10:00:02.100Z")),
            1200
        );
        assert_eq!(
            clock.elapsed_millis(at("2024-05-01T10:00:00.999999Z"), at("2024-05-01T10:00:01.000Z")),
            0
        );
        assert_eq!(
            clock.elapsed_millis(
                at("2024-05-01T10:00:00.250Z"),
                at("2024-05-01T10:00:01.2509Z")
            ),
            1000
        );
    }

    #[test]
    fn backwards_step_clamps_to_zero() {
        let mut clock = SampleClock::new();
        clock.elapsed_millis(Utc::now(), Utc::now());
        assert_eq!(
            clock.elapsed_millis(at("2024-05-01T10:00:05Z"), at("2024-05-01T10:00:04.5Z")),
            0
        );
    }

    #[test]
    fn independent_clocks_bootstrap_independently() {
        let t = at("2024-05-01T10:00:00Z");
        let mut a = SampleClock::new();
        let mut b = SampleClock::new();
        assert_eq!(a.elapsed_millis(t, t), 1000);
        assert_eq!(b.elapsed_millis(t, t), 1000);
    }
}
