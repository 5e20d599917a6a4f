//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the metering runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};

/// Width of a reporting period in seconds.
pub const PERIOD_SECONDS: i64 = 15 * 60;

/// `strftime` pattern used for period labels in the report log.
pub const LABEL_FORMAT: &str = "%Y-%m-%d_%H:%M";

/// Width of a reporting period.
pub fn period_length() -> TimeDelta {
    TimeDelta::seconds(PERIOD_SECONDS)
}

/// Time zone that period labels and month boundaries are evaluated in.
///
/// Instants are always carried as UTC; the zone only decides how they are
/// rendered and where the 15-minute grid and the month edges fall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportZone {
    #[default]
    Local,
    Fixed(FixedOffset),
}

impl ReportZone {
    pub fn utc() -> Self {
        ReportZone::Fixed(Utc.fix())
    }

    /// Offset from UTC in seconds that applies at `instant`.
    pub fn offset_seconds(&self, instant: DateTime<Utc>) -> i32 {
        match self {
            ReportZone::Local => Local
                .offset_from_utc_datetime(&instant.naive_utc())
                .fix()
                .local_minus_utc(),
            ReportZone::Fixed(offset) => offset.local_minus_utc(),
        }
    }

    /// Wall-clock reading of `instant` in this zone.
    pub fn wall_clock(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.naive_utc() + TimeDelta::seconds(i64::from(self.offset_seconds(instant)))
    }

    /// Render `instant` as a period label (`YYYY-MM-DD_HH:MM`).
    pub fn label(&self, instant: DateTime<Utc>) -> String {
        self.wall_clock(instant).format(LABEL_FORMAT).to_string()
    }

    /// Calendar month (1-12) of `instant` in this zone.
    pub fn month(&self, instant: DateTime<Utc>) -> u32 {
        self.wall_clock(instant).month()
    }

    /// Round `instant` up to the next 15-minute boundary of wall-clock time.
    ///
    /// Sub-second precision is discarded first, so an instant that is already
    /// on the boundary (to the second) is returned unchanged.
    pub fn align_up(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let whole = instant.timestamp();
        let wall = whole + i64::from(self.offset_seconds(instant));
        let remainder = wall.rem_euclid(PERIOD_SECONDS);
        let aligned = if remainder == 0 {
            whole
        } else {
            whole + PERIOD_SECONDS - remainder
        };
        DateTime::from_timestamp(aligned, 0).unwrap_or(instant)
    }

    pub fn is_aligned(&self, instant: DateTime<Utc>) -> bool {
        instant.timestamp_subsec_nanos() == 0 && self.align_up(instant) == instant
    }
}

impl fmt::Display for ReportZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportZone::Local => f.write_str("local"),
            ReportZone::Fixed(offset) => write!(f, "{offset}"),
        }
    }
}

impl FromStr for ReportZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "local" => return Ok(ReportZone::Local),
            "utc" | "z" => return Ok(ReportZone::utc()),
            _ => {}
        }

        let (sign, rest) = match trimmed.chars().next() {
            Some('+') => (1, &trimmed[1..]),
            Some('-') => (-1, &trimmed[1..]),
            _ => return Err(format!("unknown time zone: {}", s)),
        };
        let (hours, minutes) = rest
            .split_once(':')
            .ok_or_else(|| format!("offset must look like +HH:MM: {}", s))?;
        let hours: i32 = hours
            .parse()
            .map_err(|_| format!("invalid offset hours: {}", s))?;
        let minutes: i32 = minutes
            .parse()
            .map_err(|_| format!("invalid offset minutes: {}", s))?;
        if !(0..60).contains(&minutes) {
            return Err(format!("invalid offset minutes: {}", s));
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(ReportZone::Fixed)
            .ok_or_else(|| format!("offset out of range: {}", s))
    }
}
