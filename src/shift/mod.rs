//! Shift calendar: resolves plant-local wall-clock time to the active shift.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};

/// One row of the shift table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftSpec {
    pub name: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Shift runs across midnight: it matches times at or after `start` on
    /// one day and before `end` on the next.
    pub wraps_midnight: bool,
}

impl ShiftSpec {
    /// Builds a spec from "HH:MM" boundary strings.
    pub fn parse(name: &str, start: &str, end: &str, wraps_midnight: bool) -> Result<Self> {
        let start = NaiveTime::parse_from_str(start, "%H:%M")
            .with_context(|| format!("shift {name}: invalid start time {start:?}"))?;
        let end = NaiveTime::parse_from_str(end, "%H:%M")
            .with_context(|| format!("shift {name}: invalid end time {end:?}"))?;

        Ok(Self {
            name: name.to_string(),
            start,
            end,
            wraps_midnight,
        })
    }

    fn start_minute(&self) -> u32 {
        self.start.hour() * 60 + self.start.minute()
    }

    fn end_minute(&self) -> u32 {
        self.end.hour() * 60 + self.end.minute()
    }

    /// Whether `minute_of_day` falls inside this shift.
    fn contains(&self, minute_of_day: u32) -> bool {
        if self.wraps_midnight {
            minute_of_day >= self.start_minute() || minute_of_day < self.end_minute()
        } else {
            minute_of_day >= self.start_minute() && minute_of_day < self.end_minute()
        }
    }
}

/// The resolved operating window for a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftWindow {
    pub name: String,
    pub start: NaiveDateTime,
}

/// Ordered table of plant shifts.
///
/// The table is expected to cover the full 24 hours; a time that matches no
/// row (a configuration gap) resolves to the first row.
#[derive(Debug, Clone)]
pub struct ShiftCalendar {
    shifts: Vec<ShiftSpec>,
}

impl ShiftCalendar {
    pub fn new(shifts: Vec<ShiftSpec>) -> Result<Self> {
        anyhow::ensure!(!shifts.is_empty(), "shift table must not be empty");
        Ok(Self { shifts })
    }

    /// Resolves `now` to the shift it falls in and that shift's start
    /// timestamp. For a wrapping shift observed before its end time, the
    /// start lands on the previous calendar day.
    pub fn resolve(&self, now: NaiveDateTime) -> ShiftWindow {
        let minute_of_day = now.hour() * 60 + now.minute();

        let spec = self
            .shifts
            .iter()
            .find(|s| s.contains(minute_of_day))
            .unwrap_or(&self.shifts[0]);

        let mut start = now.date().and_time(spec.start);
        if spec.wraps_midnight && minute_of_day < spec.end_minute() {
            start -= Duration::days(1);
        }

        ShiftWindow {
            name: spec.name.clone(),
            start,
        }
    }
}
