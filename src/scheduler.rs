use chrono::{Local, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// Daily triggers accepted from configuration or a command.
pub const MAX_SCHEDULE_TIMES: usize = 24;

/// Parse an `HH:MM` time of day.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ScheduleError::InvalidTime(value.to_string()))
}

pub fn parse_times(values: &[impl AsRef<str>]) -> Result<Vec<NaiveTime>, ScheduleError> {
    values.iter().map(|v| parse_time_of_day(v.as_ref())).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub total_triggered: u32,
    /// Triggers that passed while a late tick was catching up.
    pub total_skipped: u32,
    pub last_triggered: Option<NaiveDateTime>,
}

/// Daily time-of-day triggers. The owner drives it by asking whether a run
/// is due on each tick; nothing fires on its own.
#[derive(Debug, Clone, Default)]
pub struct IrrigationSchedule {
    times: Vec<NaiveTime>,
    next_run: Option<NaiveDateTime>,
    stats: ScheduleStats,
}

impl IrrigationSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every trigger and recompute the next run relative to `now`.
    pub fn set_times(&mut self, mut times: Vec<NaiveTime>, now: NaiveDateTime) {
        times.sort_unstable();
        times.dedup();
        self.times = times;
        self.next_run = self.next_after(now);
    }

    pub fn set_times_now(&mut self, times: Vec<NaiveTime>) {
        self.set_times(times, Local::now().naive_local());
    }

    /// Earliest trigger strictly after `now`: later today, else the first one tomorrow.
    pub fn next_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let today = now.date();
        if let Some(time) = self.times.iter().find(|&&t| today.and_time(t) > now) {
            return Some(today.and_time(*time));
        }

        let first = self.times.first()?;
        let tomorrow = today.succ_opt()?;
        Some(tomorrow.and_time(*first))
    }

    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        self.next_run.is_some_and(|next| now >= next)
    }

    /// If a run is due, consume it and advance past `now`. Returns the
    /// trigger time that fired.
    pub fn take_due(&mut self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if !self.is_due(now) {
            return None;
        }
        let fired = self.next_run?;

        let mut next = self.next_after(fired);
        while let Some(candidate) = next {
            if candidate > now {
                break;
            }
            self.stats.total_skipped += 1;
            next = self.next_after(candidate);
        }

        self.next_run = next;
        self.stats.total_triggered += 1;
        self.stats.last_triggered = Some(fired);
        Some(fired)
    }

    pub fn times(&self) -> &[NaiveTime] {
        &self.times
    }

    pub fn next_run(&self) -> Option<NaiveDateTime> {
        self.next_run
    }

    pub fn stats(&self) -> &ScheduleStats {
        &self.stats
    }
}
