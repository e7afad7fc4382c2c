//! Daily time-of-day gate for the recognition worker.

use chrono::NaiveTime;
use std::fmt;
use thiserror::Error;

const TIME_FORMAT: &str = "%H:%M";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid time {0:?}; use 24-hour HH:MM")]
    InvalidTime(String),
}

/// Parse a 24-hour `HH:MM` string.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(s.trim(), TIME_FORMAT)
        .map_err(|_| ScheduleError::InvalidTime(s.to_string()))
}

/// An active window within a day. `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ScheduleWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, ScheduleError> {
        Ok(Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?))
    }

    pub fn is_overnight(&self) -> bool {
        self.start > self.end
    }

    /// Both bounds are inclusive.
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.is_overnight() {
            now >= self.start || now <= self.end
        } else {
            self.start <= now && now <= self.end
        }
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format(TIME_FORMAT),
            self.end.format(TIME_FORMAT)
        )
    }
}

/// Decides whether the worker should be processing frames right now.
/// Without a window the gate is always open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleGate {
    window: Option<ScheduleWindow>,
}

impl ScheduleGate {
    pub fn new(window: Option<ScheduleWindow>) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Option<ScheduleWindow> {
        self.window
    }

    pub fn is_scheduled(&self) -> bool {
        self.window.is_some()
    }

    pub fn is_open_at(&self, now: NaiveTime) -> bool {
        self.window.map_or(true, |w| w.contains(now))
    }

    /// Evaluate against the local wall clock.
    pub fn is_open_now(&self) -> bool {
        self.is_open_at(chrono::Local::now().time())
    }
}
