//! Publish delay calculation
//!
//! Resolves one of three scheduling modes into a delay in whole seconds. The
//! delay is computed once, at submission time; later clock changes do not
//! move an already scheduled publish.

use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::ScheduleError;

/// Hours, minutes and seconds as entered by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hms {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl Hms {
    pub fn new(hours: u32, minutes: u32, seconds: u32) -> Self {
        Self {
            hours,
            minutes,
            seconds,
        }
    }

    fn total_seconds(&self) -> u64 {
        u64::from(self.hours) * 3600 + u64::from(self.minutes) * 60 + u64::from(self.seconds)
    }
}

impl fmt::Display for Hms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds
        )
    }
}

impl FromStr for Hms {
    type Err = ScheduleError;

    /// Parses `HH:MM:SS`. Range checks happen in [`compute_delay`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim().split(':').collect();
        if fields.len() != 3 {
            return Err(ScheduleError::InvalidTimeSpec(format!(
                "expected HH:MM:SS, got '{}'",
                s
            )));
        }

        let mut parsed = [0u32; 3];
        for (slot, field) in parsed.iter_mut().zip(fields.iter()) {
            *slot = field.trim().parse().map_err(|_| {
                ScheduleError::InvalidTimeSpec(format!("'{}' is not a number in '{}'", field, s))
            })?;
        }

        Ok(Hms::new(parsed[0], parsed[1], parsed[2]))
    }
}

/// When a publish should be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScheduleSpec {
    #[default]
    Immediate,
    /// Relative delay from the moment of submission
    DurationFromNow(Hms),
    /// Next occurrence of a local time of day
    WallClockTime(Hms),
}

/// Scheduling mode as selected in a UI combo box or on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Immediate,
    Duration,
    WallClock,
}

impl FromStr for ScheduleMode {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" | "now" => Ok(ScheduleMode::Immediate),
            "duration" | "in" => Ok(ScheduleMode::Duration),
            "wallclock" | "wall-clock" | "at" => Ok(ScheduleMode::WallClock),
            other => Err(ScheduleError::InvalidTimeSpec(format!(
                "unknown scheduling mode '{}'",
                other
            ))),
        }
    }
}

impl ScheduleSpec {
    /// Builds a spec from a mode name and an `HH:MM:SS` field.
    ///
    /// The time field is ignored for the immediate mode.
    pub fn parse(mode: &str, time: &str) -> Result<Self, ScheduleError> {
        match mode.parse::<ScheduleMode>()? {
            ScheduleMode::Immediate => Ok(ScheduleSpec::Immediate),
            ScheduleMode::Duration => Ok(ScheduleSpec::DurationFromNow(time.parse()?)),
            ScheduleMode::WallClock => Ok(ScheduleSpec::WallClockTime(time.parse()?)),
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Immediate => write!(f, "immediate"),
            ScheduleSpec::DurationFromNow(hms) => write!(f, "in {}", hms),
            ScheduleSpec::WallClockTime(hms) => write!(f, "at {}", hms),
        }
    }
}

/// Resolves a schedule into a non-negative delay in whole seconds.
///
/// `now` is local wall-clock time; its sub-second part is discarded, so a
/// wall-clock target equal to the current second yields 0. A target earlier
/// than `now` rolls over to the same time tomorrow.
pub fn compute_delay(spec: &ScheduleSpec, now: NaiveDateTime) -> Result<u64, ScheduleError> {
    match spec {
        ScheduleSpec::Immediate => Ok(0),
        ScheduleSpec::DurationFromNow(hms) => {
            if hms.minutes >= 60 || hms.seconds >= 60 {
                return Err(ScheduleError::InvalidTimeSpec(format!(
                    "duration {} has minutes or seconds out of range",
                    hms
                )));
            }
            Ok(hms.total_seconds())
        }
        ScheduleSpec::WallClockTime(hms) => {
            let time = NaiveTime::from_hms_opt(hms.hours, hms.minutes, hms.seconds).ok_or_else(
                || ScheduleError::InvalidTimeSpec(format!("{} is not a valid time of day", hms)),
            )?;

            let now = now.with_nanosecond(0).unwrap_or(now);
            let mut target = now.date().and_time(time);
            if target < now {
                target += Duration::days(1);
            }

            let delay = (target - now).num_seconds();
            u64::try_from(delay).map_err(|_| {
                ScheduleError::InvalidTimeSpec(format!("negative delay for target {}", hms))
            })
        }
    }
}
