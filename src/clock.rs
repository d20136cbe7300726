//! Wall-clock <-> instant conversion.
//!
//! Everything inside the engine compares absolute instants. Wall-clock values
//! (schedule times, grid rows) are resolved against a zone for one specific
//! calendar date, so daylight-saving days come out 23 or 25 hours long.
//!
//! Ambiguous local times (the repeated hour when clocks fall back) resolve to
//! the earlier instant. Local times inside a spring-forward gap resolve to the
//! first wall-clock minute after the gap.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::{Ms, TimeInterval};

/// Upper bound on how far a gap walk may move a local time forward.
const MAX_GAP_MINUTES: i64 = 24 * 60;

/// A time of day, `HH:mm`. `24:00` is accepted as the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WallTime {
    hour: u8,
    minute: u8,
}

impl WallTime {
    pub const MIDNIGHT: WallTime = WallTime { hour: 0, minute: 0 };
    pub const END_OF_DAY: WallTime = WallTime { hour: 24, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if (hour < 24 && minute < 60) || (hour == 24 && minute == 0) {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    /// Minutes since midnight, 0..=1440.
    pub fn minutes(&self) -> u32 {
        self.hour as u32 * 60 + self.minute as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WallTimeError(String);

impl fmt::Display for WallTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid wall-clock time {:?}, expected HH:mm", self.0)
    }
}

impl std::error::Error for WallTimeError {}

impl FromStr for WallTime {
    type Err = WallTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || WallTimeError(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(err)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(err());
        }
        let hour: u8 = h.parse().map_err(|_| err())?;
        let minute: u8 = m.parse().map_err(|_| err())?;
        WallTime::new(hour, minute).ok_or_else(err)
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for WallTime {
    type Error = WallTimeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<WallTime> for String {
    fn from(w: WallTime) -> Self {
        w.to_string()
    }
}

fn check_range(instant: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&instant) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub fn to_local(instant: Ms, tz: Tz) -> Result<DateTime<Tz>, EngineError> {
    check_range(instant)?;
    DateTime::from_timestamp_millis(instant)
        .map(|utc| utc.with_timezone(&tz))
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))
}

pub fn to_wall_clock(instant: Ms, tz: Tz) -> Result<WallTime, EngineError> {
    let local = to_local(instant, tz)?;
    Ok(WallTime {
        hour: local.hour() as u8,
        minute: local.minute() as u8,
    })
}

pub fn local_date(instant: Ms, tz: Tz) -> Result<NaiveDate, EngineError> {
    Ok(to_local(instant, tz)?.date_naive())
}

/// Resolve `time` on `date` in `tz` to an instant.
pub fn from_wall_clock(date: NaiveDate, time: WallTime, tz: Tz) -> Result<Ms, EngineError> {
    let (date, time) = if time == WallTime::END_OF_DAY {
        let next = date
            .succ_opt()
            .ok_or(EngineError::LimitExceeded("date out of range"))?;
        (next, WallTime::MIDNIGHT)
    } else {
        (date, time)
    };
    let naive_time = NaiveTime::from_hms_opt(time.hour as u32, time.minute as u32, 0)
        .ok_or(EngineError::LimitExceeded("wall-clock time out of range"))?;
    let mut local = date.and_time(naive_time);

    for _ in 0..=MAX_GAP_MINUTES {
        if let Some(dt) = tz.from_local_datetime(&local).earliest() {
            let instant = dt.timestamp_millis();
            check_range(instant)?;
            return Ok(instant);
        }
        local += TimeDelta::minutes(1);
    }
    Err(EngineError::LimitExceeded("wall-clock time does not exist in zone"))
}

/// `[local midnight, next local midnight)` for `date`.
pub fn day_bounds(date: NaiveDate, tz: Tz) -> Result<TimeInterval, EngineError> {
    let start = from_wall_clock(date, WallTime::MIDNIGHT, tz)?;
    let end = from_wall_clock(date, WallTime::END_OF_DAY, tz)?;
    TimeInterval::try_new(start, end)
}

/// Every local calendar date the interval occupies, in order.
pub fn dates_touched(interval: &TimeInterval, tz: Tz) -> Result<Vec<NaiveDate>, EngineError> {
    let first = local_date(interval.start, tz)?;
    let last = local_date(interval.end - 1, tz)?;
    let mut dates = Vec::new();
    let mut current = first;
    while current <= last {
        if dates.len() > MAX_DATE_SCAN_DAYS as usize {
            return Err(EngineError::LimitExceeded("interval spans too many days"));
        }
        dates.push(current);
        current = current
            .succ_opt()
            .ok_or(EngineError::LimitExceeded("date out of range"))?;
    }
    Ok(dates)
}
