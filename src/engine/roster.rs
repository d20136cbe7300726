use std::collections::BTreeSet;

use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::debug;
use ulid::Ulid;

use crate::clock::from_wall_clock;
use crate::limits::*;
use crate::model::*;

use super::availability::merge_overlapping;
use super::EngineError;

// ── Roster ────────────────────────────────────────────────────────

/// Staff holding at least one working-hours schedule at `location_id` that is
/// active on `date`. Sorted by id, no duplicates. Blocked schedules never
/// qualify anyone.
pub fn resolve_roster(
    schedules: &[StaffSchedule],
    location_id: Ulid,
    date: NaiveDate,
) -> Result<Vec<Ulid>, EngineError> {
    let mut roster = BTreeSet::new();
    for s in schedules {
        if s.blocked || s.location_id != location_id || !s.is_active_on(date) {
            continue;
        }
        s.validate()?;
        roster.insert(s.staff_id);
    }
    Ok(roster.into_iter().collect())
}

/// Dates in `[from, from + days)` on which the staff member is on the roster
/// at `location_id`.
pub fn available_dates(
    schedules: &[StaffSchedule],
    staff_id: Ulid,
    location_id: Ulid,
    from: NaiveDate,
    days: u32,
) -> Result<Vec<NaiveDate>, EngineError> {
    if days > MAX_DATE_SCAN_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    let own: Vec<&StaffSchedule> = schedules
        .iter()
        .filter(|s| !s.blocked && s.staff_id == staff_id && s.location_id == location_id)
        .collect();
    for s in &own {
        s.validate()?;
    }

    let mut dates = Vec::new();
    let mut date = from;
    for _ in 0..days {
        if own.iter().any(|s| s.is_active_on(date)) {
            dates.push(date);
        }
        date = date
            .succ_opt()
            .ok_or(EngineError::LimitExceeded("date out of range"))?;
    }
    Ok(dates)
}

// ── Schedule intervals ────────────────────────────────────────────

/// Absolute interval of a schedule on `date`. `None` when the whole range
/// falls inside a daylight-saving gap and so never happens that day.
pub(crate) fn schedule_interval(
    schedule: &StaffSchedule,
    date: NaiveDate,
    tz: Tz,
) -> Result<Option<TimeInterval>, EngineError> {
    schedule.validate()?;
    let start = from_wall_clock(date, schedule.start_time, tz)?;
    let end = from_wall_clock(date, schedule.end_time, tz)?;
    if start >= end {
        debug!(
            schedule_id = %schedule.id,
            %date,
            "schedule {}-{} does not occur on this date",
            schedule.start_time,
            schedule.end_time
        );
        return Ok(None);
    }
    Ok(Some(TimeInterval::new(start, end)))
}

/// Working hours of one staff member at one location on `date`, as sorted
/// disjoint instants. Overlapping or duplicate schedules are unioned; split
/// shifts with a gap between them stay separate.
pub fn working_intervals(
    schedules: &[StaffSchedule],
    staff_id: Ulid,
    location_id: Ulid,
    date: NaiveDate,
    tz: Tz,
) -> Result<Vec<TimeInterval>, EngineError> {
    let mut spans = Vec::new();
    for s in schedules {
        if s.blocked || s.staff_id != staff_id || s.location_id != location_id || !s.is_active_on(date) {
            continue;
        }
        spans.extend(schedule_interval(s, date, tz)?);
    }
    spans.sort();
    Ok(merge_overlapping(&spans))
}

/// Blocked-schedule ranges for the staff member on `date`, at any location.
pub fn blocked_intervals(
    schedules: &[StaffSchedule],
    staff_id: Ulid,
    date: NaiveDate,
    tz: Tz,
) -> Result<Vec<BusyInterval>, EngineError> {
    let mut out = Vec::new();
    for s in schedules {
        if !s.blocked || s.staff_id != staff_id || !s.is_active_on(date) {
            continue;
        }
        if let Some(interval) = schedule_interval(s, date, tz)? {
            out.push(BusyInterval {
                interval,
                source: BusySource::BlockedSchedule(s.id),
            });
        }
    }
    Ok(out)
}
