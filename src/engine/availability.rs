use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Serialize;
use ulid::Ulid;

use crate::clock::{dates_touched, day_bounds};
use crate::limits::*;
use crate::model::*;

use super::roster::{blocked_intervals, working_intervals};
use super::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub busy: Vec<TimeInterval>,
    pub free: Vec<TimeInterval>,
}

// ── Busy / free ───────────────────────────────────────────────────

/// Every interval occupying `staff_id` that intersects `window`: active
/// appointments, blocks, and blocked schedules, at any location. Unmerged and
/// unclamped, so each entry still names what occupies it.
pub fn busy_sources(
    snapshot: &Snapshot,
    staff_id: Ulid,
    window: &TimeInterval,
    tz: Tz,
    exclude: Option<Ulid>,
) -> Result<Vec<BusyInterval>, EngineError> {
    let mut busy = Vec::new();

    for a in &snapshot.appointments {
        if a.staff_id != staff_id || !a.is_active() || Some(a.id) == exclude {
            continue;
        }
        let interval = a.interval()?;
        if interval.overlaps(window) {
            busy.push(BusyInterval {
                interval,
                source: BusySource::Appointment(a.id),
            });
        }
    }

    for b in &snapshot.blocks {
        if b.staff_id != staff_id || Some(b.id) == exclude {
            continue;
        }
        let interval = b.interval()?;
        if interval.overlaps(window) {
            busy.push(BusyInterval {
                interval,
                source: BusySource::Block(b.id),
            });
        }
    }

    for date in dates_touched(window, tz)? {
        for blocked in blocked_intervals(&snapshot.schedules, staff_id, date, tz)? {
            if blocked.interval.overlaps(window) {
                busy.push(blocked);
            }
        }
    }

    busy.sort_by_key(|b| (b.interval, b.source));
    Ok(busy)
}

/// Merged busy time for the staff member on `date`. Overlaps count once.
pub fn compute_busy(
    snapshot: &Snapshot,
    staff_id: Ulid,
    date: NaiveDate,
    tz: Tz,
) -> Result<Vec<TimeInterval>, EngineError> {
    let day = day_bounds(date, tz)?;
    let sources = busy_sources(snapshot, staff_id, &day, tz, None)?;
    let spans: Vec<TimeInterval> = sources.iter().map(|b| b.interval).collect();
    Ok(merge_overlapping(&spans))
}

/// Busy and free time for one staff member at one location on `date`.
///
/// Busy is staff-wide; free is each working interval at `location_id` minus
/// busy, concatenated.
pub fn availability(
    snapshot: &Snapshot,
    staff_id: Ulid,
    location_id: Ulid,
    date: NaiveDate,
    tz: Tz,
) -> Result<Availability, EngineError> {
    let busy = compute_busy(snapshot, staff_id, date, tz)?;
    let working = working_intervals(&snapshot.schedules, staff_id, location_id, date, tz)?;
    let free = compute_free(&working, &busy);
    Ok(Availability { busy, free })
}

/// Each working interval minus busy time, concatenated in order.
pub fn compute_free(working: &[TimeInterval], busy: &[TimeInterval]) -> Vec<TimeInterval> {
    working.iter().flat_map(|w| subtract(w, busy)).collect()
}

/// Slots of `duration_ms` starting every `step_ms` from the start of each
/// working interval, kept only when they fit entirely inside free time.
pub fn bookable_slots(
    working: &[TimeInterval],
    free: &[TimeInterval],
    step_ms: Ms,
    duration_ms: Ms,
) -> Result<Vec<TimeInterval>, EngineError> {
    if step_ms <= 0 || duration_ms <= 0 {
        return Err(EngineError::LimitExceeded("slot step and duration must be positive"));
    }
    let mut slots = Vec::new();
    for w in working {
        let mut t = w.start;
        while t + duration_ms <= w.end {
            let slot = TimeInterval::new(t, t + duration_ms);
            if free.iter().any(|f| f.contains_interval(&slot)) {
                if slots.len() >= MAX_SLOTS_PER_QUERY {
                    return Err(EngineError::LimitExceeded("too many slots"));
                }
                slots.push(slot);
            }
            t += step_ms;
        }
    }
    Ok(slots)
}

// ── Interval algebra ──────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[TimeInterval]) -> Vec<TimeInterval> {
    let mut merged: Vec<TimeInterval> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Both inputs sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[TimeInterval], to_remove: &[TimeInterval]) -> Vec<TimeInterval> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(TimeInterval::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(TimeInterval::new(current_start, current_end));
        }
    }

    result
}

/// Free sub-intervals of `base` after removing `cuts` in any order, with
/// duplicates or overlaps among them.
pub fn subtract(base: &TimeInterval, cuts: &[TimeInterval]) -> Vec<TimeInterval> {
    let mut cuts = cuts.to_vec();
    cuts.sort();
    let cuts = merge_overlapping(&cuts);
    subtract_intervals(std::slice::from_ref(base), &cuts)
}

/// Sweep-line algorithm: find time ranges where allocation count >= capacity.
/// Returns sorted, merged spans representing fully-saturated time ranges.
pub fn compute_saturated_spans(allocs: &[TimeInterval], capacity: u32) -> Vec<TimeInterval> {
    if allocs.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        let mut sorted = allocs.to_vec();
        sorted.sort();
        return merge_overlapping(&sorted);
    }

    // +1 at start, -1 at end; ends sort before starts at the same instant
    let mut events: Vec<(Ms, i32)> = Vec::with_capacity(allocs.len() * 2);
    for a in allocs {
        events.push((a.start, 1));
        events.push((a.end, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result: Vec<TimeInterval> = Vec::new();
    let mut count: u32 = 0;
    let mut saturated_start: Option<Ms> = None;

    for (time, delta) in &events {
        if *delta > 0 {
            count += *delta as u32;
        } else {
            count -= (-*delta) as u32;
        }

        if count >= capacity && saturated_start.is_none() {
            saturated_start = Some(*time);
        } else if count < capacity
            && let Some(start) = saturated_start.take()
            && *time > start {
                result.push(TimeInterval::new(start, *time));
            }
    }

    merge_overlapping(&result)
}
