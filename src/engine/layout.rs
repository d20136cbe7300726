use std::collections::HashMap;
use std::time::Instant;

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::{from_wall_clock, WallTime};
use crate::limits::*;
use crate::model::*;

use super::EngineError;

const MINUTE_MS: f64 = 60_000.0;

/// Visible window and pixel scale of the calendar grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub day_start: WallTime,
    pub day_end: WallTime,
    pub px_per_minute: f64,
    /// Floor on rendered height. Display only; durations are untouched.
    pub min_height: f64,
    pub include_cancelled: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            day_start: WallTime::new(6, 0).unwrap_or(WallTime::MIDNIGHT),
            day_end: WallTime::new(22, 0).unwrap_or(WallTime::END_OF_DAY),
            px_per_minute: 2.0,
            min_height: 20.0,
            include_cancelled: false,
        }
    }
}

impl LayoutConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.day_start >= self.day_end {
            return Err(EngineError::LimitExceeded("layout day_start must be before day_end"));
        }
        if !self.px_per_minute.is_finite() || self.px_per_minute <= 0.0 {
            return Err(EngineError::LimitExceeded("px_per_minute must be positive"));
        }
        if !self.min_height.is_finite() || self.min_height < 0.0 {
            return Err(EngineError::LimitExceeded("min_height must not be negative"));
        }
        Ok(())
    }
}

/// Screen geometry for one appointment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutBlock {
    pub appointment_id: Ulid,
    pub staff_id: Ulid,
    pub column: usize,
    pub column_count: usize,
    pub top_offset: f64,
    pub height: f64,
    /// 1 for the oldest entry; double bookings stack newest on top.
    pub z_index: u32,
}

impl LayoutBlock {
    /// Left edge as a fraction of the grid width.
    pub fn left(&self) -> f64 {
        self.column as f64 / self.column_count as f64
    }

    pub fn width(&self) -> f64 {
        1.0 / self.column_count as f64
    }
}

struct Placed<'a> {
    appointment: &'a Appointment,
    /// Clamped to the visible window.
    span: TimeInterval,
}

impl Placed<'_> {
    fn created(&self) -> (Ms, Ulid) {
        (self.appointment.created_at, self.appointment.id)
    }
}

/// z-order per entry of one column. Entries joined by a chain of overlaps
/// form a cluster; within it, rank by creation so the newest is on top.
fn stack_order(entries: &[Placed<'_>]) -> Vec<u32> {
    let mut by_start: Vec<usize> = (0..entries.len()).collect();
    by_start.sort_by_key(|&i| (entries[i].span.start, entries[i].created()));

    let mut z = vec![1; entries.len()];
    let mut cluster: Vec<usize> = Vec::new();
    let mut reach = Ms::MIN;
    let mut flush = |cluster: &mut Vec<usize>| {
        cluster.sort_by_key(|&i| entries[i].created());
        for (rank, &i) in cluster.iter().enumerate() {
            z[i] = rank as u32 + 1;
        }
        cluster.clear();
    };
    for i in by_start {
        if entries[i].span.start >= reach {
            flush(&mut cluster);
        }
        reach = reach.max(entries[i].span.end);
        cluster.push(i);
    }
    flush(&mut cluster);
    z
}

/// Lay out the appointments of `staff_ids` on `date`.
///
/// One column per staff member that has something visible, ordered by display
/// name without regard to case, then id. Staff missing from `staff` sort last.
/// With a single staff id this is the one-resource day view.
///
/// The result depends only on the input sets, never on their order.
pub fn layout(
    date: NaiveDate,
    tz: Tz,
    staff: &[StaffMember],
    staff_ids: &[Ulid],
    appointments: &[Appointment],
    config: &LayoutConfig,
) -> Result<Vec<LayoutBlock>, EngineError> {
    let started = Instant::now();
    config.validate()?;
    if staff_ids.len() > MAX_LAYOUT_STAFF {
        return Err(EngineError::LimitExceeded("too many staff in layout"));
    }

    let window = TimeInterval::try_new(
        from_wall_clock(date, config.day_start, tz)?,
        from_wall_clock(date, config.day_end, tz)?,
    )?;

    let mut by_staff: HashMap<Ulid, Vec<Placed<'_>>> = HashMap::new();
    for a in appointments {
        if !staff_ids.contains(&a.staff_id) || (!a.is_active() && !config.include_cancelled) {
            continue;
        }
        let Some(span) = a.interval()?.intersection(&window) else {
            continue;
        };
        by_staff.entry(a.staff_id).or_default().push(Placed { appointment: a, span });
    }

    let names: HashMap<Ulid, String> = staff
        .iter()
        .map(|m| (m.id, m.display_name.to_lowercase()))
        .collect();
    let mut columns: Vec<Ulid> = by_staff.keys().copied().collect();
    columns.sort_by(|a, b| {
        let ka = (names.get(a).is_none(), names.get(a), a);
        let kb = (names.get(b).is_none(), names.get(b), b);
        ka.cmp(&kb)
    });

    let column_count = columns.len();
    let mut blocks = Vec::new();
    for (column, staff_id) in columns.iter().enumerate() {
        let entries = by_staff.get(staff_id).map(Vec::as_slice).unwrap_or_default();
        let z = stack_order(entries);
        for (p, z_index) in entries.iter().zip(z) {
            let offset_min = (p.span.start - window.start) as f64 / MINUTE_MS;
            let length_min = p.span.duration_ms() as f64 / MINUTE_MS;
            blocks.push((
                p.span.start,
                LayoutBlock {
                    appointment_id: p.appointment.id,
                    staff_id: *staff_id,
                    column,
                    column_count,
                    top_offset: offset_min * config.px_per_minute,
                    height: (length_min * config.px_per_minute).max(config.min_height),
                    z_index,
                },
            ));
        }
    }

    blocks.sort_by(|(sa, a), (sb, b)| {
        a.column
            .cmp(&b.column)
            .then(sa.cmp(sb))
            .then(a.appointment_id.cmp(&b.appointment_id))
    });

    metrics::histogram!(crate::observability::LAYOUT_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    Ok(blocks.into_iter().map(|(_, b)| b).collect())
}
