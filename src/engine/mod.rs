mod availability;
mod conflict;
mod error;
mod layout;
mod refresh;
mod roster;

pub use availability::{
    availability, bookable_slots, busy_sources, compute_busy, compute_free, compute_saturated_spans,
    merge_overlapping, subtract, subtract_intervals, Availability,
};
pub use conflict::{check_booking, BookingRequest, RejectReason, Rejection, RoomRule, Validation};
pub(crate) use conflict::validate_interval;
pub use error::EngineError;
pub use layout::{layout, LayoutBlock, LayoutConfig};
pub use refresh::{RefreshCoordinator, RefreshTicket, ViewKey, ViewState};
pub use roster::{available_dates, blocked_intervals, resolve_roster, working_intervals};

use std::collections::BTreeSet;

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Serialize;
use ulid::Ulid;

use crate::clock::day_bounds;
use crate::model::*;

/// Busy and free time of one rostered staff member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaffAvailability {
    pub staff_id: Ulid,
    pub busy: Vec<TimeInterval>,
    pub free: Vec<TimeInterval>,
}

/// Everything a location calendar shows for one date, recomputed in full.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayView {
    pub location_id: Ulid,
    pub date: NaiveDate,
    /// Empty means nobody is scheduled, which is not an error.
    pub roster: Vec<Ulid>,
    pub availability: Vec<StaffAvailability>,
    pub layout: Vec<LayoutBlock>,
}

/// Pure read-only view over an in-memory snapshot.
///
/// Location and date are always explicit arguments. The engine performs no
/// I/O; the snapshot must already hold every record the call needs.
pub struct Engine<'a> {
    snapshot: &'a Snapshot,
    tz: Tz,
    layout: LayoutConfig,
}

impl<'a> Engine<'a> {
    pub fn new(snapshot: &'a Snapshot, tz: Tz) -> Self {
        Self {
            snapshot,
            tz,
            layout: LayoutConfig::default(),
        }
    }

    pub fn with_layout(mut self, layout: LayoutConfig) -> Self {
        self.layout = layout;
        self
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn resolve_roster(&self, location_id: Ulid, date: NaiveDate) -> Result<Vec<Ulid>, EngineError> {
        resolve_roster(&self.snapshot.schedules, location_id, date)
    }

    pub fn compute_availability(
        &self,
        staff_id: Ulid,
        location_id: Ulid,
        date: NaiveDate,
    ) -> Result<Availability, EngineError> {
        availability(self.snapshot, staff_id, location_id, date, self.tz)
    }

    pub fn validate_booking(&self, request: &BookingRequest) -> Result<Validation, EngineError> {
        let result = check_booking(self.snapshot, request, self.tz);
        let outcome = match &result {
            Ok(v) => v.label(),
            Err(_) => "error",
        };
        metrics::counter!(crate::observability::VALIDATIONS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    pub fn compute_layout(
        &self,
        date: NaiveDate,
        staff_ids: &[Ulid],
        appointments: &[Appointment],
    ) -> Result<Vec<LayoutBlock>, EngineError> {
        layout(date, self.tz, &self.snapshot.staff, staff_ids, appointments, &self.layout)
    }

    pub fn available_dates(
        &self,
        staff_id: Ulid,
        location_id: Ulid,
        from: NaiveDate,
        days: u32,
    ) -> Result<Vec<NaiveDate>, EngineError> {
        available_dates(&self.snapshot.schedules, staff_id, location_id, from, days)
    }

    /// Start times a client may pick for a service of `duration_ms`.
    pub fn bookable_slots(
        &self,
        staff_id: Ulid,
        location_id: Ulid,
        date: NaiveDate,
        step_ms: Ms,
        duration_ms: Ms,
    ) -> Result<Vec<TimeInterval>, EngineError> {
        let working = working_intervals(&self.snapshot.schedules, staff_id, location_id, date, self.tz)?;
        let free = self.compute_availability(staff_id, location_id, date)?.free;
        bookable_slots(&working, &free, step_ms, duration_ms)
    }

    /// Roster, availability and layout for one location and date.
    ///
    /// Layout columns cover the roster plus anyone holding a visible
    /// appointment at the location that day, so off-schedule bookings still
    /// render.
    pub fn day_view(&self, location_id: Ulid, date: NaiveDate) -> Result<DayView, EngineError> {
        let roster = self.resolve_roster(location_id, date)?;

        let mut availability = Vec::with_capacity(roster.len());
        for &staff_id in &roster {
            let a = self.compute_availability(staff_id, location_id, date)?;
            availability.push(StaffAvailability {
                staff_id,
                busy: a.busy,
                free: a.free,
            });
        }

        let day = day_bounds(date, self.tz)?;
        let mut here = Vec::new();
        for a in &self.snapshot.appointments {
            if a.location_id == location_id && a.interval()?.overlaps(&day) {
                here.push(a.clone());
            }
        }
        let mut shown: BTreeSet<Ulid> = roster.iter().copied().collect();
        shown.extend(here.iter().filter(|a| a.is_active()).map(|a| a.staff_id));
        let shown: Vec<Ulid> = shown.into_iter().collect();
        let layout = self.compute_layout(date, &shown, &here)?;

        Ok(DayView {
            location_id,
            date,
            roster,
            availability,
            layout,
        })
    }
}
