use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::clock::{dates_touched, day_bounds};
use crate::limits::*;
use crate::model::*;

use super::availability::{busy_sources, compute_saturated_spans, merge_overlapping, subtract};
use super::roster::working_intervals;
use super::EngineError;

/// A room shared by several services; at most `capacity` overlapping
/// appointments may use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomRule {
    pub room_id: Ulid,
    pub capacity: u32,
}

/// A proposed appointment or block for one staff member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub staff_id: Ulid,
    pub location_id: Ulid,
    pub interval: TimeInterval,
    /// The record being moved, ignored as a busy source.
    pub exclude: Option<Ulid>,
    pub room: Option<RoomRule>,
    /// Manager override: accept time outside working hours.
    pub override_schedule: bool,
}

impl BookingRequest {
    pub fn new(staff_id: Ulid, location_id: Ulid, interval: TimeInterval) -> Self {
        Self {
            staff_id,
            location_id,
            interval,
            exclude: None,
            room: None,
            override_schedule: false,
        }
    }

    pub fn excluding(mut self, id: Ulid) -> Self {
        self.exclude = Some(id);
        self
    }

    pub fn in_room(mut self, room: RoomRule) -> Self {
        self.room = Some(room);
        self
    }

    pub fn overriding_schedule(mut self) -> Self {
        self.override_schedule = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    OutsideSchedule,
    OverlapsExisting,
    RoomAtCapacity,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::OutsideSchedule => "outside_schedule",
            RejectReason::OverlapsExisting => "overlaps_existing",
            RejectReason::RoomAtCapacity => "room_at_capacity",
        }
    }
}

/// Why a candidate was refused, with enough detail to explain it.
///
/// `conflicts` holds the uncovered part of the candidate for
/// `OutsideSchedule`, the merged busy intervals it hits for
/// `OverlapsExisting`, and the saturated room ranges for `RoomAtCapacity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub staff_id: Ulid,
    pub candidate: TimeInterval,
    pub conflicts: Vec<TimeInterval>,
    pub sources: Vec<BusySource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Validation {
    Accepted,
    Rejected(Rejection),
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Validation::Accepted => "accepted",
            Validation::Rejected(r) => r.reason.as_str(),
        }
    }
}

pub(crate) fn validate_interval(interval: &TimeInterval) -> Result<(), EngineError> {
    if interval.start >= interval.end {
        return Err(EngineError::InvalidInterval {
            start: interval.start,
            end: interval.end,
        });
    }
    if interval.start < MIN_VALID_TIMESTAMP_MS || interval.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if interval.duration_ms() > MAX_INTERVAL_DURATION_MS {
        return Err(EngineError::LimitExceeded("interval too wide"));
    }
    Ok(())
}

/// Schedule conformance, then busy overlap, then room capacity.
pub fn check_booking(
    snapshot: &Snapshot,
    request: &BookingRequest,
    tz: Tz,
) -> Result<Validation, EngineError> {
    let candidate = request.interval;
    validate_interval(&candidate)?;
    let dates = dates_touched(&candidate, tz)?;

    if request.override_schedule {
        warn!(
            staff_id = %request.staff_id,
            start = candidate.start,
            end = candidate.end,
            "schedule check overridden"
        );
    } else {
        let mut working = Vec::new();
        for date in &dates {
            working.extend(working_intervals(
                &snapshot.schedules,
                request.staff_id,
                request.location_id,
                *date,
                tz,
            )?);
        }
        working.sort();
        let working = merge_overlapping(&working);
        if !working.iter().any(|w| w.contains_interval(&candidate)) {
            return Ok(reject(
                RejectReason::OutsideSchedule,
                request,
                subtract(&candidate, &working),
                Vec::new(),
            ));
        }
    }

    // Busy time is merged over whole days so the reported intervals match
    // what availability shows for those days.
    let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
        return Err(EngineError::InvalidInterval {
            start: candidate.start,
            end: candidate.end,
        });
    };
    let window = TimeInterval::try_new(day_bounds(*first, tz)?.start, day_bounds(*last, tz)?.end)?;
    let sources = busy_sources(snapshot, request.staff_id, &window, tz, request.exclude)?;
    let spans: Vec<TimeInterval> = sources.iter().map(|b| b.interval).collect();
    let conflicts: Vec<TimeInterval> = merge_overlapping(&spans)
        .into_iter()
        .filter(|b| b.overlaps(&candidate))
        .collect();
    if !conflicts.is_empty() {
        let offending = sources
            .iter()
            .filter(|b| b.interval.overlaps(&candidate))
            .map(|b| b.source)
            .collect();
        return Ok(reject(RejectReason::OverlapsExisting, request, conflicts, offending));
    }

    if let Some(room) = request.room {
        if room.capacity == 0 {
            return Err(EngineError::LimitExceeded("room capacity must be positive"));
        }
        let mut in_room = Vec::new();
        for a in &snapshot.appointments {
            if a.room_id != Some(room.room_id) || !a.is_active() || Some(a.id) == request.exclude {
                continue;
            }
            let interval = a.interval()?;
            if interval.overlaps(&candidate) {
                in_room.push((interval, a.id));
            }
        }
        let allocs: Vec<TimeInterval> = in_room.iter().map(|(i, _)| *i).collect();
        let saturated: Vec<TimeInterval> = compute_saturated_spans(&allocs, room.capacity)
            .into_iter()
            .filter(|s| s.overlaps(&candidate))
            .collect();
        if !saturated.is_empty() {
            let offending = in_room
                .iter()
                .filter(|(i, _)| saturated.iter().any(|s| s.overlaps(i)))
                .map(|(_, id)| BusySource::Appointment(*id))
                .collect();
            return Ok(reject(RejectReason::RoomAtCapacity, request, saturated, offending));
        }
    }

    debug!(staff_id = %request.staff_id, start = candidate.start, end = candidate.end, "booking accepted");
    Ok(Validation::Accepted)
}

fn reject(
    reason: RejectReason,
    request: &BookingRequest,
    conflicts: Vec<TimeInterval>,
    sources: Vec<BusySource>,
) -> Validation {
    debug!(
        staff_id = %request.staff_id,
        reason = reason.as_str(),
        conflicts = conflicts.len(),
        "booking rejected"
    );
    Validation::Rejected(Rejection {
        reason,
        staff_id: request.staff_id,
        candidate: request.interval,
        conflicts,
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_wall_clock, WallTime};
    use chrono::{NaiveDate, Weekday};
    use chrono_tz::UTC;

    const H: Ms = 3_600_000;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()
    }

    fn at(time: &str) -> Ms {
        from_wall_clock(monday(), time.parse::<WallTime>().unwrap(), UTC).unwrap()
    }

    fn iv(start: &str, end: &str) -> TimeInterval {
        TimeInterval::new(at(start), at(end))
    }

    fn schedule(staff_id: Ulid, location_id: Ulid, weekday: Weekday, start: &str, end: &str) -> StaffSchedule {
        StaffSchedule {
            id: Ulid::new(),
            staff_id,
            location_id,
            weekday,
            start_time: start.parse().unwrap(),
            end_time: end.parse().unwrap(),
            valid_from: monday(),
            valid_to: None,
            blocked: false,
        }
    }

    fn appointment(staff_id: Ulid, location_id: Ulid, interval: TimeInterval) -> Appointment {
        Appointment {
            id: Ulid::new(),
            staff_id,
            location_id,
            client_id: Ulid::new(),
            service_id: Ulid::new(),
            start_time: interval.start,
            end_time: interval.end,
            status: AppointmentStatus::Booked,
            booking_method: BookingMethod::Staff,
            room_id: None,
            created_at: 0,
        }
    }

    struct Fixture {
        staff: Ulid,
        loc: Ulid,
        existing: Ulid,
        snapshot: Snapshot,
    }

    /// Staff on 09:00-17:00 Monday with an appointment 10:00-11:00.
    fn fixture() -> Fixture {
        let staff = Ulid::new();
        let loc = Ulid::new();
        let a = appointment(staff, loc, iv("10:00", "11:00"));
        let existing = a.id;
        Fixture {
            staff,
            loc,
            existing,
            snapshot: Snapshot {
                schedules: vec![schedule(staff, loc, Weekday::Mon, "09:00", "17:00")],
                appointments: vec![a],
                ..Default::default()
            },
        }
    }

    fn rejection(v: Validation) -> Rejection {
        match v {
            Validation::Rejected(r) => r,
            Validation::Accepted => panic!("expected rejection"),
        }
    }

    #[test]
    fn overlapping_candidate_reports_existing_interval() {
        let f = fixture();
        let req = BookingRequest::new(f.staff, f.loc, iv("10:30", "11:30"));
        let r = rejection(check_booking(&f.snapshot, &req, UTC).unwrap());
        assert_eq!(r.reason, RejectReason::OverlapsExisting);
        assert_eq!(r.conflicts, vec![iv("10:00", "11:00")]);
        assert_eq!(r.sources, vec![BusySource::Appointment(f.existing)]);
        assert_eq!(r.staff_id, f.staff);
    }

    #[test]
    fn touching_candidate_is_accepted() {
        let f = fixture();
        let req = BookingRequest::new(f.staff, f.loc, iv("11:00", "12:00"));
        assert_eq!(check_booking(&f.snapshot, &req, UTC).unwrap(), Validation::Accepted);
    }

    #[test]
    fn before_hours_is_outside_schedule() {
        let f = fixture();
        let req = BookingRequest::new(f.staff, f.loc, iv("08:00", "09:00"));
        let r = rejection(check_booking(&f.snapshot, &req, UTC).unwrap());
        assert_eq!(r.reason, RejectReason::OutsideSchedule);
        assert_eq!(r.conflicts, vec![iv("08:00", "09:00")]);
    }

    #[test]
    fn straddling_end_of_shift_reports_uncovered_part() {
        let f = fixture();
        let req = BookingRequest::new(f.staff, f.loc, iv("16:30", "17:30"));
        let r = rejection(check_booking(&f.snapshot, &req, UTC).unwrap());
        assert_eq!(r.reason, RejectReason::OutsideSchedule);
        assert_eq!(r.conflicts, vec![iv("17:00", "17:30")]);
    }

    #[test]
    fn schedule_at_other_location_does_not_cover() {
        let f = fixture();
        let req = BookingRequest::new(f.staff, Ulid::new(), iv("13:00", "14:00"));
        let r = rejection(check_booking(&f.snapshot, &req, UTC).unwrap());
        assert_eq!(r.reason, RejectReason::OutsideSchedule);
    }

    #[test]
    fn override_skips_schedule_but_not_overlap() {
        let f = fixture();
        let early = BookingRequest::new(f.staff, f.loc, iv("07:00", "08:00")).overriding_schedule();
        assert!(check_booking(&f.snapshot, &early, UTC).unwrap().is_accepted());

        let clash = BookingRequest::new(f.staff, f.loc, iv("10:00", "10:15")).overriding_schedule();
        let r = rejection(check_booking(&f.snapshot, &clash, UTC).unwrap());
        assert_eq!(r.reason, RejectReason::OverlapsExisting);
    }

    #[test]
    fn moving_an_appointment_ignores_itself() {
        let f = fixture();
        let req = BookingRequest::new(f.staff, f.loc, iv("10:30", "11:30")).excluding(f.existing);
        assert!(check_booking(&f.snapshot, &req, UTC).unwrap().is_accepted());
    }

    #[test]
    fn conflicts_are_merged_busy_intervals() {
        let mut f = fixture();
        f.snapshot.blocks.push(Block {
            id: Ulid::new(),
            staff_id: f.staff,
            location_id: f.loc,
            start_time: at("11:00"),
            end_time: at("12:00"),
            reason: None,
        });
        let req = BookingRequest::new(f.staff, f.loc, iv("10:45", "11:15"));
        let r = rejection(check_booking(&f.snapshot, &req, UTC).unwrap());
        assert_eq!(r.conflicts, vec![iv("10:00", "12:00")]);
        assert_eq!(r.sources.len(), 2);
    }

    #[test]
    fn busy_elsewhere_still_conflicts() {
        let mut f = fixture();
        let other_loc = Ulid::new();
        f.snapshot.appointments.push(appointment(f.staff, other_loc, iv("14:00", "15:00")));
        let req = BookingRequest::new(f.staff, f.loc, iv("14:30", "15:30"));
        let r = rejection(check_booking(&f.snapshot, &req, UTC).unwrap());
        assert_eq!(r.reason, RejectReason::OverlapsExisting);
    }

    #[test]
    fn overnight_shift_covers_candidate_across_midnight() {
        let staff = Ulid::new();
        let loc = Ulid::new();
        let snapshot = Snapshot {
            schedules: vec![
                schedule(staff, loc, Weekday::Mon, "20:00", "24:00"),
                schedule(staff, loc, Weekday::Tue, "00:00", "04:00"),
            ],
            ..Default::default()
        };
        let start = at("23:00");
        let req = BookingRequest::new(staff, loc, TimeInterval::new(start, start + 2 * H));
        assert!(check_booking(&snapshot, &req, UTC).unwrap().is_accepted());
    }

    #[test]
    fn room_capacity_is_enforced() {
        let f = fixture();
        let room_id = Ulid::new();
        let mut snapshot = f.snapshot.clone();
        for _ in 0..2 {
            let mut a = appointment(Ulid::new(), f.loc, iv("13:00", "14:00"));
            a.room_id = Some(room_id);
            snapshot.appointments.push(a);
        }

        let req = BookingRequest::new(f.staff, f.loc, iv("13:30", "14:30"))
            .in_room(RoomRule { room_id, capacity: 2 });
        let r = rejection(check_booking(&snapshot, &req, UTC).unwrap());
        assert_eq!(r.reason, RejectReason::RoomAtCapacity);
        assert_eq!(r.conflicts, vec![iv("13:00", "14:00")]);
        assert_eq!(r.sources.len(), 2);

        let roomy = BookingRequest::new(f.staff, f.loc, iv("13:30", "14:30"))
            .in_room(RoomRule { room_id, capacity: 3 });
        assert!(check_booking(&snapshot, &roomy, UTC).unwrap().is_accepted());
    }

    #[test]
    fn inverted_candidate_fails_fast() {
        let f = fixture();
        let req = BookingRequest::new(
            f.staff,
            f.loc,
            TimeInterval { start: at("12:00"), end: at("11:00") },
        );
        assert!(matches!(
            check_booking(&f.snapshot, &req, UTC),
            Err(EngineError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn overly_long_candidate_rejected() {
        let f = fixture();
        let start = at("09:00");
        let req = BookingRequest::new(
            f.staff,
            f.loc,
            TimeInterval::new(start, start + MAX_INTERVAL_DURATION_MS + 1),
        );
        assert!(matches!(
            check_booking(&f.snapshot, &req, UTC),
            Err(EngineError::LimitExceeded("interval too wide"))
        ));
    }

    #[test]
    fn validation_labels() {
        assert_eq!(Validation::Accepted.label(), "accepted");
        assert_eq!(RejectReason::OverlapsExisting.as_str(), "overlaps_existing");
    }
}
