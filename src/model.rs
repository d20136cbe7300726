use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::WallTime;
use crate::engine::EngineError;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)` between two instants.
///
/// Construction from untrusted values goes through [`TimeInterval::try_new`];
/// `new` is for values whose ordering is already established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimeInterval {
    pub start: Ms,
    pub end: Ms,
}

impl TimeInterval {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "TimeInterval start must be before end");
        Self { start, end }
    }

    pub fn try_new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_interval(&self, other: &TimeInterval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersection(&self, other: &TimeInterval) -> Option<TimeInterval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| TimeInterval::new(start, end))
    }
}

/// One recurring working-hours rule, already materialized to a weekday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffSchedule {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub location_id: Ulid,
    pub weekday: Weekday,
    pub start_time: WallTime,
    pub end_time: WallTime,
    pub valid_from: NaiveDate,
    #[serde(default)]
    pub valid_to: Option<NaiveDate>,
    /// Marks the range as unavailable instead of working hours.
    #[serde(default)]
    pub blocked: bool,
}

impl StaffSchedule {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.start_time >= self.end_time {
            return Err(EngineError::InvalidSchedule {
                id: self.id,
                reason: "start_time must be before end_time",
            });
        }
        if let Some(to) = self.valid_to
            && self.valid_from > to
        {
            return Err(EngineError::InvalidSchedule {
                id: self.id,
                reason: "valid_from must not be after valid_to",
            });
        }
        Ok(())
    }

    /// Weekday matches and the validity window (inclusive) contains `date`.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        date.weekday() == self.weekday
            && self.valid_from <= date
            && self.valid_to.is_none_or(|to| date <= to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Booked,
    Confirmed,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingMethod {
    #[default]
    Staff,
    Online,
    Sms,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub location_id: Ulid,
    pub client_id: Ulid,
    pub service_id: Ulid,
    pub start_time: Ms,
    pub end_time: Ms,
    pub status: AppointmentStatus,
    #[serde(default)]
    pub booking_method: BookingMethod,
    #[serde(default)]
    pub room_id: Option<Ulid>,
    #[serde(default)]
    pub created_at: Ms,
}

impl Appointment {
    pub fn interval(&self) -> Result<TimeInterval, EngineError> {
        TimeInterval::try_new(self.start_time, self.end_time)
    }

    /// Cancelled appointments never occupy time.
    pub fn is_active(&self) -> bool {
        self.status != AppointmentStatus::Cancelled
    }
}

/// Manually blocked time. Occupies the staff member like an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub location_id: Ulid,
    pub start_time: Ms,
    pub end_time: Ms,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Block {
    pub fn interval(&self) -> Result<TimeInterval, EngineError> {
        TimeInterval::try_new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub display_name: String,
}

/// Everything the pure core reads: already fetched, already in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub schedules: Vec<StaffSchedule>,
    #[serde(default)]
    pub appointments: Vec<Appointment>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub staff: Vec<StaffMember>,
}

/// What occupies a busy interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BusySource {
    Appointment(Ulid),
    Block(Ulid),
    BlockedSchedule(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusyInterval {
    pub interval: TimeInterval,
    pub source: BusySource,
}

/// Successful writes, as published by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    AppointmentCreated {
        appointment: Appointment,
    },
    AppointmentUpdated {
        before: Appointment,
        after: Appointment,
    },
    AppointmentDeleted {
        appointment: Appointment,
    },
    BlockCreated {
        block: Block,
    },
    BlockDeleted {
        block: Block,
    },
    ScheduleUpserted {
        before: Option<StaffSchedule>,
        after: StaffSchedule,
    },
    ScheduleDeleted {
        schedule: StaffSchedule,
    },
}

impl Event {
    /// Locations whose views may change because of this write.
    pub fn location_ids(&self) -> Vec<Ulid> {
        let mut ids = match self {
            Event::AppointmentCreated { appointment } | Event::AppointmentDeleted { appointment } => {
                vec![appointment.location_id]
            }
            Event::AppointmentUpdated { before, after } => vec![before.location_id, after.location_id],
            Event::BlockCreated { block } | Event::BlockDeleted { block } => vec![block.location_id],
            Event::ScheduleUpserted { before, after } => {
                let mut ids = vec![after.location_id];
                ids.extend(before.as_ref().map(|s| s.location_id));
                ids
            }
            Event::ScheduleDeleted { schedule } => vec![schedule.location_id],
        };
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn staff_ids(&self) -> Vec<Ulid> {
        let mut ids = match self {
            Event::AppointmentCreated { appointment } | Event::AppointmentDeleted { appointment } => {
                vec![appointment.staff_id]
            }
            Event::AppointmentUpdated { before, after } => vec![before.staff_id, after.staff_id],
            Event::BlockCreated { block } | Event::BlockDeleted { block } => vec![block.staff_id],
            Event::ScheduleUpserted { before, after } => {
                let mut ids = vec![after.staff_id];
                ids.extend(before.as_ref().map(|s| s.staff_id));
                ids
            }
            Event::ScheduleDeleted { schedule } => vec![schedule.staff_id],
        };
        ids.sort();
        ids.dedup();
        ids
    }
}
