//! Storage collaborator contracts.
//!
//! The engine reads through these traits and never writes on its own. Writes
//! are compare-and-set against a per-staff [`Revision`]: the caller reads the
//! revision, validates against what it read, then commits with that revision.
//! The store refuses the commit if an intersecting appointment or block was
//! written for the same staff member in between.

use async_trait::async_trait;
use serde::Serialize;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

/// Monotonic per-staff write counter.
pub type Revision = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome<T> {
    Committed(T),
    /// Someone else wrote intersecting busy time after the read.
    Stale {
        staff_id: Ulid,
        conflicts: Vec<TimeInterval>,
    },
}

impl<T> CommitOutcome<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CommitOutcome<U> {
        match self {
            CommitOutcome::Committed(v) => CommitOutcome::Committed(f(v)),
            CommitOutcome::Stale { staff_id, conflicts } => CommitOutcome::Stale { staff_id, conflicts },
        }
    }
}

#[async_trait]
pub trait RosterSource: Send + Sync {
    /// `None` lists every location.
    async fn list_schedules(&self, location_id: Option<Ulid>) -> Result<Vec<StaffSchedule>, EngineError>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Appointments intersecting `range`, cancelled ones included. `None`
    /// lists every location.
    async fn list_appointments(
        &self,
        location_id: Option<Ulid>,
        range: TimeInterval,
    ) -> Result<Vec<Appointment>, EngineError>;

    async fn revision(&self, staff_id: Ulid) -> Result<Revision, EngineError>;

    async fn create_appointment(
        &self,
        appointment: Appointment,
        read_at: Revision,
    ) -> Result<CommitOutcome<Appointment>, EngineError>;

    /// Replace an appointment. `read_at` is the revision of the staff member
    /// the appointment is moving to.
    async fn update_appointment(
        &self,
        appointment: Appointment,
        read_at: Revision,
    ) -> Result<CommitOutcome<Appointment>, EngineError>;

    /// Change status in place. Bringing a cancelled appointment back is
    /// `Stale` when its slot has since been taken.
    async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<CommitOutcome<Appointment>, EngineError>;

    async fn delete_appointment(&self, id: Ulid) -> Result<Appointment, EngineError>;
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn list_blocks(&self, location_id: Option<Ulid>, range: TimeInterval) -> Result<Vec<Block>, EngineError>;

    async fn create_block(&self, block: Block, read_at: Revision) -> Result<CommitOutcome<Block>, EngineError>;

    async fn delete_block(&self, id: Ulid) -> Result<Block, EngineError>;
}

#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn list_staff(&self) -> Result<Vec<StaffMember>, EngineError>;
}
