use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `start >= end` reached an operation. Always an upstream bug.
    InvalidInterval { start: Ms, end: Ms },
    InvalidSchedule { id: Ulid, reason: &'static str },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    /// Every commit attempt lost the race to a concurrent intersecting write.
    StaleWrite { staff_id: Ulid, attempts: u32 },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::InvalidSchedule { id, reason } => {
                write!(f, "invalid schedule {id}: {reason}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StaleWrite { staff_id, attempts } => write!(
                f,
                "stale write for staff {staff_id}: slot changed concurrently after {attempts} attempts"
            ),
        }
    }
}

impl std::error::Error for EngineError {}
