use ulid::Ulid;

use crate::normalize::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    DuplicateSlot,
    OverlappingSlot,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConflictKind::DuplicateSlot => "duplicate slot",
            ConflictKind::OverlappingSlot => "overlapping slot",
        })
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(ValidationError),
    /// `existing` is the live slot the candidate collided with.
    Conflict {
        kind: ConflictKind,
        existing: Ulid,
    },
    NotFound(Ulid),
    LimitExceeded(&'static str),
    Cancelled,
    Storage(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(e) => write!(f, "{e}"),
            EngineError::Conflict { kind, existing } => {
                write!(f, "{kind}: conflicts with slot {existing}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Cancelled => write!(f, "operation cancelled"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}
