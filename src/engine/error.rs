use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

/// Coarse error class, used for wire SQLSTATE mapping and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidArgument,
    Forbidden,
    Unavailable,
}

#[derive(Debug)]
pub enum EngineError {
    ExpertNotFound(Ulid),
    DateNotFound { expert_id: Ulid, date: NaiveDate },
    SlotNotFound { date: NaiveDate, start: NaiveTime, end: NaiveTime },
    ClaimNotFound { user_id: Ulid },
    SlotTaken { start: NaiveTime, end: NaiveTime },
    DuplicateClaim { user_id: Ulid },
    InvalidArgument(&'static str),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    Journal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ExpertNotFound(_)
            | EngineError::DateNotFound { .. }
            | EngineError::SlotNotFound { .. }
            | EngineError::ClaimNotFound { .. } => ErrorKind::NotFound,
            EngineError::SlotTaken { .. } | EngineError::DuplicateClaim { .. } => {
                ErrorKind::Conflict
            }
            EngineError::InvalidArgument(_) | EngineError::LimitExceeded(_) => {
                ErrorKind::InvalidArgument
            }
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::Journal(_) => ErrorKind::Unavailable,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ExpertNotFound(id) => write!(f, "no availability for expert {id}"),
            EngineError::DateNotFound { expert_id, date } => {
                write!(f, "expert {expert_id} has no availability on {date}")
            }
            EngineError::SlotNotFound { date, start, end } => write!(
                f,
                "no slot {}-{} on {date}",
                start.format("%H:%M"),
                end.format("%H:%M")
            ),
            EngineError::ClaimNotFound { user_id } => {
                write!(f, "no booking claim by user {user_id} on that slot")
            }
            EngineError::SlotTaken { start, end } => write!(
                f,
                "slot {}-{} already has an active booking claim",
                start.format("%H:%M"),
                end.format("%H:%M")
            ),
            EngineError::DuplicateClaim { user_id } => {
                write!(f, "user {user_id} already has a claim on that slot")
            }
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
