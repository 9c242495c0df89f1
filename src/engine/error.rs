use ulid::Ulid;

use crate::model::Conflict;

#[derive(Debug)]
pub enum EngineError {
    /// Caller identity could not be resolved.
    NotLoggedIn,
    /// Role/ownership check failed.
    NoPermission,
    /// Required field missing or empty.
    InvalidParams(&'static str),
    /// start >= end.
    InvalidTime,
    /// The candidate collides with existing lessons. A rejected proposal,
    /// not a fault — the list goes back to the caller.
    Conflicts(Vec<Conflict>),
    NotFound(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotLoggedIn => "NOT_LOGGED_IN",
            EngineError::NoPermission => "NO_PERMISSION",
            EngineError::InvalidParams(_) => "INVALID_PARAMS",
            EngineError::InvalidTime => "INVALID_TIME",
            EngineError::Conflicts(_) => "CONFLICT",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::WalError(_) => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotLoggedIn => write!(f, "not logged in"),
            EngineError::NoPermission => write!(f, "no permission"),
            EngineError::InvalidParams(msg) => write!(f, "invalid params: {msg}"),
            EngineError::InvalidTime => write!(f, "end time must be after start time"),
            EngineError::Conflicts(conflicts) => {
                write!(f, "{} scheduling conflict(s) detected", conflicts.len())
            }
            EngineError::NotFound(id) => write!(f, "lesson not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
