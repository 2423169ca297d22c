use ulid::Ulid;

use super::conflict::ConflictReport;

#[derive(Debug)]
pub enum EngineError {
    /// Missing or malformed field, off-grid slot, or a slot in the past.
    Validation(String),
    /// One of the cabinet/provider/patient uniqueness rules would break.
    Conflict(ConflictReport),
    NotFound(&'static str, Ulid),
    Forbidden(String),
    /// The appointment's status or time no longer allows the operation.
    InvalidState(String),
    LimitExceeded(&'static str),
    /// Journal or storage failure. Never shown verbatim to callers.
    Store(String),
}

impl EngineError {
    /// Stable machine-readable kind for API responses and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(..) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Store(_) => "store",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Conflict(report) => write!(f, "conflict: {}", report.message),
            EngineError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
