use crate::model::{Ms, Span};

/// Why a span was refused before any store access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntervalError {
    #[error("start {start} must be before end {end}")]
    Inverted { start: Ms, end: Ms },
    #[error("timestamp out of range")]
    OutOfRange,
    #[error("interval too long")]
    TooLong,
    #[error("interval shorter than {min_ms} ms")]
    TooShort { min_ms: Ms },
    #[error("interval bounds must be multiples of {granularity_ms} ms")]
    Misaligned { granularity_ms: Ms },
    #[error("interval starts in the past")]
    InPast,
}

#[derive(Debug, thiserror::Error)]
pub enum ReserveError {
    #[error("invalid interval: {0}")]
    InvalidInterval(#[from] IntervalError),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    /// Expected outcome of contention; not an error on our side.
    #[error("resource {resource} is unavailable for {span}")]
    Overlap { resource: String, span: Span },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// Transient; the caller may retry with backoff.
    #[error("reservation store unavailable: {0}")]
    StoreUnavailable(String),
    /// The non-overlap guarantee was bypassed. Never shown verbatim to clients.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ReserveError {
    /// Short label for metrics and logs.
    pub fn outcome(&self) -> &'static str {
        match self {
            ReserveError::InvalidInterval(_) | ReserveError::InvalidRequest(_) => "invalid",
            ReserveError::Overlap { .. } => "overlap",
            ReserveError::LimitExceeded(_) => "limit_exceeded",
            ReserveError::StoreUnavailable(_) => "store_unavailable",
            ReserveError::InvariantViolation(_) => "invariant_violation",
        }
    }
}
