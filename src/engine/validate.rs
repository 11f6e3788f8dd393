use crate::limits::*;
use crate::model::*;

use super::{IntervalError, ReserveError};

/// Business rules applied to a requested span on top of `start < end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservePolicy {
    /// Shortest accepted reservation.
    pub min_duration_ms: Ms,
    /// When set, both bounds must be multiples of this.
    pub granularity_ms: Option<Ms>,
    /// Refuse spans that start before the current time.
    pub reject_past: bool,
}

impl Default for ReservePolicy {
    fn default() -> Self {
        Self {
            min_duration_ms: 1,
            granularity_ms: None,
            reject_past: false,
        }
    }
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span, policy: &ReservePolicy, now: Ms) -> Result<(), IntervalError> {
    if span.is_empty() {
        return Err(IntervalError::Inverted {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(IntervalError::OutOfRange);
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(IntervalError::TooLong);
    }
    if span.duration_ms() < policy.min_duration_ms {
        return Err(IntervalError::TooShort {
            min_ms: policy.min_duration_ms,
        });
    }
    if let Some(g) = policy.granularity_ms.filter(|g| *g > 0)
        && (span.start % g != 0 || span.end % g != 0)
    {
        return Err(IntervalError::Misaligned { granularity_ms: g });
    }
    if policy.reject_past && span.start < now {
        return Err(IntervalError::InPast);
    }
    Ok(())
}

pub(crate) fn validate_names(resource: &str, owner: &str) -> Result<(), ReserveError> {
    if resource.is_empty() {
        return Err(ReserveError::InvalidRequest("resource name is empty"));
    }
    if resource.len() > MAX_RESOURCE_NAME_LEN {
        return Err(ReserveError::InvalidRequest("resource name too long"));
    }
    if owner.is_empty() {
        return Err(ReserveError::InvalidRequest("owner is empty"));
    }
    if owner.len() > MAX_OWNER_LEN {
        return Err(ReserveError::InvalidRequest("owner too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    #[test]
    fn rejects_inverted_and_empty() {
        let policy = ReservePolicy::default();
        assert_eq!(
            validate_span(&Span::new(11 * H, 10 * H), &policy, 0),
            Err(IntervalError::Inverted { start: 11 * H, end: 10 * H })
        );
        assert!(matches!(
            validate_span(&Span::new(H, H), &policy, 0),
            Err(IntervalError::Inverted { .. })
        ));
        assert!(validate_span(&Span::new(H, H + 1), &policy, 0).is_ok());
    }

    #[test]
    fn rejects_out_of_range_and_too_long() {
        let policy = ReservePolicy::default();
        assert_eq!(
            validate_span(&Span::new(-5, 10), &policy, 0),
            Err(IntervalError::OutOfRange)
        );
        assert_eq!(
            validate_span(&Span::new(0, MAX_VALID_TIMESTAMP_MS + 1), &policy, 0),
            Err(IntervalError::OutOfRange)
        );
        assert_eq!(
            validate_span(&Span::new(0, MAX_SPAN_DURATION_MS + 1), &policy, 0),
            Err(IntervalError::TooLong)
        );
    }

    #[test]
    fn enforces_min_duration() {
        let policy = ReservePolicy {
            min_duration_ms: 15 * 60_000,
            ..ReservePolicy::default()
        };
        assert!(matches!(
            validate_span(&Span::new(0, 60_000), &policy, 0),
            Err(IntervalError::TooShort { .. })
        ));
        assert!(validate_span(&Span::new(0, 15 * 60_000), &policy, 0).is_ok());
    }

    #[test]
    fn enforces_granularity() {
        let policy = ReservePolicy {
            granularity_ms: Some(30 * 60_000),
            ..ReservePolicy::default()
        };
        assert!(validate_span(&Span::new(10 * H, 10 * H + 30 * 60_000), &policy, 0).is_ok());
        assert_eq!(
            validate_span(&Span::new(10 * H + 1, 11 * H), &policy, 0),
            Err(IntervalError::Misaligned { granularity_ms: 30 * 60_000 })
        );
    }

    #[test]
    fn past_only_rejected_when_configured() {
        let now = 100 * H;
        let span = Span::new(10 * H, 11 * H);
        assert!(validate_span(&span, &ReservePolicy::default(), now).is_ok());
        let strict = ReservePolicy {
            reject_past: true,
            ..ReservePolicy::default()
        };
        assert_eq!(validate_span(&span, &strict, now), Err(IntervalError::InPast));
        assert!(validate_span(&Span::new(now, now + H), &strict, now).is_ok());
    }

    #[test]
    fn names_checked() {
        assert!(validate_names("RoomA", "alice").is_ok());
        assert!(matches!(validate_names("", "alice"), Err(ReserveError::InvalidRequest(_))));
        assert!(matches!(validate_names("RoomA", ""), Err(ReserveError::InvalidRequest(_))));
        let long = "x".repeat(MAX_RESOURCE_NAME_LEN + 1);
        assert!(matches!(validate_names(&long, "alice"), Err(ReserveError::InvalidRequest(_))));
    }
}
