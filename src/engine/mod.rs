mod error;
mod queries;
mod validate;

pub use error::{IntervalError, ReserveError};
pub use queries::ReservationFilter;
pub use validate::ReservePolicy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{RESERVATIONS_TOTAL, RESERVE_DURATION_SECONDS, SCOPE_WAIT_SECONDS};
use crate::store::{IntervalStore, ReservationScope, StoreError};

use validate::{now_ms, validate_names, validate_span};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: ReservePolicy,
    /// Upper bound on waiting for a resource held by another scope.
    pub scope_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: ReservePolicy::default(),
            scope_timeout: Duration::from_secs(5),
        }
    }
}

/// Turns reservation requests into commit-or-reject decisions.
///
/// Every call to [`Engine::reserve`] runs inside a store scope holding
/// exclusive access to the requested resource, so the overlap check and the
/// insert that follows it are atomic with respect to every other request on
/// that resource. Requests on different resources never wait on each other.
pub struct Engine {
    store: Arc<dyn IntervalStore>,
    settings: EngineSettings,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(store: Arc<dyn IntervalStore>, notify: Arc<NotifyHub>, settings: EngineSettings) -> Self {
        Self {
            store,
            settings,
            notify,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Reserve `span` on `resource` for `owner`.
    ///
    /// `Overlap` is never retried here: it is not transient, and retrying
    /// could flip an outcome the client was already given.
    pub async fn reserve(&self, resource: &str, span: Span, owner: &str) -> Result<Reservation, ReserveError> {
        let started = Instant::now();
        let result = self.try_reserve(resource, span, owner).await;

        let outcome = match &result {
            Ok(_) => "committed",
            Err(e) => e.outcome(),
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(RESERVE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(r) => info!(
                id = %r.id,
                resource = %r.resource,
                owner = %r.owner,
                start = r.span.start,
                end = r.span.end,
                "reservation committed"
            ),
            Err(ReserveError::Overlap { .. }) => {
                debug!(resource, %span, owner, "reservation rejected: overlap")
            }
            Err(ReserveError::StoreUnavailable(cause)) => {
                error!(resource, %span, owner, %cause, "reservation failed: store unavailable")
            }
            Err(ReserveError::InvariantViolation(detail)) => error!(
                resource,
                %span,
                owner,
                %detail,
                "INVARIANT VIOLATION: non-overlap guarantee bypassed"
            ),
            Err(e) => debug!(resource, %span, owner, "reservation refused: {e}"),
        }
        result
    }

    async fn try_reserve(&self, resource: &str, span: Span, owner: &str) -> Result<Reservation, ReserveError> {
        // Validating
        validate_names(resource, owner)?;
        let now = now_ms();
        validate_span(&span, &self.settings.policy, now)?;

        // Checking
        let mut scope = self.open_scope(resource, span).await?;
        if let Some(existing) = scope
            .find_overlapping(&span)
            .await
            .map_err(|e| translate(e, resource, span))?
        {
            debug!(resource, existing = %existing.id, "overlapping reservation found");
            return Err(overlap(resource, span));
        }

        // Inserting
        let staged = Reservation {
            id: Ulid::new(),
            resource: resource.to_string(),
            span,
            owner: owner.to_string(),
            created_at: now,
        };
        let staged = match scope.insert(staged).await {
            Ok(r) => r,
            Err(StoreError::Conflict(existing)) => {
                warn!(resource, %span, %existing, "exclusion constraint caught an overlap the check missed");
                return Err(overlap(resource, span));
            }
            Err(e) => return Err(translate(e, resource, span)),
        };

        // Committed. The commit runs on its own task so a caller that goes
        // away mid-commit cannot leave the journal and the ledger disagreeing.
        tokio::spawn(scope.commit())
            .await
            .map_err(|e| ReserveError::StoreUnavailable(format!("commit task failed: {e}")))?
            .map_err(|e| translate(e, resource, span))?;

        self.notify.send(&staged);
        Ok(staged)
    }

    /// Wait (bounded) for exclusive access to `resource`.
    async fn open_scope(&self, resource: &str, span: Span) -> Result<Box<dyn ReservationScope>, ReserveError> {
        let wait = Instant::now();
        let scope = tokio::time::timeout(self.settings.scope_timeout, self.store.begin(resource))
            .await
            .map_err(|_| {
                ReserveError::StoreUnavailable(format!(
                    "timed out after {:?} waiting for {resource}",
                    self.settings.scope_timeout
                ))
            })?;
        metrics::histogram!(SCOPE_WAIT_SECONDS).record(wait.elapsed().as_secs_f64());
        scope.map_err(|e| translate(e, resource, span))
    }
}

fn overlap(resource: &str, span: Span) -> ReserveError {
    ReserveError::Overlap {
        resource: resource.to_string(),
        span,
    }
}

/// Store errors never cross the engine boundary raw.
fn translate(e: StoreError, resource: &str, span: Span) -> ReserveError {
    match e {
        StoreError::Unavailable(cause) => ReserveError::StoreUnavailable(cause),
        StoreError::Conflict(_) => overlap(resource, span),
        StoreError::InvariantViolation(detail) => ReserveError::InvariantViolation(detail),
        StoreError::LimitExceeded(what) => ReserveError::LimitExceeded(what),
    }
}
