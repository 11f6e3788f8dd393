//! Interval Store: the durable record of committed reservations and the
//! isolation scopes the engine composes into an atomic check-and-insert.

mod durable;
mod memory;

pub use durable::WalStore;
pub use memory::InMemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use durable::WalHandle;

pub type SharedLedger = Arc<RwLock<ResourceLedger>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient; the caller may retry the whole scope.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The exclusion constraint rejected a row overlapping `0`.
    #[error("conflict with reservation {0}")]
    Conflict(Ulid),
    /// Committed state would contain two overlapping reservations.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Storage capability the engine is built on.
#[async_trait]
pub trait IntervalStore: Send + Sync {
    /// Open an isolation scope with exclusive access to `resource`. Waits
    /// while another scope holds the resource.
    async fn begin(&self, resource: &str) -> Result<Box<dyn ReservationScope>, StoreError>;

    /// Committed reservations, optionally restricted to one resource.
    /// Ordered by resource name, then start.
    async fn list(&self, resource: Option<&str>) -> Result<Vec<Reservation>, StoreError>;
}

/// A unit of work holding exclusive access to one resource. Dropping it
/// without calling `commit` rolls back everything staged.
#[async_trait]
pub trait ReservationScope: Send {
    fn resource(&self) -> &str;

    /// Any committed (or staged in this scope) reservation overlapping `span`.
    async fn find_overlapping(&mut self, span: &Span) -> Result<Option<Reservation>, StoreError>;

    /// Stage a reservation. Rejects rows that overlap anything visible to
    /// this scope.
    async fn insert(&mut self, reservation: Reservation) -> Result<Reservation, StoreError>;

    /// Make staged rows durable and visible. The returned future owns the
    /// scope, so it can be driven to completion on its own task.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;
}

/// Per-resource ledgers shared by both store implementations.
#[derive(Default)]
pub(crate) struct Ledgers {
    map: DashMap<String, SharedLedger>,
}

impl Ledgers {
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn get(&self, resource: &str) -> Option<SharedLedger> {
        self.map.get(resource).map(|e| e.value().clone())
    }

    pub(crate) fn get_or_create(&self, resource: &str) -> Result<SharedLedger, StoreError> {
        if let Some(ledger) = self.get(resource) {
            return Ok(ledger);
        }
        if self.map.len() >= MAX_RESOURCES {
            return Err(StoreError::LimitExceeded("too many resources"));
        }
        let ledger = self
            .map
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceLedger::new(resource))))
            .value()
            .clone();
        Ok(ledger)
    }

    pub(crate) async fn begin(
        &self,
        resource: &str,
        journal: Option<WalHandle>,
    ) -> Result<Box<dyn ReservationScope>, StoreError> {
        let ledger = self.get_or_create(resource)?;
        let guard = ledger.write_owned().await;
        Ok(Box::new(LedgerScope {
            guard,
            staged: Vec::new(),
            journal,
        }))
    }

    pub(crate) async fn list(&self, resource: Option<&str>) -> Vec<Reservation> {
        // Clone the Arcs out first; never hold a DashMap shard across an await.
        let mut ledgers: Vec<(String, SharedLedger)> = match resource {
            Some(name) => self
                .get(name)
                .map(|l| vec![(name.to_string(), l)])
                .unwrap_or_default(),
            None => self
                .map
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        ledgers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::new();
        for (_, ledger) in ledgers {
            let guard = ledger.read().await;
            out.extend(guard.reservations().iter().cloned());
        }
        out
    }
}

/// Scope over one ledger: the owned write guard is the exclusive lock.
struct LedgerScope {
    guard: OwnedRwLockWriteGuard<ResourceLedger>,
    staged: Vec<Reservation>,
    journal: Option<WalHandle>,
}

impl LedgerScope {
    fn visible_overlap(&self, span: &Span) -> Option<&Reservation> {
        self.guard
            .first_overlap(span)
            .or_else(|| self.staged.iter().find(|r| r.span.overlaps(span)))
    }
}

#[async_trait]
impl ReservationScope for LedgerScope {
    fn resource(&self) -> &str {
        &self.guard.resource
    }

    async fn find_overlapping(&mut self, span: &Span) -> Result<Option<Reservation>, StoreError> {
        Ok(self.visible_overlap(span).cloned())
    }

    async fn insert(&mut self, reservation: Reservation) -> Result<Reservation, StoreError> {
        if reservation.resource != self.guard.resource {
            return Err(StoreError::InvariantViolation(format!(
                "reservation for {} staged in scope of {}",
                reservation.resource, self.guard.resource
            )));
        }
        if let Some(existing) = self.visible_overlap(&reservation.span) {
            return Err(StoreError::Conflict(existing.id));
        }
        if self.guard.len() + self.staged.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(StoreError::LimitExceeded("too many reservations on resource"));
        }
        self.staged.push(reservation.clone());
        Ok(reservation)
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        let LedgerScope {
            mut guard,
            staged,
            journal,
        } = *self;
        Box::pin(async move {
            if staged.is_empty() {
                return Ok(());
            }
            for r in &staged {
                if let Some(existing) = guard.first_overlap(&r.span) {
                    return Err(StoreError::InvariantViolation(format!(
                        "{} {} overlaps committed {} {} on {}",
                        r.id, r.span, existing.id, existing.span, guard.resource
                    )));
                }
            }
            if let Some(journal) = &journal {
                let events = staged.iter().cloned().map(Event::Reserved).collect();
                journal.append(events).await?;
            }
            for r in staged {
                guard.insert(r);
            }
            Ok(())
        })
    }
}
