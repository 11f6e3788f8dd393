use crate::model::*;

use super::{Engine, ReserveError};

/// Optional restrictions for [`Engine::list_reservations`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub resource: Option<String>,
    pub owner: Option<String>,
}

impl ReservationFilter {
    pub fn resource(resource: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            owner: None,
        }
    }

    fn matches(&self, r: &Reservation) -> bool {
        self.owner.as_deref().is_none_or(|o| o == r.owner)
    }
}

impl Engine {
    /// Committed reservations, by resource name then start. Never includes
    /// rows staged by an in-flight `reserve`.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, ReserveError> {
        let timeout = self.settings.scope_timeout;
        let listed = tokio::time::timeout(timeout, self.store.list(filter.resource.as_deref()))
            .await
            .map_err(|_| ReserveError::StoreUnavailable(format!("listing timed out after {timeout:?}")))?
            .map_err(|e| ReserveError::StoreUnavailable(e.to_string()))?;
        Ok(listed.into_iter().filter(|r| filter.matches(r)).collect())
    }
}
