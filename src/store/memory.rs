use async_trait::async_trait;

use crate::model::Reservation;

use super::{IntervalStore, Ledgers, ReservationScope, StoreError};

/// Volatile store: per-resource ledgers behind tokio RwLocks, nothing on disk.
#[derive(Default)]
pub struct InMemoryStore {
    ledgers: Ledgers,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_count(&self) -> usize {
        self.ledgers.len()
    }
}

#[async_trait]
impl IntervalStore for InMemoryStore {
    async fn begin(&self, resource: &str) -> Result<Box<dyn ReservationScope>, StoreError> {
        self.ledgers.begin(resource, None).await
    }

    async fn list(&self, resource: Option<&str>) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.ledgers.list(resource).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ledgers_created_lazily() {
        let store = InMemoryStore::new();
        assert_eq!(store.resource_count(), 0);
        assert!(store.list(Some("RoomA")).await.unwrap().is_empty());
        assert_eq!(store.resource_count(), 0);

        let _scope = store.begin("RoomA").await.unwrap();
        assert_eq!(store.resource_count(), 1);
    }
}
