//! Core services: idempotency bookkeeping, the system-state coordinator, the
//! reconciliation engine, and the maintenance runners built on top of them.

use std::sync::Arc;
use std::time::Duration;

use refsync_core::{NewCategoryGroup, NewTag};
use refsync_storage::{CatalogStore, KeyedTable, Store, StoreError};
use thiserror::Error;

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod idempotency;
pub mod keyed;
pub mod maintenance;

pub use config::{BootstrapMode, SyncConfig};
pub use coordinator::{Completion, SystemStateCoordinator};
pub use engine::ReconciliationEngine;
pub use idempotency::{payload_fingerprint, IdempotencyCheck, IdempotencyService};
pub use keyed::{upsert_by_key, upsert_category_groups, upsert_tags, KeyUpsertOutcome};
pub use maintenance::{
    catalog_source_for, maybe_build_scheduler, run_bootstrap, run_nightly_sync,
    MaintenanceOutcome, MaintenanceReport,
};

pub const CRATE_NAME: &str = "refsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("lookup tables unavailable: {0}")]
    LookupsUnavailable(#[source] StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("gave up on '{operation}' after {attempts} conflicting state updates")]
    StateContention {
        operation: &'static str,
        attempts: usize,
    },
}

/// Every service wired against one storage backend.
#[derive(Clone)]
pub struct SyncServices {
    pub idempotency: Arc<IdempotencyService>,
    pub coordinator: Arc<SystemStateCoordinator>,
    pub engine: Arc<ReconciliationEngine>,
    pub catalog: Arc<dyn CatalogStore>,
    pub tags: Arc<dyn KeyedTable<String, NewTag>>,
    pub category_groups: Arc<dyn KeyedTable<i32, NewCategoryGroup>>,
}

impl SyncServices {
    pub fn new<S: Store>(store: Arc<S>, status_ttl: Duration) -> Self {
        let coordinator = Arc::new(SystemStateCoordinator::new(store.clone(), status_ttl));
        let catalog: Arc<dyn CatalogStore> = store.clone();
        Self {
            idempotency: Arc::new(IdempotencyService::new(store.clone())),
            engine: Arc::new(ReconciliationEngine::new(
                Arc::clone(&catalog),
                Arc::clone(&coordinator),
            )),
            coordinator,
            catalog,
            tags: store.clone(),
            category_groups: store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refsync_core::CatalogItem;
    use refsync_storage::MemoryStore;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn services_share_one_backend() {
        let store = Arc::new(MemoryStore::new());
        let services = SyncServices::new(Arc::clone(&store), Duration::ZERO);

        upsert_tags(services.tags.as_ref(), &["fire".into()]).await.expect("tags");
        upsert_category_groups(
            services.category_groups.as_ref(),
            &[NewCategoryGroup { number: 1, name: "generation i".into() }],
        )
        .await
        .expect("groups");

        let result = services
            .engine
            .upsert_batch(
                &[CatalogItem::new(1, 1, "A").with_tags(["fire"])],
                &CancellationToken::new(),
            )
            .await
            .expect("batch");
        assert_eq!(result.inserted_count, 1);
        assert_eq!(store.item_count().await, 1);
        assert!(services.coordinator.get_status().await.expect("status").last_sync_at.is_some());
    }

    #[test]
    fn lookup_failure_reads_as_its_own_error() {
        let err = SyncError::LookupsUnavailable(StoreError::NotFound("tags".into()));
        assert_eq!(err.to_string(), "lookup tables unavailable: not found: tags");
    }
}
