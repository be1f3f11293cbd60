use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use refsync_core::{BatchResult, CatalogItem, ItemResult, ItemStatus, LookupSnapshot};
use refsync_storage::{
    CatalogStore, CatalogUnitOfWork, ItemUpdate, ResolvedItem, StoreResult, StoredCatalogItem,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::coordinator::SystemStateCoordinator;
use crate::SyncError;

/// Merges catalog batches into the store, one unit of work per item.
pub struct ReconciliationEngine {
    store: Arc<dyn CatalogStore>,
    coordinator: Arc<SystemStateCoordinator>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn CatalogStore>, coordinator: Arc<SystemStateCoordinator>) -> Self {
        Self { store, coordinator }
    }

    /// Items are processed in order. A failing item is reported and the loop
    /// moves on; only an unreadable lookup snapshot aborts the batch. When
    /// `cancel` fires, items already merged stay merged and the partial result
    /// comes back with `cancelled` set.
    pub async fn upsert_batch(
        &self,
        items: &[CatalogItem],
        cancel: &CancellationToken,
    ) -> Result<BatchResult, SyncError> {
        self.run_batch(items, cancel)
            .instrument(info_span!("upsert_batch", items = items.len()))
            .await
    }

    async fn run_batch(
        &self,
        items: &[CatalogItem],
        cancel: &CancellationToken,
    ) -> Result<BatchResult, SyncError> {
        let started = Instant::now();
        let lookups = self
            .store
            .load_lookups()
            .await
            .map_err(SyncError::LookupsUnavailable)?;

        let mut result = BatchResult::with_capacity(items.len());
        for item in items {
            if cancel.is_cancelled() {
                warn!(
                    attempted = result.items.len(),
                    remaining = items.len() - result.items.len(),
                    "batch cancelled"
                );
                result.cancelled = true;
                break;
            }

            let outcome = self.merge_item(item, &lookups).await;
            match outcome.status {
                ItemStatus::Failed => warn!(
                    external_id = outcome.external_id,
                    message = outcome.message.as_deref().unwrap_or_default(),
                    "item failed"
                ),
                status => debug!(external_id = outcome.external_id, status = status.as_str(), "item merged"),
            }
            result.record(outcome);
        }
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if result.changed_count() > 0 {
            if let Err(err) = self.coordinator.mark_sync_now().await {
                warn!(error = %err, "could not refresh last sync time");
            }
        }

        info!(
            inserted = result.inserted_count,
            updated = result.updated_count,
            skipped = result.skipped_count,
            failed = result.failed_count,
            duration_ms = result.duration_ms,
            "batch reconciled"
        );
        Ok(result)
    }

    async fn merge_item(&self, item: &CatalogItem, lookups: &LookupSnapshot) -> ItemResult {
        let item = item.clone().normalized();
        let external_id = item.external_id;

        let Some(category_group_id) = lookups.category_id(item.category_group) else {
            return ItemResult::failed(
                external_id,
                format!("Unknown categoryGroup={}.", item.category_group),
            );
        };
        let mut tag_ids = BTreeSet::new();
        for tag in &item.tags {
            match lookups.tag_id(tag) {
                Some(id) => {
                    tag_ids.insert(id);
                }
                None => return ItemResult::failed(external_id, format!("Unknown tag '{tag}'.")),
            }
        }

        let mut uow = match self.store.begin().await {
            Ok(uow) => uow,
            Err(err) => return ItemResult::failed(external_id, err.to_string()),
        };
        match apply_item(uow.as_mut(), &item, category_group_id, tag_ids).await {
            Ok(outcome) => match uow.commit().await {
                Ok(()) => outcome,
                Err(err) => ItemResult::failed(external_id, err.to_string()),
            },
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(external_id, error = %rollback_err, "rollback failed");
                }
                ItemResult::failed(external_id, err.to_string())
            }
        }
    }
}

async fn apply_item(
    uow: &mut dyn CatalogUnitOfWork,
    item: &CatalogItem,
    category_group_id: i32,
    tag_ids: BTreeSet<i32>,
) -> StoreResult<ItemResult> {
    let Some(existing) = uow.find_by_external_id(item.external_id).await? else {
        uow.insert_item(&ResolvedItem {
            external_id: item.external_id,
            display_number: item.display_number,
            name: item.name.clone(),
            category_group_id,
            image_ref: item.image_ref.clone(),
            size1: item.size1,
            size2: item.size2,
            tag_ids,
            scores: item.attribute_scores.clone().unwrap_or_default(),
            texts: item.localized_texts.clone().unwrap_or_default(),
        })
        .await?;
        return Ok(ItemResult::inserted(item.external_id));
    };

    match plan_update(&existing, item, category_group_id, tag_ids) {
        Some(update) => {
            uow.update_item(existing.id, &update).await?;
            Ok(ItemResult::updated(item.external_id))
        }
        None => Ok(ItemResult::unchanged(item.external_id)),
    }
}

/// `None` when the stored row already matches. Names compare
/// case-insensitively and keep their stored spelling on a case-only
/// difference. Scores and texts, when present, always replace.
pub(crate) fn plan_update(
    existing: &StoredCatalogItem,
    item: &CatalogItem,
    category_group_id: i32,
    tag_ids: BTreeSet<i32>,
) -> Option<ItemUpdate> {
    let name_changed = existing.name.to_lowercase() != item.name.to_lowercase();
    let tags_changed = existing.tag_ids != tag_ids;
    let mutated = name_changed
        || tags_changed
        || existing.display_number != item.display_number
        || existing.category_group_id != category_group_id
        || existing.size1 != item.size1
        || existing.size2 != item.size2
        || existing.image_ref != item.image_ref
        || item.attribute_scores.is_some()
        || item.localized_texts.is_some();

    mutated.then(|| ItemUpdate {
        display_number: item.display_number,
        name: if name_changed {
            item.name.clone()
        } else {
            existing.name.clone()
        },
        category_group_id,
        image_ref: item.image_ref.clone(),
        size1: item.size1,
        size2: item.size2,
        tag_ids: tags_changed.then_some(tag_ids),
        scores: item.attribute_scores.clone(),
        texts: item.localized_texts.clone(),
    })
}
