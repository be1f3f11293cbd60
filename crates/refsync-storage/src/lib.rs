//! Repository contracts for refsync plus Postgres and in-memory backends.
//!
//! Both backends honour the same uniqueness rules: idempotency keys, catalog
//! external ids, lookup natural keys, and per-item score names / text
//! languages. The singleton state record is only ever written through
//! [`SystemStateStore::compare_and_swap_system_state`] or
//! [`SystemStateStore::touch_last_sync`], both of which bump its version.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refsync_core::{
    AttributeScore, ConcurrencyToken, IdempotencyRecord, LocalizedText, LookupSnapshot,
    NewCategoryGroup, NewTag, SystemState,
};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "refsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("undecodable row: {0}")]
    Decode(String),
    #[error("unit of work already finished")]
    Finished,
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateKey(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() || db.is_check_violation() => {
                StoreError::Constraint(db.message().to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            _ => StoreError::Database(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn find_idempotency_record(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>>;

    /// Fails with [`StoreError::DuplicateKey`] when the key already exists.
    async fn insert_idempotency_record(&self, record: &IdempotencyRecord) -> StoreResult<()>;
}

#[async_trait]
pub trait SystemStateStore: Send + Sync {
    async fn load_system_state(&self) -> StoreResult<SystemState>;

    /// Writes `next` only if the stored version still equals `expected`.
    /// The stored version becomes `expected.next()`; `next.version` is ignored.
    async fn compare_and_swap_system_state(
        &self,
        expected: ConcurrencyToken,
        next: &SystemState,
    ) -> StoreResult<bool>;

    /// Sets `last_sync_at` in a single atomic write without touching state or locks.
    async fn touch_last_sync(&self, at: DateTime<Utc>) -> StoreResult<()>;
}

/// A catalog item as merged: lookups already resolved to surrogate ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedItem {
    pub external_id: i64,
    pub display_number: i32,
    pub name: String,
    pub category_group_id: i32,
    pub image_ref: Option<String>,
    pub size1: Option<f64>,
    pub size2: Option<f64>,
    pub tag_ids: BTreeSet<i32>,
    pub scores: Vec<AttributeScore>,
    pub texts: Vec<LocalizedText>,
}

/// A catalog item as currently stored, with its child rows.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCatalogItem {
    pub id: i64,
    pub external_id: i64,
    pub display_number: i32,
    pub name: String,
    pub category_group_id: i32,
    pub image_ref: Option<String>,
    pub size1: Option<f64>,
    pub size2: Option<f64>,
    pub tag_ids: BTreeSet<i32>,
    pub scores: Vec<AttributeScore>,
    pub texts: Vec<LocalizedText>,
}

/// Changes to apply to one stored item. Scalars are always written; a
/// collection set to `Some` replaces the stored collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpdate {
    pub display_number: i32,
    pub name: String,
    pub category_group_id: i32,
    pub image_ref: Option<String>,
    pub size1: Option<f64>,
    pub size2: Option<f64>,
    pub tag_ids: Option<BTreeSet<i32>>,
    pub scores: Option<Vec<AttributeScore>>,
    pub texts: Option<Vec<LocalizedText>>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load_lookups(&self) -> StoreResult<LookupSnapshot>;

    /// Opens one isolated unit of work. Nothing written through it is visible
    /// until [`CatalogUnitOfWork::commit`].
    async fn begin(&self) -> StoreResult<Box<dyn CatalogUnitOfWork>>;
}

#[async_trait]
pub trait CatalogUnitOfWork: Send {
    async fn find_by_external_id(&mut self, external_id: i64) -> StoreResult<Option<StoredCatalogItem>>;

    async fn insert_item(&mut self, item: &ResolvedItem) -> StoreResult<i64>;

    async fn update_item(&mut self, id: i64, update: &ItemUpdate) -> StoreResult<()>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}

/// A flat lookup table addressed by a natural key `K`.
#[async_trait]
pub trait KeyedTable<K, R>: Send + Sync
where
    K: Send + Sync,
    R: Send + Sync,
{
    /// Rows whose key is among `keys`, fetched in one round-trip.
    async fn existing_rows(&self, keys: &[K]) -> StoreResult<Vec<R>>;

    /// Inserts all rows atomically; a unique violation yields
    /// [`StoreError::DuplicateKey`] and inserts nothing.
    async fn insert_rows(&self, rows: &[R]) -> StoreResult<()>;
}

/// Everything the sync services need from one backend.
#[async_trait]
pub trait Store:
    IdempotencyStore
    + SystemStateStore
    + CatalogStore
    + KeyedTable<i32, NewCategoryGroup>
    + KeyedTable<String, NewTag>
    + 'static
{
    fn backend_name(&self) -> &'static str;

    async fn migrate(&self) -> StoreResult<()>;
}

pub(crate) fn ensure_unique_children(
    scores: &[AttributeScore],
    texts: &[LocalizedText],
) -> StoreResult<()> {
    let mut names = BTreeSet::new();
    for score in scores {
        if !names.insert(score.name) {
            return Err(StoreError::DuplicateKey(format!(
                "score '{}' appears more than once",
                score.name
            )));
        }
    }
    let mut languages = BTreeSet::new();
    for text in texts {
        if !languages.insert(text.language.as_str()) {
            return Err(StoreError::DuplicateKey(format!(
                "text language '{}' appears more than once",
                text.language
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use refsync_core::ScoreName;

    #[test]
    fn duplicate_child_keys_are_rejected() {
        let scores = vec![
            AttributeScore { name: ScoreName::Hp, value: 10 },
            AttributeScore { name: ScoreName::Hp, value: 20 },
        ];
        let err = ensure_unique_children(&scores, &[]).expect_err("duplicate score");
        assert!(matches!(err, StoreError::DuplicateKey(_)));

        let texts = vec![
            LocalizedText { language: "en".into(), text: "a".into() },
            LocalizedText { language: "en".into(), text: "b".into() },
        ];
        assert!(ensure_unique_children(&[], &texts).is_err());
        assert!(ensure_unique_children(&scores[..1], &texts[..1]).is_ok());
    }
}
