use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refsync_core::{
    AttributeScore, CategoryGroup, ConcurrencyToken, IdempotencyRecord, LocalizedText,
    LookupSnapshot, NewCategoryGroup, NewTag, ScoreName, SystemState, SystemStateKind, Tag,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use crate::{
    ensure_unique_children, CatalogStore, CatalogUnitOfWork, IdempotencyStore, ItemUpdate,
    KeyedTable, ResolvedItem, Store, StoreError, StoreResult, StoredCatalogItem, SystemStateStore,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

fn decode_system_state(row: &PgRow) -> StoreResult<SystemState> {
    let raw_state: String = row.try_get("state")?;
    let state = SystemStateKind::from_db(&raw_state)
        .ok_or_else(|| StoreError::Decode(format!("system_state.state = '{raw_state}'")))?;
    Ok(SystemState {
        state,
        bootstrap_in_progress: row.try_get("bootstrap_in_progress")?,
        sync_in_progress: row.try_get("sync_in_progress")?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_sync_error: row.try_get("last_sync_error")?,
        updated_at: row.try_get("updated_at")?,
        version: ConcurrencyToken(row.try_get("version")?),
    })
}

#[async_trait]
impl IdempotencyStore for PgStore {
    async fn find_idempotency_record(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT external_key, payload_fingerprint, created_at, response_body
              FROM idempotency_keys
             WHERE external_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> StoreResult<IdempotencyRecord> {
            Ok(IdempotencyRecord {
                external_key: row.try_get("external_key")?,
                payload_fingerprint: row.try_get("payload_fingerprint")?,
                created_at: row.try_get("created_at")?,
                response_body: row.try_get("response_body")?,
            })
        })
        .transpose()
    }

    async fn insert_idempotency_record(&self, record: &IdempotencyRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (external_key, payload_fingerprint, created_at, response_body)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&record.external_key)
        .bind(&record.payload_fingerprint)
        .bind(record.created_at)
        .bind(&record.response_body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SystemStateStore for PgStore {
    async fn load_system_state(&self) -> StoreResult<SystemState> {
        let row = sqlx::query(
            r#"
            SELECT state, bootstrap_in_progress, sync_in_progress, last_sync_at,
                   last_sync_error, updated_at, version
              FROM system_state
             WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => decode_system_state(&row),
            None => Err(StoreError::NotFound("system_state row".to_string())),
        }
    }

    async fn compare_and_swap_system_state(
        &self,
        expected: ConcurrencyToken,
        next: &SystemState,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE system_state
               SET state = $1,
                   bootstrap_in_progress = $2,
                   sync_in_progress = $3,
                   last_sync_at = $4,
                   last_sync_error = $5,
                   updated_at = $6,
                   version = version + 1
             WHERE id = 1 AND version = $7
            "#,
        )
        .bind(next.state.as_str())
        .bind(next.bootstrap_in_progress)
        .bind(next.sync_in_progress)
        .bind(next.last_sync_at)
        .bind(&next.last_sync_error)
        .bind(next.updated_at)
        .bind(expected.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn touch_last_sync(&self, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE system_state
               SET last_sync_at = $1, updated_at = $1, version = version + 1
             WHERE id = 1
            "#,
        )
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("system_state row".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn load_lookups(&self) -> StoreResult<LookupSnapshot> {
        let group_rows = sqlx::query("SELECT id, number, name FROM category_groups")
            .fetch_all(&self.pool)
            .await?;
        let mut groups = Vec::with_capacity(group_rows.len());
        for row in group_rows {
            groups.push(CategoryGroup {
                id: row.try_get("id")?,
                number: row.try_get("number")?,
                name: row.try_get("name")?,
            });
        }

        let tag_rows = sqlx::query("SELECT id, name FROM tags")
            .fetch_all(&self.pool)
            .await?;
        let mut tags = Vec::with_capacity(tag_rows.len());
        for row in tag_rows {
            tags.push(Tag {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            });
        }

        Ok(LookupSnapshot::new(&groups, &tags))
    }

    async fn begin(&self) -> StoreResult<Box<dyn CatalogUnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx: Some(tx) }))
    }
}

struct PgUnitOfWork {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgUnitOfWork {
    fn tx(&mut self) -> StoreResult<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or(StoreError::Finished)
    }

    async fn replace_tags(&mut self, item_id: i64, tag_ids: &BTreeSet<i32>) -> StoreResult<()> {
        let tx = self.tx()?;
        sqlx::query("DELETE FROM catalog_item_tags WHERE item_id = $1")
            .bind(item_id)
            .execute(&mut **tx)
            .await?;
        for tag_id in tag_ids {
            sqlx::query("INSERT INTO catalog_item_tags (item_id, tag_id) VALUES ($1, $2)")
                .bind(item_id)
                .bind(*tag_id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn replace_scores(&mut self, item_id: i64, scores: &[AttributeScore]) -> StoreResult<()> {
        let tx = self.tx()?;
        sqlx::query("DELETE FROM catalog_item_scores WHERE item_id = $1")
            .bind(item_id)
            .execute(&mut **tx)
            .await?;
        for score in scores {
            sqlx::query("INSERT INTO catalog_item_scores (item_id, name, value) VALUES ($1, $2, $3)")
                .bind(item_id)
                .bind(score.name.as_str())
                .bind(i32::from(score.value))
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn replace_texts(&mut self, item_id: i64, texts: &[LocalizedText]) -> StoreResult<()> {
        let tx = self.tx()?;
        sqlx::query("DELETE FROM catalog_item_texts WHERE item_id = $1")
            .bind(item_id)
            .execute(&mut **tx)
            .await?;
        for text in texts {
            sqlx::query("INSERT INTO catalog_item_texts (item_id, language, text) VALUES ($1, $2, $3)")
                .bind(item_id)
                .bind(&text.language)
                .bind(&text.text)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogUnitOfWork for PgUnitOfWork {
    async fn find_by_external_id(&mut self, external_id: i64) -> StoreResult<Option<StoredCatalogItem>> {
        let tx = self.tx()?;
        let Some(row) = sqlx::query(
            r#"
            SELECT id, external_id, display_number, name, category_group_id,
                   image_ref, size1, size2
              FROM catalog_items
             WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&mut **tx)
        .await?
        else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;

        let tag_ids = sqlx::query("SELECT tag_id FROM catalog_item_tags WHERE item_id = $1")
            .bind(id)
            .fetch_all(&mut **tx)
            .await?
            .iter()
            .map(|r| r.try_get::<i32, _>("tag_id"))
            .collect::<Result<BTreeSet<_>, _>>()?;

        let mut scores = Vec::new();
        for r in sqlx::query("SELECT name, value FROM catalog_item_scores WHERE item_id = $1 ORDER BY id")
            .bind(id)
            .fetch_all(&mut **tx)
            .await?
        {
            let raw_name: String = r.try_get("name")?;
            let name = raw_name
                .parse::<ScoreName>()
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            let value: i32 = r.try_get("value")?;
            let value = u8::try_from(value)
                .map_err(|_| StoreError::Decode(format!("score value {value} out of range")))?;
            scores.push(AttributeScore { name, value });
        }

        let mut texts = Vec::new();
        for r in sqlx::query("SELECT language, text FROM catalog_item_texts WHERE item_id = $1 ORDER BY id")
            .bind(id)
            .fetch_all(&mut **tx)
            .await?
        {
            texts.push(LocalizedText {
                language: r.try_get("language")?,
                text: r.try_get("text")?,
            });
        }

        Ok(Some(StoredCatalogItem {
            id,
            external_id: row.try_get("external_id")?,
            display_number: row.try_get("display_number")?,
            name: row.try_get("name")?,
            category_group_id: row.try_get("category_group_id")?,
            image_ref: row.try_get("image_ref")?,
            size1: row.try_get("size1")?,
            size2: row.try_get("size2")?,
            tag_ids,
            scores,
            texts,
        }))
    }

    async fn insert_item(&mut self, item: &ResolvedItem) -> StoreResult<i64> {
        ensure_unique_children(&item.scores, &item.texts)?;
        let tx = self.tx()?;
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO catalog_items
                (external_id, display_number, name, category_group_id, image_ref, size1, size2)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(item.external_id)
        .bind(item.display_number)
        .bind(&item.name)
        .bind(item.category_group_id)
        .bind(&item.image_ref)
        .bind(item.size1)
        .bind(item.size2)
        .fetch_one(&mut **tx)
        .await?
        .try_get("id")?;

        self.replace_tags(id, &item.tag_ids).await?;
        self.replace_scores(id, &item.scores).await?;
        self.replace_texts(id, &item.texts).await?;
        Ok(id)
    }

    async fn update_item(&mut self, id: i64, update: &ItemUpdate) -> StoreResult<()> {
        ensure_unique_children(
            update.scores.as_deref().unwrap_or_default(),
            update.texts.as_deref().unwrap_or_default(),
        )?;
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            UPDATE catalog_items
               SET display_number = $2,
                   name = $3,
                   category_group_id = $4,
                   image_ref = $5,
                   size1 = $6,
                   size2 = $7
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.display_number)
        .bind(&update.name)
        .bind(update.category_group_id)
        .bind(&update.image_ref)
        .bind(update.size1)
        .bind(update.size2)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("catalog item {id}")));
        }

        if let Some(tag_ids) = &update.tag_ids {
            self.replace_tags(id, tag_ids).await?;
        }
        if let Some(scores) = &update.scores {
            self.replace_scores(id, scores).await?;
        }
        if let Some(texts) = &update.texts {
            self.replace_texts(id, texts).await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl KeyedTable<i32, NewCategoryGroup> for PgStore {
    async fn existing_rows(&self, keys: &[i32]) -> StoreResult<Vec<NewCategoryGroup>> {
        let rows = sqlx::query("SELECT number, name FROM category_groups WHERE number = ANY($1)")
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<NewCategoryGroup> {
                Ok(NewCategoryGroup {
                    number: row.try_get("number")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    async fn insert_rows(&self, rows: &[NewCategoryGroup]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query("INSERT INTO category_groups (number, name) VALUES ($1, $2)")
                .bind(row.number)
                .bind(&row.name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl KeyedTable<String, NewTag> for PgStore {
    async fn existing_rows(&self, keys: &[String]) -> StoreResult<Vec<NewTag>> {
        let rows = sqlx::query("SELECT name FROM tags WHERE name = ANY($1)")
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<NewTag> { Ok(NewTag { name: row.try_get("name")? }) })
            .collect()
    }

    async fn insert_rows(&self, rows: &[NewTag]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query("INSERT INTO tags (name) VALUES ($1)")
                .bind(&row.name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}
