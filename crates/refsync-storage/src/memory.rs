//! In-memory backend used by tests and by `serve` when no database is configured.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refsync_core::{
    CategoryGroup, ConcurrencyToken, IdempotencyRecord, LookupSnapshot, NewCategoryGroup, NewTag,
    SystemState, Tag,
};
use tokio::sync::Mutex;

use crate::{
    ensure_unique_children, CatalogStore, CatalogUnitOfWork, IdempotencyStore, ItemUpdate,
    KeyedTable, ResolvedItem, Store, StoreError, StoreResult, StoredCatalogItem, SystemStateStore,
};

#[derive(Debug)]
struct Tables {
    idempotency: HashMap<String, IdempotencyRecord>,
    system_state: SystemState,
    category_groups: Vec<CategoryGroup>,
    tags: Vec<Tag>,
    items: BTreeMap<i64, StoredCatalogItem>,
    next_item_id: i64,
}

impl Tables {
    fn item_by_external_id(&self, external_id: i64) -> Option<&StoredCatalogItem> {
        self.items.values().find(|i| i.external_id == external_id)
    }

    fn has_category_group_id(&self, id: i32) -> bool {
        self.category_groups.iter().any(|g| g.id == id)
    }

    fn has_tag_id(&self, id: i32) -> bool {
        self.tags.iter().any(|t| t.id == id)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables {
                idempotency: HashMap::new(),
                system_state: SystemState::initial(Utc::now()),
                category_groups: Vec::new(),
                tags: Vec::new(),
                items: BTreeMap::new(),
                next_item_id: 1,
            })),
        }
    }

    pub async fn item(&self, external_id: i64) -> Option<StoredCatalogItem> {
        self.tables.lock().await.item_by_external_id(external_id).cloned()
    }

    pub async fn item_count(&self) -> usize {
        self.tables.lock().await.items.len()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn find_idempotency_record(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        Ok(self.tables.lock().await.idempotency.get(key).cloned())
    }

    async fn insert_idempotency_record(&self, record: &IdempotencyRecord) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.idempotency.contains_key(&record.external_key) {
            return Err(StoreError::DuplicateKey(format!(
                "idempotency key '{}'",
                record.external_key
            )));
        }
        tables
            .idempotency
            .insert(record.external_key.clone(), record.clone());
        Ok(())
    }
}

#[async_trait]
impl SystemStateStore for MemoryStore {
    async fn load_system_state(&self) -> StoreResult<SystemState> {
        Ok(self.tables.lock().await.system_state.clone())
    }

    async fn compare_and_swap_system_state(
        &self,
        expected: ConcurrencyToken,
        next: &SystemState,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables.system_state.version != expected {
            return Ok(false);
        }
        tables.system_state = SystemState {
            version: expected.next(),
            ..next.clone()
        };
        Ok(true)
    }

    async fn touch_last_sync(&self, at: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let state = &mut tables.system_state;
        state.last_sync_at = Some(at);
        state.updated_at = at;
        state.version = state.version.next();
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load_lookups(&self) -> StoreResult<LookupSnapshot> {
        let tables = self.tables.lock().await;
        Ok(LookupSnapshot::new(&tables.category_groups, &tables.tags))
    }

    async fn begin(&self) -> StoreResult<Box<dyn CatalogUnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork {
            tables: Arc::clone(&self.tables),
            staged: Vec::new(),
            finished: false,
        }))
    }
}

#[derive(Debug)]
enum StagedWrite {
    Insert(StoredCatalogItem),
    Update(i64, ItemUpdate),
}

/// Buffers writes and applies them under one lock acquisition on commit.
struct MemoryUnitOfWork {
    tables: Arc<Mutex<Tables>>,
    staged: Vec<StagedWrite>,
    finished: bool,
}

impl MemoryUnitOfWork {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.finished {
            Err(StoreError::Finished)
        } else {
            Ok(())
        }
    }
}

fn apply_update(item: &mut StoredCatalogItem, update: &ItemUpdate) {
    item.display_number = update.display_number;
    item.name = update.name.clone();
    item.category_group_id = update.category_group_id;
    item.image_ref = update.image_ref.clone();
    item.size1 = update.size1;
    item.size2 = update.size2;
    if let Some(tag_ids) = &update.tag_ids {
        item.tag_ids = tag_ids.clone();
    }
    if let Some(scores) = &update.scores {
        item.scores = scores.clone();
    }
    if let Some(texts) = &update.texts {
        item.texts = texts.clone();
    }
}

fn check_references(
    tables: &Tables,
    category_group_id: i32,
    tag_ids: Option<&std::collections::BTreeSet<i32>>,
) -> StoreResult<()> {
    if !tables.has_category_group_id(category_group_id) {
        return Err(StoreError::Constraint(format!(
            "category group id {category_group_id} does not exist"
        )));
    }
    if let Some(missing) = tag_ids.and_then(|ids| ids.iter().find(|id| !tables.has_tag_id(**id))) {
        return Err(StoreError::Constraint(format!("tag id {missing} does not exist")));
    }
    Ok(())
}

#[async_trait]
impl CatalogUnitOfWork for MemoryUnitOfWork {
    async fn find_by_external_id(&mut self, external_id: i64) -> StoreResult<Option<StoredCatalogItem>> {
        self.ensure_open()?;
        let staged_insert = self.staged.iter().find_map(|w| match w {
            StagedWrite::Insert(item) if item.external_id == external_id => Some(item.clone()),
            _ => None,
        });
        if staged_insert.is_some() {
            return Ok(staged_insert);
        }
        let tables = self.tables.lock().await;
        let mut found = tables.item_by_external_id(external_id).cloned();
        if let Some(item) = found.as_mut() {
            for write in &self.staged {
                if let StagedWrite::Update(id, update) = write {
                    if *id == item.id {
                        apply_update(item, update);
                    }
                }
            }
        }
        Ok(found)
    }

    async fn insert_item(&mut self, item: &ResolvedItem) -> StoreResult<i64> {
        self.ensure_open()?;
        ensure_unique_children(&item.scores, &item.texts)?;
        let mut tables = self.tables.lock().await;
        check_references(&tables, item.category_group_id, Some(&item.tag_ids))?;
        let id = tables.next_item_id;
        tables.next_item_id += 1;
        drop(tables);

        self.staged.push(StagedWrite::Insert(StoredCatalogItem {
            id,
            external_id: item.external_id,
            display_number: item.display_number,
            name: item.name.clone(),
            category_group_id: item.category_group_id,
            image_ref: item.image_ref.clone(),
            size1: item.size1,
            size2: item.size2,
            tag_ids: item.tag_ids.clone(),
            scores: item.scores.clone(),
            texts: item.texts.clone(),
        }));
        Ok(id)
    }

    async fn update_item(&mut self, id: i64, update: &ItemUpdate) -> StoreResult<()> {
        self.ensure_open()?;
        ensure_unique_children(
            update.scores.as_deref().unwrap_or_default(),
            update.texts.as_deref().unwrap_or_default(),
        )?;
        let tables = self.tables.lock().await;
        if !tables.items.contains_key(&id) {
            return Err(StoreError::NotFound(format!("catalog item {id}")));
        }
        check_references(&tables, update.category_group_id, update.tag_ids.as_ref())?;
        drop(tables);

        self.staged.push(StagedWrite::Update(id, update.clone()));
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.finished = true;
        let mut tables = self.tables.lock().await;
        for write in &self.staged {
            if let StagedWrite::Insert(item) = write {
                if tables.item_by_external_id(item.external_id).is_some() {
                    return Err(StoreError::DuplicateKey(format!(
                        "catalog item external id {}",
                        item.external_id
                    )));
                }
            }
        }
        for write in self.staged.drain(..) {
            match write {
                StagedWrite::Insert(item) => {
                    tables.items.insert(item.id, item);
                }
                StagedWrite::Update(id, update) => {
                    if let Some(item) = tables.items.get_mut(&id) {
                        apply_update(item, &update);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.finished = true;
        self.staged.clear();
        Ok(())
    }
}

#[async_trait]
impl KeyedTable<i32, NewCategoryGroup> for MemoryStore {
    async fn existing_rows(&self, keys: &[i32]) -> StoreResult<Vec<NewCategoryGroup>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .category_groups
            .iter()
            .filter(|g| keys.contains(&g.number))
            .map(|g| NewCategoryGroup {
                number: g.number,
                name: g.name.clone(),
            })
            .collect())
    }

    async fn insert_rows(&self, rows: &[NewCategoryGroup]) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        for (idx, row) in rows.iter().enumerate() {
            let clash = tables.category_groups.iter().any(|g| g.number == row.number)
                || rows[..idx].iter().any(|r| r.number == row.number);
            if clash {
                return Err(StoreError::DuplicateKey(format!("category group number {}", row.number)));
            }
        }
        for row in rows {
            let id = tables.category_groups.len() as i32 + 1;
            tables.category_groups.push(CategoryGroup {
                id,
                number: row.number,
                name: row.name.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyedTable<String, NewTag> for MemoryStore {
    async fn existing_rows(&self, keys: &[String]) -> StoreResult<Vec<NewTag>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tags
            .iter()
            .filter(|t| keys.contains(&t.name))
            .map(|t| NewTag { name: t.name.clone() })
            .collect())
    }

    async fn insert_rows(&self, rows: &[NewTag]) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        for (idx, row) in rows.iter().enumerate() {
            let clash = tables.tags.iter().any(|t| t.name == row.name)
                || rows[..idx].iter().any(|r| r.name == row.name);
            if clash {
                return Err(StoreError::DuplicateKey(format!("tag '{}'", row.name)));
            }
        }
        for row in rows {
            let id = tables.tags.len() as i32 + 1;
            tables.tags.push(Tag {
                id,
                name: row.name.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn migrate(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        KeyedTable::<i32, NewCategoryGroup>::insert_rows(
            &store,
            &[NewCategoryGroup { number: 1, name: "generation i".into() }],
        )
        .await
        .expect("groups");
        KeyedTable::<String, NewTag>::insert_rows(&store, &[NewTag { name: "fire".into() }])
            .await
            .expect("tags");
        store
    }

    fn resolved(external_id: i64) -> ResolvedItem {
        ResolvedItem {
            external_id,
            display_number: 1,
            name: "A".into(),
            category_group_id: 1,
            image_ref: None,
            size1: None,
            size2: None,
            tag_ids: BTreeSet::from([1]),
            scores: vec![],
            texts: vec![],
        }
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_token() {
        let store = MemoryStore::new();
        let state = store.load_system_state().await.expect("load");
        let mut next = state.clone();
        next.bootstrap_in_progress = true;

        assert!(store.compare_and_swap_system_state(state.version, &next).await.expect("cas"));
        assert!(!store.compare_and_swap_system_state(state.version, &next).await.expect("cas"));

        let reloaded = store.load_system_state().await.expect("load");
        assert_eq!(reloaded.version, state.version.next());
        assert!(reloaded.bootstrap_in_progress);
    }

    #[tokio::test]
    async fn touch_last_sync_bumps_version_only() {
        let store = MemoryStore::new();
        let before = store.load_system_state().await.expect("load");
        let at = Utc::now();
        store.touch_last_sync(at).await.expect("touch");
        let after = store.load_system_state().await.expect("load");
        assert_eq!(after.last_sync_at, Some(at));
        assert_eq!(after.version, before.version.next());
        assert_eq!(after.state, before.state);
        assert_eq!(after.bootstrap_in_progress, before.bootstrap_in_progress);
    }

    #[tokio::test]
    async fn rolled_back_unit_of_work_leaves_no_trace() {
        let store = seeded().await;
        let mut uow = store.begin().await.expect("begin");
        uow.insert_item(&resolved(1)).await.expect("insert");
        assert!(uow.find_by_external_id(1).await.expect("find").is_some());
        uow.rollback().await.expect("rollback");

        assert_eq!(store.item_count().await, 0);
        assert!(matches!(uow.commit().await, Err(StoreError::Finished)));
    }

    #[tokio::test]
    async fn committed_insert_is_visible_and_unique() {
        let store = seeded().await;
        let mut uow = store.begin().await.expect("begin");
        uow.insert_item(&resolved(1)).await.expect("insert");
        uow.commit().await.expect("commit");
        assert!(store.item(1).await.is_some());

        let mut uow = store.begin().await.expect("begin");
        uow.insert_item(&resolved(1)).await.expect("staged insert");
        let err = uow.commit().await.expect_err("duplicate external id");
        assert!(matches!(err, StoreError::DuplicateKey(_)));
        assert_eq!(store.item_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_references_violate_constraints() {
        let store = seeded().await;
        let mut uow = store.begin().await.expect("begin");
        let mut item = resolved(2);
        item.tag_ids = BTreeSet::from([42]);
        let err = uow.insert_item(&item).await.expect_err("unknown tag");
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn lookup_inserts_are_all_or_nothing() {
        let store = seeded().await;
        let err = KeyedTable::<String, NewTag>::insert_rows(
            &store,
            &[NewTag { name: "water".into() }, NewTag { name: "fire".into() }],
        )
        .await
        .expect_err("fire already present");
        assert!(matches!(err, StoreError::DuplicateKey(_)));

        let lookups = store.load_lookups().await.expect("lookups");
        assert_eq!(lookups.tag_id("water"), None);
        assert_eq!(lookups.tag_id("fire"), Some(1));
    }
}
