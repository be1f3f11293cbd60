use std::collections::HashSet;
use std::hash::Hash;

use refsync_core::{normalize_lookup_name, NewCategoryGroup, NewTag};
use refsync_storage::{KeyedTable, StoreError, StoreResult};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyUpsertOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

/// Inserts the incoming rows whose key is not stored yet.
///
/// Incoming rows are deduplicated by key (first occurrence wins) and diffed
/// against the existing keys fetched in one query. A unique violation during
/// the insert means another writer added the same keys first, so every
/// distinct key is reported as skipped.
pub async fn upsert_by_key<T, K, R, D>(
    table: &T,
    incoming: &[D],
    incoming_key: impl Fn(&D) -> K,
    existing_key: impl Fn(&R) -> K,
    map_new: impl Fn(&D) -> R,
) -> StoreResult<KeyUpsertOutcome>
where
    T: KeyedTable<K, R> + ?Sized,
    K: Eq + Hash + Clone + Send + Sync,
    R: Send + Sync,
{
    let mut seen = HashSet::new();
    let mut distinct = Vec::new();
    for row in incoming {
        let key = incoming_key(row);
        if seen.insert(key.clone()) {
            distinct.push((key, row));
        }
    }
    if distinct.is_empty() {
        return Ok(KeyUpsertOutcome::default());
    }

    let keys: Vec<K> = distinct.iter().map(|(key, _)| key.clone()).collect();
    let existing: HashSet<K> = table
        .existing_rows(&keys)
        .await?
        .iter()
        .map(existing_key)
        .collect();

    let new_rows: Vec<R> = distinct
        .iter()
        .filter(|(key, _)| !existing.contains(key))
        .map(|(_, row)| map_new(*row))
        .collect();
    let skipped = distinct.len() - new_rows.len();
    if new_rows.is_empty() {
        return Ok(KeyUpsertOutcome { inserted: 0, skipped });
    }

    match table.insert_rows(&new_rows).await {
        Ok(()) => Ok(KeyUpsertOutcome {
            inserted: new_rows.len(),
            skipped,
        }),
        Err(StoreError::DuplicateKey(detail)) => {
            warn!(%detail, "concurrent insert won the race; counting all rows as skipped");
            Ok(KeyUpsertOutcome {
                inserted: 0,
                skipped: distinct.len(),
            })
        }
        Err(err) => Err(err),
    }
}

/// Blank names are dropped; the rest are trimmed and lowercased.
pub async fn upsert_tags(
    table: &dyn KeyedTable<String, NewTag>,
    names: &[String],
) -> StoreResult<KeyUpsertOutcome> {
    let rows: Vec<NewTag> = names
        .iter()
        .map(|n| normalize_lookup_name(n))
        .filter(|n| !n.is_empty())
        .map(|name| NewTag { name })
        .collect();
    let outcome = upsert_by_key(
        table,
        &rows,
        |row| row.name.clone(),
        |row: &NewTag| row.name.clone(),
        Clone::clone,
    )
    .await?;
    info!(inserted = outcome.inserted, skipped = outcome.skipped, "tags upserted");
    Ok(outcome)
}

/// Groups with a non-positive number or a blank name are dropped.
pub async fn upsert_category_groups(
    table: &dyn KeyedTable<i32, NewCategoryGroup>,
    groups: &[NewCategoryGroup],
) -> StoreResult<KeyUpsertOutcome> {
    let rows: Vec<NewCategoryGroup> = groups
        .iter()
        .filter(|g| g.number > 0 && !g.name.trim().is_empty())
        .map(|g| NewCategoryGroup {
            number: g.number,
            name: normalize_lookup_name(&g.name),
        })
        .collect();
    let outcome = upsert_by_key(
        table,
        &rows,
        |row| row.number,
        |row: &NewCategoryGroup| row.number,
        Clone::clone,
    )
    .await?;
    info!(
        inserted = outcome.inserted,
        skipped = outcome.skipped,
        "category groups upserted"
    );
    Ok(outcome)
}
