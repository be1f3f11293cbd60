//! Upstream catalog sources: a local seed file and the HTTP integration.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refsync_core::CatalogItem;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

mod http;

pub use http::{FetchError, HttpCatalogSource, HttpClientConfig, HttpFetcher, RetrySchedule};

pub const CRATE_NAME: &str = "refsync-upstream";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedTag {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedCategoryGroup {
    pub number: i32,
    pub name: String,
}

/// Initial dataset: both lookup vocabularies plus any catalog items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedData {
    #[serde(default, alias = "types")]
    pub tags: Vec<SeedTag>,
    #[serde(default, alias = "generations")]
    pub category_groups: Vec<SeedCategoryGroup>,
    #[serde(default)]
    pub items: Vec<CatalogItem>,
}

impl SeedData {
    /// Minimal dataset used when no seed file exists.
    pub fn builtin() -> Self {
        Self {
            tags: ["normal", "fire", "water"]
                .into_iter()
                .map(|name| SeedTag { name: name.to_string() })
                .collect(),
            category_groups: vec![
                SeedCategoryGroup { number: 1, name: "generation i".to_string() },
                SeedCategoryGroup { number: 2, name: "generation ii".to_string() },
            ],
            items: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn initial_load(&self) -> Result<SeedData, SourceError>;

    /// Items changed upstream since `since` (everything when `None`).
    async fn delta(&self, since: Option<DateTime<Utc>>) -> Result<Vec<CatalogItem>, SourceError>;
}

/// Reads a JSON or YAML seed file from disk.
#[derive(Debug, Clone)]
pub struct SeedFileSource {
    path: PathBuf,
}

impl SeedFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn is_yaml(&self) -> bool {
        matches!(
            self.path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        )
    }

    async fn read(&self) -> Result<Option<SeedData>, SourceError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SourceError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let parsed = if self.is_yaml() {
            serde_yaml::from_str(&raw).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&raw).map_err(|e| e.to_string())
        };
        parsed.map(Some).map_err(|message| SourceError::Parse {
            path: self.path.clone(),
            message,
        })
    }
}

#[async_trait]
impl CatalogSource for SeedFileSource {
    fn name(&self) -> &'static str {
        "seed-file"
    }

    async fn initial_load(&self) -> Result<SeedData, SourceError> {
        match self.read().await? {
            Some(seed) => {
                info!(
                    path = %self.path.display(),
                    tags = seed.tags.len(),
                    category_groups = seed.category_groups.len(),
                    items = seed.items.len(),
                    "loaded seed file"
                );
                Ok(seed)
            }
            None => {
                warn!(path = %self.path.display(), "seed file not found; using built-in sample data");
                Ok(SeedData::builtin())
            }
        }
    }

    async fn delta(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<CatalogItem>, SourceError> {
        Ok(self.read().await?.map(|seed| seed.items).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_seed_file_falls_back_to_builtin_data() {
        let dir = tempdir().expect("tempdir");
        let source = SeedFileSource::new(dir.path().join("absent.json"));

        let seed = source.initial_load().await.expect("fallback");
        assert_eq!(seed, SeedData::builtin());
        assert!(source.delta(None).await.expect("delta").is_empty());
    }

    #[tokio::test]
    async fn json_seed_accepts_legacy_field_names() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("seed-data.json");
        std::fs::write(
            &path,
            r#"{
                "types": [{"name": "grass"}],
                "generations": [{"number": 3, "name": "generation iii"}],
                "items": [{"externalId": 252, "displayNumber": 252, "name": "Treecko",
                           "categoryGroup": 3, "tags": ["grass"]}]
            }"#,
        )
        .expect("write seed");

        let source = SeedFileSource::new(&path);
        let seed = source.initial_load().await.expect("load");
        assert_eq!(seed.tags, vec![SeedTag { name: "grass".into() }]);
        assert_eq!(seed.category_groups[0].number, 3);
        assert_eq!(seed.items[0].external_id, 252);
        assert_eq!(source.delta(Some(Utc::now())).await.expect("delta").len(), 1);
    }

    #[tokio::test]
    async fn yaml_seed_is_selected_by_extension() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("seed.yaml");
        std::fs::write(
            &path,
            "tags:\n  - name: ice\ncategoryGroups:\n  - number: 4\n    name: generation iv\n",
        )
        .expect("write seed");

        let seed = SeedFileSource::new(&path).initial_load().await.expect("load");
        assert_eq!(seed.tags[0].name, "ice");
        assert_eq!(seed.category_groups[0].name, "generation iv");
        assert!(seed.items.is_empty());
    }

    #[tokio::test]
    async fn malformed_seed_is_a_parse_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("seed-data.json");
        std::fs::write(&path, "{ not json").expect("write seed");

        let err = SeedFileSource::new(&path).initial_load().await.expect_err("parse");
        assert!(matches!(err, SourceError::Parse { .. }));
    }
}
