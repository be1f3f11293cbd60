//! Core domain model for refsync: catalog items, batch results, system state.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "refsync-core";

/// Longest idempotency key the store accepts.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Fixed vocabulary for attribute score names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreName {
    Hp,
    Attack,
    Defense,
    SpecialAttack,
    SpecialDefense,
    Speed,
}

impl ScoreName {
    pub const ALL: [ScoreName; 6] = [
        ScoreName::Hp,
        ScoreName::Attack,
        ScoreName::Defense,
        ScoreName::SpecialAttack,
        ScoreName::SpecialDefense,
        ScoreName::Speed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hp => "hp",
            Self::Attack => "attack",
            Self::Defense => "defense",
            Self::SpecialAttack => "special-attack",
            Self::SpecialDefense => "special-defense",
            Self::Speed => "speed",
        }
    }
}

impl fmt::Display for ScoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownScoreName(pub String);

impl fmt::Display for UnknownScoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown score name '{}'", self.0)
    }
}

impl std::error::Error for UnknownScoreName {}

impl FromStr for ScoreName {
    type Err = UnknownScoreName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownScoreName(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeScore {
    pub name: ScoreName,
    pub value: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedText {
    pub language: String,
    pub text: String,
}

/// One incoming catalog record, already validated.
///
/// `attribute_scores` and `localized_texts` are authoritative when present:
/// a merge replaces the stored collection wholesale. `None` leaves it alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub external_id: i64,
    #[serde(default)]
    pub display_number: i32,
    pub name: String,
    pub category_group: i32,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub size1: Option<f64>,
    #[serde(default)]
    pub size2: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attribute_scores: Option<Vec<AttributeScore>>,
    #[serde(default)]
    pub localized_texts: Option<Vec<LocalizedText>>,
}

impl CatalogItem {
    pub fn new(external_id: i64, category_group: i32, name: impl Into<String>) -> Self {
        Self {
            external_id,
            display_number: external_id.clamp(1, i32::MAX as i64) as i32,
            name: name.into(),
            category_group,
            image_ref: None,
            size1: None,
            size2: None,
            tags: Vec::new(),
            attribute_scores: None,
            localized_texts: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Tags are matched against the lookup by their trimmed lowercase form.
    pub fn normalized(mut self) -> Self {
        self.tags = self.tags.iter().map(|t| normalize_lookup_name(t)).collect();
        self
    }
}

pub fn normalize_lookup_name(name: &str) -> String {
    name.trim().to_lowercase()
}

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_IMAGE_REF_LEN: usize = 512;
pub const MAX_TEXT_LEN: usize = 300;

fn is_kebab_token(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl CatalogItem {
    /// Field-level problems with this item. Tags are checked as given, so
    /// callers normalize first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.external_id <= 0 {
            errors.push("externalId must be positive.".to_string());
        }
        if self.display_number <= 0 {
            errors.push("displayNumber must be positive.".to_string());
        }
        if self.name.trim().is_empty() {
            errors.push("name is required.".to_string());
        } else if self.name.chars().count() > MAX_NAME_LEN {
            errors.push(format!("name too long ({MAX_NAME_LEN} max)."));
        }
        if self.category_group <= 0 {
            errors.push("categoryGroup must be positive.".to_string());
        }
        if self
            .image_ref
            .as_ref()
            .is_some_and(|r| r.chars().count() > MAX_IMAGE_REF_LEN)
        {
            errors.push(format!("imageRef too long ({MAX_IMAGE_REF_LEN} max)."));
        }
        for (field, size) in [("size1", self.size1), ("size2", self.size2)] {
            if size.is_some_and(|v| !v.is_finite() || v < 0.0) {
                errors.push(format!("{field} must be a non-negative number."));
            }
        }

        if self.tags.is_empty() {
            errors.push("at least one tag is required.".to_string());
        }
        for tag in &self.tags {
            if !is_kebab_token(tag) {
                errors.push(format!("tag '{tag}' must be lowercase kebab-case."));
            }
        }

        if let Some(scores) = &self.attribute_scores {
            for (i, score) in scores.iter().enumerate() {
                if score.value == 0 {
                    errors.push(format!(
                        "attributeScores[{i}].value must be between 1 and 255."
                    ));
                }
                if scores[..i].iter().any(|s| s.name == score.name) {
                    errors.push(format!(
                        "attributeScores[{i}].name '{}' appears more than once.",
                        score.name
                    ));
                }
            }
        }

        if let Some(texts) = &self.localized_texts {
            for (i, text) in texts.iter().enumerate() {
                let len = text.language.chars().count();
                if !(2..=5).contains(&len) {
                    errors.push(format!(
                        "localizedTexts[{i}].language must be 2 to 5 characters."
                    ));
                } else if texts[..i].iter().any(|t| t.language == text.language) {
                    errors.push(format!(
                        "localizedTexts[{i}].language '{}' appears more than once.",
                        text.language
                    ));
                }
                if text.text.trim().is_empty() {
                    errors.push(format!("localizedTexts[{i}].text is required."));
                } else if text.text.chars().count() > MAX_TEXT_LEN {
                    errors.push(format!(
                        "localizedTexts[{i}].text too long ({MAX_TEXT_LEN} max)."
                    ));
                }
            }
        }
        errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    Inserted,
    Updated,
    Skipped,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "Inserted",
            Self::Updated => "Updated",
            Self::Skipped => "Skipped",
            Self::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub external_id: i64,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ItemResult {
    pub fn inserted(external_id: i64) -> Self {
        Self {
            external_id,
            status: ItemStatus::Inserted,
            message: None,
        }
    }

    pub fn updated(external_id: i64) -> Self {
        Self {
            external_id,
            status: ItemStatus::Updated,
            message: None,
        }
    }

    pub fn unchanged(external_id: i64) -> Self {
        Self {
            external_id,
            status: ItemStatus::Skipped,
            message: Some("No changes.".to_string()),
        }
    }

    pub fn failed(external_id: i64, message: impl Into<String>) -> Self {
        Self {
            external_id,
            status: ItemStatus::Failed,
            message: Some(message.into()),
        }
    }
}

/// Outcome of one reconciliation call. Counts always sum to `items.len()`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub items: Vec<ItemResult>,
    pub inserted_count: usize,
    pub updated_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancelled: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl BatchResult {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            items: Vec::with_capacity(n),
            ..Default::default()
        }
    }

    pub fn record(&mut self, result: ItemResult) {
        match result.status {
            ItemStatus::Inserted => self.inserted_count += 1,
            ItemStatus::Updated => self.updated_count += 1,
            ItemStatus::Skipped => self.skipped_count += 1,
            ItemStatus::Failed => self.failed_count += 1,
        }
        self.items.push(result);
    }

    pub fn changed_count(&self) -> usize {
        self.inserted_count + self.updated_count
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStateKind {
    Initializing,
    Ready,
    Degraded,
}

impl SystemStateKind {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(Self::Initializing),
            "ready" => Some(Self::Ready),
            "degraded" => Some(Self::Degraded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
        }
    }
}

/// Opaque row version of the singleton state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConcurrencyToken(pub i64);

impl ConcurrencyToken {
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub state: SystemStateKind,
    pub bootstrap_in_progress: bool,
    pub sync_in_progress: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub version: ConcurrencyToken,
}

impl SystemState {
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            state: SystemStateKind::Initializing,
            bootstrap_in_progress: false,
            sync_in_progress: false,
            last_sync_at: None,
            last_sync_error: None,
            updated_at: now,
            version: ConcurrencyToken(0),
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            initializing: self.state == SystemStateKind::Initializing || self.bootstrap_in_progress,
            last_sync_at: self.last_sync_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub initializing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Stored outcome of the first successful processing of an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub external_key: String,
    pub payload_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub response_body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryGroup {
    pub id: i32,
    pub number: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewCategoryGroup {
    pub number: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewTag {
    pub name: String,
}

/// Natural key to surrogate id maps, loaded once per batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupSnapshot {
    category_ids: HashMap<i32, i32>,
    tag_ids: HashMap<String, i32>,
}

impl LookupSnapshot {
    pub fn new(groups: &[CategoryGroup], tags: &[Tag]) -> Self {
        Self {
            category_ids: groups.iter().map(|g| (g.number, g.id)).collect(),
            tag_ids: tags.iter().map(|t| (t.name.clone(), t.id)).collect(),
        }
    }

    pub fn category_id(&self, number: i32) -> Option<i32> {
        self.category_ids.get(&number).copied()
    }

    pub fn tag_id(&self, name: &str) -> Option<i32> {
        self.tag_ids.get(name).copied()
    }

    pub fn has_category_groups(&self) -> bool {
        !self.category_ids.is_empty()
    }

    pub fn has_tags(&self) -> bool {
        !self.tag_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_names_parse_from_wire_vocabulary() {
        assert_eq!("special-attack".parse::<ScoreName>(), Ok(ScoreName::SpecialAttack));
        assert_eq!("hp".parse::<ScoreName>(), Ok(ScoreName::Hp));
        assert!("luck".parse::<ScoreName>().is_err());
        for name in ScoreName::ALL {
            assert_eq!(name.as_str().parse::<ScoreName>(), Ok(name));
        }
    }

    #[test]
    fn batch_result_counts_track_recorded_items() {
        let mut result = BatchResult::with_capacity(4);
        result.record(ItemResult::inserted(1));
        result.record(ItemResult::updated(2));
        result.record(ItemResult::unchanged(3));
        result.record(ItemResult::failed(4, "boom"));

        assert_eq!(result.inserted_count, 1);
        assert_eq!(result.updated_count, 1);
        assert_eq!(result.skipped_count, 1);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.changed_count(), 2);
        assert!(result.has_failures());
        assert_eq!(
            result.inserted_count + result.updated_count + result.skipped_count + result.failed_count,
            result.items.len()
        );
    }

    #[test]
    fn item_result_serializes_camel_case_without_empty_message() {
        let json = serde_json::to_value(ItemResult::inserted(25)).expect("serialize");
        assert_eq!(json, serde_json::json!({"externalId": 25, "status": "Inserted"}));

        let json = serde_json::to_value(ItemResult::unchanged(25)).expect("serialize");
        assert_eq!(json["message"], "No changes.");
    }

    #[test]
    fn cancelled_flag_only_serialized_when_set() {
        let json = serde_json::to_value(BatchResult::default()).expect("serialize");
        assert!(json.get("cancelled").is_none());
        assert_eq!(json["durationMs"], 0);
    }

    #[test]
    fn status_reports_initializing_while_bootstrap_holds_lock() {
        let now = Utc::now();
        let mut state = SystemState::initial(now);
        assert!(state.status().initializing);

        state.state = SystemStateKind::Ready;
        assert!(!state.status().initializing);

        state.bootstrap_in_progress = true;
        assert!(state.status().initializing);
    }

    #[test]
    fn catalog_item_tags_normalize_to_lowercase() {
        let item = CatalogItem::new(1, 1, "A").with_tags([" Fire ", "WATER"]).normalized();
        assert_eq!(item.tags, vec!["fire".to_string(), "water".to_string()]);
    }

    #[test]
    fn valid_item_has_no_errors() {
        let mut item = CatalogItem::new(25, 1, "Pikachu").with_tags(["electric"]);
        item.attribute_scores = Some(vec![AttributeScore { name: ScoreName::Speed, value: 90 }]);
        item.localized_texts = Some(vec![LocalizedText {
            language: "en".into(),
            text: "Mouse".into(),
        }]);
        assert!(item.validate().is_empty());
    }

    #[test]
    fn invalid_fields_are_each_reported() {
        let mut item = CatalogItem::new(0, 0, " ").with_tags(["Fire Type"]);
        item.display_number = 0;
        item.size1 = Some(-1.0);
        item.attribute_scores = Some(vec![
            AttributeScore { name: ScoreName::Hp, value: 0 },
            AttributeScore { name: ScoreName::Hp, value: 10 },
        ]);
        item.localized_texts = Some(vec![LocalizedText {
            language: "english".into(),
            text: "x".repeat(MAX_TEXT_LEN + 1),
        }]);

        let errors = item.validate();
        for expected in [
            "externalId must be positive.",
            "displayNumber must be positive.",
            "name is required.",
            "categoryGroup must be positive.",
            "size1 must be a non-negative number.",
            "tag 'Fire Type' must be lowercase kebab-case.",
            "attributeScores[0].value must be between 1 and 255.",
            "attributeScores[1].name 'hp' appears more than once.",
            "localizedTexts[0].language must be 2 to 5 characters.",
            "localizedTexts[0].text too long (300 max).",
        ] {
            assert!(errors.iter().any(|e| e == expected), "missing {expected}: {errors:?}");
        }
        assert_eq!(
            CatalogItem::new(1, 1, "A").validate(),
            vec!["at least one tag is required.".to_string()]
        );
    }

    #[test]
    fn lookup_snapshot_resolves_natural_keys() {
        let snapshot = LookupSnapshot::new(
            &[CategoryGroup { id: 10, number: 1, name: "generation i".into() }],
            &[Tag { id: 7, name: "fire".into() }],
        );
        assert_eq!(snapshot.category_id(1), Some(10));
        assert_eq!(snapshot.category_id(99), None);
        assert_eq!(snapshot.tag_id("fire"), Some(7));
        assert!(snapshot.has_tags());
        assert!(snapshot.has_category_groups());
        assert!(!LookupSnapshot::default().has_tags());
    }
}
