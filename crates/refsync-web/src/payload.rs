//! Request bodies for the upsert endpoints and their validation.

use refsync_core::{AttributeScore, CatalogItem, LocalizedText, NewCategoryGroup, ScoreName};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct TagPayload {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryGroupPayload {
    #[serde(default)]
    pub number: i32,
    #[serde(default)]
    pub name: String,
}

impl From<CategoryGroupPayload> for NewCategoryGroup {
    fn from(payload: CategoryGroupPayload) -> Self {
        Self {
            number: payload.number,
            name: payload.name,
        }
    }
}

/// Score as sent on the wire. Name and value are checked before they are
/// narrowed to [`ScoreName`] and `u8`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScorePayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItemPayload {
    #[serde(default)]
    pub external_id: i64,
    #[serde(default)]
    pub display_number: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
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
    pub attribute_scores: Option<Vec<ScorePayload>>,
    #[serde(default)]
    pub localized_texts: Option<Vec<LocalizedText>>,
}

fn allowed_score_names() -> String {
    ScoreName::ALL
        .iter()
        .map(ScoreName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl CatalogItemPayload {
    /// Normalizes tags, then returns the item or every field problem found.
    pub fn into_item(self) -> Result<CatalogItem, Vec<String>> {
        let mut errors = Vec::new();

        let scores = self.attribute_scores.map(|raw| {
            let mut scores = Vec::with_capacity(raw.len());
            for (i, score) in raw.iter().enumerate() {
                let name = score.name.parse::<ScoreName>();
                if name.is_err() {
                    errors.push(format!(
                        "attributeScores[{i}].name must be one of: {}.",
                        allowed_score_names()
                    ));
                }
                let value = u8::try_from(score.value).ok().filter(|v| *v > 0);
                if value.is_none() {
                    errors.push(format!(
                        "attributeScores[{i}].value must be between 1 and 255."
                    ));
                }
                if let (Ok(name), Some(value)) = (name, value) {
                    scores.push(AttributeScore { name, value });
                }
            }
            scores
        });
        // Indices in the item's own checks only line up when nothing was dropped.
        let scores = if errors.is_empty() { scores } else { None };

        let item = CatalogItem {
            external_id: self.external_id,
            display_number: self.display_number,
            name: self.name,
            category_group: self.category_group,
            image_ref: self.image_ref,
            size1: self.size1,
            size2: self.size2,
            tags: self.tags,
            attribute_scores: scores,
            localized_texts: self.localized_texts,
        }
        .normalized();

        errors.extend(item.validate());
        if errors.is_empty() {
            Ok(item)
        } else {
            Err(errors)
        }
    }
}

/// Converts a whole batch, prefixing each problem with the item's position.
pub fn into_items(payloads: Vec<CatalogItemPayload>) -> Result<Vec<CatalogItem>, Vec<String>> {
    let mut items = Vec::with_capacity(payloads.len());
    let mut errors = Vec::new();
    for (i, payload) in payloads.into_iter().enumerate() {
        let external_id = payload.external_id;
        match payload.into_item() {
            Ok(item) => items.push(item),
            Err(problems) => errors.extend(
                problems
                    .into_iter()
                    .map(|p| format!("items[{i}] (externalId={external_id}): {p}")),
            ),
        }
    }
    if errors.is_empty() {
        Ok(items)
    } else {
        Err(errors)
    }
}
