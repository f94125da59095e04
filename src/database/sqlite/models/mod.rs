
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of `index_entries`. Labels are a JSON array, the vector is
/// little-endian `f32` bytes.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct StoredEntry {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub labels: String,
    pub normalized_text: String,
    pub content_hash: String,
    pub vector: Vec<u8>,
    pub indexed_at: DateTime<Utc>,
}

/// Identity of the model the stored vectors came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIndexMeta {
    pub model_id: String,
    pub model_version: Option<String>,
    pub dimension: usize,
    pub created_at: Option<DateTime<Utc>>,
}

impl StoredIndexMeta {
    pub const MODEL_ID_KEY: &'static str = "model_id";
    pub const MODEL_VERSION_KEY: &'static str = "model_version";
    pub const DIMENSION_KEY: &'static str = "dimension";
    pub const CREATED_AT_KEY: &'static str = "created_at";

    /// Rebuild from key/value rows. `None` when the identity keys are absent,
    /// i.e. the index has never been written.
    #[inline]
    pub fn from_pairs<I>(pairs: I) -> Option<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut model_id = None;
        let mut model_version = None;
        let mut dimension = None;
        let mut created_at = None;

        for (key, value) in pairs {
            match key.as_str() {
                Self::MODEL_ID_KEY => model_id = Some(value),
                Self::MODEL_VERSION_KEY => model_version = Some(value),
                Self::DIMENSION_KEY => dimension = value.parse::<usize>().ok(),
                Self::CREATED_AT_KEY => {
                    created_at = DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc));
                }
                _ => {}
            }
        }

        Some(Self {
            model_id: model_id?,
            model_version: model_version.filter(|v| !v.is_empty()),
            dimension: dimension?,
            created_at,
        })
    }

    #[inline]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (Self::MODEL_ID_KEY, self.model_id.clone()),
            (
                Self::MODEL_VERSION_KEY,
                self.model_version.clone().unwrap_or_default(),
            ),
            (Self::DIMENSION_KEY, self.dimension.to_string()),
        ];
        if let Some(created_at) = self.created_at {
            pairs.push((Self::CREATED_AT_KEY, created_at.to_rfc3339()));
        }
        pairs
    }
}
