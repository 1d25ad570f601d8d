use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A chapter known for a title, with its resolved source reference
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRef {
    /// Unit (chapter) key
    pub unit_key: String,
    /// Resolved source reference
    pub source_url: String,
    /// Human-readable name
    #[serde(default)]
    pub display_name: String,
}

impl ChapterRef {
    /// Create a chapter reference
    pub fn new(
        unit_key: impl Into<String>,
        source_url: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            unit_key: unit_key.into(),
            source_url: source_url.into(),
            display_name: display_name.into(),
        }
    }
}

/// Lookup of the chapters known for a title
///
/// Hosts back this with whatever produced the chapter metadata.
#[async_trait]
pub trait ChapterCatalog: Send + Sync {
    /// Every known chapter of a title, in reading order
    async fn chapters(&self, owner_id: &str) -> Result<Vec<ChapterRef>>;

    /// One chapter of a title
    async fn chapter(&self, owner_id: &str, unit_key: &str) -> Result<Option<ChapterRef>> {
        Ok(self
            .chapters(owner_id)
            .await?
            .into_iter()
            .find(|c| c.unit_key == unit_key))
    }
}

/// Catalog over a fixed in-memory map
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    titles: HashMap<String, Vec<ChapterRef>>,
}

impl StaticCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the chapters of a title
    pub fn with_title(mut self, owner_id: impl Into<String>, chapters: Vec<ChapterRef>) -> Self {
        self.titles.insert(owner_id.into(), chapters);
        self
    }
}

#[async_trait]
impl ChapterCatalog for StaticCatalog {
    async fn chapters(&self, owner_id: &str) -> Result<Vec<ChapterRef>> {
        Ok(self.titles.get(owner_id).cloned().unwrap_or_default())
    }
}
