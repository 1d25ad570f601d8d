use crate::error::{Error, Result};
use async_trait::async_trait;
use url::Url;

/// Turns a chapter's source reference into its ordered page URLs
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Resolve the page list of a chapter
    async fn resolve_pages(&self, source_url: &str) -> Result<Vec<String>>;
}

/// Page source for endpoints that serve the page list as JSON
///
/// Accepts either a bare array of URLs or an object with a `pages` array.
/// Relative entries are resolved against the source URL.
pub struct JsonPageSource {
    client: reqwest::Client,
}

impl JsonPageSource {
    /// Create a page source sharing the given client
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageSource for JsonPageSource {
    async fn resolve_pages(&self, source_url: &str) -> Result<Vec<String>> {
        let base = Url::parse(source_url)?;

        let response = self.client.get(base.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: source_url.to_string(),
            });
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_decode() {
                Error::InvalidSource(format!("page list at {} is not JSON: {}", source_url, e))
            } else {
                Error::Network(e)
            }
        })?;

        parse_page_list(&base, &body)
    }
}

fn parse_page_list(base: &Url, body: &serde_json::Value) -> Result<Vec<String>> {
    let entries = body
        .as_array()
        .or_else(|| body.get("pages").and_then(|p| p.as_array()))
        .ok_or_else(|| {
            Error::InvalidSource(format!("page list at {} has no pages array", base))
        })?;

    entries
        .iter()
        .map(|entry| {
            let raw = entry.as_str().ok_or_else(|| {
                Error::InvalidSource(format!("page entry {} is not a string", entry))
            })?;
            Ok(base.join(raw)?.to_string())
        })
        .collect()
}
