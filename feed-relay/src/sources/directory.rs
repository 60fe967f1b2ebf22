use crate::fetcher::Fetcher;
use crate::types::{FeedDirectory, FeedSource, RelayError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::info;
use url::Url;

pub const DEFAULT_DIRECTORY_URL: &str =
    "https://raw.githubusercontent.com/plebbit/temporary-default-subplebbits/master/multisub.json";

#[derive(Debug, Deserialize)]
struct DirectoryDocument {
    #[serde(default)]
    subplebbits: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    #[serde(default)]
    address: String,
}

/// Feed list published as a JSON document over HTTP.
pub struct HttpDirectory {
    fetcher: Fetcher,
    url: String,
}

impl HttpDirectory {
    pub fn new(fetcher: Fetcher, url: &str) -> Result<Self> {
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RelayError::General(format!("Unsupported directory URL: {}", url)));
        }
        Ok(Self {
            fetcher,
            url: url.to_string(),
        })
    }
}

/// Keeps the first occurrence of every non-empty address.
fn sources_from_document(document: DirectoryDocument) -> Vec<FeedSource> {
    let mut seen = HashSet::new();
    document
        .subplebbits
        .into_iter()
        .map(|entry| entry.address.trim().to_string())
        .filter(|address| !address.is_empty() && seen.insert(address.clone()))
        .map(|address| FeedSource { address })
        .collect()
}

#[async_trait]
impl FeedDirectory for HttpDirectory {
    async fn list_sources(&self) -> anyhow::Result<Vec<FeedSource>> {
        let document: DirectoryDocument = self.fetcher.fetch_json(&self.url).await?;
        let sources = sources_from_document(document);
        info!("Directory lists {} feeds", sources.len());
        Ok(sources)
    }
}
