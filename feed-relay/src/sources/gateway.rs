use crate::fetcher::Fetcher;
use crate::types::{FeedNetwork, FeedPointer, PostLink, PostRecord, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

const PEER_ID_PREFIX: &str = "12D3KooW";
const SHORT_ADDRESS_LEN: usize = 12;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedDocument {
    address: Option<String>,
    last_post_cid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostDocument {
    title: Option<String>,
    content: Option<String>,
    link: Option<String>,
    subplebbit_address: String,
    previous_cid: Option<String>,
    #[serde(default)]
    author: AuthorDocument,
}

#[derive(Debug, Default, Deserialize)]
struct AuthorDocument {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkDocument {
    previous_cid: Option<String>,
}

/// Reads feeds and posts through an HTTP content gateway
/// (`/ipns/<feed address>` and `/ipfs/<post id>`).
pub struct GatewayNetwork {
    fetcher: Fetcher,
    base: String,
}

impl GatewayNetwork {
    pub fn new(fetcher: Fetcher, gateway_url: &str) -> Result<Self> {
        let parsed = Url::parse(gateway_url)?;
        Ok(Self {
            fetcher,
            base: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn feed_url(&self, address: &str) -> String {
        format!("{}/ipns/{}", self.base, address)
    }

    fn post_url(&self, id: &str) -> String {
        format!("{}/ipfs/{}", self.base, id)
    }
}

/// Names (anything with a dot) are shown as-is; key-derived addresses are shortened.
pub fn author_display(address: &str) -> String {
    if address.contains('.') {
        return address.to_string();
    }
    address
        .strip_prefix(PEER_ID_PREFIX)
        .unwrap_or(address)
        .chars()
        .take(SHORT_ADDRESS_LEN)
        .collect()
}

fn post_from_document(id: &str, document: PostDocument) -> PostRecord {
    PostRecord {
        id: id.to_string(),
        title: document.title.unwrap_or_default(),
        body: document.content.unwrap_or_default(),
        link: document.link.filter(|link| !link.trim().is_empty()),
        feed_address: document.subplebbit_address,
        author: author_display(&document.author.address),
        previous_id: document.previous_cid,
    }
}

#[async_trait]
impl FeedNetwork for GatewayNetwork {
    async fn fetch_feed(&self, address: &str) -> anyhow::Result<FeedPointer> {
        let document: FeedDocument = self.fetcher.fetch_json(&self.feed_url(address)).await?;
        debug!(address = %address, last_post = ?document.last_post_cid, "Resolved feed pointer");
        Ok(FeedPointer {
            address: document.address.unwrap_or_else(|| address.to_string()),
            last_post_id: document.last_post_cid,
        })
    }

    async fn fetch_post(&self, id: &str) -> anyhow::Result<PostRecord> {
        let document: PostDocument = self.fetcher.fetch_json(&self.post_url(id)).await?;
        Ok(post_from_document(id, document))
    }

    async fn fetch_post_link(&self, id: &str) -> anyhow::Result<PostLink> {
        let document: LinkDocument = self.fetcher.fetch_json(&self.post_url(id)).await?;
        Ok(PostLink {
            id: id.to_string(),
            previous_id: document.previous_cid,
        })
    }
}
