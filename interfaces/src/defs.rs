use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

// Feed side: a feed is an independently addressed board whose posts form a
// backward-linked chain, newest first.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedSource {
    pub address: String,
}

#[derive(Clone, Debug)]
pub struct FeedPointer {
    pub address: String,
    pub last_post_id: Option<String>,
}

/// The part of a post needed to keep walking the chain.
#[derive(Clone, Debug)]
pub struct PostLink {
    pub id: String,
    pub previous_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PostRecord {
    pub id: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub feed_address: String,
    pub author: String,
    pub previous_id: Option<String>,
}

impl PostRecord {
    pub fn to_link(&self) -> PostLink {
        PostLink {
            id: self.id.clone(),
            previous_id: self.previous_id.clone(),
        }
    }
}

#[async_trait]
pub trait FeedDirectory: Send + Sync {
    async fn list_sources(&self) -> Result<Vec<FeedSource>>;
}

#[async_trait]
pub trait FeedNetwork: Send + Sync {
    async fn fetch_feed(&self, address: &str) -> Result<FeedPointer>;
    async fn fetch_post(&self, id: &str) -> Result<PostRecord>;

    async fn fetch_post_link(&self, id: &str) -> Result<PostLink> {
        Ok(self.fetch_post(id).await?.to_link())
    }
}

// Messaging side.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Button {
    Url { label: String, url: String },
    Callback { label: String, data: String },
}

impl Button {
    pub fn url(label: &str, url: impl Into<String>) -> Self {
        Button::Url {
            label: label.to_owned(),
            url: url.into(),
        }
    }

    pub fn callback(label: &str, data: &str) -> Self {
        Button::Callback {
            label: label.to_owned(),
            data: data.to_owned(),
        }
    }
}

pub type ButtonRow = Vec<Button>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: String,
    pub message_id: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeImage {
    pub data: Vec<u8>,
    pub mime_type: String,
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Media is a URL the platform fetches itself; the caption is HTML.
    async fn send_photo(&self, chat_id: &str, media: &str, caption: &str, buttons: &[ButtonRow]) -> Result<SentMessage>;
    async fn send_text(&self, chat_id: &str, text: &str, buttons: &[ButtonRow]) -> Result<SentMessage>;
    async fn send_image(&self, chat_id: &str, image: &ChallengeImage, caption: &str) -> Result<SentMessage>;
}

// Session side. Values are opaque serialized documents.

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Returns whether a value was present.
    async fn delete(&self, key: &str) -> Result<bool>;
}

// Publishing side.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishKind {
    Vote,
    Comment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    pub fn value(self) -> i8 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishRequest {
    Vote {
        feed_address: String,
        target_id: String,
        direction: VoteDirection,
    },
    Comment {
        feed_address: String,
        parent_id: String,
        content: String,
    },
}

impl PublishRequest {
    pub fn kind(&self) -> PublishKind {
        match self {
            PublishRequest::Vote { .. } => PublishKind::Vote,
            PublishRequest::Comment { .. } => PublishKind::Comment,
        }
    }

    pub fn feed_address(&self) -> &str {
        match self {
            PublishRequest::Vote { feed_address, .. } => feed_address,
            PublishRequest::Comment { feed_address, .. } => feed_address,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SignerInfo {
    pub address: String,
    pub public_key: String,
    pub short_address: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeVerification {
    pub challenge_success: bool,
    pub reasons: Vec<String>,
    pub published_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    Challenge(ChallengeImage),
    ChallengeVerification(ChallengeVerification),
    Error(String),
}

// Object style note:
// A publish handle is driven from one place only. Its events are handed out
// once as a channel; whoever owns the handle turns them into state changes.
// Dropping the sender side (remove_listeners) ends that channel, so calling
// it more than once must be harmless.

#[async_trait]
pub trait PublishHandle: Send {
    /// Returns the event stream the first time, `None` afterwards.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;
    async fn publish(&mut self) -> Result<()>;
    async fn publish_challenge_answers(&mut self, answers: Vec<String>) -> Result<()>;
    fn remove_listeners(&mut self);
    async fn stop(&mut self) -> Result<()>;
}

#[async_trait]
pub trait PublishEngine: Send + Sync {
    async fn load_signer(&self, private_key: &str) -> Result<SignerInfo>;
    async fn create_publication(&self, private_key: &str, request: &PublishRequest) -> Result<Box<dyn PublishHandle>>;
}
