use std::path::PathBuf;
use std::time::Duration;

use interfaces::defs::ButtonRow;

// Boundary types live in the interfaces crate
pub use interfaces::defs::{
    Button, ChallengeImage, ChallengeVerification, EngineEvent, FeedDirectory, FeedNetwork,
    FeedPointer, FeedSource, KeyValueStore, Messenger, PostLink, PostRecord, PublishEngine,
    PublishHandle, PublishKind, PublishRequest, SentMessage, SignerInfo, VoteDirection,
};

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub max_redirects: usize,
    pub max_body_mb: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Feed-Relay/1.0".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_seconds: 2,
            max_redirects: 5,
            max_body_mb: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Pause between the end of one cycle and the start of the next
    pub cycle_interval: Duration,
    /// Bound on resolving a feed's newest-post pointer
    pub pointer_timeout: Duration,
    /// Bound on the whole backward walk of one feed
    pub crawl_timeout: Duration,
    /// Items visited per feed per cycle, seen or not
    pub crawl_limit: usize,
    pub history_path: PathBuf,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(60),
            pointer_timeout: Duration::from_secs(5 * 60),
            crawl_timeout: Duration::from_secs(6 * 60),
            crawl_limit: 20,
            history_path: PathBuf::from("history.json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub chat_id: String,
    /// Wait after every send, successful or not
    pub send_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            chat_id: String::new(),
            send_interval: Duration::from_secs(6),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    /// Total publish attempts for a comment whose challenge failed
    pub max_comment_attempts: u32,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            max_comment_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub seedit_base: String,
    pub plebchan_base: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            seedit_base: "https://seedit.eth.limo".to_string(),
            plebchan_base: "https://plebchan.eth.limo".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub fetch: FetchConfig,
    pub poller: PollerConfig,
    pub delivery: DeliveryConfig,
    pub challenge: ChallengeConfig,
    pub links: LinkConfig,
}

/// Where a delivered message came from, kept so callbacks on it can find their target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostOrigin {
    pub post_id: String,
    pub feed_address: String,
}

#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub chat_id: String,
    pub text: String,
    pub media: Option<String>,
    pub buttons: Vec<ButtonRow>,
    pub origin: Option<PostOrigin>,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to fetch {target}: {source}")]
    Fetch {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Timed out after {limit:?} while {stage}")]
    Timeout { stage: String, limit: Duration },

    #[error("Dedup snapshot {path}: {message}")]
    Persistence { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("User {user_id} is not registered")]
    NotRegistered { user_id: String },

    #[error("No message {message_id} known in chat {chat_id}")]
    UnknownMessage { chat_id: String, message_id: i64 },

    #[error("No pending challenge for user {user_id}")]
    NoPendingChallenge { user_id: String },

    #[error("An answer was already submitted for user {user_id}")]
    AnswerAlreadySubmitted { user_id: String },

    #[error("Delivery queue is closed")]
    QueueClosed,

    #[error("General error: {0}")]
    General(String),
}

impl RelayError {
    pub fn fetch(target: &str, source: impl Into<anyhow::Error>) -> Self {
        RelayError::Fetch {
            target: target.to_string(),
            source: source.into(),
        }
    }

    pub fn timeout(stage: &str, limit: Duration) -> Self {
        RelayError::Timeout {
            stage: stage.to_string(),
            limit,
        }
    }

    pub fn engine(err: impl std::fmt::Display) -> Self {
        RelayError::Engine(err.to_string())
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        RelayError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
