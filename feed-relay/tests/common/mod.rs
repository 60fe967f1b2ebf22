#![allow(dead_code)]

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use feed_relay::{
    ChallengeImage, ChallengeVerification, EngineEvent, FeedDirectory, FeedNetwork, FeedPointer, FeedSource,
    Messenger, PostLink, PostRecord, PublishEngine, PublishHandle, PublishRequest, SentMessage, SignerInfo,
};
use interfaces::defs::ButtonRow;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn post(feed: &str, id: &str, previous: Option<&str>) -> PostRecord {
    PostRecord {
        id: id.to_string(),
        title: format!("Post {}", id),
        body: format!("Body of {}", id),
        link: None,
        feed_address: feed.to_string(),
        author: "alice.eth".to_string(),
        previous_id: previous.map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// Feed side

#[derive(Default)]
pub struct MockNetwork {
    heads: Mutex<HashMap<String, Option<String>>>,
    posts: Mutex<HashMap<String, PostRecord>>,
    slow_feeds: HashMap<String, Duration>,
    slow_posts: HashMap<String, Duration>,
    failing_feeds: HashSet<String>,
    pub feed_fetches: AtomicUsize,
    pub post_fetches: AtomicUsize,
    pub link_fetches: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ids` newest first; each post links to the next one.
    pub fn with_chain(self, feed: &str, ids: &[&str]) -> Self {
        {
            let mut posts = self.posts.lock().unwrap();
            for (i, id) in ids.iter().enumerate() {
                posts.insert(id.to_string(), post(feed, id, ids.get(i + 1).copied()));
            }
        }
        self.heads
            .lock()
            .unwrap()
            .insert(feed.to_string(), ids.first().map(|id| id.to_string()));
        self
    }

    pub fn with_post(self, record: PostRecord) -> Self {
        self.posts.lock().unwrap().insert(record.id.clone(), record);
        self
    }

    pub fn with_slow_feed(mut self, feed: &str, delay: Duration) -> Self {
        self.slow_feeds.insert(feed.to_string(), delay);
        self
    }

    pub fn with_slow_post(mut self, id: &str, delay: Duration) -> Self {
        self.slow_posts.insert(id.to_string(), delay);
        self
    }

    pub fn with_failing_feed(mut self, feed: &str) -> Self {
        self.failing_feeds.insert(feed.to_string());
        self
    }

    /// Publish a new newest post on `feed`.
    pub fn push_post(&self, feed: &str, id: &str) {
        let mut heads = self.heads.lock().unwrap();
        let previous = heads.get(feed).cloned().flatten();
        self.posts
            .lock()
            .unwrap()
            .insert(id.to_string(), post(feed, id, previous.as_deref()));
        heads.insert(feed.to_string(), Some(id.to_string()));
    }
}

#[async_trait]
impl FeedNetwork for MockNetwork {
    async fn fetch_feed(&self, address: &str) -> anyhow::Result<FeedPointer> {
        self.feed_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.slow_feeds.get(address) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_feeds.contains(address) {
            bail!("feed {} unreachable", address);
        }
        let head = self
            .heads
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| anyhow!("unknown feed {}", address))?;
        Ok(FeedPointer {
            address: address.to_string(),
            last_post_id: head,
        })
    }

    async fn fetch_post(&self, id: &str) -> anyhow::Result<PostRecord> {
        self.post_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.slow_posts.get(id) {
            tokio::time::sleep(*delay).await;
        }
        // Let concurrent crawls interleave between check and mark
        tokio::task::yield_now().await;
        self.posts
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown post {}", id))
    }

    async fn fetch_post_link(&self, id: &str) -> anyhow::Result<PostLink> {
        self.link_fetches.fetch_add(1, Ordering::SeqCst);
        self.posts
            .lock()
            .unwrap()
            .get(id)
            .map(|p| p.to_link())
            .ok_or_else(|| anyhow!("unknown post {}", id))
    }
}

pub struct MockDirectory {
    addresses: Vec<String>,
    fail: bool,
}

impl MockDirectory {
    pub fn new(addresses: &[&str]) -> Self {
        Self {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            addresses: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl FeedDirectory for MockDirectory {
    async fn list_sources(&self) -> anyhow::Result<Vec<FeedSource>> {
        if self.fail {
            bail!("directory unreachable");
        }
        Ok(self
            .addresses
            .iter()
            .map(|address| FeedSource {
                address: address.clone(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Messaging side

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Photo { chat: String, media: String, caption: String },
    Text { chat: String, text: String },
    Image { chat: String, data: Vec<u8> },
}

#[derive(Default)]
pub struct MockMessenger {
    calls: Mutex<Vec<Sent>>,
    next_id: AtomicI64,
    pub fail_photo: AtomicBool,
    pub fail_text: AtomicBool,
}

impl MockMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Sent> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls addressed to `chat`, in order.
    pub fn calls_to(&self, chat: &str) -> Vec<Sent> {
        self.calls()
            .into_iter()
            .filter(|call| match call {
                Sent::Photo { chat: c, .. } | Sent::Text { chat: c, .. } | Sent::Image { chat: c, .. } => c == chat,
            })
            .collect()
    }

    pub fn texts_to(&self, chat: &str) -> Vec<String> {
        self.calls_to(chat)
            .into_iter()
            .filter_map(|call| match call {
                Sent::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// First byte of every challenge image sent to `chat`.
    pub fn images_to(&self, chat: &str) -> Vec<u8> {
        self.calls_to(chat)
            .into_iter()
            .filter_map(|call| match call {
                Sent::Image { data, .. } => data.first().copied(),
                _ => None,
            })
            .collect()
    }

    fn record(&self, chat: &str, call: Sent) -> SentMessage {
        self.calls.lock().unwrap().push(call);
        SentMessage {
            chat_id: chat.to_string(),
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send_photo(
        &self,
        chat_id: &str,
        media: &str,
        caption: &str,
        _buttons: &[ButtonRow],
    ) -> anyhow::Result<SentMessage> {
        let call = Sent::Photo {
            chat: chat_id.to_string(),
            media: media.to_string(),
            caption: caption.to_string(),
        };
        if self.fail_photo.load(Ordering::SeqCst) {
            self.calls.lock().unwrap().push(call);
            bail!("wrong file identifier");
        }
        Ok(self.record(chat_id, call))
    }

    async fn send_text(&self, chat_id: &str, text: &str, _buttons: &[ButtonRow]) -> anyhow::Result<SentMessage> {
        let call = Sent::Text {
            chat: chat_id.to_string(),
            text: text.to_string(),
        };
        if self.fail_text.load(Ordering::SeqCst) {
            self.calls.lock().unwrap().push(call);
            bail!("chat not found");
        }
        Ok(self.record(chat_id, call))
    }

    async fn send_image(&self, chat_id: &str, image: &ChallengeImage, _caption: &str) -> anyhow::Result<SentMessage> {
        let call = Sent::Image {
            chat: chat_id.to_string(),
            data: image.data.clone(),
        };
        Ok(self.record(chat_id, call))
    }
}

// ---------------------------------------------------------------------------
// Publishing side

/// Test-side view of one publication handed out by [`MockEngine`].
pub struct HandleProbe {
    pub request: PublishRequest,
    sender: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    pub published: AtomicBool,
    pub answers: Mutex<Vec<String>>,
    pub stops: AtomicUsize,
    pub listener_removals: AtomicUsize,
}

impl HandleProbe {
    /// Returns false once the listeners were removed.
    pub fn emit(&self, event: EngineEvent) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    pub fn challenge(&self, tag: u8) -> bool {
        self.emit(EngineEvent::Challenge(image(tag)))
    }

    pub fn verify(&self, success: bool) -> bool {
        self.emit(EngineEvent::ChallengeVerification(ChallengeVerification {
            challenge_success: success,
            reasons: if success { Vec::new() } else { vec!["wrong answer".to_string()] },
            published_id: success.then(|| "QmPublished".to_string()),
        }))
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn removals(&self) -> usize {
        self.listener_removals.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> Vec<String> {
        self.answers.lock().unwrap().clone()
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }
}

pub fn image(tag: u8) -> ChallengeImage {
    ChallengeImage {
        data: vec![tag, 0x89, 0x50],
        mime_type: "image/png".to_string(),
    }
}

struct MockHandle {
    probe: Arc<HandleProbe>,
    events: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    fail_publish: Arc<AtomicBool>,
    reject_answers: Arc<AtomicBool>,
}

#[async_trait]
impl PublishHandle for MockHandle {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events.take()
    }

    async fn publish(&mut self) -> anyhow::Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            bail!("no peers");
        }
        self.probe.published.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish_challenge_answers(&mut self, answers: Vec<String>) -> anyhow::Result<()> {
        if self.reject_answers.load(Ordering::SeqCst) {
            bail!("publication is no longer accepted");
        }
        self.probe.answers.lock().unwrap().extend(answers);
        Ok(())
    }

    fn remove_listeners(&mut self) {
        self.probe.listener_removals.fetch_add(1, Ordering::SeqCst);
        self.probe.sender.lock().unwrap().take();
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockEngine {
    handles: Mutex<Vec<Arc<HandleProbe>>>,
    pub fail_publish: Arc<AtomicBool>,
    pub reject_answers: Arc<AtomicBool>,
}

pub const BAD_KEY: &str = "bad-key";

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, index: usize) -> Arc<HandleProbe> {
        self.handles.lock().unwrap()[index].clone()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

#[async_trait]
impl PublishEngine for MockEngine {
    async fn load_signer(&self, private_key: &str) -> anyhow::Result<SignerInfo> {
        if private_key == BAD_KEY {
            bail!("invalid ed25519 key");
        }
        Ok(SignerInfo {
            address: format!("12D3KooW{}", private_key),
            public_key: format!("pub-{}", private_key),
            short_address: private_key.chars().take(12).collect(),
        })
    }

    async fn create_publication(
        &self,
        _private_key: &str,
        request: &PublishRequest,
    ) -> anyhow::Result<Box<dyn PublishHandle>> {
        let (sender, events) = mpsc::unbounded_channel();
        let probe = Arc::new(HandleProbe {
            request: request.clone(),
            sender: Mutex::new(Some(sender)),
            published: AtomicBool::new(false),
            answers: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            listener_removals: AtomicUsize::new(0),
        });
        self.handles.lock().unwrap().push(probe.clone());
        Ok(Box::new(MockHandle {
            probe,
            events: Some(events),
            fail_publish: self.fail_publish.clone(),
            reject_answers: self.reject_answers.clone(),
        }))
    }
}
