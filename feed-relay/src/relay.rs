use crate::actions::ActionService;
use crate::challenge::ChallengeQueue;
use crate::dedup::DedupStore;
use crate::delivery::DeliveryQueue;
use crate::poller::{CycleReport, FeedPoller};
use crate::session::{MessageIndex, UserRegistry};
use crate::types::{FeedDirectory, FeedNetwork, KeyValueStore, Messenger, PublishEngine, RelayConfig, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Collaborators the relay is built from.
#[derive(Clone)]
pub struct RelayContext {
    pub network: Arc<dyn FeedNetwork>,
    pub directory: Arc<dyn FeedDirectory>,
    pub messenger: Arc<dyn Messenger>,
    pub store: Arc<dyn KeyValueStore>,
}

/// Feed side of the bot: polls every listed feed and posts new items to the
/// configured chat.
pub struct FeedRelay {
    poller: FeedPoller,
    delivery: DeliveryQueue,
    dedup: Arc<DedupStore>,
    messages: MessageIndex,
    context: RelayContext,
    config: RelayConfig,
}

impl FeedRelay {
    /// Starts the delivery worker, so this must run inside a tokio runtime.
    pub fn new(context: RelayContext, config: RelayConfig) -> Self {
        let dedup = Arc::new(DedupStore::new(config.poller.history_path.clone()));
        let messages = MessageIndex::new(context.store.clone());
        let delivery = DeliveryQueue::start(context.messenger.clone(), messages.clone(), config.delivery.clone());

        let poller = FeedPoller::new(
            context.network.clone(),
            context.directory.clone(),
            dedup.clone(),
            delivery.handle(),
            config.poller.clone(),
            config.links.clone(),
            config.delivery.chat_id.clone(),
        );

        info!(
            "Relay ready: chat {}, history {}",
            config.delivery.chat_id,
            config.poller.history_path.display()
        );

        Self {
            poller,
            delivery,
            dedup,
            messages,
            context,
            config,
        }
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.poller.run(shutdown).await
    }

    pub async fn run_once(&self) -> Result<CycleReport> {
        self.poller.run_cycle().await
    }

    pub fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    pub fn messages(&self) -> &MessageIndex {
        &self.messages
    }

    /// Interactive side sharing this relay's store and messenger.
    pub fn action_service(&self, engine: Arc<dyn PublishEngine>) -> ActionService {
        let users = UserRegistry::new(self.context.store.clone(), engine.clone());
        let queue = ChallengeQueue::new(self.context.messenger.clone(), engine, self.config.challenge.clone());
        ActionService::new(users, self.messages.clone(), queue)
    }

    /// Wait for everything already queued to be sent.
    pub async fn close(self) {
        let FeedRelay { poller, delivery, .. } = self;
        // The poller holds a producer handle; the worker only drains once it is gone
        drop(poller);
        delivery.close().await;
        info!("Relay closed");
    }
}
