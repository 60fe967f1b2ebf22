use crate::session::MessageIndex;
use crate::types::{DeliveryConfig, DeliveryTask, Messenger, RelayError, Result, SentMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent(SentMessage),
    /// Media send failed, plain text went out instead
    SentFallback(SentMessage),
    Dropped,
}

impl DeliveryOutcome {
    pub fn message(&self) -> Option<&SentMessage> {
        match self {
            DeliveryOutcome::Sent(sent) | DeliveryOutcome::SentFallback(sent) => Some(sent),
            DeliveryOutcome::Dropped => None,
        }
    }
}

/// Cheap producer side of the queue, handed to every crawl.
#[derive(Clone)]
pub struct DeliveryHandle {
    sender: mpsc::UnboundedSender<DeliveryTask>,
}

impl DeliveryHandle {
    /// Never waits, so a caller can mark-and-enqueue without yielding in between.
    pub fn enqueue(&self, task: DeliveryTask) -> Result<()> {
        self.sender.send(task).map_err(|_| RelayError::QueueClosed)
    }
}

#[cfg(test)]
impl DeliveryHandle {
    /// A handle whose worker is already gone.
    pub(crate) fn closed() -> Self {
        let (sender, _) = mpsc::unbounded_channel();
        Self { sender }
    }
}

/// Single-lane sender shared by all feeds: tasks go out strictly one at a
/// time, in arrival order, with a fixed pause after each.
pub struct DeliveryQueue {
    handle: DeliveryHandle,
    worker: JoinHandle<()>,
}

impl DeliveryQueue {
    pub fn start(messenger: Arc<dyn Messenger>, messages: MessageIndex, config: DeliveryConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(receiver, messenger, messages, config));
        Self {
            handle: DeliveryHandle { sender },
            worker,
        }
    }

    pub fn handle(&self) -> DeliveryHandle {
        self.handle.clone()
    }

    pub fn enqueue(&self, task: DeliveryTask) -> Result<()> {
        self.handle.enqueue(task)
    }

    /// Stop accepting work and wait until everything already queued is sent.
    /// Handles cloned out earlier keep the queue open until they are dropped.
    pub async fn close(self) {
        let DeliveryQueue { handle, worker } = self;
        drop(handle);
        if let Err(e) = worker.await {
            error!("Delivery worker ended abnormally: {}", e);
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<DeliveryTask>,
    messenger: Arc<dyn Messenger>,
    messages: MessageIndex,
    config: DeliveryConfig,
) {
    info!("Delivery worker started (interval {:?})", config.send_interval);

    while let Some(task) = receiver.recv().await {
        let outcome = deliver(messenger.as_ref(), &task).await;

        if let (Some(sent), Some(origin)) = (outcome.message(), task.origin.as_ref()) {
            if let Err(e) = messages.record_delivery(sent, origin).await {
                warn!(post_id = %origin.post_id, "Failed to save message metadata: {}", e);
            }
        }

        tokio::time::sleep(config.send_interval).await;
    }

    info!("Delivery worker stopped");
}

/// Send one task. With media, a failed media send gets exactly one plain
/// text retry carrying the same caption and buttons; nothing is retried
/// beyond that.
pub async fn deliver(messenger: &dyn Messenger, task: &DeliveryTask) -> DeliveryOutcome {
    let Some(media) = task.media.as_deref() else {
        return match messenger.send_text(&task.chat_id, &task.text, &task.buttons).await {
            Ok(sent) => {
                debug!(chat_id = %task.chat_id, message_id = sent.message_id, "Sent text message");
                DeliveryOutcome::Sent(sent)
            }
            Err(e) => {
                error!(chat_id = %task.chat_id, "Text send failed, dropping task: {:#}", e);
                DeliveryOutcome::Dropped
            }
        };
    };

    match messenger.send_photo(&task.chat_id, media, &task.text, &task.buttons).await {
        Ok(sent) => {
            debug!(chat_id = %task.chat_id, message_id = sent.message_id, "Sent media message");
            return DeliveryOutcome::Sent(sent);
        }
        Err(e) => {
            warn!(chat_id = %task.chat_id, media = %media, "Media send failed, falling back to text: {:#}", e);
        }
    }

    match messenger.send_text(&task.chat_id, &task.text, &task.buttons).await {
        Ok(sent) => {
            info!(chat_id = %task.chat_id, message_id = sent.message_id, "Sent text fallback");
            DeliveryOutcome::SentFallback(sent)
        }
        Err(e) => {
            error!(chat_id = %task.chat_id, "Text fallback failed, dropping task: {:#}", e);
            DeliveryOutcome::Dropped
        }
    }
}
