//! Per-user queue of publish actions waiting on a challenge answer.
//!
//! A user has at most one challenge on screen: the head entry. Later
//! challenges wait dormant behind it and are shown only when the head is
//! resolved, cancelled or dropped on error. Actions that were published but
//! have not produced a challenge yet are tracked beside the queue so their
//! events still have somewhere to land.
//!
//! Engine events reach the queue through one forwarding task per action; each
//! event is applied under the user's lock, so enqueue, answer, resolve and
//! cancel never interleave for the same user.

use crate::publish::{ActionState, ActionUpdate, PublishAction};
use crate::types::{
    ChallengeConfig, ChallengeImage, EngineEvent, Messenger, PublishEngine, PublishKind, PublishRequest, RelayError,
    Result,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CHALLENGE_CAPTION: &str = "Reply with the answer to this challenge, or /cancel to skip it.";

struct PendingEntry {
    action: PublishAction,
    /// None only for a retried head whose new challenge has not arrived
    image: Option<ChallengeImage>,
}

#[derive(Default)]
struct UserQueue {
    entries: VecDeque<PendingEntry>,
    awaiting: Vec<PublishAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Awaiting(usize),
    Entry(usize),
}

impl UserQueue {
    fn find(&self, action_id: Uuid) -> Option<Slot> {
        if let Some(i) = self.entries.iter().position(|e| e.action.id() == action_id) {
            return Some(Slot::Entry(i));
        }
        self.awaiting
            .iter()
            .position(|a| a.id() == action_id)
            .map(Slot::Awaiting)
    }

    fn action_mut(&mut self, slot: Slot) -> Option<&mut PublishAction> {
        match slot {
            Slot::Awaiting(i) => self.awaiting.get_mut(i),
            Slot::Entry(i) => self.entries.get_mut(i).map(|e| &mut e.action),
        }
    }

    fn take(&mut self, slot: Slot) -> Option<PublishAction> {
        match slot {
            Slot::Awaiting(i) if i < self.awaiting.len() => Some(self.awaiting.remove(i)),
            Slot::Awaiting(_) => None,
            Slot::Entry(i) => self.entries.remove(i).map(|e| e.action),
        }
    }
}

struct QueueInner {
    users: RwLock<HashMap<String, Arc<Mutex<UserQueue>>>>,
    messenger: Arc<dyn Messenger>,
    engine: Arc<dyn PublishEngine>,
    config: ChallengeConfig,
}

/// Cheap to clone; all clones share the same per-user queues.
#[derive(Clone)]
pub struct ChallengeQueue {
    inner: Arc<QueueInner>,
}

fn kind_label(kind: PublishKind) -> &'static str {
    match kind {
        PublishKind::Vote => "Vote",
        PublishKind::Comment => "Comment",
    }
}

impl ChallengeQueue {
    pub fn new(messenger: Arc<dyn Messenger>, engine: Arc<dyn PublishEngine>, config: ChallengeConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                users: RwLock::new(HashMap::new()),
                messenger,
                engine,
                config,
            }),
        }
    }

    async fn user_queue(&self, user_id: &str) -> Arc<Mutex<UserQueue>> {
        if let Some(queue) = self.inner.users.read().await.get(user_id) {
            return queue.clone();
        }
        self.inner
            .users
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    async fn existing_queue(&self, user_id: &str) -> Option<Arc<Mutex<UserQueue>>> {
        self.inner.users.read().await.get(user_id).cloned()
    }

    /// Create and publish an action for `user_id`, then follow its events.
    /// The challenge, when the engine sends one, is queued automatically.
    pub async fn submit(&self, user_id: &str, private_key: &str, request: PublishRequest) -> Result<Uuid> {
        let (mut action, events) =
            PublishAction::create(self.inner.engine.as_ref(), user_id, private_key, request, 1).await?;
        let action_id = action.id();
        action.publish().await?;

        let queue = self.user_queue(user_id).await;
        queue.lock().await.awaiting.push(action);

        self.listen(user_id, action_id, events);
        Ok(action_id)
    }

    /// Forward an action's engine events into this queue until its listeners
    /// are removed.
    pub fn listen(&self, user_id: &str, action_id: Uuid, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        let queue = self.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                queue.handle_event(&user_id, action_id, event).await;
            }
            debug!(user_id = %user_id, action_id = %action_id, "Event stream closed");
        });
    }

    /// Queue an action whose challenge image is already known. The image is
    /// shown at once if the user has nothing pending, otherwise it waits.
    pub async fn enqueue(&self, action: PublishAction, image: ChallengeImage) {
        let user_id = action.user_id().to_string();
        let queue = self.user_queue(&user_id).await;
        let mut queue = queue.lock().await;
        self.push_entry(&mut queue, &user_id, action, image).await;
    }

    async fn push_entry(&self, queue: &mut UserQueue, user_id: &str, mut action: PublishAction, image: ChallengeImage) {
        action.challenge_presented();
        let becomes_active = queue.entries.is_empty();
        debug!(user_id = %user_id, action_id = %action.id(), active = becomes_active, "Challenge queued");
        queue.entries.push_back(PendingEntry {
            action,
            image: Some(image.clone()),
        });
        if becomes_active {
            self.present(user_id, &image).await;
        }
    }

    /// Hand the user's answer to the active challenge. An engine error drops
    /// the active entry and moves on to the next one.
    pub async fn submit_answer(&self, user_id: &str, answer: &str) -> Result<()> {
        let no_pending = || RelayError::NoPendingChallenge {
            user_id: user_id.to_string(),
        };
        let queue = self.existing_queue(user_id).await.ok_or_else(no_pending)?;
        let mut queue = queue.lock().await;

        let head = queue.entries.front_mut().ok_or_else(no_pending)?;
        if head.image.is_none() {
            return Err(no_pending());
        }
        if head.action.state() == ActionState::AnswerSubmitted {
            return Err(RelayError::AnswerAlreadySubmitted {
                user_id: user_id.to_string(),
            });
        }

        match head.action.submit_answer(answer).await {
            Ok(()) => {
                info!(user_id = %user_id, action_id = %head.action.id(), "Challenge answer forwarded");
                Ok(())
            }
            Err(e) => {
                let kind = head.action.kind();
                warn!(user_id = %user_id, "Answer rejected by engine: {}", e);
                self.notify(user_id, &format!("{} failed: {}", kind_label(kind), e)).await;
                self.drop_slot(&mut queue, user_id, Slot::Entry(0)).await;
                Err(e)
            }
        }
    }

    /// Tear down and remove the active entry, then show the next challenge.
    /// Returns false when nothing was pending.
    pub async fn resolve(&self, user_id: &str) -> bool {
        let Some(queue) = self.existing_queue(user_id).await else {
            return false;
        };
        let mut queue = queue.lock().await;
        if queue.entries.is_empty() {
            return false;
        }
        self.drop_slot(&mut queue, user_id, Slot::Entry(0)).await;
        true
    }

    /// Drop the active entry without waiting for its verification. With no
    /// challenge on screen, the oldest action still waiting for one is
    /// cancelled instead.
    pub async fn cancel(&self, user_id: &str) -> bool {
        let Some(queue) = self.existing_queue(user_id).await else {
            return false;
        };
        let mut queue = queue.lock().await;
        let slot = if !queue.entries.is_empty() {
            Slot::Entry(0)
        } else if !queue.awaiting.is_empty() {
            Slot::Awaiting(0)
        } else {
            return false;
        };
        info!(user_id = %user_id, "Cancelling pending action");
        self.drop_slot(&mut queue, user_id, slot).await;
        true
    }

    /// Challenges queued for the user, the active one included.
    pub async fn pending_count(&self, user_id: &str) -> usize {
        match self.existing_queue(user_id).await {
            Some(queue) => queue.lock().await.entries.len(),
            None => 0,
        }
    }

    /// Published actions with no challenge yet.
    pub async fn awaiting_count(&self, user_id: &str) -> usize {
        match self.existing_queue(user_id).await {
            Some(queue) => queue.lock().await.awaiting.len(),
            None => 0,
        }
    }

    pub async fn active_action(&self, user_id: &str) -> Option<Uuid> {
        let queue = self.existing_queue(user_id).await?;
        let queue = queue.lock().await;
        queue.entries.front().map(|e| e.action.id())
    }

    /// Tear down every tracked action of every user.
    pub async fn shutdown(&self) {
        let queues: Vec<_> = self.inner.users.write().await.drain().collect();
        for (user_id, queue) in queues {
            let mut queue = queue.lock().await;
            let mut torn_down = 0;
            while let Some(mut entry) = queue.entries.pop_front() {
                entry.action.teardown().await;
                torn_down += 1;
            }
            for mut action in queue.awaiting.drain(..) {
                action.teardown().await;
                torn_down += 1;
            }
            if torn_down > 0 {
                debug!(user_id = %user_id, "Tore down {} pending actions", torn_down);
            }
        }
        info!("Challenge queue shut down");
    }

    /// Users with at least one tracked action.
    pub async fn tracked_users(&self) -> usize {
        self.inner.users.read().await.len()
    }

    /// Apply one engine event to the action it belongs to.
    pub async fn handle_event(&self, user_id: &str, action_id: Uuid, event: EngineEvent) {
        let Some(queue) = self.existing_queue(user_id).await else {
            debug!(user_id = %user_id, action_id = %action_id, "Event for a user with nothing pending");
            return;
        };
        let mut queue = queue.lock().await;

        let Some(slot) = queue.find(action_id) else {
            debug!(user_id = %user_id, action_id = %action_id, "Event for an action no longer tracked");
            return;
        };
        let Some(action) = queue.action_mut(slot) else {
            return;
        };
        let kind = action.kind();
        let attempt = action.attempt();

        let update = action.on_event(event).await;

        match update {
            ActionUpdate::Ignored => {
                debug!(action_id = %action_id, "Event ignored in current state");
            }
            ActionUpdate::Challenge(image) => match slot {
                Slot::Awaiting(i) => {
                    let action = queue.awaiting.remove(i);
                    self.push_entry(&mut queue, user_id, action, image).await;
                }
                Slot::Entry(i) => {
                    if let Some(entry) = queue.entries.get_mut(i) {
                        entry.image = Some(image.clone());
                    }
                    if i == 0 {
                        self.present(user_id, &image).await;
                    }
                }
            },
            ActionUpdate::Verified { published_id } => {
                info!(user_id = %user_id, action_id = %action_id, published_id = ?published_id, "Publication verified");
                self.notify(user_id, &format!("{} published.", kind_label(kind))).await;
                self.drop_slot(&mut queue, user_id, slot).await;
            }
            ActionUpdate::Rejected { reasons } => {
                let reasons = if reasons.is_empty() {
                    "challenge failed".to_string()
                } else {
                    reasons.join(", ")
                };
                let max = self.inner.config.max_comment_attempts;

                if kind == PublishKind::Comment && attempt < max {
                    self.notify(
                        user_id,
                        &format!("Comment failed ({}), retrying ({}/{})", reasons, attempt + 1, max),
                    )
                    .await;
                    self.retry_comment(&mut queue, user_id, slot).await;
                } else {
                    warn!(user_id = %user_id, action_id = %action_id, attempt, "Publication rejected: {}", reasons);
                    self.notify(user_id, &format!("{} failed: {}", kind_label(kind), reasons)).await;
                    self.drop_slot(&mut queue, user_id, slot).await;
                }
            }
            ActionUpdate::Errored(message) => {
                self.notify(user_id, &format!("{} failed: {}", kind_label(kind), message)).await;
                self.drop_slot(&mut queue, user_id, slot).await;
            }
        }
    }

    /// Replace the rejected comment in `slot` by a fresh attempt. A head
    /// keeps its place with no image until the new challenge arrives.
    async fn retry_comment(&self, queue: &mut UserQueue, user_id: &str, slot: Slot) {
        let Some(old) = queue.action_mut(slot) else {
            return;
        };
        old.teardown().await;

        let retried = match old.recreate(self.inner.engine.as_ref()).await {
            Ok((mut next, events)) => match next.publish().await {
                Ok(()) => Ok((next, events)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match retried {
            Ok((next, events)) => {
                let next_id = next.id();
                info!(user_id = %user_id, action_id = %next_id, attempt = next.attempt(), "Comment resubmitted");
                match slot {
                    Slot::Awaiting(i) => queue.awaiting[i] = next,
                    Slot::Entry(i) => {
                        queue.entries[i] = PendingEntry {
                            action: next,
                            image: None,
                        }
                    }
                }
                self.listen(user_id, next_id, events);
            }
            Err(e) => {
                error!(user_id = %user_id, "Comment retry failed: {}", e);
                self.notify(user_id, &format!("Comment failed: {}", e)).await;
                self.drop_slot(queue, user_id, slot).await;
            }
        }
    }

    /// Remove and tear down the action in `slot`; when it was the active
    /// entry, show the next challenge.
    async fn drop_slot(&self, queue: &mut UserQueue, user_id: &str, slot: Slot) {
        if let Some(mut action) = queue.take(slot) {
            action.teardown().await;
        }
        if slot == Slot::Entry(0) {
            let next = queue.entries.front().and_then(|e| e.image.clone());
            if let Some(image) = next {
                debug!(user_id = %user_id, "Promoting next challenge");
                self.present(user_id, &image).await;
            }
        }
        self.forget_if_idle(user_id, queue).await;
    }

    /// Remove an empty user queue from the map. Callers hold one clone of the
    /// queue; any further clone means another call is about to use it.
    async fn forget_if_idle(&self, user_id: &str, queue: &mut UserQueue) {
        if !queue.entries.is_empty() || !queue.awaiting.is_empty() {
            return;
        }
        // Clones are only taken under the map lock, so the count is stable here
        let mut users = self.inner.users.write().await;
        if users.get(user_id).is_some_and(|q| Arc::strong_count(q) == 2) {
            users.remove(user_id);
            debug!(user_id = %user_id, "User queue emptied");
        }
    }

    async fn present(&self, user_id: &str, image: &ChallengeImage) {
        if let Err(e) = self.inner.messenger.send_image(user_id, image, CHALLENGE_CAPTION).await {
            error!(user_id = %user_id, "Failed to send challenge: {:#}", e);
        }
    }

    async fn notify(&self, user_id: &str, text: &str) {
        if let Err(e) = self.inner.messenger.send_text(user_id, text, &[]).await {
            warn!(user_id = %user_id, "Failed to notify user: {:#}", e);
        }
    }
}
