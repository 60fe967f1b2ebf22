//! User-facing entry points: registration, votes and comments on delivered
//! messages, challenge answers and cancellation.

use crate::challenge::ChallengeQueue;
use crate::format::{DOWNVOTE_CALLBACK, UPVOTE_CALLBACK};
use crate::session::{MessageIndex, MessageRecord, UserRecord, UserRegistry};
use crate::types::{PublishRequest, RelayError, Result, SignerInfo, VoteDirection};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct ActionService {
    users: UserRegistry,
    messages: MessageIndex,
    queue: ChallengeQueue,
}

impl ActionService {
    pub fn new(users: UserRegistry, messages: MessageIndex, queue: ChallengeQueue) -> Self {
        Self { users, messages, queue }
    }

    pub fn queue(&self) -> &ChallengeQueue {
        &self.queue
    }

    pub async fn register(&self, user_id: &str, private_key: &str) -> Result<SignerInfo> {
        self.users.register(user_id, private_key).await
    }

    pub async fn vote(&self, user_id: &str, chat_id: &str, message_id: i64, direction: VoteDirection) -> Result<Uuid> {
        let user = self.registered_user(user_id).await?;
        let message = self.known_message(chat_id, message_id).await?;

        let request = PublishRequest::Vote {
            feed_address: message.feed_address,
            target_id: message.post_id,
            direction,
        };
        let action_id = self.queue.submit(&user.id, &user.private_key, request).await?;
        info!(user_id = %user_id, action_id = %action_id, vote = direction.value(), "Vote submitted");
        Ok(action_id)
    }

    pub async fn comment(&self, user_id: &str, chat_id: &str, message_id: i64, content: &str) -> Result<Uuid> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RelayError::General("Comment is empty".to_string()));
        }
        let user = self.registered_user(user_id).await?;
        let message = self.known_message(chat_id, message_id).await?;

        let request = PublishRequest::Comment {
            feed_address: message.feed_address,
            parent_id: message.post_id,
            content: content.to_string(),
        };
        let action_id = self.queue.submit(&user.id, &user.private_key, request).await?;
        info!(user_id = %user_id, action_id = %action_id, "Comment submitted");
        Ok(action_id)
    }

    /// Button press on a delivered message. Returns None for callback data
    /// that is not a vote.
    pub async fn handle_callback(
        &self,
        user_id: &str,
        chat_id: &str,
        message_id: i64,
        data: &str,
    ) -> Result<Option<Uuid>> {
        let direction = match data {
            UPVOTE_CALLBACK => VoteDirection::Up,
            DOWNVOTE_CALLBACK => VoteDirection::Down,
            other => {
                debug!(user_id = %user_id, "Ignoring callback {:?}", other);
                return Ok(None);
            }
        };
        self.vote(user_id, chat_id, message_id, direction).await.map(Some)
    }

    pub async fn answer(&self, user_id: &str, text: &str) -> Result<()> {
        self.queue.submit_answer(user_id, text).await
    }

    pub async fn cancel(&self, user_id: &str) -> bool {
        self.queue.cancel(user_id).await
    }

    async fn registered_user(&self, user_id: &str) -> Result<UserRecord> {
        self.users
            .get_user(user_id)
            .await?
            .ok_or_else(|| RelayError::NotRegistered {
                user_id: user_id.to_string(),
            })
    }

    async fn known_message(&self, chat_id: &str, message_id: i64) -> Result<MessageRecord> {
        self.messages
            .get_message(chat_id, message_id)
            .await?
            .ok_or_else(|| RelayError::UnknownMessage {
                chat_id: chat_id.to_string(),
                message_id,
            })
    }
}
