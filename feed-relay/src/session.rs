//! Per-user and per-message records kept in the session store.

use crate::types::{KeyValueStore, PostOrigin, PublishEngine, RelayError, Result, SentMessage, SignerInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub private_key: String,
    pub address: String,
    pub registered_at: DateTime<Utc>,
}

// Keep the key out of logs
impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub chat_id: String,
    pub message_id: i64,
    pub post_id: String,
    pub feed_address: String,
    pub delivered_at: DateTime<Utc>,
}

fn user_key(user_id: &str) -> String {
    format!("user:{}", user_id)
}

fn message_key(chat_id: &str, message_id: i64) -> String {
    format!("message:{}:{}", chat_id, message_id)
}

/// Registered signers, one per messaging-platform user.
#[derive(Clone)]
pub struct UserRegistry {
    store: Arc<dyn KeyValueStore>,
    engine: Arc<dyn PublishEngine>,
}

impl UserRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, engine: Arc<dyn PublishEngine>) -> Self {
        Self { store, engine }
    }

    /// Validate the key with the engine, then store it. Nothing is stored for
    /// a key the engine rejects.
    pub async fn register(&self, user_id: &str, private_key: &str) -> Result<SignerInfo> {
        let signer = self
            .engine
            .load_signer(private_key.trim())
            .await
            .map_err(|e| RelayError::Engine(format!("Invalid private key: {}", e)))?;

        let record = UserRecord {
            id: user_id.to_string(),
            private_key: private_key.trim().to_string(),
            address: signer.address.clone(),
            registered_at: Utc::now(),
        };
        self.store
            .set(&user_key(user_id), &serde_json::to_string(&record)?)
            .await
            .map_err(RelayError::store)?;

        info!(user_id = %user_id, address = %signer.address, "Registered user");
        Ok(signer)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let raw = self.store.get(&user_key(user_id)).await.map_err(RelayError::store)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn is_registered(&self, user_id: &str) -> Result<bool> {
        Ok(self.get_user(user_id).await?.is_some())
    }

    pub async fn remove_user(&self, user_id: &str) -> Result<bool> {
        let removed = self.store.delete(&user_key(user_id)).await.map_err(RelayError::store)?;
        if removed {
            info!(user_id = %user_id, "Removed user");
        }
        Ok(removed)
    }
}

/// Which post each delivered channel message shows.
#[derive(Clone)]
pub struct MessageIndex {
    store: Arc<dyn KeyValueStore>,
}

impl MessageIndex {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn record_delivery(&self, sent: &SentMessage, origin: &PostOrigin) -> Result<MessageRecord> {
        let record = MessageRecord {
            chat_id: sent.chat_id.clone(),
            message_id: sent.message_id,
            post_id: origin.post_id.clone(),
            feed_address: origin.feed_address.clone(),
            delivered_at: Utc::now(),
        };
        self.save_message(&record).await?;
        Ok(record)
    }

    pub async fn save_message(&self, record: &MessageRecord) -> Result<()> {
        self.store
            .set(
                &message_key(&record.chat_id, record.message_id),
                &serde_json::to_string(record)?,
            )
            .await
            .map_err(RelayError::store)?;
        debug!(chat_id = %record.chat_id, message_id = record.message_id, "Saved message metadata");
        Ok(())
    }

    pub async fn get_message(&self, chat_id: &str, message_id: i64) -> Result<Option<MessageRecord>> {
        let raw = self
            .store
            .get(&message_key(chat_id, message_id))
            .await
            .map_err(RelayError::store)?;
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    warn!(chat_id = %chat_id, message_id, "Unreadable message metadata: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}
