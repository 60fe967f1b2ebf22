//! One vote or comment in flight against the publish engine.
//!
//! The engine speaks in events (challenge, verification, error). Each event is
//! fed to [`PublishAction::on_event`], which moves the action along
//!
//! ```text
//! Created -> AwaitingChallenge -> ChallengeDelivered -> AnswerSubmitted -> Verified
//!                                                                       \-> Failed
//! ```
//!
//! and tells the caller what happened. Any engine error jumps straight to
//! `Failed`. Whatever path ends an action, [`PublishAction::teardown`] detaches
//! the listeners and stops the engine handle exactly once.

use crate::types::{
    ChallengeImage, EngineEvent, PublishEngine, PublishHandle, PublishKind, PublishRequest, RelayError, Result,
};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Created,
    AwaitingChallenge,
    ChallengeDelivered,
    AnswerSubmitted,
    Verified,
    Failed,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionState::Verified | ActionState::Failed)
    }
}

/// Result of feeding one engine event to an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionUpdate {
    Challenge(ChallengeImage),
    Verified { published_id: Option<String> },
    Rejected { reasons: Vec<String> },
    Errored(String),
    /// Event made no sense in the current state
    Ignored,
}

pub struct PublishAction {
    id: Uuid,
    user_id: String,
    private_key: String,
    request: PublishRequest,
    attempt: u32,
    state: ActionState,
    handle: Box<dyn PublishHandle>,
    torn_down: bool,
}

impl fmt::Debug for PublishAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishAction")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("request", &self.request)
            .field("attempt", &self.attempt)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PublishAction {
    /// Ask the engine for a handle. Nothing is published yet.
    pub async fn create(
        engine: &dyn PublishEngine,
        user_id: &str,
        private_key: &str,
        request: PublishRequest,
        attempt: u32,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        let mut handle = engine
            .create_publication(private_key, &request)
            .await
            .map_err(RelayError::engine)?;
        let events = match handle.take_events() {
            Some(events) => events,
            None => {
                handle.remove_listeners();
                return Err(RelayError::Engine("publication has no event stream".to_string()));
            }
        };

        let action = Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            private_key: private_key.to_string(),
            request,
            attempt,
            state: ActionState::Created,
            handle,
            torn_down: false,
        };
        debug!(action_id = %action.id, user_id = %user_id, kind = ?action.kind(), attempt, "Created publish action");
        Ok((action, events))
    }

    /// A fresh action for the same request, one attempt further.
    // Takes &mut so the future stays Send; the handle is not Sync.
    pub async fn recreate(&mut self, engine: &dyn PublishEngine) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        Self::create(engine, &self.user_id, &self.private_key, self.request.clone(), self.attempt + 1).await
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn kind(&self) -> PublishKind {
        self.request.kind()
    }

    pub fn request(&self) -> &PublishRequest {
        &self.request
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// `Created -> AwaitingChallenge`. On engine error the action fails and is torn down.
    pub async fn publish(&mut self) -> Result<()> {
        if self.state != ActionState::Created {
            return Err(RelayError::General(format!(
                "action {} cannot publish from {:?}",
                self.id, self.state
            )));
        }
        self.state = ActionState::AwaitingChallenge;
        if let Err(e) = self.handle.publish().await {
            self.fail().await;
            return Err(RelayError::engine(e));
        }
        info!(action_id = %self.id, user_id = %self.user_id, kind = ?self.kind(), "Publish requested");
        Ok(())
    }

    /// Record that this action's challenge is being held for the user.
    pub fn challenge_presented(&mut self) {
        if matches!(self.state, ActionState::Created | ActionState::AwaitingChallenge) {
            self.state = ActionState::ChallengeDelivered;
        }
    }

    /// `ChallengeDelivered -> AnswerSubmitted`. An engine error fails the action and tears it down.
    pub async fn submit_answer(&mut self, answer: &str) -> Result<()> {
        if self.state != ActionState::ChallengeDelivered {
            return Err(RelayError::General(format!(
                "action {} is not waiting for an answer ({:?})",
                self.id, self.state
            )));
        }
        match self.handle.publish_challenge_answers(vec![answer.trim().to_string()]).await {
            Ok(()) => {
                self.state = ActionState::AnswerSubmitted;
                debug!(action_id = %self.id, "Challenge answer submitted");
                Ok(())
            }
            Err(e) => {
                self.fail().await;
                Err(RelayError::engine(e))
            }
        }
    }

    /// Apply one engine event. Errors fail the action and tear it down here;
    /// verification results leave teardown to the owner, which may still need
    /// the action (for a retry) before discarding it.
    pub async fn on_event(&mut self, event: EngineEvent) -> ActionUpdate {
        if self.torn_down || self.state.is_terminal() {
            return ActionUpdate::Ignored;
        }

        match event {
            EngineEvent::Challenge(image) => match self.state {
                ActionState::AwaitingChallenge | ActionState::ChallengeDelivered => {
                    self.state = ActionState::ChallengeDelivered;
                    ActionUpdate::Challenge(image)
                }
                _ => ActionUpdate::Ignored,
            },
            EngineEvent::ChallengeVerification(verification) => match self.state {
                // The engine may skip the challenge entirely
                ActionState::AwaitingChallenge | ActionState::AnswerSubmitted => {
                    if verification.challenge_success {
                        self.state = ActionState::Verified;
                        ActionUpdate::Verified {
                            published_id: verification.published_id,
                        }
                    } else {
                        self.state = ActionState::Failed;
                        ActionUpdate::Rejected {
                            reasons: verification.reasons,
                        }
                    }
                }
                _ => ActionUpdate::Ignored,
            },
            EngineEvent::Error(message) => {
                warn!(action_id = %self.id, "Engine error: {}", message);
                self.fail().await;
                ActionUpdate::Errored(message)
            }
        }
    }

    async fn fail(&mut self) {
        self.state = ActionState::Failed;
        self.teardown().await;
    }

    /// Detach from the engine and stop the handle. Runs once; later calls
    /// return false and do nothing.
    pub async fn teardown(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;
        if !self.state.is_terminal() {
            self.state = ActionState::Failed;
        }

        self.handle.remove_listeners();
        if let Err(e) = self.handle.stop().await {
            warn!(action_id = %self.id, "Failed to stop publication: {}", e);
        }
        debug!(action_id = %self.id, "Publish action torn down");
        true
    }
}
