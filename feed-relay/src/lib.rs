pub mod types;
pub mod fetcher;
pub mod sources;
pub mod format;
pub mod dedup;
pub mod session;
pub mod delivery;
pub mod poller;
pub mod publish;
pub mod challenge;
pub mod actions;
pub mod telegram;
pub mod relay;

pub use types::*;
pub use fetcher::Fetcher;
pub use sources::{GatewayNetwork, HttpDirectory};
pub use dedup::DedupStore;
pub use session::{MessageIndex, MessageRecord, UserRecord, UserRegistry};
pub use delivery::{DeliveryHandle, DeliveryOutcome, DeliveryQueue};
pub use poller::{CrawlReport, CycleReport, FeedPoller};
pub use publish::{ActionState, ActionUpdate, PublishAction};
pub use challenge::ChallengeQueue;
pub use actions::ActionService;
pub use telegram::TelegramMessenger;
pub use relay::{FeedRelay, RelayContext};
