use anyhow::Context;
use clap::Parser;
use feed_relay::sources::directory::DEFAULT_DIRECTORY_URL;
use feed_relay::telegram::DEFAULT_API_BASE;
use feed_relay::{
    FeedRelay, Fetcher, GatewayNetwork, HttpDirectory, KeyValueStore, RelayConfig, RelayContext, TelegramMessenger,
};
use interfaces::{MemoryStore, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Relays new posts from every listed feed into a chat.
#[derive(Parser, Debug)]
#[command(name = "feed-relay")]
struct Args {
    /// Bot API token
    #[arg(long, env = "FEED_BOT_TOKEN", hide_env_values = true)]
    bot_token: String,

    /// Chat (or @channel) that receives new posts
    #[arg(long, env = "FEED_BOT_CHAT")]
    chat: String,

    #[arg(long, env = "FEED_BOT_API", default_value = DEFAULT_API_BASE)]
    bot_api: String,

    /// Document listing the feeds to follow
    #[arg(long, env = "FEED_DIRECTORY_URL", default_value = DEFAULT_DIRECTORY_URL)]
    directory_url: String,

    /// Content gateway serving /ipns and /ipfs paths
    #[arg(long, env = "FEED_GATEWAY_URL", default_value = "http://127.0.0.1:8080")]
    gateway_url: String,

    #[arg(long, env = "FEED_HISTORY_FILE", default_value = "history.json")]
    history_file: PathBuf,

    /// sqlite URL for session data; kept in memory when absent
    #[arg(long, env = "FEED_STORE_URL")]
    store_url: Option<String>,

    /// Seconds between cycles
    #[arg(long, env = "FEED_CYCLE_INTERVAL", default_value = "60")]
    interval: u64,

    /// Seconds between two sends
    #[arg(long, env = "FEED_SEND_INTERVAL", default_value = "6")]
    send_interval: u64,

    /// Posts visited per feed per cycle
    #[arg(long, env = "FEED_CRAWL_LIMIT", default_value = "20")]
    crawl_limit: usize,

    /// Run a single cycle, wait for its messages, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    info!("Starting feed relay");

    let mut config = RelayConfig::default();
    config.poller.history_path = args.history_file.clone();
    config.poller.cycle_interval = Duration::from_secs(args.interval);
    config.poller.crawl_limit = args.crawl_limit;
    config.delivery.chat_id = args.chat.clone();
    config.delivery.send_interval = Duration::from_secs(args.send_interval);

    let fetcher = Fetcher::new(config.fetch.clone()).context("Failed to build HTTP client")?;
    let network = GatewayNetwork::new(fetcher.clone(), &args.gateway_url).context("Invalid gateway URL")?;
    let directory = HttpDirectory::new(fetcher.clone(), &args.directory_url).context("Invalid directory URL")?;
    let messenger = TelegramMessenger::with_api_base(fetcher.client().clone(), &args.bot_token, &args.bot_api);

    let store: Arc<dyn KeyValueStore> = match &args.store_url {
        Some(url) => {
            info!("Using session store {}", url);
            Arc::new(SqliteStore::connect(url).await.context("Failed to open session store")?)
        }
        None => {
            warn!("No session store configured, message metadata is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let relay = FeedRelay::new(
        RelayContext {
            network: Arc::new(network),
            directory: Arc::new(directory),
            messenger: Arc::new(messenger),
            store,
        },
        config,
    );

    let outcome = if args.once {
        relay.run_once().await.map(|report| {
            info!(
                "Single cycle done: {} feeds, {} new posts, {} failed",
                report.sources,
                report.delivered(),
                report.failed.len()
            );
        })
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for interrupt: {}", e);
                // Dropping the sender would read as a shutdown
                std::future::pending::<()>().await;
            }
            info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        });
        relay.run(shutdown_rx).await
    };

    relay.close().await;

    if let Err(e) = &outcome {
        error!("Feed relay stopped: {}", e);
    }
    outcome?;
    info!("Feed relay finished");
    Ok(())
}
