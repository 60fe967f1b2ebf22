use crate::dedup::DedupStore;
use crate::delivery::DeliveryHandle;
use crate::format;
use crate::types::{FeedDirectory, FeedNetwork, FeedSource, LinkConfig, PollerConfig, RelayError, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// What one backward walk over a feed did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub address: String,
    /// Chain steps consumed, delivered or not
    pub visited: usize,
    /// Newly delivered ids, newest first
    pub delivered: Vec<String>,
    pub already_seen: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub sources: usize,
    pub crawled: Vec<CrawlReport>,
    pub failed: Vec<(String, String)>,
    pub history_saved: bool,
}

impl CycleReport {
    pub fn delivered(&self) -> usize {
        self.crawled.iter().map(|c| c.delivered.len()).sum()
    }
}

pub struct FeedPoller {
    network: Arc<dyn FeedNetwork>,
    directory: Arc<dyn FeedDirectory>,
    dedup: Arc<DedupStore>,
    delivery: DeliveryHandle,
    config: PollerConfig,
    links: LinkConfig,
    chat_id: String,
}

impl FeedPoller {
    pub fn new(
        network: Arc<dyn FeedNetwork>,
        directory: Arc<dyn FeedDirectory>,
        dedup: Arc<DedupStore>,
        delivery: DeliveryHandle,
        config: PollerConfig,
        links: LinkConfig,
        chat_id: String,
    ) -> Self {
        Self {
            network,
            directory,
            dedup,
            delivery,
            config,
            links,
            chat_id,
        }
    }

    /// Cycle until `shutdown` flips to true. Returns early only when the
    /// history cannot be loaded.
    ///
    /// A cycle cut short by shutdown drops every in-flight fetch; whatever was
    /// marked before that point is still flushed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting feed poller");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                result = self.run_cycle() => {
                    let report = result?;
                    info!(
                        "Cycle finished: {} feeds, {} new posts, {} failures",
                        report.sources,
                        report.delivered(),
                        report.failed.len()
                    );
                }
                _ = shutdown.changed() => {
                    warn!("Shutdown during cycle, saving history");
                    if let Err(e) = self.dedup.flush().await {
                        error!("Failed to save delivery history: {}", e);
                    }
                    break;
                }
            }

            info!("Waiting {:?} for next cycle", self.config.cycle_interval);
            tokio::select! {
                _ = tokio::time::sleep(self.config.cycle_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Feed poller stopped");
        Ok(())
    }

    /// Load history, crawl every listed feed concurrently, save history once.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let known = self.dedup.load().await?;
        info!("Loaded {} delivered ids", known);

        let sources = match self.directory.list_sources().await {
            Ok(sources) => sources,
            Err(e) => {
                error!("Failed to fetch feed directory, skipping this cycle's feeds: {:#}", e);
                Vec::new()
            }
        };

        let mut report = CycleReport {
            sources: sources.len(),
            ..Default::default()
        };

        let results = join_all(sources.iter().map(|source| self.poll_source(source))).await;
        for (source, result) in sources.iter().zip(results) {
            match result {
                Ok(crawl) => report.crawled.push(crawl),
                Err(e) => {
                    warn!(address = %source.address, "Feed skipped this cycle: {}", e);
                    report.failed.push((source.address.clone(), e.to_string()));
                }
            }
        }

        match self.dedup.flush().await {
            Ok(()) => report.history_saved = true,
            Err(e) => error!("Failed to save delivery history: {}", e),
        }

        Ok(report)
    }

    /// Resolve the feed's newest post, then walk back from it. Each step has
    /// its own deadline; hitting one abandons the feed for this cycle.
    pub async fn poll_source(&self, source: &FeedSource) -> Result<CrawlReport> {
        debug!(address = %source.address, "Loading feed");
        let started = Instant::now();

        let pointer = timeout(self.config.pointer_timeout, self.network.fetch_feed(&source.address))
            .await
            .map_err(|_| RelayError::timeout("loading feed pointer", self.config.pointer_timeout))?
            .map_err(|e| RelayError::fetch(&source.address, e))?;

        debug!(
            address = %source.address,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Feed loaded"
        );

        timeout(self.config.crawl_timeout, self.crawl(&pointer.address, pointer.last_post_id))
            .await
            .map_err(|_| RelayError::timeout("crawling feed", self.config.crawl_timeout))?
    }

    /// Walk back from `newest` through predecessor links.
    ///
    /// Every step counts toward the crawl limit. Already delivered posts do not
    /// stop the walk: only their link is fetched, so older gaps are still found.
    pub async fn crawl(&self, address: &str, newest: Option<String>) -> Result<CrawlReport> {
        let mut report = CrawlReport {
            address: address.to_string(),
            ..Default::default()
        };
        let mut cursor = newest;

        while let Some(id) = cursor.take() {
            if report.visited >= self.config.crawl_limit {
                debug!(address = %address, "Crawl limit reached");
                break;
            }
            report.visited += 1;

            if self.dedup.contains(&id).await {
                debug!(address = %address, post_id = %id, "Already delivered");
                report.already_seen += 1;
                let link = self
                    .network
                    .fetch_post_link(&id)
                    .await
                    .map_err(|e| RelayError::fetch(&id, e))?;
                cursor = link.previous_id;
                continue;
            }

            let post = self
                .network
                .fetch_post(&id)
                .await
                .map_err(|e| RelayError::fetch(&id, e))?;
            cursor = post.previous_id.clone();

            // Mark and enqueue with no await in between
            if !self.dedup.mark_if_new(&id).await {
                report.already_seen += 1;
                continue;
            }
            if let Err(e) = self.delivery.enqueue(format::build_task(&self.chat_id, &post, &self.links)) {
                self.dedup.unmark(&id).await;
                return Err(e);
            }

            info!(address = %address, post_id = %id, "New post queued: {}", post.title);
            report.delivered.push(id);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeedPointer, PostLink, PostRecord};
    use anyhow::bail;
    use async_trait::async_trait;

    struct SinglePost;

    #[async_trait]
    impl FeedNetwork for SinglePost {
        async fn fetch_feed(&self, address: &str) -> anyhow::Result<FeedPointer> {
            Ok(FeedPointer {
                address: address.to_string(),
                last_post_id: Some("p1".to_string()),
            })
        }

        async fn fetch_post(&self, id: &str) -> anyhow::Result<PostRecord> {
            Ok(PostRecord {
                id: id.to_string(),
                title: "Only post".to_string(),
                body: String::new(),
                link: None,
                feed_address: "board.eth".to_string(),
                author: "alice.eth".to_string(),
                previous_id: None,
            })
        }

        async fn fetch_post_link(&self, id: &str) -> anyhow::Result<PostLink> {
            bail!("no link for {}", id)
        }
    }

    struct NoFeeds;

    #[async_trait]
    impl FeedDirectory for NoFeeds {
        async fn list_sources(&self) -> anyhow::Result<Vec<FeedSource>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn closed_queue_leaves_post_unmarked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dedup = Arc::new(DedupStore::new(dir.path().join("history.json")));
        dedup.load().await?;

        let poller = FeedPoller::new(
            Arc::new(SinglePost),
            Arc::new(NoFeeds),
            dedup.clone(),
            DeliveryHandle::closed(),
            PollerConfig::default(),
            LinkConfig::default(),
            "@feed".to_string(),
        );

        let result = poller.crawl("board.eth", Some("p1".to_string())).await;
        assert!(matches!(result, Err(RelayError::QueueClosed)));
        assert!(!dedup.contains("p1").await);
        assert!(dedup.is_empty().await);
        Ok(())
    }
}
