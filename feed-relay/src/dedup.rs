use crate::types::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// On-disk shape of the delivery history. Older snapshots used `Cids`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DedupSnapshot {
    #[serde(alias = "Cids", default)]
    ids: Vec<String>,
}

#[derive(Default)]
struct DedupIndex {
    // Insertion order, so the snapshot reads chronologically
    order: Vec<String>,
    members: HashSet<String>,
    loaded: bool,
}

impl DedupIndex {
    fn insert(&mut self, id: &str) -> bool {
        if self.members.insert(id.to_string()) {
            self.order.push(id.to_string());
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        if self.members.remove(id) {
            self.order.retain(|known| known != id);
            true
        } else {
            false
        }
    }
}

/// Set of post ids already handed to delivery, persisted as one JSON snapshot.
///
/// All crawls of a cycle share one store; every mutation goes through the
/// internal lock, and [`DedupStore::mark_if_new`] is the atomic check-and-mark
/// the crawler relies on.
pub struct DedupStore {
    path: PathBuf,
    index: Mutex<DedupIndex>,
}

impl DedupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: Mutex::new(DedupIndex::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory set with the persisted snapshot.
    ///
    /// A missing file is an empty history. Any other read or parse failure is
    /// returned: the poller must not run without knowing what it already sent.
    pub async fn load(&self) -> Result<usize> {
        let snapshot = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str::<DedupSnapshot>(&content).map_err(|e| self.persistence_error(e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("No delivery history at {}, starting empty", self.path.display());
                DedupSnapshot::default()
            }
            Err(e) => return Err(self.persistence_error(e)),
        };

        let mut fresh = DedupIndex::default();
        for id in &snapshot.ids {
            fresh.insert(id);
        }
        fresh.loaded = true;

        let mut index = self.index.lock().await;
        *index = fresh;
        debug!("Loaded {} delivered ids from {}", index.order.len(), self.path.display());
        Ok(index.order.len())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.index.lock().await.members.contains(id)
    }

    pub async fn mark_seen(&self, id: &str) {
        self.index.lock().await.insert(id);
    }

    /// Marks `id` and reports whether it was unseen until now.
    pub async fn mark_if_new(&self, id: &str) -> bool {
        self.index.lock().await.insert(id)
    }

    /// Forget `id`, for a post that was marked but never reached the queue.
    pub async fn unmark(&self, id: &str) -> bool {
        self.index.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite the snapshot with the in-memory set.
    ///
    /// Refuses to write before a successful [`DedupStore::load`], so an
    /// interrupted start can never replace a real history with an empty one.
    pub async fn flush(&self) -> Result<()> {
        let content = {
            let index = self.index.lock().await;
            if !index.loaded {
                return Err(self.persistence_error("history was never loaded, refusing to overwrite"));
            }
            let snapshot = DedupSnapshot {
                ids: index.order.clone(),
            };
            serde_json::to_string_pretty(&snapshot)?
        };

        // Write-then-rename keeps the old snapshot intact if we die mid-write
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        info!("Saved delivery history to {}", self.path.display());
        Ok(())
    }

    fn persistence_error(&self, err: impl std::fmt::Display) -> RelayError {
        RelayError::Persistence {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marked_ids_survive_reload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = DedupStore::new(dir.path().join("history.json"));

        assert_eq!(store.load().await?, 0);
        assert!(!store.contains("QmA").await);
        store.mark_seen("QmA").await;
        assert!(store.mark_if_new("QmB").await);
        assert!(!store.mark_if_new("QmB").await);
        store.flush().await?;

        let reopened = DedupStore::new(dir.path().join("history.json"));
        assert_eq!(reopened.load().await?, 2);
        assert!(reopened.contains("QmA").await);
        assert!(reopened.contains("QmB").await);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_is_pretty_json_in_insertion_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.json");
        let store = DedupStore::new(&path);
        store.load().await?;
        for id in ["Qm3", "Qm1", "Qm2"] {
            store.mark_seen(id).await;
        }
        store.flush().await?;

        let written = std::fs::read_to_string(&path)?;
        assert!(written.contains("\n  \"ids\": [\n"));
        let value: serde_json::Value = serde_json::from_str(&written)?;
        assert_eq!(value["ids"], serde_json::json!(["Qm3", "Qm1", "Qm2"]));
        Ok(())
    }

    #[tokio::test]
    async fn reads_legacy_key() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.json");
        std::fs::write(&path, r#"{ "Cids": ["QmOld1", "QmOld2", "QmOld1"] }"#)?;

        let store = DedupStore::new(&path);
        assert_eq!(store.load().await?, 2);
        assert!(store.contains("QmOld2").await);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_snapshot_fails_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json")?;

        let store = DedupStore::new(&path);
        assert!(matches!(store.load().await, Err(RelayError::Persistence { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn flush_before_load_is_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.json");
        std::fs::write(&path, r#"{ "ids": ["QmKeep"] }"#)?;

        let store = DedupStore::new(&path);
        store.mark_seen("QmNew").await;
        assert!(store.flush().await.is_err());
        assert!(std::fs::read_to_string(&path)?.contains("QmKeep"));
        Ok(())
    }

    #[tokio::test]
    async fn unmarked_id_is_not_saved() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.json");
        let store = DedupStore::new(&path);
        store.load().await?;
        assert!(store.mark_if_new("QmA").await);
        assert!(store.mark_if_new("QmB").await);

        assert!(store.unmark("QmA").await);
        assert!(!store.unmark("QmA").await);
        assert!(!store.contains("QmA").await);
        assert!(store.mark_if_new("QmA").await);
        store.flush().await?;

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(value["ids"], serde_json::json!(["QmB", "QmA"]));
        Ok(())
    }

    #[tokio::test]
    async fn load_replaces_in_memory_marks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = DedupStore::new(dir.path().join("history.json"));
        store.load().await?;
        store.mark_seen("QmUnflushed").await;

        store.load().await?;
        assert!(!store.contains("QmUnflushed").await);
        Ok(())
    }
}
