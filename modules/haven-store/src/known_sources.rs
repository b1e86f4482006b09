//! Per-plugin persisted sets of already-seen source identifiers.
//!
//! Each plugin's set lives in its own JSON artifact in the data directory
//! (`{plugin}_sources.json`). Writes go through a temp file and a rename,
//! so readers never observe a half-written artifact. Sets are cached in
//! memory after first access.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;

#[derive(Debug, Serialize, Deserialize)]
struct SourceArtifact {
    plugin_name: String,
    sources: Vec<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct KnownSourceStats {
    pub known_count: usize,
}

/// Tracks which source ids a plugin has already archived, backing the
/// `archive_new` policy. `contains(p, id)` after `add(p, id)` holds across
/// process restarts.
pub struct KnownSourceStore {
    data_dir: PathBuf,
    cache: Mutex<HashMap<String, HashSet<String>>>,
}

impl KnownSourceStore {
    /// Open the store, creating the data directory if needed.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;
        Ok(Self {
            data_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The full known-source set for a plugin, possibly empty.
    pub async fn load(&self, plugin: &str) -> Result<HashSet<String>> {
        let mut cache = self.cache.lock().await;
        Ok(self.loaded(&mut cache, plugin).await.clone())
    }

    pub async fn contains(&self, plugin: &str, source_id: &str) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        Ok(self.loaded(&mut cache, plugin).await.contains(source_id))
    }

    /// Mark one source as known and persist the updated set.
    pub async fn add(&self, plugin: &str, source_id: impl Into<String>) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.loaded(&mut cache, plugin).await.insert(source_id.into());
        self.save(&cache, plugin).await
    }

    /// Mark many sources as known with a single write.
    pub async fn add_many(
        &self,
        plugin: &str,
        source_ids: impl IntoIterator<Item = String>,
    ) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.loaded(&mut cache, plugin).await.extend(source_ids);
        self.save(&cache, plugin).await
    }

    /// Filter `source_ids` down to the ones not yet known, preserving order.
    pub async fn filter_new(&self, plugin: &str, source_ids: &[String]) -> Result<Vec<String>> {
        let mut cache = self.cache.lock().await;
        let known = self.loaded(&mut cache, plugin).await;
        Ok(source_ids
            .iter()
            .filter(|id| !known.contains(id.as_str()))
            .cloned()
            .collect())
    }

    /// Forget everything known for a plugin, removing its artifact.
    pub async fn clear(&self, plugin: &str) -> Result<()> {
        self.cache.lock().await.remove(plugin);
        let path = self.artifact_path(plugin);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(plugin, "Cleared known-source artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub async fn stats(&self, plugin: &str) -> Result<KnownSourceStats> {
        let mut cache = self.cache.lock().await;
        Ok(KnownSourceStats {
            known_count: self.loaded(&mut cache, plugin).await.len(),
        })
    }

    fn artifact_path(&self, plugin: &str) -> PathBuf {
        self.data_dir.join(format!("{plugin}_sources.json"))
    }

    async fn loaded<'c>(
        &self,
        cache: &'c mut HashMap<String, HashSet<String>>,
        plugin: &str,
    ) -> &'c mut HashSet<String> {
        match cache.entry(plugin.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let set = self.read_artifact(plugin).await;
                entry.insert(set)
            }
        }
    }

    async fn read_artifact(&self, plugin: &str) -> HashSet<String> {
        let path = self.artifact_path(plugin);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashSet::new(),
            Err(e) => {
                warn!(plugin, error = %e, "Failed to read known-source artifact");
                return HashSet::new();
            }
        };
        match serde_json::from_slice::<SourceArtifact>(&raw) {
            Ok(artifact) => {
                debug!(plugin, count = artifact.sources.len(), "Loaded known sources");
                artifact.sources.into_iter().collect()
            }
            Err(e) => {
                warn!(plugin, error = %e, "Corrupt known-source artifact, starting empty");
                HashSet::new()
            }
        }
    }

    async fn save(&self, cache: &HashMap<String, HashSet<String>>, plugin: &str) -> Result<()> {
        let mut sources: Vec<String> = cache
            .get(plugin)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        sources.sort();

        let artifact = SourceArtifact {
            plugin_name: plugin.to_string(),
            sources,
            updated_at: Utc::now(),
        };
        let raw = serde_json::to_vec_pretty(&artifact)?;

        let path = self.artifact_path(plugin);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_contains() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownSourceStore::open(dir.path()).await.unwrap();

        assert!(!store.contains("DemoPlugin", "vid_1").await.unwrap());
        store.add("DemoPlugin", "vid_1").await.unwrap();
        assert!(store.contains("DemoPlugin", "vid_1").await.unwrap());
        assert!(!store.contains("OtherPlugin", "vid_1").await.unwrap());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KnownSourceStore::open(dir.path()).await.unwrap();
            store.add("DemoPlugin", "vid_A").await.unwrap();
        }

        let reopened = KnownSourceStore::open(dir.path()).await.unwrap();
        assert!(reopened.contains("DemoPlugin", "vid_A").await.unwrap());
        assert_eq!(reopened.stats("DemoPlugin").await.unwrap().known_count, 1);
    }

    #[tokio::test]
    async fn filter_new_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownSourceStore::open(dir.path()).await.unwrap();
        store
            .add_many("DemoPlugin", ["b".to_string(), "d".to_string()])
            .await
            .unwrap();

        let ids: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let new = store.filter_new("DemoPlugin", &ids).await.unwrap();
        assert_eq!(new, vec!["a", "c", "e"]);
    }

    #[tokio::test]
    async fn clear_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownSourceStore::open(dir.path()).await.unwrap();
        store.add("DemoPlugin", "vid_1").await.unwrap();

        store.clear("DemoPlugin").await.unwrap();
        assert!(!store.contains("DemoPlugin", "vid_1").await.unwrap());
        assert!(!dir.path().join("DemoPlugin_sources.json").exists());

        // Clearing an unknown plugin is a no-op.
        store.clear("NeverSeen").await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_artifact_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("DemoPlugin_sources.json"), b"{not json")
            .await
            .unwrap();

        let store = KnownSourceStore::open(dir.path()).await.unwrap();
        assert_eq!(store.stats("DemoPlugin").await.unwrap().known_count, 0);
        store.add("DemoPlugin", "vid_1").await.unwrap();
        assert!(store.contains("DemoPlugin", "vid_1").await.unwrap());
    }
}
