use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::state::ConversationState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Written after the turn input was merged into the state.
    Input,
    /// Written after a node ran.
    Loop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub step: i64,
    pub source: CheckpointSource,
    /// `{node name: what it wrote}` for this step.
    pub writes: serde_json::Value,
}

/// Persisted state of a thread after one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub values: ConversationState,
    /// Nodes scheduled to run next; empty once the turn ended.
    pub next: Vec<String>,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Every key must equal the snapshot's metadata value at that key.
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    /// Only snapshots written before this checkpoint.
    pub before: Option<String>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    fn matches(&self, snapshot: &StateSnapshot) -> bool {
        let Some(ref wanted) = self.metadata else {
            return true;
        };
        let Ok(actual) = serde_json::to_value(&snapshot.metadata) else {
            return false;
        };
        wanted.iter().all(|(k, v)| actual.get(k) == Some(v))
    }

    /// Apply to a thread's snapshots in write order; result is newest first.
    pub fn apply(&self, snapshots: &[StateSnapshot]) -> Vec<StateSnapshot> {
        let end = match self.before {
            Some(ref id) => snapshots
                .iter()
                .position(|s| &s.checkpoint_id == id)
                .unwrap_or(snapshots.len()),
            None => snapshots.len(),
        };
        snapshots[..end]
            .iter()
            .rev()
            .filter(|s| self.matches(s))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn put(&self, snapshot: StateSnapshot) -> Result<()>;

    /// A specific checkpoint, or the latest one when `checkpoint_id` is `None`.
    async fn get(&self, thread_id: &str, checkpoint_id: Option<&str>) -> Result<Option<StateSnapshot>>;

    /// Newest first.
    async fn list(&self, thread_id: &str, filter: &HistoryFilter) -> Result<Vec<StateSnapshot>>;

    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}

fn pick(snapshots: &[StateSnapshot], checkpoint_id: Option<&str>) -> Option<StateSnapshot> {
    match checkpoint_id {
        Some(id) => snapshots.iter().find(|s| s.checkpoint_id == id).cloned(),
        None => snapshots.last().cloned(),
    }
}

#[derive(Default)]
pub struct InMemoryCheckpointer {
    threads: RwLock<HashMap<String, Vec<StateSnapshot>>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn put(&self, snapshot: StateSnapshot) -> Result<()> {
        self.threads
            .write()
            .entry(snapshot.thread_id.clone())
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn get(&self, thread_id: &str, checkpoint_id: Option<&str>) -> Result<Option<StateSnapshot>> {
        Ok(self
            .threads
            .read()
            .get(thread_id)
            .and_then(|snapshots| pick(snapshots, checkpoint_id)))
    }

    async fn list(&self, thread_id: &str, filter: &HistoryFilter) -> Result<Vec<StateSnapshot>> {
        Ok(self
            .threads
            .read()
            .get(thread_id)
            .map(|snapshots| filter.apply(snapshots))
            .unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.threads.write().remove(thread_id);
        Ok(())
    }
}

/// One JSON file per thread under a directory.
pub struct FileCheckpointer {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointer {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint dir {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn thread_path(&self, thread_id: &str) -> Result<PathBuf> {
        let valid = !thread_id.is_empty()
            && thread_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(anyhow!("Invalid thread id: {:?}", thread_id));
        }
        Ok(self.dir.join(format!("{}.json", thread_id)))
    }

    async fn load(&self, thread_id: &str) -> Result<Vec<StateSnapshot>> {
        let path = self.thread_path(thread_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse checkpoints {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read checkpoints {}", path.display())),
        }
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn put(&self, snapshot: StateSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.thread_path(&snapshot.thread_id)?;
        let mut snapshots = self.load(&snapshot.thread_id).await?;
        snapshots.push(snapshot);

        let json = serde_json::to_string(&snapshots).context("Failed to serialize checkpoints")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, thread_id: &str, checkpoint_id: Option<&str>) -> Result<Option<StateSnapshot>> {
        Ok(pick(&self.load(thread_id).await?, checkpoint_id))
    }

    async fn list(&self, thread_id: &str, filter: &HistoryFilter) -> Result<Vec<StateSnapshot>> {
        Ok(filter.apply(&self.load(thread_id).await?))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.thread_path(thread_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}
