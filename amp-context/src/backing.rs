//! Durable backing stores for context snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;

use crate::record::ContextSnapshot;
use crate::{ContextError, ContextResult};

/// Trait implemented by durable context stores.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Loads a snapshot by context id.
    async fn get(&self, context_id: &str) -> ContextResult<Option<ContextSnapshot>>;

    /// Stores a snapshot, replacing any previous one with the same id.
    async fn put(&self, snapshot: &ContextSnapshot) -> ContextResult<()>;

    /// Removes a snapshot. Missing ids are not an error.
    async fn delete(&self, context_id: &str) -> ContextResult<()>;
}

/// Process-local backing store.
#[derive(Debug, Default)]
pub struct InMemoryBackingStore {
    snapshots: RwLock<HashMap<String, ContextSnapshot>>,
}

impl InMemoryBackingStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn get(&self, context_id: &str) -> ContextResult<Option<ContextSnapshot>> {
        Ok(self.snapshots.read().await.get(context_id).cloned())
    }

    async fn put(&self, snapshot: &ContextSnapshot) -> ContextResult<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, context_id: &str) -> ContextResult<()> {
        self.snapshots.write().await.remove(context_id);
        Ok(())
    }
}

/// Directory-backed store writing one JSON file per context.
#[derive(Debug)]
pub struct FileBackingStore {
    root: PathBuf,
}

impl FileBackingStore {
    /// Opens (or creates) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors encountered while creating the directory.
    pub async fn open(root: impl Into<PathBuf>) -> ContextResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Returns the directory holding snapshot files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, context_id: &str) -> ContextResult<PathBuf> {
        let safe = !context_id.is_empty()
            && context_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        if !safe {
            return Err(ContextError::InvalidId {
                id: context_id.to_owned(),
            });
        }
        Ok(self.root.join(format!("{context_id}.json")))
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    async fn get(&self, context_id: &str) -> ContextResult<Option<ContextSnapshot>> {
        let path = self.path_for(context_id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, snapshot: &ContextSnapshot) -> ContextResult<()> {
        let path = self.path_for(&snapshot.id)?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec(snapshot)?).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn delete(&self, context_id: &str) -> ContextResult<()> {
        let path = self.path_for(context_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
