//! Arena of live contexts indexed by id and session.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use amp_primitives::{AgentId, new_context_id};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backing::BackingStore;
use crate::handle::ContextHandle;
use crate::record::{AccessControl, ContextOptions, ContextSnapshot, Lineage};
use crate::{ContextError, ContextResult};

/// Store-wide settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextConfig {
    /// Lifetime applied to contexts created without an explicit ttl.
    pub default_ttl: Option<Duration>,
}

impl ContextConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::InvalidConfig`] for a zero default ttl.
    pub fn validate(&self) -> ContextResult<()> {
        if self.default_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(ContextError::InvalidConfig(
                "default_ttl must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// One live context.
///
/// Metadata is immutable; shared memory is serialised through a per-context
/// mutex; agent partitions are independent map entries.
pub(crate) struct ContextCell {
    pub(crate) id: String,
    pub(crate) session_id: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) expires_at: Option<DateTime<Utc>>,
    pub(crate) lineage: Lineage,
    pub(crate) access_control: AccessControl,
    pub(crate) shared: Mutex<Map<String, Value>>,
    pub(crate) agents: DashMap<AgentId, Map<String, Value>>,
    destroyed: AtomicBool,
}

impl ContextCell {
    fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        Self {
            id: snapshot.id,
            session_id: snapshot.session_id,
            created_at: snapshot.created_at,
            expires_at: snapshot.expires_at,
            lineage: snapshot.lineage,
            access_control: snapshot.access_control,
            shared: Mutex::new(snapshot.shared_memory),
            agents: snapshot.agent_memory.into_iter().collect(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.destroyed.load(Ordering::Acquire)
            && self.expires_at.is_none_or(|expires_at| expires_at > now)
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    /// Builds a snapshot given the already-locked shared map.
    pub(crate) fn snapshot_with(&self, shared: &Map<String, Value>) -> ContextSnapshot {
        ContextSnapshot {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            shared_memory: shared.clone(),
            agent_memory: self
                .agents
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            lineage: self.lineage.clone(),
            access_control: self.access_control.clone(),
        }
    }

    pub(crate) fn check_read(&self, agent: Option<&AgentId>) -> ContextResult<()> {
        if self.access_control.can_read(agent) {
            Ok(())
        } else {
            Err(self.denied(agent, "read"))
        }
    }

    pub(crate) fn check_write(&self, agent: Option<&AgentId>) -> ContextResult<()> {
        if self.access_control.can_write(agent) {
            Ok(())
        } else {
            Err(self.denied(agent, "write"))
        }
    }

    fn denied(&self, agent: Option<&AgentId>, operation: &'static str) -> ContextError {
        ContextError::AccessDenied {
            context_id: self.id.clone(),
            agent: agent.map_or_else(|| "anonymous".to_owned(), ToString::to_string),
            operation,
        }
    }
}

impl fmt::Debug for ContextCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextCell")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("expires_at", &self.expires_at)
            .field("lineage", &self.lineage)
            .finish_non_exhaustive()
    }
}

/// Owner of every context known to one runtime.
pub struct ContextStore {
    config: ContextConfig,
    cells: DashMap<String, Arc<ContextCell>>,
    sessions: DashMap<String, String>,
    backing: Option<Arc<dyn BackingStore>>,
}

impl fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextStore")
            .field("config", &self.config)
            .field("contexts", &self.cells.len())
            .field("sessions", &self.sessions.len())
            .field("backing", &self.backing.is_some())
            .finish()
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self {
            config: ContextConfig::default(),
            cells: DashMap::new(),
            sessions: DashMap::new(),
            backing: None,
        }
    }
}

impl ContextStore {
    /// Creates a store.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: ContextConfig) -> ContextResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    /// Writes every mutation through to `backing` and loads misses from it.
    #[must_use]
    pub fn with_backing(mut self, backing: Arc<dyn BackingStore>) -> Self {
        self.backing = Some(backing);
        self
    }

    /// Number of live contexts held in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the store holds no contexts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Creates a root context and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::SessionExists`] when the session already has a
    /// live context, or a backing-store error.
    pub async fn create(&self, options: ContextOptions) -> ContextResult<String> {
        let id = new_context_id();
        let now = Utc::now();
        let snapshot = ContextSnapshot {
            id: id.clone(),
            session_id: options.session_id,
            created_at: now,
            expires_at: self.expiry_from(now, options.ttl),
            shared_memory: options.shared_memory,
            agent_memory: Default::default(),
            lineage: Lineage {
                parent_context_id: None,
                root_context_id: id.clone(),
            },
            access_control: options.access_control,
        };
        self.install(snapshot).await?;
        debug!(context_id = %id, "context created");
        Ok(id)
    }

    fn expiry_from(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.or(self.config.default_ttl)
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl))
    }

    async fn install(&self, snapshot: ContextSnapshot) -> ContextResult<()> {
        let now = Utc::now();
        if let Some(session_id) = &snapshot.session_id {
            match self.sessions.entry(session_id.clone()) {
                Entry::Occupied(mut entry) => {
                    let current = entry.get().clone();
                    if self.live_cell(&current, now).is_some() {
                        return Err(ContextError::SessionExists {
                            session_id: session_id.clone(),
                            context_id: current,
                        });
                    }
                    entry.insert(snapshot.id.clone());
                }
                Entry::Vacant(entry) => {
                    entry.insert(snapshot.id.clone());
                }
            }
        }

        if let Some(backing) = &self.backing {
            backing.put(&snapshot).await?;
        }
        self.cells.insert(
            snapshot.id.clone(),
            Arc::new(ContextCell::from_snapshot(snapshot)),
        );
        Ok(())
    }

    fn live_cell(&self, id: &str, now: DateTime<Utc>) -> Option<Arc<ContextCell>> {
        self.cells
            .get(id)
            .map(|cell| Arc::clone(cell.value()))
            .filter(|cell| cell.is_live(now))
    }

    async fn cell(&self, id: &str) -> ContextResult<Arc<ContextCell>> {
        let now = Utc::now();
        if let Some(cell) = self.cells.get(id).map(|cell| Arc::clone(cell.value())) {
            if cell.is_live(now) {
                return Ok(cell);
            }
            self.evict(&cell).await;
            return Err(ContextError::not_found(id));
        }

        let Some(backing) = &self.backing else {
            return Err(ContextError::not_found(id));
        };
        let Some(snapshot) = backing.get(id).await? else {
            return Err(ContextError::not_found(id));
        };
        if snapshot.is_expired(now) {
            backing.delete(id).await?;
            return Err(ContextError::not_found(id));
        }

        let session_id = snapshot.session_id.clone();
        let cell = match self.cells.entry(id.to_owned()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let cell = Arc::new(ContextCell::from_snapshot(snapshot));
                entry.insert(Arc::clone(&cell));
                cell
            }
        };
        if let Some(session_id) = session_id {
            self.sessions.entry(session_id).or_insert_with(|| id.to_owned());
        }
        debug!(context_id = %id, "context loaded from backing store");
        Ok(cell)
    }

    async fn evict(&self, cell: &Arc<ContextCell>) {
        cell.destroy();
        self.cells.remove_if(&cell.id, |_, current| Arc::ptr_eq(current, cell));
        if let Some(session_id) = &cell.session_id {
            self.sessions
                .remove_if(session_id, |_, context_id| context_id == &cell.id);
        }
        if let Some(backing) = &self.backing {
            if let Err(err) = backing.delete(&cell.id).await {
                warn!(?err, context_id = %cell.id, "failed to delete context from backing store");
            }
        }
    }

    /// Returns a point-in-time copy of a context.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] for unknown, expired, or deleted ids.
    pub async fn snapshot(&self, id: &str) -> ContextResult<ContextSnapshot> {
        let cell = self.cell(id).await?;
        let shared = cell.shared.lock().await;
        Ok(cell.snapshot_with(&shared))
    }

    /// Resolves the live context bound to `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::SessionNotFound`] when no live context is bound.
    pub async fn resolve_session(&self, session_id: &str) -> ContextResult<String> {
        let id = self
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ContextError::SessionNotFound {
                session_id: session_id.to_owned(),
            })?;
        match self.cell(&id).await {
            Ok(_) => Ok(id),
            Err(ContextError::NotFound { .. }) => Err(ContextError::SessionNotFound {
                session_id: session_id.to_owned(),
            }),
            Err(err) => Err(err),
        }
    }

    /// Returns a handle on context `id` acting as `agent`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] for unknown, expired, or deleted ids.
    pub async fn handle(&self, id: &str, agent: Option<AgentId>) -> ContextResult<ContextHandle> {
        let cell = self.cell(id).await?;
        Ok(ContextHandle::new(cell, self.backing.clone(), agent))
    }

    /// Returns a handle on the context bound to `session_id`, creating a root
    /// context for the session when `create_missing` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::SessionNotFound`] when the session has no live
    /// context and `create_missing` is false.
    pub async fn session_handle(
        &self,
        session_id: &str,
        agent: Option<AgentId>,
        create_missing: bool,
    ) -> ContextResult<ContextHandle> {
        let id = match self.resolve_session(session_id).await {
            Ok(id) => id,
            Err(ContextError::SessionNotFound { .. }) if create_missing => {
                match self.create(ContextOptions::for_session(session_id)).await {
                    Ok(id) => id,
                    Err(ContextError::SessionExists { context_id, .. }) => context_id,
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };
        self.handle(&id, agent).await
    }

    /// Forks `source_id` into a new context.
    ///
    /// Shared memory is copied by value; agent partitions are not copied.
    /// The child's parent is the source and its root is the source's root.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] for a missing source,
    /// [`ContextError::AccessDenied`] when `agent` may not read it, or
    /// [`ContextError::SessionExists`] when `session_id` is taken.
    pub async fn fork(
        &self,
        source_id: &str,
        agent: Option<&AgentId>,
        session_id: Option<String>,
    ) -> ContextResult<String> {
        let source = self.cell(source_id).await?;
        source.check_read(agent)?;
        let shared = source.shared.lock().await.clone();

        let id = new_context_id();
        let snapshot = ContextSnapshot {
            id: id.clone(),
            session_id,
            created_at: Utc::now(),
            expires_at: source.expires_at,
            shared_memory: shared,
            agent_memory: Default::default(),
            lineage: Lineage {
                parent_context_id: Some(source.id.clone()),
                root_context_id: source.lineage.root_context_id.clone(),
            },
            access_control: source.access_control.clone(),
        };
        self.install(snapshot).await?;
        debug!(context_id = %id, parent = %source.id, "context forked");
        Ok(id)
    }

    /// Merges the shared memory of `child_id` into its parent; child keys win.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NoParent`] for root contexts,
    /// [`ContextError::NotFound`] when either context is gone, or
    /// [`ContextError::AccessDenied`] when `agent` may not read the child or
    /// write the parent.
    pub async fn merge(&self, child_id: &str, agent: Option<&AgentId>) -> ContextResult<()> {
        let child = self.cell(child_id).await?;
        child.check_read(agent)?;
        let parent_id = child
            .lineage
            .parent_context_id
            .clone()
            .ok_or_else(|| ContextError::NoParent {
                id: child_id.to_owned(),
            })?;
        let parent = self.cell(&parent_id).await?;
        parent.check_write(agent)?;

        let updates = child.shared.lock().await.clone();
        let mut shared = parent.shared.lock().await;
        shared.extend(updates);
        if let Some(backing) = &self.backing {
            backing.put(&parent.snapshot_with(&shared)).await?;
        }
        debug!(child = %child_id, parent = %parent_id, "context merged");
        Ok(())
    }

    /// Destroys a context. Later lookups return not-found.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] for unknown ids.
    pub async fn delete(&self, id: &str) -> ContextResult<()> {
        let cell = self.cell(id).await?;
        self.evict(&cell).await;
        debug!(context_id = %id, "context deleted");
        Ok(())
    }

    /// Destroys every context expired at `now`, returning how many were removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Arc<ContextCell>> = self
            .cells
            .iter()
            .filter(|entry| !entry.value().is_live(now))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for cell in &expired {
            self.evict(cell).await;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired contexts swept");
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::InMemoryBackingStore;
    use serde_json::json;

    fn agent(id: &str) -> AgentId {
        AgentId::new(id).unwrap()
    }

    #[tokio::test]
    async fn fork_copies_shared_by_value() {
        let store = ContextStore::default();
        let parent = store.create(ContextOptions::for_session("s-1")).await.unwrap();
        let handle = store.handle(&parent, None).await.unwrap();
        handle.set_shared("topic", json!("weather")).await.unwrap();

        let child = store.fork(&parent, None, None).await.unwrap();
        handle.set_shared("topic", json!("sports")).await.unwrap();

        let child_snapshot = store.snapshot(&child).await.unwrap();
        assert_eq!(child_snapshot.shared_memory["topic"], json!("weather"));
        assert_eq!(child_snapshot.lineage.parent_context_id.as_deref(), Some(parent.as_str()));
        assert_eq!(child_snapshot.lineage.root_context_id, parent);

        let grandchild = store.fork(&child, None, None).await.unwrap();
        let snapshot = store.snapshot(&grandchild).await.unwrap();
        assert_eq!(snapshot.lineage.root_context_id, parent);
    }

    #[tokio::test]
    async fn merge_child_wins() {
        let store = ContextStore::default();
        let parent = store.create(ContextOptions::default()).await.unwrap();
        let parent_handle = store.handle(&parent, None).await.unwrap();
        parent_handle.set_shared("a", json!(1)).await.unwrap();
        parent_handle.set_shared("b", json!(1)).await.unwrap();

        let child = store.fork(&parent, None, None).await.unwrap();
        let child_handle = store.handle(&child, None).await.unwrap();
        child_handle.set_shared("b", json!(2)).await.unwrap();
        child_handle.set_shared("c", json!(3)).await.unwrap();

        store.merge(&child, None).await.unwrap();
        let merged = store.snapshot(&parent).await.unwrap().shared_memory;
        assert_eq!(merged["a"], json!(1));
        assert_eq!(merged["b"], json!(2));
        assert_eq!(merged["c"], json!(3));

        let err = store.merge(&parent, None).await.unwrap_err();
        assert!(matches!(err, ContextError::NoParent { .. }));
    }

    #[tokio::test]
    async fn deleted_context_not_found() {
        let store = ContextStore::default();
        let id = store.create(ContextOptions::for_session("s-2")).await.unwrap();
        let handle = store.handle(&id, None).await.unwrap();
        store.delete(&id).await.unwrap();

        assert!(matches!(store.snapshot(&id).await, Err(ContextError::NotFound { .. })));
        assert!(matches!(
            store.resolve_session("s-2").await,
            Err(ContextError::SessionNotFound { .. })
        ));
        let err = handle.get_shared("x").await.unwrap_err();
        assert!(matches!(err, ContextError::NotFound { .. }));
    }

    #[tokio::test]
    async fn expired_contexts_are_swept() {
        let store = ContextStore::default();
        let id = store
            .create(ContextOptions::default().with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        let keep = store.create(ContextOptions::default()).await.unwrap();

        assert_eq!(store.sweep_expired(Utc::now()).await, 0);
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(store.sweep_expired(later).await, 1);
        assert!(store.snapshot(&id).await.is_err());
        assert!(store.snapshot(&keep).await.is_ok());
    }

    #[tokio::test]
    async fn session_binding_is_exclusive() {
        let store = ContextStore::default();
        let id = store.create(ContextOptions::for_session("s-3")).await.unwrap();
        let err = store
            .create(ContextOptions::for_session("s-3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::SessionExists { .. }));
        assert_eq!(store.resolve_session("s-3").await.unwrap(), id);
    }

    #[tokio::test]
    async fn session_handle_creates_on_demand() {
        let store = ContextStore::default();
        assert!(store.session_handle("s-4", None, false).await.is_err());
        let handle = store.session_handle("s-4", None, true).await.unwrap();
        assert_eq!(handle.session_id(), Some("s-4"));
        assert_eq!(store.resolve_session("s-4").await.unwrap(), handle.id());
    }

    #[tokio::test]
    async fn fork_respects_read_acl() {
        let store = ContextStore::default();
        let acl = AccessControl {
            read: [agent("agent-a")].into_iter().collect(),
            write: Default::default(),
        };
        let id = store
            .create(ContextOptions::default().with_access_control(acl))
            .await
            .unwrap();
        assert!(store.fork(&id, Some(&agent("agent-a")), None).await.is_ok());
        let err = store.fork(&id, Some(&agent("agent-b")), None).await.unwrap_err();
        assert!(matches!(err, ContextError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn backing_store_write_through_and_load_on_miss() {
        let backing = Arc::new(InMemoryBackingStore::new());
        let first = ContextStore::default().with_backing(backing.clone());
        let id = first.create(ContextOptions::for_session("s-5")).await.unwrap();
        first
            .handle(&id, Some(agent("agent-a")))
            .await
            .unwrap()
            .set_private("note", json!("mine"))
            .await
            .unwrap();

        let second = ContextStore::default().with_backing(backing.clone());
        let handle = second.handle(&id, Some(agent("agent-a"))).await.unwrap();
        assert_eq!(handle.get_private("note").await.unwrap(), Some(json!("mine")));
        assert_eq!(second.resolve_session("s-5").await.unwrap(), id);

        second.delete(&id).await.unwrap();
        assert!(backing.is_empty().await);
    }
}
