//! Agent-scoped access to one context.

use std::sync::Arc;

use amp_primitives::AgentId;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::backing::BackingStore;
use crate::store::ContextCell;
use crate::{ContextError, ContextResult};

/// Handle given to capability handlers.
///
/// The handle acts as one agent: private reads and writes touch only that
/// agent's partition. Every operation fails with [`ContextError::NotFound`]
/// once the context is deleted or expired.
#[derive(Clone)]
pub struct ContextHandle {
    cell: Arc<ContextCell>,
    backing: Option<Arc<dyn BackingStore>>,
    agent: Option<AgentId>,
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("context_id", &self.cell.id)
            .field("agent", &self.agent)
            .finish()
    }
}

impl ContextHandle {
    pub(crate) fn new(
        cell: Arc<ContextCell>,
        backing: Option<Arc<dyn BackingStore>>,
        agent: Option<AgentId>,
    ) -> Self {
        Self {
            cell,
            backing,
            agent,
        }
    }

    /// Context id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.cell.id
    }

    /// Session bound to the context.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.cell.session_id.as_deref()
    }

    /// Agent the handle acts as.
    #[must_use]
    pub fn agent(&self) -> Option<&AgentId> {
        self.agent.as_ref()
    }

    /// Parent context id, if this context was forked.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.cell.lineage.parent_context_id.as_deref()
    }

    /// Root context id of the fork chain.
    #[must_use]
    pub fn root_id(&self) -> &str {
        &self.cell.lineage.root_context_id
    }

    fn ensure_live(&self) -> ContextResult<()> {
        if self.cell.is_live(Utc::now()) {
            Ok(())
        } else {
            Err(ContextError::not_found(&self.cell.id))
        }
    }

    async fn persist(&self, shared: &Map<String, Value>) -> ContextResult<()> {
        if let Some(backing) = &self.backing {
            backing.put(&self.cell.snapshot_with(shared)).await?;
        }
        Ok(())
    }

    /// Reads a shared key.
    ///
    /// # Errors
    ///
    /// Returns not-found for dead contexts or access-denied without read access.
    pub async fn get_shared(&self, key: &str) -> ContextResult<Option<Value>> {
        self.ensure_live()?;
        self.cell.check_read(self.agent.as_ref())?;
        Ok(self.cell.shared.lock().await.get(key).cloned())
    }

    /// Copies the whole shared map.
    ///
    /// # Errors
    ///
    /// Returns not-found for dead contexts or access-denied without read access.
    pub async fn shared_snapshot(&self) -> ContextResult<Map<String, Value>> {
        self.ensure_live()?;
        self.cell.check_read(self.agent.as_ref())?;
        Ok(self.cell.shared.lock().await.clone())
    }

    /// Writes a shared key, returning the previous value.
    ///
    /// # Errors
    ///
    /// Returns not-found for dead contexts, access-denied without write
    /// access, or a backing-store error.
    pub async fn set_shared(&self, key: impl Into<String>, value: Value) -> ContextResult<Option<Value>> {
        self.update_shared(key, |_| Some(value)).await
    }

    /// Removes a shared key, returning the previous value.
    ///
    /// # Errors
    ///
    /// Same as [`ContextHandle::set_shared`].
    pub async fn remove_shared(&self, key: &str) -> ContextResult<Option<Value>> {
        self.update_shared(key, |_| None).await
    }

    /// Atomically replaces a shared key with `update(current)`.
    ///
    /// Concurrent updates on the same context are linearised: each `update`
    /// observes the result of the previous one. Returning `None` removes the
    /// key. Returns the previous value.
    ///
    /// # Errors
    ///
    /// Same as [`ContextHandle::set_shared`].
    pub async fn update_shared<F>(&self, key: impl Into<String>, update: F) -> ContextResult<Option<Value>>
    where
        F: FnOnce(Option<&Value>) -> Option<Value> + Send,
    {
        self.ensure_live()?;
        self.cell.check_write(self.agent.as_ref())?;
        let key = key.into();
        let mut shared = self.cell.shared.lock().await;
        // Re-checked under the lock so a concurrent delete wins.
        self.ensure_live()?;
        let previous = match update(shared.get(&key)) {
            Some(value) => shared.insert(key, value),
            None => shared.remove(&key),
        };
        self.persist(&shared).await?;
        Ok(previous)
    }

    /// Reads a key from this agent's private partition.
    ///
    /// # Errors
    ///
    /// Returns not-found for dead contexts.
    pub async fn get_private(&self, key: &str) -> ContextResult<Option<Value>> {
        self.ensure_live()?;
        let owner = self.owner();
        Ok(self
            .cell
            .agents
            .get(&owner)
            .and_then(|partition| partition.get(key).cloned()))
    }

    /// Writes a key to this agent's private partition, returning the previous value.
    ///
    /// # Errors
    ///
    /// Returns not-found for dead contexts or a backing-store error.
    pub async fn set_private(&self, key: impl Into<String>, value: Value) -> ContextResult<Option<Value>> {
        self.ensure_live()?;
        let owner = self.owner();
        let previous = self
            .cell
            .agents
            .entry(owner)
            .or_default()
            .insert(key.into(), value);
        let shared = self.cell.shared.lock().await;
        self.persist(&shared).await?;
        Ok(previous)
    }

    /// Anonymous callers share one partition keyed by the reserved id.
    fn owner(&self) -> AgentId {
        self.agent.clone().unwrap_or_else(AgentId::anonymous)
    }
}

#[cfg(test)]
mod tests {
    use crate::{ContextOptions, ContextStore};
    use amp_primitives::AgentId;
    use serde_json::json;
    use std::sync::Arc;

    fn agent(id: &str) -> AgentId {
        AgentId::new(id).unwrap()
    }

    #[tokio::test]
    async fn private_partitions_are_isolated() {
        let store = ContextStore::default();
        let id = store.create(ContextOptions::default()).await.unwrap();
        let a = store.handle(&id, Some(agent("agent-a"))).await.unwrap();
        let b = store.handle(&id, Some(agent("agent-b"))).await.unwrap();

        a.set_private("secret", json!("alpha")).await.unwrap();
        assert_eq!(a.get_private("secret").await.unwrap(), Some(json!("alpha")));
        assert_eq!(b.get_private("secret").await.unwrap(), None);

        b.set_shared("public", json!(true)).await.unwrap();
        assert_eq!(a.get_shared("public").await.unwrap(), Some(json!(true)));
    }

    #[tokio::test]
    async fn concurrent_updates_are_linearised() {
        let store = ContextStore::default();
        let id = store.create(ContextOptions::default()).await.unwrap();
        let handle = Arc::new(store.handle(&id, None).await.unwrap());

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let handle = Arc::clone(&handle);
            tasks.push(tokio::spawn(async move {
                handle
                    .update_shared("counter", |current| {
                        let n = current.and_then(serde_json::Value::as_u64).unwrap_or(0);
                        Some(json!(n + 1))
                    })
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(handle.get_shared("counter").await.unwrap(), Some(json!(50)));
    }

    #[tokio::test]
    async fn write_acl_is_enforced() {
        let store = ContextStore::default();
        let acl = crate::AccessControl {
            read: Default::default(),
            write: [agent("agent-a")].into_iter().collect(),
        };
        let id = store
            .create(ContextOptions::default().with_access_control(acl))
            .await
            .unwrap();
        let a = store.handle(&id, Some(agent("agent-a"))).await.unwrap();
        let b = store.handle(&id, Some(agent("agent-b"))).await.unwrap();

        a.set_shared("k", json!(1)).await.unwrap();
        assert!(matches!(
            b.set_shared("k", json!(2)).await,
            Err(crate::ContextError::AccessDenied { operation: "write", .. })
        ));
        assert_eq!(b.get_shared("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn remove_shared_returns_previous() {
        let store = ContextStore::default();
        let id = store.create(ContextOptions::default()).await.unwrap();
        let handle = store.handle(&id, None).await.unwrap();
        handle.set_shared("k", json!("v")).await.unwrap();
        assert_eq!(handle.remove_shared("k").await.unwrap(), Some(json!("v")));
        assert!(handle.shared_snapshot().await.unwrap().is_empty());
    }
}
