//! Scope subsystem (`spec.md` §4.5): a symmetric master/consumer lifecycle
//! for addressable state that outlives a single call — cancellation tokens,
//! streams, and simple triggerable handles.

pub mod cancellation;
pub mod registry;
pub mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::codec::DynamicValue;
use crate::error::RpcError;

/// Reserved and user-defined scope type identifiers (`spec.md` §3 "Scope
/// types").
pub mod scope_type {
    pub const STREAM: u32 = 0;
    /// Reserved, deliberately unimplemented (`spec.md` §9 open question).
    pub const ENUMERABLE: u32 = 1;
    pub const CANCELLATION: u32 = 2;
    pub const USER_DEFINED_MIN: u32 = 256;
}

/// Teardown state machine shared by [`LocalScope`] and [`RemoteScope`]
/// (`spec.md` §4.5 diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Creating,
    Active,
    Discarded,
    Disposed,
}

/// An opaque scope-held resource. Concrete scope types (cancellation,
/// stream) downcast through this via `Any`; the scope tables themselves
/// never need to know the concrete type.
pub trait ScopeValue: std::any::Any + Send + Sync {
    fn as_any(&self) -> &dyn std::any::Any;
}

impl<T: std::any::Any + Send + Sync> ScopeValue for T {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Master-side scope: the owner (`spec.md` §3 "Scope (master side,
/// LocalScope)").
pub struct LocalScope {
    pub id: u64,
    pub key: Option<String>,
    pub scope_type: u32,
    pub value: Arc<dyn ScopeValue>,
    pub dispose_value: bool,
    pub dispose_value_on_error: bool,
    pub inform_consumer_when_disposing: bool,
    pub replace_existing_scope: bool,
    pub state: ScopeState,
    pub is_stored: bool,
    pub is_error: bool,
    pub last_exception: Option<String>,
}

impl LocalScope {
    /// `should_dispose = dispose_value OR (is_error AND
    /// dispose_value_on_error)` (`spec.md` §4.5 "Disposal policy").
    pub fn should_dispose(&self) -> bool {
        self.dispose_value || (self.is_error && self.dispose_value_on_error)
    }
}

/// Consumer-side mirror (`spec.md` §3 "RemoteScope (consumer side)").
pub struct RemoteScope {
    pub id: u64,
    pub key: Option<String>,
    pub scope_type: u32,
    pub scope_value: DynamicValue,
    pub materialized: Arc<dyn ScopeValue>,
    pub dispose_value: bool,
    pub dispose_value_on_error: bool,
    pub inform_master_when_disposing: bool,
    pub state: ScopeState,
    pub is_error: bool,
}

impl RemoteScope {
    pub fn should_dispose(&self) -> bool {
        self.dispose_value || (self.is_error && self.dispose_value_on_error)
    }
}

/// Releases a scope value's held resources, if the concrete type has any to
/// release. Free function rather than a `ScopeValue` method: the blanket
/// `impl<T> ScopeValue for T` above means no concrete type can override a
/// trait method without an overlapping-impl error, so disposal dispatches by
/// downcasting instead (`spec.md` §4.5 "disposed" step).
pub(crate) async fn dispose_scope_value(value: &Arc<dyn ScopeValue>) {
    if let Some(stream) = value.as_any().downcast_ref::<stream::StreamScope>() {
        stream.close().await;
    }
}

/// The four id/key-indexed maps a [`crate::processor::Processor`] holds
/// (`spec.md` §4.5): `local_scopes`/`keyed_local_scopes` on the master
/// side, `remote_scopes`/`keyed_remote_scopes` on the consumer side.
/// Compound lookup-then-insert operations are serialized by the single
/// `Mutex` guarding all four maps, upholding the "no duplicate key"
/// invariant without a separate global lock (`spec.md` §5 "Shared
/// resources").
pub struct ScopeTables {
    next_scope_id: AtomicU64,
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    local_scopes: HashMap<u64, LocalScope>,
    keyed_local_scopes: HashMap<String, u64>,
    remote_scopes: HashMap<u64, RemoteScope>,
    keyed_remote_scopes: HashMap<String, u64>,
}

impl ScopeTables {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_scope_id: AtomicU64::new(1),
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn next_scope_id(&self) -> u64 {
        self.next_scope_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Inserts a newly created local scope, honoring `replace_existing_scope`
    /// and returning the displaced entry (already removed from both tables,
    /// left for the caller to dispose) if a keyed collision was replaced.
    pub async fn insert_local(&self, scope: LocalScope) -> Result<Option<LocalScope>, RpcError> {
        let mut inner = self.inner.lock().await;
        if inner.local_scopes.len() >= self.capacity {
            return Err(RpcError::TooManyScopes {
                capacity: self.capacity,
            });
        }
        let mut displaced = None;
        if let Some(key) = scope.key.clone() {
            if let Some(&existing_id) = inner.keyed_local_scopes.get(&key) {
                if !scope.replace_existing_scope {
                    return Err(RpcError::DuplicateScopeKey(key));
                }
                inner.keyed_local_scopes.remove(&key);
                displaced = inner.local_scopes.remove(&existing_id);
            }
            if scope.is_stored {
                inner.keyed_local_scopes.insert(key, scope.id);
            }
        }
        inner.local_scopes.insert(scope.id, scope);
        Ok(displaced)
    }

    pub async fn local_by_id(&self, id: u64) -> Option<Arc<dyn ScopeValue>> {
        self.inner
            .lock()
            .await
            .local_scopes
            .get(&id)
            .map(|s| s.value.clone())
    }

    pub async fn local_id_by_key(&self, key: &str) -> Option<u64> {
        self.inner.lock().await.keyed_local_scopes.get(key).copied()
    }

    pub async fn mark_local_triggered(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(scope) = inner.local_scopes.get_mut(&id) {
            scope.state = ScopeState::Active;
            true
        } else {
            false
        }
    }

    /// Removes a local scope from both indexes (master-initiated or
    /// peer-acknowledged discard); returns it for disposal by the caller.
    pub async fn discard_local(&self, id: u64) -> Option<LocalScope> {
        let mut inner = self.inner.lock().await;
        let scope = inner.local_scopes.remove(&id)?;
        if let Some(key) = &scope.key {
            inner.keyed_local_scopes.remove(key);
        }
        Some(scope)
    }

    pub async fn insert_remote(&self, scope: RemoteScope) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().await;
        if inner.remote_scopes.len() >= self.capacity {
            return Err(RpcError::TooManyScopes {
                capacity: self.capacity,
            });
        }
        if let Some(key) = &scope.key {
            inner.keyed_remote_scopes.insert(key.clone(), scope.id);
        }
        inner.remote_scopes.insert(scope.id, scope);
        Ok(())
    }

    pub async fn remote_id_by_key(&self, key: &str) -> Option<u64> {
        self.inner.lock().await.keyed_remote_scopes.get(key).copied()
    }

    pub async fn remote_by_id(&self, id: u64) -> Option<Arc<dyn ScopeValue>> {
        self.inner
            .lock()
            .await
            .remote_scopes
            .get(&id)
            .map(|s| s.materialized.clone())
    }

    pub async fn discard_remote(&self, id: u64) -> Option<RemoteScope> {
        let mut inner = self.inner.lock().await;
        let scope = inner.remote_scopes.remove(&id)?;
        if let Some(key) = &scope.key {
            inner.keyed_remote_scopes.remove(key);
        }
        Some(scope)
    }

    /// Drains both tables for processor shutdown; caller disposes each
    /// entry and suppresses `inform_*` messages per `spec.md` §4.5 "On
    /// processor shutdown".
    pub async fn drain_all(&self) -> (Vec<LocalScope>, Vec<RemoteScope>) {
        let mut inner = self.inner.lock().await;
        inner.keyed_local_scopes.clear();
        inner.keyed_remote_scopes.clear();
        (
            inner.local_scopes.drain().map(|(_, v)| v).collect(),
            inner.remote_scopes.drain().map(|(_, v)| v).collect(),
        )
    }

    #[cfg(test)]
    pub async fn local_len(&self) -> usize {
        self.inner.lock().await.local_scopes.len()
    }

    #[cfg(test)]
    pub async fn keyed_local_len(&self) -> usize {
        self.inner.lock().await.keyed_local_scopes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(id: u64, key: Option<&str>) -> LocalScope {
        LocalScope {
            id,
            key: key.map(String::from),
            scope_type: scope_type::CANCELLATION,
            value: Arc::new(()),
            dispose_value: false,
            dispose_value_on_error: false,
            inform_consumer_when_disposing: true,
            replace_existing_scope: true,
            state: ScopeState::Creating,
            is_stored: key.is_some(),
            is_error: false,
            last_exception: None,
        }
    }

    #[tokio::test]
    async fn keyed_lookup_matches_id_lookup() {
        let tables = ScopeTables::new(8);
        tables.insert_local(scope(1, Some("k"))).await.unwrap();
        assert_eq!(tables.local_id_by_key("k").await, Some(1));
        assert!(tables.local_by_id(1).await.is_some());
    }

    #[tokio::test]
    async fn duplicate_key_without_replace_fails() {
        let tables = ScopeTables::new(8);
        tables.insert_local(scope(1, Some("k"))).await.unwrap();
        let mut second = scope(2, Some("k"));
        second.replace_existing_scope = false;
        let result = tables.insert_local(second).await;
        assert!(matches!(result, Err(RpcError::DuplicateScopeKey(_))));
    }

    #[tokio::test]
    async fn replace_existing_scope_displaces_old_entry() {
        let tables = ScopeTables::new(8);
        tables.insert_local(scope(1, Some("k"))).await.unwrap();
        let displaced = tables.insert_local(scope(2, Some("k"))).await.unwrap();
        assert_eq!(displaced.unwrap().id, 1);
        assert_eq!(tables.local_id_by_key("k").await, Some(2));
        assert_eq!(tables.local_len().await, 1);
    }

    #[tokio::test]
    async fn discard_empties_both_indexes() {
        let tables = ScopeTables::new(8);
        tables.insert_local(scope(1, Some("k"))).await.unwrap();
        tables.discard_local(1).await.unwrap();
        assert_eq!(tables.local_len().await, 0);
        assert_eq!(tables.keyed_local_len().await, 0);
    }

    #[tokio::test]
    async fn discard_is_idempotent() {
        let tables = ScopeTables::new(8);
        tables.insert_local(scope(1, Some("k"))).await.unwrap();
        assert!(tables.discard_local(1).await.is_some());
        assert!(tables.discard_local(1).await.is_none());
    }
}
