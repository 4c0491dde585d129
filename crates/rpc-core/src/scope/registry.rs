//! Process-wide Scope Registry (`spec.md` §4.4): keyed by scope type-id,
//! carrying the factories a processor needs to materialize either side of
//! a scope. Registration is additive and must happen before the first
//! processor starts (`spec.md` §6 "Process-wide state").

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::codec::DynamicValue;
use crate::error::RpcError;

use super::{scope_type, ScopeValue};

/// Builds a fresh local (master-owned) resource for a scope of this type,
/// e.g. a new `CancellationToken` source.
pub type CreateLocalFromParameter = Arc<dyn Fn() -> Arc<dyn ScopeValue> + Send + Sync>;

/// Materializes the consumer-side resource from the received
/// `ScopeRegistration` DTO, e.g. a mirrored cancellation token.
pub type CreateRemoteFromValue =
    Arc<dyn Fn(&DynamicValue) -> Result<Arc<dyn ScopeValue>, RpcError> + Send + Sync>;

/// A process-wide entry describing one scope type.
#[derive(Clone)]
pub struct ScopeTypeDescriptor {
    pub type_id: u32,
    pub name: &'static str,
    pub create_local_from_parameter: Option<CreateLocalFromParameter>,
    pub create_remote_from_value: Option<CreateRemoteFromValue>,
}

impl ScopeTypeDescriptor {
    pub fn new(type_id: u32, name: &'static str) -> Self {
        Self {
            type_id,
            name,
            create_local_from_parameter: None,
            create_remote_from_value: None,
        }
    }

    pub fn with_local_factory(mut self, factory: CreateLocalFromParameter) -> Self {
        self.create_local_from_parameter = Some(factory);
        self
    }

    pub fn with_remote_factory(mut self, factory: CreateRemoteFromValue) -> Self {
        self.create_remote_from_value = Some(factory);
        self
    }
}

/// Process-wide table of [`ScopeTypeDescriptor`]s. Type id 1 (Enumerable)
/// is permanently reserved and can never be registered (`spec.md` §9 open
/// question: "reserved but incomplete").
pub struct ScopeRegistry {
    entries: RwLock<HashMap<u32, ScopeTypeDescriptor>>,
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `descriptor`. Fails if `type_id` is the reserved
    /// Enumerable slot or already registered (`spec.md` §4.4 "collisions
    /// are rejected").
    pub fn register(&self, descriptor: ScopeTypeDescriptor) -> Result<(), RpcError> {
        if descriptor.type_id == scope_type::ENUMERABLE {
            return Err(RpcError::ReservedScopeType(descriptor.type_id));
        }
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&descriptor.type_id) {
            return Err(RpcError::ReservedScopeType(descriptor.type_id));
        }
        entries.insert(descriptor.type_id, descriptor);
        Ok(())
    }

    pub fn get(&self, type_id: u32) -> Option<ScopeTypeDescriptor> {
        self.entries.read().unwrap().get(&type_id).cloned()
    }

    pub fn is_disabled(&self, type_id: u32, disabled: &[u32]) -> bool {
        disabled.contains(&type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_the_reserved_enumerable_type() {
        let registry = ScopeRegistry::new();
        let result = registry.register(ScopeTypeDescriptor::new(scope_type::ENUMERABLE, "enumerable"));
        assert!(matches!(result, Err(RpcError::ReservedScopeType(1))));
    }

    #[test]
    fn rejects_duplicate_registration() {
        let registry = ScopeRegistry::new();
        registry
            .register(ScopeTypeDescriptor::new(scope_type::CANCELLATION, "cancellation"))
            .unwrap();
        let result = registry.register(ScopeTypeDescriptor::new(scope_type::CANCELLATION, "cancellation"));
        assert!(result.is_err());
    }

    #[test]
    fn registered_descriptor_is_retrievable() {
        let registry = ScopeRegistry::new();
        registry
            .register(ScopeTypeDescriptor::new(scope_type::STREAM, "stream"))
            .unwrap();
        assert!(registry.get(scope_type::STREAM).is_some());
        assert!(registry.get(999).is_none());
    }
}
