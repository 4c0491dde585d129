//! API descriptor surface (`SPEC_FULL.md` §4.12). Reflection-based method
//! discovery is an external collaborator (`spec.md` §1); this module is the
//! plain data shape the Call Dispatcher consumes instead, built by hand or
//! by a codegen tool. Builder ergonomics follow the teacher's `*Builder`
//! pattern rather than a derive macro.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::dispatcher::CallContext;
use crate::error::RpcError;

pub type MethodHandler =
    Arc<dyn Fn(CallContext) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Refuses a call; the first refusal in `authorization` wins
/// (`spec.md` §4.8 "Evaluate authorization attributes in order").
pub trait AuthorizationPredicate: Send + Sync {
    fn authorize(&self, context: &CallContext) -> Result<(), String>;
}

/// The `{from, to?, newer_name?}` version-range attribute (`spec.md` §9).
#[derive(Debug, Clone, Default)]
pub struct VersionRange {
    pub from: u32,
    pub to: Option<u32>,
    pub newer_name: Option<String>,
}

impl VersionRange {
    pub fn contains(&self, hl_version: u32) -> bool {
        hl_version >= self.from && self.to.map_or(true, |to| hl_version <= to)
    }
}

#[derive(Clone)]
pub struct ParamDescriptor {
    pub name: String,
    pub dispose_parameter_value: bool,
    pub dispose_parameter_value_on_error: bool,
    /// Contextual parameters (processor handle, linked cancellation token)
    /// injected by the dispatcher rather than deserialized from the wire.
    pub no_rpc: bool,
}

impl ParamDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dispose_parameter_value: false,
            dispose_parameter_value_on_error: false,
            no_rpc: false,
        }
    }

    pub fn no_rpc(mut self) -> Self {
        self.no_rpc = true;
        self
    }

    pub fn dispose_on_return(mut self) -> Self {
        self.dispose_parameter_value = true;
        self
    }

    pub fn dispose_on_error(mut self) -> Self {
        self.dispose_parameter_value_on_error = true;
        self
    }
}

#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub handler: MethodHandler,
    pub params: Vec<ParamDescriptor>,
    pub dispose_on_return: bool,
    pub dispose_on_error: bool,
    pub disconnect_on_error: bool,
    pub authorization: Vec<Arc<dyn AuthorizationPredicate>>,
    pub scope_wrap: Option<u32>,
    pub version_range: VersionRange,
}

impl MethodDescriptor {
    pub fn builder(name: impl Into<String>, handler: MethodHandler) -> MethodDescriptorBuilder {
        MethodDescriptorBuilder {
            descriptor: MethodDescriptor {
                name: name.into(),
                handler,
                params: Vec::new(),
                dispose_on_return: false,
                dispose_on_error: false,
                disconnect_on_error: false,
                authorization: Vec::new(),
                scope_wrap: None,
                version_range: VersionRange {
                    from: 1,
                    to: None,
                    newer_name: None,
                },
            },
        }
    }
}

pub struct MethodDescriptorBuilder {
    descriptor: MethodDescriptor,
}

impl MethodDescriptorBuilder {
    pub fn param(mut self, param: ParamDescriptor) -> Self {
        self.descriptor.params.push(param);
        self
    }

    pub fn dispose_on_return(mut self) -> Self {
        self.descriptor.dispose_on_return = true;
        self
    }

    pub fn dispose_on_error(mut self) -> Self {
        self.descriptor.dispose_on_error = true;
        self
    }

    pub fn disconnect_on_error(mut self) -> Self {
        self.descriptor.disconnect_on_error = true;
        self
    }

    pub fn authorize(mut self, predicate: Arc<dyn AuthorizationPredicate>) -> Self {
        self.descriptor.authorization.push(predicate);
        self
    }

    pub fn scope_wrap(mut self, scope_type: u32) -> Self {
        self.descriptor.scope_wrap = Some(scope_type);
        self
    }

    pub fn version_range(mut self, range: VersionRange) -> Self {
        self.descriptor.version_range = range;
        self
    }

    pub fn build(self) -> MethodDescriptor {
        self.descriptor
    }
}

#[derive(Clone)]
pub struct ApiDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ApiDescriptor {
    pub fn builder(name: impl Into<String>) -> ApiDescriptorBuilder {
        ApiDescriptorBuilder {
            descriptor: ApiDescriptor {
                name: name.into(),
                methods: Vec::new(),
            },
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }
}

pub struct ApiDescriptorBuilder {
    descriptor: ApiDescriptor,
}

impl ApiDescriptorBuilder {
    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.descriptor.methods.push(method);
        self
    }

    pub fn build(self) -> ApiDescriptor {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_range_contains_is_inclusive() {
        let range = VersionRange {
            from: 2,
            to: Some(4),
            newer_name: None,
        };
        assert!(!range.contains(1));
        assert!(range.contains(2));
        assert!(range.contains(4));
        assert!(!range.contains(5));
    }

    #[test]
    fn builder_finds_method_by_name() {
        let handler: MethodHandler = Arc::new(|_ctx| Box::pin(async { Ok(Value::Null) }));
        let api = ApiDescriptor::builder("ServerApi")
            .method(MethodDescriptor::builder("Echo", handler).build())
            .build();
        assert!(api.method("Echo").is_some());
        assert!(api.method("Missing").is_none());
    }
}
