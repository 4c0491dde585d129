//! Call Dispatcher (`spec.md` §4.8): resolves `api`+`method`, authorizes,
//! deserializes parameters (materializing scopes where needed), injects
//! contextual parameters, executes, and builds the `Response`/
//! `ErrorResponse`. Grounded on the teacher's `invoke_tool_call`/
//! `invoke_app_call` (`mcp/client.rs`) run in reverse — callee side instead
//! of caller side.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{ApiDescriptor, MethodDescriptor};
use crate::codec::{DynamicValue, WireType};
use crate::error::RpcError;
use crate::message::{ErrorResponseBody, RequestBody, ResponseBody};
use crate::processor::Processor;
use crate::scope::cancellation::CancellationToken;
use crate::scope::ScopeValue;

/// A parameter whose wire value is a scope id rather than the scope's own
/// materialized value (`spec.md` §4.8 step 3, "if a parameter's value is a
/// `RpcScopeValue`, instantiate or resolve a `RemoteScope` for it"). The
/// scope itself travels out-of-band via `ScopeRegistration`, established
/// before the call that references it (e.g. `Processor::
/// create_cancellation_scope`); this DTO is just the numeric handle the
/// callee resolves back to the mirrored `RemoteScope`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RpcScopeRef {
    pub scope_id: u64,
}

impl WireType for RpcScopeRef {
    fn type_name() -> &'static str {
        "rpc.scope_ref"
    }
}

/// A pending inbound request being executed (`spec.md` §3 "Call
/// (context)"). Holds a non-owning handle to the processor so the method
/// body can call back into it (raise events, open scopes) without the
/// processor's ownership of its call-execution tasks becoming circular
/// (`spec.md` §9 "scopes hold a weak/non-owning reference to their
/// processor").
#[derive(Clone)]
pub struct CallContext {
    pub request_id: u64,
    pub api: String,
    pub method: String,
    pub params: Vec<DynamicValue>,
    pub cancellation: CancellationToken,
    pub processor: Arc<Processor>,
}

impl CallContext {
    /// Deserializes the `index`-th parameter as `T`, or `None` if the
    /// caller sent fewer parameters than the method declares.
    pub fn param<T: crate::codec::WireType>(&self, index: usize) -> Option<Result<T, RpcError>> {
        self.params.get(index).map(|p| p.decode(&self.processor.codec))
    }

    /// Decodes the `index`-th parameter as an [`RpcScopeRef`] and resolves
    /// it against this side's `RemoteScope` table — the callee half of
    /// `spec.md` §4.8 step 3. Returns `ScopeNotFound` if the caller's
    /// `ScopeRegistration` hasn't been processed yet; callers racing the
    /// two should retry briefly rather than treat this as permanent.
    pub async fn scope_param(&self, index: usize) -> Result<Arc<dyn ScopeValue>, RpcError> {
        let scope_ref: RpcScopeRef = self
            .param(index)
            .ok_or_else(|| RpcError::MethodNotFound {
                api: self.api.clone(),
                method: self.method.clone(),
            })??;
        self.processor
            .get_remote_scope(scope_ref.scope_id)
            .await
            .ok_or(RpcError::ScopeNotFound(scope_ref.scope_id))
    }
}

/// Runs the full pipeline for one inbound `Request` and returns the
/// message body to send back — `Response` on success, `ErrorResponse`
/// otherwise. Never propagates an `Err` itself: every failure mode in
/// `spec.md` §4.8 is call-local and collapses into an `ErrorResponse`.
pub async fn dispatch(
    processor: &Arc<Processor>,
    request_id: u64,
    request: RequestBody,
    cancellation: CancellationToken,
) -> DispatchOutcome {
    let api = match processor
        .config
        .apis
        .iter()
        .find(|a| a.name == request.api)
    {
        Some(api) => api,
        None => {
            return DispatchOutcome::error(
                "MethodNotFound",
                format!("no such api `{}`", request.api),
                false,
            )
        }
    };

    let method = match api.method(&request.method) {
        Some(method) => method,
        None => {
            return DispatchOutcome::error(
                "MethodNotFound",
                format!("no such method `{}.{}`", request.api, request.method),
                false,
            )
        }
    };

    let params = request.params;
    let context = CallContext {
        request_id,
        api: request.api.clone(),
        method: request.method.clone(),
        params: params.clone(),
        cancellation,
        processor: processor.clone(),
    };

    for predicate in &method.authorization {
        if let Err(reason) = predicate.authorize(&context) {
            return DispatchOutcome::error("Unauthorized", reason, method.disconnect_on_error);
        }
    }

    let outcome = match (method.handler)(context).await {
        Ok(value) => DispatchOutcome::Response(ResponseBody {
            value: Some(value_to_dynamic(value)),
        }),
        Err(err) => DispatchOutcome::error(remote_type_name(&err), err.to_string(), method.disconnect_on_error),
    };

    dispose_call_parameters(processor, method, &params, matches!(outcome, DispatchOutcome::Response(_))).await;

    outcome
}

/// Disposes each parameter flagged `dispose_on_return`/`dispose_on_error`
/// (`spec.md` §4.8 step 7): a parameter whose wire value was an
/// [`RpcScopeRef`] has its mirrored `RemoteScope` discarded once the call
/// no longer needs it.
async fn dispose_call_parameters(
    processor: &Arc<Processor>,
    method: &MethodDescriptor,
    params: &[DynamicValue],
    succeeded: bool,
) {
    for (index, param) in method.params.iter().enumerate() {
        let should_dispose = if succeeded {
            param.dispose_parameter_value || method.dispose_on_return
        } else {
            param.dispose_parameter_value_on_error || method.dispose_on_error
        };
        if !should_dispose {
            continue;
        }
        let Some(value) = params.get(index) else { continue };
        if let Ok(scope_ref) = value.decode::<RpcScopeRef>(&processor.codec) {
            processor.discard_remote_scope(scope_ref.scope_id).await;
        }
    }
}

/// Wraps a handler's raw JSON return value as a `DynamicValue` tagged
/// `json.value` — handlers that need a named wire type build their own
/// `DynamicValue` via [`DynamicValue::encode`] instead of returning
/// `serde_json::Value` directly.
fn value_to_dynamic(value: Value) -> DynamicValue {
    DynamicValue::untyped_json(value)
}

fn remote_type_name(err: &RpcError) -> &'static str {
    match err {
        RpcError::Unauthorized(_) => "Unauthorized",
        RpcError::MethodNotFound { .. } => "MethodNotFound",
        RpcError::ScopeNotFound(_) => "ScopeNotFound",
        RpcError::Cancelled => "Cancelled",
        RpcError::Timeout(_) => "Timeout",
        _ => "RpcError",
    }
}

pub enum DispatchOutcome {
    Response(ResponseBody),
    Error(ErrorResponseBody, bool),
}

impl DispatchOutcome {
    fn error(remote_type: impl Into<String>, message: impl Into<String>, disconnect: bool) -> Self {
        DispatchOutcome::Error(
            ErrorResponseBody {
                remote_type: remote_type.into(),
                message: message.into(),
            },
            disconnect,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, SerializerId};
    use crate::registry::MessageRegistry;

    #[test]
    fn rpc_scope_ref_round_trips_through_dynamic_value() {
        let codec = Codec::new(Arc::new(MessageRegistry::new()), 1024 * 1024);
        let encoded = DynamicValue::encode(&RpcScopeRef { scope_id: 7 }, SerializerId::Json).unwrap();
        let decoded: RpcScopeRef = encoded.decode(&codec).unwrap();
        assert_eq!(decoded.scope_id, 7);
    }
}
