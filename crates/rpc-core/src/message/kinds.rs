use serde::{Deserialize, Serialize};

use super::MessageKind;
use crate::codec::DynamicValue;
use crate::error::RpcError;

/// Call an API method (`spec.md` §3, type-id 0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBody {
    pub api: String,
    pub method: String,
    pub params: Vec<DynamicValue>,
}

/// Return value for a request (type-id 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody {
    pub value: Option<DynamicValue>,
}

/// Exception surfaced for a request (type-id 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponseBody {
    pub remote_type: String,
    pub message: String,
}

/// Cancel an in-flight request by id (type-id 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelBody {
    pub target_request_id: u64,
}

/// Processor-scoped event, optionally waiting (type-id 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBody {
    pub name: String,
    pub args: Option<DynamicValue>,
    pub waiting: bool,
}

/// Stream scope handshake (type-id 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStartBody {
    pub stream_id: u64,
    pub chunk_size: u32,
    pub max_length: Option<u64>,
    pub compression: Option<String>,
}

/// Stream data; `is_last` terminates (type-id 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunkBody {
    pub stream_id: u64,
    pub data: Vec<u8>,
    pub is_last: bool,
}

/// master→consumer: local scope gone (type-id 7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDiscardedBody {
    pub scope_id: u64,
}

/// consumer→master: remote scope gone (type-id 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteScopeDiscardedBody {
    pub scope_id: u64,
}

/// master→consumer trigger; `response_id` set iff the sender is waiting
/// for a response (`spec.md` §9: "waiting iff an id is assigned").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeTriggerBody {
    pub scope_id: u64,
    pub response_id: Option<u64>,
    pub payload: Option<DynamicValue>,
}

/// consumer→master trigger (type-id 10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteScopeTriggerBody {
    pub scope_id: u64,
    pub response_id: Option<u64>,
    pub payload: Option<DynamicValue>,
}

/// master→consumer error within scope (type-id 11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeErrorBody {
    pub scope_id: u64,
    pub remote_type: String,
    pub message: String,
}

/// Scope-scoped event, master→consumer (type-id 13).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeEventBody {
    pub scope_id: u64,
    pub name: String,
    pub args: Option<DynamicValue>,
    pub waiting: bool,
}

/// Scope-scoped event, consumer→master (type-id 14).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteScopeEventBody {
    pub scope_id: u64,
    pub name: String,
    pub args: Option<DynamicValue>,
    pub waiting: bool,
}

/// master asks consumer to instantiate a mirror (type-id 15). Carries the
/// `RpcScopeValue` DTO described in `spec.md` §4.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeRegistrationBody {
    pub scope_id: u64,
    pub key: Option<String>,
    pub replace_existing_scope: bool,
    pub scope_type: u32,
    pub is_stored: bool,
    pub dispose_scope_value: bool,
    pub dispose_scope_value_on_error: bool,
    pub inform_master_when_disposing: bool,
    pub extensions: Option<DynamicValue>,
}

/// Announce shutdown; no id (type-id 16).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseBody {
    pub code: i32,
    pub info: Option<String>,
}

/// The kind-specific payload of a [`super::Message`].
#[derive(Debug, Clone)]
pub enum MessageBody {
    Request(RequestBody),
    Response(ResponseBody),
    ErrorResponse(ErrorResponseBody),
    Cancel(CancelBody),
    Event(EventBody),
    StreamStart(StreamStartBody),
    StreamChunk(StreamChunkBody),
    ScopeDiscarded(ScopeDiscardedBody),
    RemoteScopeDiscarded(RemoteScopeDiscardedBody),
    ScopeTrigger(ScopeTriggerBody),
    RemoteScopeTrigger(RemoteScopeTriggerBody),
    ScopeError(ScopeErrorBody),
    ScopeEvent(ScopeEventBody),
    RemoteScopeEvent(RemoteScopeEventBody),
    ScopeRegistration(ScopeRegistrationBody),
    Close(CloseBody),
}

macro_rules! body_kind_match {
    ($self:expr, $($variant:ident => $kind:ident),+ $(,)?) => {
        match $self {
            $(MessageBody::$variant(_) => MessageKind::$kind),+
        }
    };
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        body_kind_match!(self,
            Request => Request,
            Response => Response,
            ErrorResponse => ErrorResponse,
            Cancel => Cancel,
            Event => Event,
            StreamStart => StreamStart,
            StreamChunk => StreamChunk,
            ScopeDiscarded => ScopeDiscarded,
            RemoteScopeDiscarded => RemoteScopeDiscarded,
            ScopeTrigger => ScopeTrigger,
            RemoteScopeTrigger => RemoteScopeTrigger,
            ScopeError => ScopeError,
            ScopeEvent => ScopeEvent,
            RemoteScopeEvent => RemoteScopeEvent,
            ScopeRegistration => ScopeRegistration,
            Close => Close,
        )
    }

    pub(crate) fn payload_json(&self) -> Result<serde_json::Value, RpcError> {
        Ok(match self {
            MessageBody::Request(b) => serde_json::to_value(b)?,
            MessageBody::Response(b) => serde_json::to_value(b)?,
            MessageBody::ErrorResponse(b) => serde_json::to_value(b)?,
            MessageBody::Cancel(b) => serde_json::to_value(b)?,
            MessageBody::Event(b) => serde_json::to_value(b)?,
            MessageBody::StreamStart(b) => serde_json::to_value(b)?,
            MessageBody::StreamChunk(b) => serde_json::to_value(b)?,
            MessageBody::ScopeDiscarded(b) => serde_json::to_value(b)?,
            MessageBody::RemoteScopeDiscarded(b) => serde_json::to_value(b)?,
            MessageBody::ScopeTrigger(b) => serde_json::to_value(b)?,
            MessageBody::RemoteScopeTrigger(b) => serde_json::to_value(b)?,
            MessageBody::ScopeError(b) => serde_json::to_value(b)?,
            MessageBody::ScopeEvent(b) => serde_json::to_value(b)?,
            MessageBody::RemoteScopeEvent(b) => serde_json::to_value(b)?,
            MessageBody::ScopeRegistration(b) => serde_json::to_value(b)?,
            MessageBody::Close(b) => serde_json::to_value(b)?,
        })
    }

    pub(crate) fn from_payload_json(
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Result<Self, RpcError> {
        Ok(match kind {
            MessageKind::Request => MessageBody::Request(serde_json::from_value(payload)?),
            MessageKind::Response => MessageBody::Response(serde_json::from_value(payload)?),
            MessageKind::ErrorResponse => {
                MessageBody::ErrorResponse(serde_json::from_value(payload)?)
            }
            MessageKind::Cancel => MessageBody::Cancel(serde_json::from_value(payload)?),
            MessageKind::Event => MessageBody::Event(serde_json::from_value(payload)?),
            MessageKind::StreamStart => MessageBody::StreamStart(serde_json::from_value(payload)?),
            MessageKind::StreamChunk => MessageBody::StreamChunk(serde_json::from_value(payload)?),
            MessageKind::ScopeDiscarded => {
                MessageBody::ScopeDiscarded(serde_json::from_value(payload)?)
            }
            MessageKind::RemoteScopeDiscarded => {
                MessageBody::RemoteScopeDiscarded(serde_json::from_value(payload)?)
            }
            MessageKind::ScopeTrigger => MessageBody::ScopeTrigger(serde_json::from_value(payload)?),
            MessageKind::RemoteScopeTrigger => {
                MessageBody::RemoteScopeTrigger(serde_json::from_value(payload)?)
            }
            MessageKind::ScopeError => MessageBody::ScopeError(serde_json::from_value(payload)?),
            MessageKind::ScopeEvent => MessageBody::ScopeEvent(serde_json::from_value(payload)?),
            MessageKind::RemoteScopeEvent => {
                MessageBody::RemoteScopeEvent(serde_json::from_value(payload)?)
            }
            MessageKind::ScopeRegistration => {
                MessageBody::ScopeRegistration(serde_json::from_value(payload)?)
            }
            MessageKind::Close => MessageBody::Close(serde_json::from_value(payload)?),
        })
    }
}
