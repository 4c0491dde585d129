use std::time::Duration;

use thiserror::Error;

use crate::message::MessageKind;

/// Errors surfaced by the RPC runtime, spanning protocol violations,
/// call-local failures, and resource exhaustion (`spec.md` §7).
#[derive(Debug, Error)]
pub enum RpcError {
    /// Wire type-id has no entry in the [`crate::registry::MessageRegistry`].
    #[error("unknown message type id {0}")]
    UnknownMessageType(u32),

    /// A framed message declared a body larger than `max_message_length`.
    #[error("message of {actual} bytes exceeds the configured limit of {limit} bytes")]
    MessageTooLong { actual: usize, limit: usize },

    /// `hl_version` fell outside the registered kind's supported range.
    #[error("{kind:?} carries hl_version {version}, outside supported range {min}..={max}")]
    UnsupportedVersion {
        kind: MessageKind,
        version: u32,
        min: u32,
        max: u32,
    },

    /// A type name failed the serializer's allow/deny policy.
    #[error("type `{0}` is not permitted to cross the wire")]
    DeserializationForbidden(String),

    /// Deserialized value was not assignable to the expected type.
    #[error("expected type `{expected}`, wire carried `{actual}`")]
    TypeMismatch { expected: String, actual: String },

    /// Transport read/write failed outright; equivalent to a protocol violation.
    #[error("transport failed: {0}")]
    Transport(#[from] std::io::Error),

    /// JSON value serializer failure.
    #[error("json serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// `RequestTable` is at `request_queue.capacity`.
    #[error("too many outstanding requests (capacity {capacity})")]
    TooManyRequests { capacity: usize },

    /// Scope tables are at capacity for this processor.
    #[error("too many scopes (capacity {capacity})")]
    TooManyScopes { capacity: usize },

    /// Stream scope backpressure slot exhausted.
    #[error("too many concurrent streams (capacity {capacity})")]
    TooManyStreams { capacity: usize },

    /// A bounded-fail queue was full when a message arrived.
    #[error("too many queued messages (capacity {capacity})")]
    TooManyMessages { capacity: usize },

    /// Too many cancellation scopes outstanding.
    #[error("too many cancellation scopes (capacity {capacity})")]
    TooManyCancellations { capacity: usize },

    /// `Call` dispatch could not resolve an api/method pair.
    #[error("method not found: {api}.{method}")]
    MethodNotFound { api: String, method: String },

    /// An authorization predicate refused the call.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A scope-targeted message named an id absent from both scope tables.
    #[error("scope {0} not found")]
    ScopeNotFound(u64),

    /// Attempted to create a keyed scope whose key already exists and
    /// `replace_existing_scope` was false.
    #[error("scope key `{0}` already in use")]
    DuplicateScopeKey(String),

    /// Attempted to register scope type 1 (enumerable), reserved but
    /// unimplemented, or re-register an existing type id.
    #[error("scope type {0} is reserved or already registered")]
    ReservedScopeType(u32),

    /// A remote exception surfaced through `ErrorResponse`/`ScopeError`.
    #[error("remote error ({remote_type}): {message}")]
    Remote { remote_type: String, message: String },

    /// The local waiter was cancelled, locally or via a `Cancel` message.
    #[error("cancelled")]
    Cancelled,

    /// A call or heartbeat exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The processor is shutting down or has stopped.
    #[error("session closed")]
    SessionClosed,

    /// An internal channel closed unexpectedly (peer task panicked or
    /// the processor was dropped while a caller still held a handle).
    #[error("internal channel closed")]
    ChannelClosed,

    /// Duplicate registration of an event handler under one name and scope.
    #[error("event handler `{0}` already registered")]
    DuplicateEventHandler(String),
}
