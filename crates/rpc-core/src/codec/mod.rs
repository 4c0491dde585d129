//! Typed serialize/deserialize of values and registered message types with
//! length framing (`spec.md` §4.1).
//!
//! Two concerns live here: the outer *message framing* (`read_message` /
//! `write_message`, a length-bounded envelope around one [`Message`]) and
//! the pluggable *value serializer* used for the dynamically-typed pieces
//! of a message — call parameters, return values, event arguments, scope
//! DTO extensions — represented as a [`DynamicValue`].

pub mod binary;

use std::collections::HashSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::RpcError;
use crate::message::{Message, MessageBody, MessageKind, Meta, OBJECT_VERSION};
use crate::registry::MessageRegistry;

/// Which value serializer a [`DynamicValue`] was (or should be) encoded
/// with. `Mixed` is a framing choice at the call site, not a value of this
/// enum: a mixed-mode writer picks `Binary` or `Json` per value and stamps
/// that choice into the byte stream so the reader can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum SerializerId {
    Binary = 0,
    Json = 1,
}

/// A Rust type that may cross the wire as a [`DynamicValue`]. `type_name`
/// is the wire identifier used for the allow-list policy and for asserting
/// assignability on deserialization.
pub trait WireType: Serialize + DeserializeOwned {
    fn type_name() -> &'static str;

    /// Types marked `no_rpc` are contextual parameters (processor handle,
    /// linked cancellation token) injected by the dispatcher rather than
    /// deserialized from the wire; they are always rejected by the
    /// allow-list regardless of policy (`spec.md` §4.1 "opt-out: a
    /// 'no-rpc' marker").
    fn no_rpc() -> bool {
        false
    }
}

/// Built-in `WireType`s for the primitives an `ApiDescriptor`'s methods
/// most commonly move across the wire. Application-defined types implement
/// [`WireType`] themselves with a wire type name scoped to their own API.
macro_rules! builtin_wire_type {
    ($ty:ty, $name:literal) => {
        impl WireType for $ty {
            fn type_name() -> &'static str {
                $name
            }
        }
    };
}

builtin_wire_type!(String, "builtin.string");
builtin_wire_type!(bool, "builtin.bool");
builtin_wire_type!(i64, "builtin.i64");
builtin_wire_type!(u64, "builtin.u64");
builtin_wire_type!(f64, "builtin.f64");
builtin_wire_type!((), "builtin.unit");

/// Allow/deny policy applied to a [`DynamicValue`]'s wire type name before
/// encoding or after decoding.
#[derive(Debug, Clone)]
pub enum SerializerPolicy {
    /// Any type not marked `no_rpc` may cross the wire.
    AllowAll,
    /// Any type not explicitly denied may cross the wire.
    DenyListed(HashSet<String>),
    /// Only explicitly allowed types may cross the wire ("opt-in when the
    /// global policy requires it").
    AllowListed(HashSet<String>),
}

impl Default for SerializerPolicy {
    fn default() -> Self {
        SerializerPolicy::AllowAll
    }
}

impl SerializerPolicy {
    fn permits(&self, type_name: &str) -> bool {
        match self {
            SerializerPolicy::AllowAll => true,
            SerializerPolicy::DenyListed(denied) => !denied.contains(type_name),
            SerializerPolicy::AllowListed(allowed) => allowed.contains(type_name),
        }
    }
}

/// Extensibility hook: lets a receiver accept a wire value whose declared
/// type differs from the statically expected type, e.g. "a stream value
/// DTO satisfies an expected byte-stream parameter" (`spec.md` §4.1).
pub trait AssignabilityRule: Send + Sync {
    fn satisfies(&self, wire_type_name: &str, expected_type_name: &str) -> bool;
}

/// A value whose concrete Rust type is only known by both peers having
/// agreed on `type_name`, carried with enough metadata for either
/// serializer to decode it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DynamicValue {
    pub type_name: String,
    pub serializer_id: SerializerId,
    /// JSON serializer: the value nested directly. Binary serializer: the
    /// same value re-expressed through [`binary::encode`], carried as a
    /// byte array so the outer envelope (itself JSON-framed) stays
    /// self-describing.
    payload: DynamicPayload,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
enum DynamicPayload {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

/// Wire type name used for a raw `serde_json::Value` return/parameter with
/// no declared Rust type — the common case for handlers that hand back a
/// plain JSON result rather than a registered [`WireType`].
pub const UNTYPED_JSON: &str = "json.value";

impl DynamicValue {
    /// Wraps `value` as a [`DynamicValue`] tagged [`UNTYPED_JSON`], always
    /// JSON-serialized regardless of the negotiated serializer — used by
    /// the dispatcher when a method's return type isn't a registered
    /// [`WireType`].
    pub fn untyped_json(value: serde_json::Value) -> Self {
        Self {
            type_name: UNTYPED_JSON.to_string(),
            serializer_id: SerializerId::Json,
            payload: DynamicPayload::Json(value),
        }
    }

    /// The raw JSON payload, regardless of `type_name` — used to read back
    /// an [`Self::untyped_json`] value, or any value, without requiring a
    /// registered [`WireType`].
    pub fn as_json(&self) -> Result<serde_json::Value, RpcError> {
        match &self.payload {
            DynamicPayload::Json(value) => Ok(value.clone()),
            DynamicPayload::Binary(bytes) => binary::decode(bytes),
        }
    }

    pub fn encode<T: WireType>(value: &T, serializer_id: SerializerId) -> Result<Self, RpcError> {
        let json_value = serde_json::to_value(value)?;
        let payload = match serializer_id {
            SerializerId::Json => DynamicPayload::Json(json_value),
            SerializerId::Binary => DynamicPayload::Binary(binary::encode(&json_value)),
        };
        Ok(Self {
            type_name: T::type_name().to_string(),
            serializer_id,
            payload,
        })
    }

    pub fn decode<T: WireType>(&self, codec: &Codec) -> Result<T, RpcError> {
        if !codec.policy.permits(&self.type_name) || T::no_rpc() {
            return Err(RpcError::DeserializationForbidden(self.type_name.clone()));
        }
        if self.type_name != T::type_name() && self.type_name != UNTYPED_JSON {
            let assignable = codec
                .assignability_rules
                .iter()
                .any(|rule| rule.satisfies(&self.type_name, T::type_name()));
            if !assignable {
                return Err(RpcError::TypeMismatch {
                    expected: T::type_name().to_string(),
                    actual: self.type_name.clone(),
                });
            }
        }
        let json_value = match &self.payload {
            DynamicPayload::Json(value) => value.clone(),
            DynamicPayload::Binary(bytes) => binary::decode(bytes)?,
        };
        Ok(serde_json::from_value(json_value)?)
    }
}

/// Round-trips [`Message`]s over a length-bounded duplex stream and
/// enforces the binary/JSON value-serializer allow-list policy.
pub struct Codec {
    registry: Arc<MessageRegistry>,
    policy: SerializerPolicy,
    assignability_rules: Vec<Box<dyn AssignabilityRule>>,
    max_message_length: usize,
}

impl Codec {
    pub fn new(registry: Arc<MessageRegistry>, max_message_length: usize) -> Self {
        Self {
            registry,
            policy: SerializerPolicy::default(),
            assignability_rules: Vec::new(),
            max_message_length,
        }
    }

    pub fn with_policy(mut self, policy: SerializerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn add_assignability_rule(&mut self, rule: Box<dyn AssignabilityRule>) {
        self.assignability_rules.push(rule);
    }

    pub fn policy(&self) -> &SerializerPolicy {
        &self.policy
    }

    /// Writes one framed message: `type_id` then a length-prefixed, JSON
    /// envelope carrying `object_version`, `hl_version`, `id`, `meta`, and
    /// the kind-specific payload (`spec.md` §6 wire framing).
    pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        message: &Message,
    ) -> Result<(), RpcError> {
        let kind = message.kind();
        if kind.require_id() && message.id.is_none() {
            return Err(RpcError::TypeMismatch {
                expected: "id set before send".into(),
                actual: format!("{kind:?} missing id"),
            });
        }
        let envelope = serde_json::json!({
            "object_version": OBJECT_VERSION,
            "hl_version": message.hl_version,
            "id": message.id,
            "meta": message.meta,
            "payload": message.body.payload_json()?,
        });
        let body = serde_json::to_vec(&envelope)?;
        if body.len() > self.max_message_length {
            return Err(RpcError::MessageTooLong {
                actual: body.len(),
                limit: self.max_message_length,
            });
        }
        writer.write_all(&kind.type_id().to_le_bytes()).await?;
        writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
        writer.write_all(&body).await?;
        Ok(())
    }

    /// Reads one framed message, validating the type-id and `hl_version`
    /// range against the [`MessageRegistry`] before decoding the payload.
    pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<Message, RpcError> {
        let mut type_id_bytes = [0u8; 4];
        reader.read_exact(&mut type_id_bytes).await?;
        let type_id = u32::from_le_bytes(type_id_bytes);
        let kind = MessageKind::from_type_id(type_id)
            .ok_or(RpcError::UnknownMessageType(type_id))?;

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > self.max_message_length {
            return Err(RpcError::MessageTooLong {
                actual: len,
                limit: self.max_message_length,
            });
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;

        let envelope: serde_json::Value = serde_json::from_slice(&body)?;
        let object_version = envelope
            .get("object_version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or_default();
        if object_version != OBJECT_VERSION as u64 {
            return Err(RpcError::TypeMismatch {
                expected: format!("object_version {OBJECT_VERSION}"),
                actual: object_version.to_string(),
            });
        }
        let hl_version = envelope
            .get("hl_version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1) as u32;
        let (min, max) = self.registry.hl_version_range(kind);
        if hl_version < min || hl_version > max {
            return Err(RpcError::UnsupportedVersion {
                kind,
                version: hl_version,
                min,
                max,
            });
        }
        let id = envelope.get("id").and_then(serde_json::Value::as_u64);
        let meta: Meta = envelope
            .get("meta")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let payload = envelope
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let body = MessageBody::from_payload_json(kind, payload)?;

        Ok(Message {
            id,
            hl_version,
            created_at: std::time::SystemTime::now(),
            meta,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, ResponseBody};

    fn codec() -> Codec {
        Codec::new(Arc::new(MessageRegistry::new()), 1024 * 1024)
    }

    #[test]
    fn dynamic_value_round_trips_through_json_serializer() {
        let codec = codec();
        let value = DynamicValue::encode(&"hello".to_string(), SerializerId::Json).unwrap();
        let decoded: String = value.decode(&codec).unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn dynamic_value_round_trips_through_binary_serializer() {
        let codec = codec();
        let value = DynamicValue::encode(&42i64, SerializerId::Binary).unwrap();
        let decoded: i64 = value.decode(&codec).unwrap();
        assert_eq!(decoded, 42);
    }

    #[test]
    fn deny_listed_type_name_is_rejected_on_decode() {
        let codec = codec().with_policy(SerializerPolicy::DenyListed(
            ["builtin.string".to_string()].into_iter().collect(),
        ));
        let value = DynamicValue::encode(&"hello".to_string(), SerializerId::Json).unwrap();
        let result: Result<String, RpcError> = value.decode(&codec);
        assert!(matches!(result, Err(RpcError::DeserializationForbidden(_))));
    }

    #[test]
    fn untyped_json_is_always_assignable_to_the_expected_type() {
        let codec = codec();
        let value = DynamicValue::untyped_json(serde_json::json!("hello"));
        let decoded: String = value.decode(&codec).unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn allow_listed_policy_rejects_types_not_on_the_list() {
        let codec = codec().with_policy(SerializerPolicy::AllowListed(
            ["builtin.i64".to_string()].into_iter().collect(),
        ));
        let value = DynamicValue::encode(&"hello".to_string(), SerializerId::Json).unwrap();
        let result: Result<String, RpcError> = value.decode(&codec);
        assert!(matches!(result, Err(RpcError::DeserializationForbidden(_))));
    }

    #[tokio::test]
    async fn write_then_read_reconstructs_the_message() {
        let codec = codec();
        let mut buffer = Vec::new();
        let outgoing = Message::new(1, MessageBody::Response(ResponseBody { value: None })).with_id(7);
        codec.write_message(&mut buffer, &outgoing).await.unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        let decoded = codec.read_message(&mut cursor).await.unwrap();
        assert_eq!(decoded.id, Some(7));
        assert!(matches!(decoded.body, MessageBody::Response(_)));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_on_write() {
        let codec = Codec::new(Arc::new(MessageRegistry::new()), 8);
        let mut buffer = Vec::new();
        let outgoing = Message::new(1, MessageBody::Response(ResponseBody { value: None })).with_id(1);
        let result = codec.write_message(&mut buffer, &outgoing).await;
        assert!(matches!(result, Err(RpcError::MessageTooLong { .. })));
    }

    #[tokio::test]
    async fn sending_a_require_id_message_without_an_id_fails() {
        let codec = codec();
        let mut buffer = Vec::new();
        let outgoing = Message::new(1, MessageBody::Response(ResponseBody { value: None }));
        let result = codec.write_message(&mut buffer, &outgoing).await;
        assert!(result.is_err());
    }
}
