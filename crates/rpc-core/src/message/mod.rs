//! Wire message envelope and the fixed set of registered message kinds
//! (`spec.md` §3). Type-ids are frozen for wire compatibility; id 12 is a
//! deliberate gap left by the source protocol and stays reserved here too.

mod kinds;

use std::collections::BTreeMap;

pub use kinds::*;

/// Maximum number of entries in a [`Meta`] map.
pub const MAX_META_ENTRIES: usize = 255;
/// Maximum length, in chars, of a meta key.
pub const MAX_META_KEY_LEN: usize = 255;
/// Maximum length, in bytes, of a meta value.
pub const MAX_META_VALUE_LEN: usize = 4 * 1024;

/// The object-shape version stamped on every message body. Bumped only on a
/// wire-breaking change to the envelope itself (not to be confused with
/// `hl_version`, which versions one message kind's payload).
pub const OBJECT_VERSION: u8 = 1;

/// Bounded key/value annotations carried on every message (`spec.md` §3).
///
/// Insertion enforces the entry count, key length, and value length limits;
/// callers that exceed them get `None` back instead of a silently truncated
/// entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Meta(BTreeMap<String, String>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `key` => `value`, returning `false` (and leaving the map
    /// unchanged) if any bound would be violated.
    #[must_use]
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();
        if key.chars().count() > MAX_META_KEY_LEN || value.len() > MAX_META_VALUE_LEN {
            return false;
        }
        if !self.0.contains_key(&key) && self.0.len() >= MAX_META_ENTRIES {
            return false;
        }
        self.0.insert(key, value);
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The fixed, wire-compatible set of message kinds (`spec.md` §3 table).
/// The numeric value returned by [`MessageKind::type_id`] is frozen; id 12
/// is intentionally absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Request,
    Response,
    ErrorResponse,
    Cancel,
    Event,
    StreamStart,
    StreamChunk,
    ScopeDiscarded,
    RemoteScopeDiscarded,
    ScopeTrigger,
    RemoteScopeTrigger,
    ScopeError,
    ScopeEvent,
    RemoteScopeEvent,
    ScopeRegistration,
    Close,
}

impl MessageKind {
    pub const ALL: [MessageKind; 15] = [
        MessageKind::Request,
        MessageKind::Response,
        MessageKind::ErrorResponse,
        MessageKind::Cancel,
        MessageKind::Event,
        MessageKind::StreamStart,
        MessageKind::StreamChunk,
        MessageKind::ScopeDiscarded,
        MessageKind::RemoteScopeDiscarded,
        MessageKind::ScopeTrigger,
        MessageKind::RemoteScopeTrigger,
        MessageKind::ScopeError,
        MessageKind::ScopeEvent,
        MessageKind::RemoteScopeEvent,
        MessageKind::ScopeRegistration,
    ];

    pub fn type_id(self) -> u32 {
        match self {
            MessageKind::Request => 0,
            MessageKind::Response => 1,
            MessageKind::ErrorResponse => 2,
            MessageKind::Cancel => 3,
            MessageKind::Event => 4,
            MessageKind::StreamStart => 5,
            MessageKind::StreamChunk => 6,
            MessageKind::ScopeDiscarded => 7,
            MessageKind::RemoteScopeDiscarded => 8,
            MessageKind::ScopeTrigger => 9,
            MessageKind::RemoteScopeTrigger => 10,
            MessageKind::ScopeError => 11,
            MessageKind::ScopeEvent => 13,
            MessageKind::RemoteScopeEvent => 14,
            MessageKind::ScopeRegistration => 15,
            MessageKind::Close => 16,
        }
    }

    pub fn from_type_id(type_id: u32) -> Option<Self> {
        Some(match type_id {
            0 => MessageKind::Request,
            1 => MessageKind::Response,
            2 => MessageKind::ErrorResponse,
            3 => MessageKind::Cancel,
            4 => MessageKind::Event,
            5 => MessageKind::StreamStart,
            6 => MessageKind::StreamChunk,
            7 => MessageKind::ScopeDiscarded,
            8 => MessageKind::RemoteScopeDiscarded,
            9 => MessageKind::ScopeTrigger,
            10 => MessageKind::RemoteScopeTrigger,
            11 => MessageKind::ScopeError,
            13 => MessageKind::ScopeEvent,
            14 => MessageKind::RemoteScopeEvent,
            15 => MessageKind::ScopeRegistration,
            16 => MessageKind::Close,
            _ => return None,
        })
    }

    /// Whether `id` must be set before a message of this kind may be sent
    /// (`spec.md` §3: "if a subtype declares `require_id`, `id` must be set
    /// before sending").
    pub fn require_id(self) -> bool {
        matches!(
            self,
            MessageKind::Request | MessageKind::Response | MessageKind::ErrorResponse | MessageKind::Cancel
        )
    }
}

/// A complete wire message: the common envelope fields plus a kind-specific
/// [`MessageBody`].
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Option<u64>,
    pub hl_version: u32,
    pub created_at: std::time::SystemTime,
    pub meta: Meta,
    pub body: MessageBody,
}

impl Message {
    pub fn new(hl_version: u32, body: MessageBody) -> Self {
        Self {
            id: None,
            hl_version,
            created_at: std::time::SystemTime::now(),
            meta: Meta::new(),
            body,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}
