use std::collections::HashMap;
use std::sync::RwLock;

use crate::message::MessageKind;

/// Maps a registered [`MessageKind`] to the inclusive `hl_version` range a
/// reader accepts for it. Every built-in kind defaults to `(1, 1)`; a
/// higher-level protocol that needs to version one message's payload (not
/// the wire envelope itself, see `OBJECT_VERSION`) widens its range here
/// before the first processor starts.
pub struct MessageRegistry {
    ranges: RwLock<HashMap<MessageKind, (u32, u32)>>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        let mut ranges = HashMap::with_capacity(MessageKind::ALL.len() + 1);
        for kind in MessageKind::ALL {
            ranges.insert(kind, (1, 1));
        }
        ranges.insert(MessageKind::Close, (1, 1));
        Self {
            ranges: RwLock::new(ranges),
        }
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Widens or narrows the accepted `hl_version` range for `kind`.
    /// Additive in spirit: call before any processor begins reading
    /// (`spec.md` §6 "Process-wide state").
    pub fn register_version_range(&self, kind: MessageKind, min: u32, max: u32) {
        self.ranges.write().unwrap().insert(kind, (min, max));
    }

    /// The accepted `hl_version` range for `kind`, defaulting to `(1, 1)`
    /// for a kind that was never explicitly registered.
    pub fn hl_version_range(&self, kind: MessageKind) -> (u32, u32) {
        self.ranges
            .read()
            .unwrap()
            .get(&kind)
            .copied()
            .unwrap_or((1, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_every_kind_to_version_one() {
        let registry = MessageRegistry::new();
        assert_eq!(registry.hl_version_range(MessageKind::Request), (1, 1));
        assert_eq!(registry.hl_version_range(MessageKind::Close), (1, 1));
    }

    #[test]
    fn register_widens_the_accepted_range() {
        let registry = MessageRegistry::new();
        registry.register_version_range(MessageKind::Event, 1, 2);
        assert_eq!(registry.hl_version_range(MessageKind::Event), (1, 2));
    }
}
