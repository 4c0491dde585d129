//! Processor configuration (`spec.md` §6 "Processor configuration",
//! `SPEC_FULL.md` §6.1 defaults). Grounded on the teacher's
//! `McpConfigManager`/`StdioServerConfig` pattern: a serde-friendly struct
//! with `#[serde(default)]` fields and documented defaults rather than a
//! builder-only API, so configuration can also be loaded from a file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::ApiDescriptor;

/// Sizing and scheduling for one of the four priority queues
/// (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
    pub threads: usize,
}

/// The two keep-alive thresholds (`spec.md` §3 "Keep-alive configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub peer_timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            peer_timeout: Duration::from_secs(45),
        }
    }
}

/// Relative priorities across message classes; higher values run sooner
/// (`spec.md` §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    pub rpc: i32,
    pub event: i32,
    pub scope: i32,
    pub stream: i32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            rpc: 100,
            event: 80,
            scope: 60,
            stream: 40,
        }
    }
}

/// Every option enumerated in `spec.md` §6, plus the API descriptor set a
/// processor dispatches calls against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Flush the transport after every message.
    pub flush_stream: bool,
    /// Stamped into outgoing messages; informs peer-compatible encoding.
    pub rpc_version: u32,
    /// Upper bound for one framed message.
    pub max_message_length: usize,
    #[serde(skip)]
    pub apis: Vec<ApiDescriptor>,
    pub incoming_message_queue: QueueConfig,
    pub outgoing_message_queue: QueueConfig,
    pub call_queue: QueueConfig,
    pub request_queue: QueueConfig,
    pub keep_alive: KeepAliveConfig,
    pub priorities: PriorityConfig,
    /// Scope type-ids denied at boot (`spec.md` §6 "deny-list applied at
    /// boot").
    pub disabled_scope_types: Vec<u32>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            flush_stream: true,
            rpc_version: 1,
            max_message_length: 16 * 1024 * 1024,
            apis: Vec::new(),
            incoming_message_queue: QueueConfig {
                capacity: 256,
                threads: 4,
            },
            outgoing_message_queue: QueueConfig {
                capacity: 256,
                threads: 1,
            },
            call_queue: QueueConfig {
                capacity: 64,
                threads: 8,
            },
            request_queue: QueueConfig {
                capacity: 1024,
                threads: 1,
            },
            keep_alive: KeepAliveConfig::default(),
            priorities: PriorityConfig::default(),
            disabled_scope_types: Vec::new(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_apis(mut self, apis: Vec<ApiDescriptor>) -> Self {
        self.apis = apis;
        self
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = ProcessorConfig::default();
        assert!(config.flush_stream);
        assert_eq!(config.rpc_version, 1);
        assert_eq!(config.max_message_length, 16 * 1024 * 1024);
        assert_eq!(config.incoming_message_queue.capacity, 256);
        assert_eq!(config.incoming_message_queue.threads, 4);
        assert_eq!(config.outgoing_message_queue.threads, 1);
        assert_eq!(config.call_queue.capacity, 64);
        assert_eq!(config.request_queue.capacity, 1024);
        assert_eq!(config.keep_alive.timeout, Duration::from_secs(15));
        assert_eq!(config.keep_alive.peer_timeout, Duration::from_secs(45));
        assert_eq!(config.priorities.rpc, 100);
        assert!(config.disabled_scope_types.is_empty());
    }

    #[test]
    fn serializes_round_trip_through_json() {
        let config = ProcessorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: ProcessorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.rpc_version, config.rpc_version);
    }
}
