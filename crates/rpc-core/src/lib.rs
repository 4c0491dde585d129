#![forbid(unsafe_code)]
//! Core runtime for a bidirectional, peer-to-peer RPC protocol: framed
//! messages, typed request/response correlation, asynchronous events, and
//! long-lived *scopes* multiplexed over a single duplex byte stream.
//!
//! A [`Processor`] owns one duplex transport and speaks the wire protocol
//! described by [`message`]: requests and responses correlate through the
//! [`request_table`], inbound calls run through the [`dispatcher`], and
//! stateful side-channels that outlive a single call are [`scope`]s mirrored
//! between the two peers. Everything here is symmetric — the same
//! `Processor` type is used whether this side initiated the connection or
//! accepted it.
//!
//! ## Setup
//! - Build a [`config::ProcessorConfig`] naming the transport, the
//!   [`api::ApiDescriptor`]s this side exposes, and queue/heartbeat sizing
//!   (every field has a default — see `SPEC_FULL.md` §6.1 for the table).
//! - Register any custom scope types with [`scope::registry::ScopeRegistry`]
//!   before starting the first `Processor`; the registry is process-wide and
//!   additive-only once traffic starts.
//! - Call [`Processor::start`] to boot the read loop, the priority queue
//!   workers, and the heartbeat timers, then drive it with
//!   [`Processor::call_value`], [`Processor::call_void`],
//!   [`Processor::raise_event`], [`Processor::ping`], and
//!   [`Processor::close`].
//!
//! ## What's out of scope
//! Reflection-based API discovery, compression codecs, logging sinks, CLI
//! surfaces, application configuration loading, and SDK code generation are
//! all external collaborators — this crate only specifies the interface it
//! expects from them (see [`api::ApiDescriptor`] for the API shape and
//! [`codec`] for the serializer hook).

pub mod api;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod heartbeat;
pub mod message;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod request_table;
pub mod scope;
pub mod transport;

pub use config::ProcessorConfig;
pub use error::RpcError;
pub use message::{Message, MessageKind, Meta};
pub use processor::{Processor, ProcessorState};
