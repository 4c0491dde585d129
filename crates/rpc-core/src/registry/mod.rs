//! Process-wide Message Registry (`spec.md` §4.2/§6): maps each
//! [`crate::message::MessageKind`] to the `hl_version` range a reader will
//! accept for it. Populated at initialization, then immutable during
//! steady-state traffic — registration past that point is still allowed
//! (`register_version_range`) but is a programming error to rely on once a
//! [`crate::processor::Processor`] has started reading.

mod message_registry;

pub use message_registry::MessageRegistry;
