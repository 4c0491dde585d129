//! Bounded, priority-ordered queues with a fixed consumer pool (`spec.md`
//! §4.2): `IncomingMessages`, `OutgoingMessages`, `Calls`, `Requests`.

mod priority_queue;

pub use priority_queue::PriorityQueue;
