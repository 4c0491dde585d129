//! Request Table (`spec.md` §4.3): correlates outbound request ids to the
//! awaiter that should be completed when a `Response`/`ErrorResponse`
//! carrying that id arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::error::RpcError;
use crate::message::MessageBody;

/// The outcome delivered to a waiter: either the matching `Response`
/// payload or the remote's `ErrorResponse`, converted to an [`RpcError`].
pub type RequestOutcome = Result<MessageBody, RpcError>;

struct Entry {
    completion: oneshot::Sender<RequestOutcome>,
}

/// Grounded on the teacher's `PendingRequests` (`Arc<Mutex<HashMap<RequestId,
/// oneshot::Sender<...>>>>`), generalized with a capacity bound the
/// teacher's unbounded map doesn't need.
pub struct RequestTable {
    next_id: AtomicU64,
    capacity: usize,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl RequestTable {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            capacity,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// The next strictly-increasing request id for this direction
    /// (`spec.md` §8 "request ids in one direction: strictly monotonically
    /// increasing and unique").
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers `id`, returning a receiver that resolves when
    /// [`Self::complete`] is called (or the table is torn down).
    ///
    /// Fails with [`RpcError::TooManyRequests`] if the table is at
    /// capacity; panics on an id collision, since a colliding id violates
    /// the per-direction uniqueness invariant and is a programming error
    /// (`spec.md` §4.3 "Insertion fails if the id collides: invariant
    /// violation").
    pub async fn register(&self, id: u64) -> Result<oneshot::Receiver<RequestOutcome>, RpcError> {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            return Err(RpcError::TooManyRequests {
                capacity: self.capacity,
            });
        }
        let (tx, rx) = oneshot::channel();
        if entries.insert(id, Entry { completion: tx }).is_some() {
            panic!("request id {id} collided with an in-flight request");
        }
        Ok(rx)
    }

    /// Completes and removes `id`'s entry; a duplicate or unknown id is a
    /// no-op (idempotent removal, and "further arrivals for the same id
    /// are discarded" per `spec.md` §8).
    pub async fn complete(&self, id: u64, outcome: RequestOutcome) {
        if let Some(entry) = self.entries.lock().await.remove(&id) {
            let _ = entry.completion.send(outcome);
        }
    }

    /// Idempotent removal without completion, used when a caller cancels
    /// locally before any response arrives.
    pub async fn remove(&self, id: u64) {
        self.entries.lock().await.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Completes every outstanding entry with `SessionClosed` and clears
    /// the table (`spec.md` §4.3 "On processor shutdown every entry is
    /// completed with an error; the table is then cleared").
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            let _ = entry.completion.send(Err(RpcError::SessionClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResponseBody;

    #[tokio::test]
    async fn complete_resolves_the_registered_receiver() {
        let table = RequestTable::new(8);
        let id = table.next_id();
        let rx = table.register(id).await.unwrap();
        table
            .complete(id, Ok(MessageBody::Response(ResponseBody { value: None })))
            .await;
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Ok(MessageBody::Response(_))));
    }

    #[tokio::test]
    async fn complete_on_unknown_id_is_a_no_op() {
        let table = RequestTable::new(8);
        table.complete(999, Err(RpcError::SessionClosed)).await;
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let table = RequestTable::new(1);
        let a = table.next_id();
        let b = table.next_id();
        let _rx = table.register(a).await.unwrap();
        let result = table.register(b).await;
        assert!(matches!(result, Err(RpcError::TooManyRequests { capacity: 1 })));
    }

    #[tokio::test]
    async fn shutdown_completes_outstanding_entries_with_session_closed() {
        let table = RequestTable::new(8);
        let id = table.next_id();
        let rx = table.register(id).await.unwrap();
        table.shutdown().await;
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(RpcError::SessionClosed)));
        assert_eq!(table.len().await, 0);
    }
}
