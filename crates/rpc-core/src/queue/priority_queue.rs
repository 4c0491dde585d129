use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::sync::{Mutex, Notify};

use crate::error::RpcError;
use crate::scope::cancellation::CancellationToken;

struct Entry<T> {
    priority: i32,
    sequence: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    /// Higher `priority` sorts first; within equal priority, the entry with
    /// the *smaller* sequence number (enqueued earlier) sorts first, giving
    /// FIFO ordering within a priority class (`spec.md` §4.2).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A bounded, priority-ordered queue backed by a binary heap, with a fixed
/// capacity enforced by blocking producers (or failing them, if cancelled)
/// until a slot frees up.
pub struct PriorityQueue<T> {
    capacity: usize,
    heap: Mutex<BinaryHeap<Entry<T>>>,
    space_available: Notify,
    item_available: Notify,
    next_sequence: AtomicU64,
}

impl<T> PriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: Mutex::new(BinaryHeap::new()),
            space_available: Notify::new(),
            item_available: Notify::new(),
            next_sequence: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    /// Enqueues `item` at `priority`, blocking while the queue is full.
    /// If `cancel` fires first, returns [`RpcError::Cancelled`] without
    /// enqueuing (`spec.md` §4.2: "producers block until capacity is
    /// available or their cancellation fires").
    pub async fn push(
        &self,
        item: T,
        priority: i32,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), RpcError> {
        let mut item = Some(item);
        loop {
            let notified = self.space_available.notified();
            {
                let mut heap = self.heap.lock().await;
                if heap.len() < self.capacity {
                    let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::SeqCst);
                    heap.push(Entry {
                        priority,
                        sequence,
                        item: item.take().expect("item consumed at most once"),
                    });
                    drop(heap);
                    self.item_available.notify_one();
                    return Ok(());
                }
            }
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = token.cancelled() => return Err(RpcError::Cancelled),
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Enqueues `item` at `priority`, failing immediately with
    /// [`RpcError::TooManyMessages`] instead of blocking if the queue is
    /// full. Used where backpressure must surface to the caller rather than
    /// stall a task (e.g. a message arriving while `Calls` is saturated).
    pub async fn try_push(&self, item: T, priority: i32) -> Result<(), RpcError> {
        let mut heap = self.heap.lock().await;
        if heap.len() >= self.capacity {
            return Err(RpcError::TooManyMessages {
                capacity: self.capacity,
            });
        }
        let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::SeqCst);
        heap.push(Entry {
            priority,
            sequence,
            item,
        });
        drop(heap);
        self.item_available.notify_one();
        Ok(())
    }

    /// Dequeues the highest-priority, earliest-enqueued item, waiting if
    /// the queue is currently empty.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.item_available.notified();
            {
                let mut heap = self.heap.lock().await;
                if let Some(entry) = heap.pop() {
                    drop(heap);
                    self.space_available.notify_one();
                    return entry.item;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn higher_priority_pops_first() {
        let queue = PriorityQueue::new(8);
        queue.push("low", 1, None).await.unwrap();
        queue.push("high", 10, None).await.unwrap();
        queue.push("mid", 5, None).await.unwrap();
        assert_eq!(queue.pop().await, "high");
        assert_eq!(queue.pop().await, "mid");
        assert_eq!(queue.pop().await, "low");
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let queue = PriorityQueue::new(8);
        queue.push("first", 1, None).await.unwrap();
        queue.push("second", 1, None).await.unwrap();
        queue.push("third", 1, None).await.unwrap();
        assert_eq!(queue.pop().await, "first");
        assert_eq!(queue.pop().await, "second");
        assert_eq!(queue.pop().await, "third");
    }

    #[tokio::test]
    async fn push_blocks_until_capacity_frees() {
        let queue = std::sync::Arc::new(PriorityQueue::new(1));
        queue.push(1, 0, None).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.push(2, 0, None).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop().await, 1);
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer unblocks once capacity frees")
            .unwrap();
        assert_eq!(queue.pop().await, 2);
    }

    #[tokio::test]
    async fn cancelled_push_fails_without_enqueuing() {
        let queue = PriorityQueue::new(1);
        queue.push(1, 0, None).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = queue.push(2, 0, Some(&token)).await;
        assert!(matches!(result, Err(RpcError::Cancelled)));
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn try_push_fails_fast_when_full() {
        let queue = PriorityQueue::new(1);
        queue.try_push(1, 0).await.unwrap();
        let result = queue.try_push(2, 0).await;
        assert!(matches!(result, Err(RpcError::TooManyMessages { capacity: 1 })));
    }
}
