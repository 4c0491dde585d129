//! Stream scope (type id 0, `spec.md` §4.11): a chunked byte stream with
//! flow control, where the sender only dispatches the next chunk after the
//! previous one's response has arrived.

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::RpcError;

/// Negotiated at `StreamStart` time.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub chunk_size: u32,
    pub max_length: Option<u64>,
    pub compression: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_length: None,
            compression: None,
        }
    }
}

/// One direction of a stream scope's local state: a queue of chunks plus
/// the bookkeeping to enforce `max_length` and detect the final chunk.
///
/// A `StreamScope` is driven from both ends: application code pushes bytes
/// in (sender side) or drains bytes out (receiver side) through the
/// `mpsc` channels; the [`crate::processor::Processor`] is the one that
/// actually turns sender-side pushes into `StreamChunk` messages and
/// receiver-side `StreamChunk` arrivals into channel sends, honoring the
/// one-chunk-in-flight backpressure rule itself (the ack/response
/// correlation lives in the Request Table, not here).
pub struct StreamScope {
    pub stream_id: u64,
    pub config: StreamConfig,
    sent_bytes: Mutex<u64>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    outbound_tx: mpsc::Sender<Bytes>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl StreamScope {
    pub fn new(stream_id: u64, config: StreamConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        Self {
            stream_id,
            config,
            sent_bytes: Mutex::new(0),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            outbound_tx,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// The handle application code writes outbound data to; an empty
    /// buffer requests the sender to close (`spec.md` §4.11 "An
    /// empty-data message signals the sender wants to close").
    pub fn outbound_sender(&self) -> mpsc::Sender<Bytes> {
        self.outbound_tx.clone()
    }

    /// The handle application code reads inbound data from.
    pub fn take_inbound_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound_rx.try_lock().ok().and_then(|mut guard| guard.take())
    }

    /// Pulled by the processor's stream pump: the next chunk to send and
    /// whether it is the last one, respecting `max_length`.
    pub async fn next_outbound_chunk(&self) -> Result<Option<(Bytes, bool)>, RpcError> {
        let mut rx_guard = self.outbound_rx.lock().await;
        let Some(rx) = rx_guard.as_mut() else {
            return Ok(None);
        };
        match rx.recv().await {
            Some(chunk) => {
                let mut sent = self.sent_bytes.lock().await;
                *sent += chunk.len() as u64;
                if let Some(max) = self.config.max_length {
                    if *sent > max {
                        return Err(RpcError::MessageTooLong {
                            actual: *sent as usize,
                            limit: max as usize,
                        });
                    }
                }
                let is_last = chunk.is_empty();
                Ok(Some((chunk, is_last)))
            }
            None => Ok(None),
        }
    }

    /// Delivers one received `StreamChunk` to the application's inbound
    /// reader. Returns `false` once `is_last` closes the channel.
    pub async fn deliver_inbound_chunk(&self, data: Bytes, is_last: bool) -> bool {
        let _ = self.inbound_tx.send(data).await;
        !is_last
    }

    pub async fn close_outbound(&self) {
        *self.outbound_rx.lock().await = None;
    }

    /// Releases both directions' channels; called when the scope is
    /// disposed (`spec.md` §4.5) whether or not either side ever drained.
    pub async fn close(&self) {
        self.close_outbound().await;
        self.inbound_rx.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_chunks_round_trip_in_order() {
        let scope = StreamScope::new(1, StreamConfig::default());
        let sender = scope.outbound_sender();
        sender.send(Bytes::from_static(b"abc")).await.unwrap();
        sender.send(Bytes::from_static(b"")).await.unwrap();

        let (chunk, is_last) = scope.next_outbound_chunk().await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from_static(b"abc"));
        assert!(!is_last);

        let (chunk, is_last) = scope.next_outbound_chunk().await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::new());
        assert!(is_last);
    }

    #[tokio::test]
    async fn exceeding_max_length_fails() {
        let scope = StreamScope::new(
            1,
            StreamConfig {
                chunk_size: 4,
                max_length: Some(2),
                compression: None,
            },
        );
        scope.outbound_sender().send(Bytes::from_static(b"abcd")).await.unwrap();
        let result = scope.next_outbound_chunk().await;
        assert!(matches!(result, Err(RpcError::MessageTooLong { .. })));
    }

    #[tokio::test]
    async fn inbound_chunks_reach_the_reader() {
        let scope = StreamScope::new(1, StreamConfig::default());
        let mut reader = scope.take_inbound_receiver().unwrap();
        scope.deliver_inbound_chunk(Bytes::from_static(b"hi"), false).await;
        assert_eq!(reader.recv().await, Some(Bytes::from_static(b"hi")));
    }
}
