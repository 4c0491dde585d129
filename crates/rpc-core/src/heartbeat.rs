//! Heartbeat (`spec.md` §4.10): two timers reset by activity. Expiry of the
//! send-timer means "emit a Ping"; expiry of the receive-timer means "the
//! peer is dead, close the session."

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// What the caller should do once [`Heartbeat::wait_for_action`] resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    PeerDead,
}

pub struct Heartbeat {
    timeout: Duration,
    peer_timeout: Duration,
    last_sent: Mutex<Instant>,
    last_received: Mutex<Instant>,
}

impl Heartbeat {
    pub fn new(timeout: Duration, peer_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            timeout,
            peer_timeout,
            last_sent: Mutex::new(now),
            last_received: Mutex::new(now),
        }
    }

    /// Called on every successful outbound write — defers the next Ping
    /// (`spec.md` §4.9 "Every successful write ... defers the next
    /// heartbeat").
    pub async fn record_sent(&self) {
        *self.last_sent.lock().await = Instant::now();
    }

    /// Called when any message is decoded off the wire.
    pub async fn record_received(&self) {
        *self.last_received.lock().await = Instant::now();
    }

    /// Blocks until either timer expires, recomputing after any spurious
    /// wake so a `record_sent`/`record_received` call racing with the sleep
    /// correctly postpones the corresponding action.
    pub async fn wait_for_action(&self) -> HeartbeatAction {
        loop {
            let send_deadline = *self.last_sent.lock().await + self.timeout;
            let peer_deadline = *self.last_received.lock().await + self.peer_timeout;
            tokio::select! {
                _ = tokio::time::sleep_until(send_deadline) => {
                    if Instant::now() >= *self.last_sent.lock().await + self.timeout {
                        return HeartbeatAction::SendPing;
                    }
                }
                _ = tokio::time::sleep_until(peer_deadline) => {
                    if Instant::now() >= *self.last_received.lock().await + self.peer_timeout {
                        return HeartbeatAction::PeerDead;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_timer_expiry_requests_a_ping() {
        let heartbeat = Heartbeat::new(Duration::from_millis(10), Duration::from_secs(60));
        let action = tokio::time::timeout(Duration::from_secs(1), heartbeat.wait_for_action())
            .await
            .unwrap();
        assert_eq!(action, HeartbeatAction::SendPing);
    }

    #[tokio::test]
    async fn recording_activity_postpones_the_deadline() {
        let heartbeat = Heartbeat::new(Duration::from_millis(30), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(15)).await;
        heartbeat.record_sent().await;
        let action = tokio::time::timeout(Duration::from_millis(60), heartbeat.wait_for_action())
            .await
            .unwrap();
        assert_eq!(action, HeartbeatAction::SendPing);
    }

    #[tokio::test]
    async fn receive_timer_expiry_declares_the_peer_dead() {
        let heartbeat = Heartbeat::new(Duration::from_secs(60), Duration::from_millis(10));
        let action = tokio::time::timeout(Duration::from_secs(1), heartbeat.wait_for_action())
            .await
            .unwrap();
        assert_eq!(action, HeartbeatAction::PeerDead);
    }
}
