use crate::channel::mqtt::AckMessage;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::Sender;
use tokio::time::Instant;
use tracing::debug;

struct PendingDelivery {
    ts: Instant,
    sender: Sender<AckMessage>,
}

/// Deliveries waiting for the device to answer, keyed by sequence id.
pub(crate) struct DeliveryManager {
    pending: DashMap<u32, PendingDelivery>,
    timeout: Duration,
}

impl DeliveryManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    pub fn add_delivery(&self, seq_id: u32) -> oneshot::Receiver<AckMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            seq_id,
            PendingDelivery {
                sender: tx,
                ts: Instant::now(),
            },
        );
        rx
    }

    pub fn cancel(&self, seq_id: u32) {
        self.pending.remove(&seq_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drops deliveries older than the ack timeout; their receivers see the
    /// channel close.
    pub fn remove_expired(&self) {
        let to_remove: Vec<u32> = self
            .pending
            .iter()
            .filter(|i| i.value().ts.elapsed() > self.timeout)
            .map(|i| *i.key())
            .collect();
        for seq_id in to_remove {
            debug!("Removing expired delivery {}", seq_id);
            self.pending.remove(&seq_id);
        }
    }

    pub fn complete(&self, ack: AckMessage) -> bool {
        debug!("Complete delivery: {ack:?}");
        if let Some((seq_id, pending)) = self.pending.remove(&ack.seq_id) {
            debug!("Forwarding answer for delivery {seq_id}");
            pending.sender.send(ack).is_ok()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_forwards_ack() {
        let manager = DeliveryManager::new(Duration::from_secs(10));
        let rx = manager.add_delivery(7);
        assert!(manager.complete(AckMessage {
            seq_id: 7,
            error: None
        }));
        assert_eq!(rx.await.unwrap().seq_id, 7);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_unknown_ack_is_ignored() {
        let manager = DeliveryManager::new(Duration::from_secs(10));
        let _rx = manager.add_delivery(1);
        assert!(!manager.complete(AckMessage {
            seq_id: 2,
            error: None
        }));
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deliveries_are_dropped() {
        let manager = DeliveryManager::new(Duration::from_secs(5));
        let rx = manager.add_delivery(3);
        tokio::time::advance(Duration::from_secs(4)).await;
        let _fresh = manager.add_delivery(4);
        tokio::time::advance(Duration::from_secs(2)).await;
        manager.remove_expired();
        assert_eq!(manager.pending_count(), 1);
        assert!(rx.await.is_err());
    }
}
