//! Inclusion notifications for callers awaiting a transaction

use cadence_core::{Height, TxHash};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Published once the block carrying a transaction is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCommitted {
    pub height: Height,
    pub code: u32,
}

/// One-shot subscriptions keyed by transaction hash
#[derive(Default)]
pub struct TxPubsub {
    waiters: Mutex<HashMap<TxHash, Vec<oneshot::Sender<TxCommitted>>>>,
}

impl TxPubsub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `tx_hash`; subscribe before submitting to avoid missing the event
    pub fn subscribe(&self, tx_hash: &TxHash) -> oneshot::Receiver<TxCommitted> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.lock().entry(tx_hash.clone()).or_default().push(sender);
        receiver
    }

    /// Wake every subscriber of `tx_hash`, returning how many were still listening
    pub fn publish(&self, tx_hash: &TxHash, event: TxCommitted) -> usize {
        let Some(senders) = self.waiters.lock().remove(tx_hash) else {
            return 0;
        };
        senders
            .into_iter()
            .filter_map(|sender| sender.send(event).ok())
            .count()
    }

    /// Drop subscriptions whose receivers have gone away
    pub fn forget(&self, tx_hash: &TxHash) {
        let mut waiters = self.waiters.lock();
        if let Some(senders) = waiters.get_mut(tx_hash) {
            senders.retain(|sender| !sender.is_closed());
            if senders.is_empty() {
                waiters.remove(tx_hash);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.waiters.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_wakes_all_subscribers() {
        let pubsub = TxPubsub::new();
        let hash = TxHash::of_bytes(b"a");
        let first = pubsub.subscribe(&hash);
        let second = pubsub.subscribe(&hash);

        let event = TxCommitted { height: 4, code: 0 };
        assert_eq!(pubsub.publish(&hash, event), 2);
        assert_eq!(first.await.unwrap(), event);
        assert_eq!(second.await.unwrap(), event);
        assert_eq!(pubsub.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let pubsub = TxPubsub::new();
        assert_eq!(pubsub.publish(&TxHash::of_bytes(b"a"), TxCommitted { height: 1, code: 0 }), 0);
    }

    #[test]
    fn test_forget_drops_abandoned_receivers() {
        let pubsub = TxPubsub::new();
        let hash = TxHash::of_bytes(b"a");
        drop(pubsub.subscribe(&hash));
        let _live = pubsub.subscribe(&hash);

        pubsub.forget(&hash);
        assert_eq!(pubsub.subscriber_count(), 1);
    }
}
