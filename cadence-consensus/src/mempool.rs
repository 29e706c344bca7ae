//! Pending transaction pool
//!
//! Entries are kept in admission order and keyed by [`TxHash`]. A single
//! mutex guards both the order index and the key index so every operation is
//! atomic with respect to the others.

use crate::error::MempoolError;
use crate::peers::PeerBroadcaster;
use cadence_core::{CoreError, Height, SignedTransaction, TxHash};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Default number of pending transactions
pub const DEFAULT_CAPACITY: usize = 10_000;

/// A signed transaction waiting for inclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolEntry {
    pub tx: SignedTransaction,
    /// Canonical bytes of `tx`
    pub tx_bytes: Vec<u8>,
    /// Expiry height; the entry is only proposed at heights below it
    pub deadline: Height,
}

impl MempoolEntry {
    pub fn new(tx: SignedTransaction, deadline: Height) -> Result<Self, CoreError> {
        let tx_bytes = tx.to_bytes()?;
        Ok(Self {
            tx,
            tx_bytes,
            deadline,
        })
    }

    /// Rebuild an entry from bytes received from a peer
    pub fn from_bytes(tx_bytes: Vec<u8>, deadline: Height) -> Result<Self, CoreError> {
        let tx = SignedTransaction::from_bytes(&tx_bytes)?;
        Ok(Self {
            tx,
            tx_bytes,
            deadline,
        })
    }

    pub fn hash(&self) -> TxHash {
        TxHash::of_bytes(&self.tx_bytes)
    }
}

struct Slot {
    seq: u64,
    entry: Arc<MempoolEntry>,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    order: BTreeMap<u64, TxHash>,
    entries: HashMap<TxHash, Slot>,
}

impl Inner {
    fn remove(&mut self, key: &TxHash) -> Option<Arc<MempoolEntry>> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot.entry)
    }
}

/// Bounded FIFO of pending transactions
pub struct Mempool {
    inner: Mutex<Inner>,
    capacity: usize,
    broadcaster: Option<Arc<PeerBroadcaster>>,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            broadcaster: None,
        }
    }

    /// Forward locally admitted transactions to peers
    pub fn with_broadcaster(mut self, broadcaster: Arc<PeerBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit a transaction submitted to this node and hand it to the peer broadcaster
    ///
    /// The broadcast is queued without waiting; peer failures never affect admission.
    pub fn add_transaction(&self, key: TxHash, entry: MempoolEntry) -> Result<(), MempoolError> {
        let bytes = Arc::new(entry.tx_bytes.clone());
        self.admit(key.clone(), entry)?;

        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.broadcast(&key, bytes);
        }
        Ok(())
    }

    /// Admit a transaction forwarded by a peer; it is not broadcast again
    pub fn add_forwarded(&self, key: TxHash, entry: MempoolEntry) -> Result<(), MempoolError> {
        self.admit(key, entry)
    }

    fn admit(&self, key: TxHash, entry: MempoolEntry) -> Result<(), MempoolError> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            return Err(MempoolError::Duplicate(key));
        }
        if inner.entries.len() >= self.capacity {
            return Err(MempoolError::Full {
                capacity: self.capacity,
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key.clone(),
            Slot {
                seq,
                entry: Arc::new(entry),
            },
        );
        tracing::debug!(tx_hash = %key, pending = inner.entries.len(), "Admitted transaction");
        Ok(())
    }

    /// Up to `n` entries still live at `height`, oldest first; nothing is removed
    pub fn get_batch(&self, n: usize, height: Height) -> Vec<Arc<MempoolEntry>> {
        let inner = self.inner.lock();
        inner
            .order
            .values()
            .filter_map(|key| inner.entries.get(key))
            .filter(|slot| slot.entry.deadline > height)
            .take(n)
            .map(|slot| slot.entry.clone())
            .collect()
    }

    /// Remove the given keys; unknown keys are ignored. Returns how many were removed.
    pub fn remove_batch<'a>(&self, keys: impl IntoIterator<Item = &'a TxHash>) -> usize {
        let mut inner = self.inner.lock();
        keys.into_iter().filter(|key| inner.remove(key).is_some()).count()
    }

    /// Drop every entry whose deadline is at or below `height`
    pub fn remove_expired_transactions(&self, height: Height) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<TxHash> = inner
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.deadline <= height)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        if !expired.is_empty() {
            tracing::info!(height, removed = expired.len(), "Expired pending transactions");
        }
        expired.len()
    }

    pub fn contains(&self, key: &TxHash) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn get(&self, key: &TxHash) -> Option<Arc<MempoolEntry>> {
        self.inner.lock().entries.get(key).map(|slot| slot.entry.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
