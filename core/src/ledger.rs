//! Encrypted Transaction Ledger
//!
//! Encrypted transactions are bucketed by the height at which they may be
//! decrypted. Within a bucket the index of an entry always equals its position.
//!
//! ```text
//!   encrypted-tx/<height BE>  →  EncryptedTxBatch { txs: [0, 1, 2, ...] }
//!                                       │
//!                     begin_block(h+1)  ▼
//!                        processed_at_height = h+1   (key ready)
//!                        expired = true              (no key)
//! ```

use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

use crate::epoch::ScheduledKey;
use crate::error::{KeyshareError, Result};
use crate::keys;
use crate::storage::codec::wincode_record;
use crate::storage::{KvStore, Record, WriteOp, load, save};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct EncryptedTransaction {
    pub target_height: u64,
    /// Position within the batch for `target_height`
    pub index: u64,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    pub creator: String,
    /// blake3 of `data`
    #[serde(with = "hex::serde")]
    pub tx_id: [u8; 32],
    /// Height at which the decryption key was available, 0 while pending
    pub processed_at_height: u64,
    pub expired: bool,
}

impl EncryptedTransaction {
    pub fn new(target_height: u64, creator: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            target_height,
            index: 0,
            tx_id: *blake3::hash(&data).as_bytes(),
            data,
            creator: creator.into(),
            processed_at_height: 0,
            expired: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.processed_at_height == 0 && !self.expired
    }
}

/// All encrypted transactions targeting one height
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct EncryptedTxBatch {
    pub height: u64,
    pub txs: Vec<EncryptedTransaction>,
}

wincode_record!(EncryptedTxBatch);

impl EncryptedTxBatch {
    pub fn new(height: u64) -> Self {
        Self {
            height,
            txs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Append a transaction, assigning it the next index.
    pub fn append(&mut self, mut tx: EncryptedTransaction) -> u64 {
        let index = self.txs.len() as u64;
        tx.index = index;
        tx.target_height = self.height;
        self.txs.push(tx);
        index
    }

    pub fn get(&self, index: u64) -> Option<&EncryptedTransaction> {
        self.txs.get(usize::try_from(index).ok()?)
    }

    /// Record the height an entry was processed at.
    ///
    /// Returns false and leaves the batch untouched when `index` is out of range.
    pub fn mark_processed(&mut self, index: u64, processed_at: u64) -> bool {
        match usize::try_from(index).ok().and_then(|i| self.txs.get_mut(i)) {
            Some(tx) => {
                tx.processed_at_height = processed_at;
                true
            }
            None => false,
        }
    }

    /// Flag every entry as expired; returns how many changed.
    pub fn mark_all_expired(&mut self) -> u64 {
        let mut changed = 0;
        for tx in self.txs.iter_mut().filter(|tx| !tx.expired) {
            tx.expired = true;
            changed += 1;
        }
        changed
    }

    /// Remove one entry and close the gap, renumbering the survivors.
    pub fn remove(&mut self, index: u64) -> Result<EncryptedTransaction> {
        let pos = usize::try_from(index)
            .ok()
            .filter(|&i| i < self.txs.len())
            .ok_or(KeyshareError::IndexOutOfRange {
                height: self.height,
                index,
            })?;

        let removed = self.txs.remove(pos);
        for (i, tx) in self.txs.iter_mut().enumerate().skip(pos) {
            tx.index = i as u64;
        }
        Ok(removed)
    }

    /// Every entry sits at the position its index names.
    pub fn is_well_ordered(&self) -> bool {
        self.txs
            .iter()
            .enumerate()
            .all(|(i, tx)| tx.index == i as u64 && tx.target_height == self.height)
    }
}

/// The scheduler's view of the key schedule, mirrored from the epoch manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledKeys {
    pub active: Option<ScheduledKey>,
    pub queued: Option<ScheduledKey>,
}

impl ScheduledKeys {
    pub fn writes(&self) -> Result<Vec<WriteOp>> {
        Ok(vec![
            WriteOp::upsert(keys::SCHEDULED_ACTIVE_KEY, self.active.as_ref())?,
            WriteOp::upsert(keys::SCHEDULED_QUEUED_KEY, self.queued.as_ref())?,
        ])
    }

    /// Latest height any scheduled key covers.
    pub fn max_expiry(&self) -> Option<u64> {
        self.active
            .iter()
            .chain(self.queued.iter())
            .map(|k| k.expiry)
            .max()
    }

    /// Move the queued key into the active slot once the active one has expired.
    pub fn promote(&self, height: u64) -> ScheduledKeys {
        let expired = self.active.as_ref().is_none_or(|a| height >= a.expiry);
        if !expired {
            return self.clone();
        }
        ScheduledKeys {
            active: self.queued.clone(),
            queued: None,
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Encrypted-tx keyspace accessors
pub trait LedgerStore: KvStore {
    /// Append to the batch for `height`, returning the assigned index.
    fn append_encrypted_tx(&mut self, height: u64, tx: EncryptedTransaction) -> Result<u64> {
        let mut batch = self.encrypted_txs(height)?;
        let index = batch.append(tx);
        save(self, &keys::encrypted_tx_key(height), &batch)?;
        Ok(index)
    }

    /// The batch for `height`; empty if nothing was submitted.
    fn encrypted_txs(&self, height: u64) -> Result<EncryptedTxBatch> {
        Ok(load(self, &keys::encrypted_tx_key(height))?.unwrap_or_else(|| EncryptedTxBatch::new(height)))
    }

    fn store_encrypted_txs(&mut self, batch: &EncryptedTxBatch) -> Result<()> {
        if batch.is_empty() {
            self.delete(&keys::encrypted_tx_key(batch.height))?;
            return Ok(());
        }
        Ok(save(self, &keys::encrypted_tx_key(batch.height), batch)?)
    }

    /// Every non-empty batch at or above `height`, ascending.
    fn encrypted_txs_from_height(&self, height: u64) -> Result<Vec<EncryptedTxBatch>> {
        Ok(self
            .all_encrypted_txs()?
            .into_iter()
            .filter(|batch| batch.height >= height)
            .collect())
    }

    fn all_encrypted_txs(&self) -> Result<Vec<EncryptedTxBatch>> {
        self.scan_prefix(keys::ENCRYPTED_TX_PREFIX)?
            .into_iter()
            .map(|(_, bytes)| EncryptedTxBatch::decode(&bytes).map_err(KeyshareError::from))
            .collect()
    }

    /// No-op when the height or index does not exist.
    fn mark_encrypted_tx_processed(&mut self, height: u64, index: u64, processed_at: u64) -> Result<()> {
        let mut batch = self.encrypted_txs(height)?;
        if batch.mark_processed(index, processed_at) {
            self.store_encrypted_txs(&batch)?;
        }
        Ok(())
    }

    fn mark_all_encrypted_txs_expired(&mut self, height: u64) -> Result<u64> {
        let mut batch = self.encrypted_txs(height)?;
        let changed = batch.mark_all_expired();
        if changed > 0 {
            self.store_encrypted_txs(&batch)?;
        }
        Ok(changed)
    }

    fn remove_encrypted_tx(&mut self, height: u64, index: u64) -> Result<EncryptedTransaction> {
        let mut batch = self.encrypted_txs(height)?;
        let removed = batch.remove(index)?;
        self.store_encrypted_txs(&batch)?;
        Ok(removed)
    }

    /// Drop the whole batch for `height`; false if there was none.
    fn remove_encrypted_tx_batch(&mut self, height: u64) -> Result<bool> {
        let key = keys::encrypted_tx_key(height);
        if self.get(&key)?.is_none() {
            return Ok(false);
        }
        self.delete(&key)?;
        Ok(true)
    }

    fn load_scheduled_keys(&self) -> Result<ScheduledKeys> {
        Ok(ScheduledKeys {
            active: load(self, keys::SCHEDULED_ACTIVE_KEY)?,
            queued: load(self, keys::SCHEDULED_QUEUED_KEY)?,
        })
    }

    fn store_scheduled_keys(&mut self, scheduled: &ScheduledKeys) -> Result<()> {
        Ok(self.write_batch(scheduled.writes()?)?)
    }
}

impl<S: KvStore + ?Sized> LedgerStore for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;

    fn batch_of(height: u64, n: usize) -> EncryptedTxBatch {
        let mut batch = EncryptedTxBatch::new(height);
        for i in 0..n {
            batch.append(EncryptedTransaction::new(height, "user", vec![i as u8 + 1]));
        }
        batch
    }

    #[test]
    fn append_assigns_positions() {
        let batch = batch_of(500, 3);
        assert!(batch.is_well_ordered());
        assert_eq!(batch.get(2).unwrap().data, vec![3]);
        assert_eq!(batch.get(0).unwrap().tx_id, *blake3::hash(&[1]).as_bytes());
    }

    #[test]
    fn remove_compacts_and_renumbers() {
        let mut batch = batch_of(500, 3);
        let removed = batch.remove(1).unwrap();
        assert_eq!(removed.data, vec![2]);

        assert_eq!(batch.len(), 2);
        assert!(batch.is_well_ordered());
        assert_eq!(batch.get(1).unwrap().data, vec![3]);
    }

    #[test]
    fn remove_out_of_range_is_an_error() {
        let mut batch = batch_of(500, 2);
        assert!(matches!(
            batch.remove(2),
            Err(KeyshareError::IndexOutOfRange { height: 500, index: 2 })
        ));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn mark_processed_out_of_range_is_a_no_op() {
        let mut batch = batch_of(10, 2);
        let before = batch.clone();
        assert!(!batch.mark_processed(7, 11));
        assert!(!batch.mark_processed(u64::MAX, 11));
        assert_eq!(batch, before);
        assert_eq!(batch.encode().unwrap(), before.encode().unwrap());
    }

    #[test]
    fn expire_is_idempotent() {
        let mut batch = batch_of(10, 2);
        assert_eq!(batch.mark_all_expired(), 2);
        assert_eq!(batch.mark_all_expired(), 0);
        assert!(batch.txs.iter().all(|tx| !tx.is_pending()));
    }

    #[test]
    fn scheduled_keys_promote_on_expiry() {
        let key = |name: &str, expiry| ScheduledKey {
            creator: "alice".into(),
            public_key: name.into(),
            expiry,
        };
        let keys = ScheduledKeys {
            active: Some(key("K1", 150)),
            queued: Some(key("K2", 200)),
        };

        assert_eq!(keys.max_expiry(), Some(200));
        assert_eq!(keys.promote(149), keys);

        let promoted = keys.promote(150);
        assert_eq!(promoted.active.unwrap().public_key, "K2");
        assert!(promoted.queued.is_none());
    }

    #[test]
    fn store_round_trip_and_range_queries() {
        let mut store = MemStore::new();
        for height in [5, 10, 300] {
            store
                .append_encrypted_tx(height, EncryptedTransaction::new(height, "u", vec![1]))
                .unwrap();
        }
        assert_eq!(
            store
                .append_encrypted_tx(10, EncryptedTransaction::new(10, "u", vec![2]))
                .unwrap(),
            1
        );

        let heights: Vec<u64> = store
            .encrypted_txs_from_height(10)
            .unwrap()
            .iter()
            .map(|b| b.height)
            .collect();
        assert_eq!(heights, vec![10, 300]);
        assert_eq!(store.all_encrypted_txs().unwrap().len(), 3);

        store.mark_encrypted_tx_processed(10, 1, 11).unwrap();
        store.mark_encrypted_tx_processed(10, 9, 11).unwrap();
        assert_eq!(store.encrypted_txs(10).unwrap().txs[1].processed_at_height, 11);

        assert!(store.remove_encrypted_tx_batch(10).unwrap());
        assert!(!store.remove_encrypted_tx_batch(10).unwrap());
        let left: Vec<u64> = store
            .all_encrypted_txs()
            .unwrap()
            .iter()
            .map(|b| b.height)
            .collect();
        assert_eq!(left, vec![5, 300]);
    }

    #[test]
    fn removing_the_last_entry_drops_the_batch() {
        let mut store = MemStore::new();
        store
            .append_encrypted_tx(42, EncryptedTransaction::new(42, "u", vec![9]))
            .unwrap();
        store.remove_encrypted_tx(42, 0).unwrap();
        assert!(store.is_empty());
        assert!(store.encrypted_txs(42).unwrap().is_empty());
    }
}
