//! Keeper
//!
//! The command surface, block hook and packet entry point over one store.
//!
//! ```text
//!   ┌─────────────────────────────────────────────────────────────────┐
//!   │ Keeper<S: KvStore, C: Combiner>                                 │
//!   │                                                                 │
//!   │  commands ──▶ EpochSet / EncryptedTxBatch / AggregatedKeyShare  │
//!   │  begin_block ──▶ promote epochs, drain height - 1              │
//!   │  on_recv_packet ──▶ broker                                      │
//!   │                                                                 │
//!   │  every transition validates first, then persists               │
//!   └─────────────────────────────────────────────────────────────────┘
//! ```

use keyshare_config::{ChannelConfig, KeyshareConfig};
use keyshare_threshold::{Combiner, ShamirCombiner};
use log::{debug, info, warn};

use crate::aggregator::{AggregatedKeyShare, AggregatorStore, Condition, KeyShare, ShareOutcome};
use crate::broker::{
    self, Acknowledgement, BrokerStore, ChannelEnd, ChannelStore, DecryptionKeyRequest, Packet,
    PrivateDecryptionKey, PrivateDecryptionKeyRequest, channel,
};
use crate::epoch::{self, CreateQueuedKey, EpochSet, EpochStore, PublicKeyEpoch};
use crate::error::{KeyshareError, Result};
use crate::events::Event;
use crate::ledger::{EncryptedTransaction, EncryptedTxBatch, LedgerStore, ScheduledKeys};
use crate::msgs::{Msg, MsgCreateQueuedPublicKey, MsgSubmitEncryptedTx, MsgSubmitKeyShare};
use crate::params::Params;
use crate::storage::KvStore;

/// What happened to the batch targeting the previous height
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainedBatch {
    /// The decryption key is available; these entries are now processed
    Ready {
        height: u64,
        key: Vec<u8>,
        txs: Vec<EncryptedTransaction>,
    },
    /// No key arrived in time; these entries are now expired
    Expired {
        height: u64,
        txs: Vec<EncryptedTransaction>,
    },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    pub height: u64,
    pub drained: DrainedBatch,
    pub events: Vec<Event>,
}

pub struct Keeper<S: KvStore, C: Combiner = ShamirCombiner> {
    store: S,
    params: Params,
    channel: ChannelConfig,
    combiner: C,
    /// Height of the block being executed
    height: u64,
}

impl<S: KvStore> Keeper<S, ShamirCombiner> {
    /// Keeper with the reference Shamir combiner, configured from `config`
    pub fn from_config(store: S, config: &KeyshareConfig) -> Self {
        Keeper::new(
            store,
            Params::from(&config.params),
            config.channel.clone(),
            ShamirCombiner::new(),
        )
    }
}

impl<S: KvStore, C: Combiner> Keeper<S, C> {
    pub fn new(store: S, params: Params, channel: ChannelConfig, combiner: C) -> Self {
        Self {
            store,
            params,
            channel,
            combiner,
            height: 0,
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Replace the parameters (governance update)
    pub fn set_params(&mut self, params: Params) -> Result<()> {
        params.validate()?;
        self.store.store_params(&params)?;
        self.params = params;
        Ok(())
    }

    pub fn channel_config(&self) -> &ChannelConfig {
        &self.channel
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub fn create_queued_public_key(&mut self, msg: MsgCreateQueuedPublicKey) -> Result<Vec<Event>> {
        let epochs = self.store.load_epochs()?;
        let transition = epochs.create_queued_key(
            &self.params,
            self.height,
            CreateQueuedKey {
                creator: msg.creator,
                public_key: msg.public_key,
                commitments: msg.commitments,
                number_of_validators: msg.number_of_validators,
            },
        )?;

        let mut scheduled = self.store.load_scheduled_keys()?;
        scheduled.queued = Some(transition.scheduled);

        // epochs and their mirror land together or not at all
        let mut writes = transition.epochs.writes()?;
        writes.extend(scheduled.writes()?);
        self.store.write_batch(writes)?;

        if let Some(queued) = &transition.epochs.queued {
            info!(
                "Queued key {} by {} (expires at {})",
                queued.public_key, queued.creator, queued.expiry_height
            );
        }
        Ok(transition.events)
    }

    /// Store a ciphertext for a future height; returns its index.
    pub fn submit_encrypted_tx(&mut self, msg: MsgSubmitEncryptedTx) -> Result<(u64, Vec<Event>)> {
        if msg.data.is_empty() {
            return Err(KeyshareError::InvalidEncryptedTx("data cannot be empty".into()));
        }
        if msg.target_block_height <= self.height {
            return Err(KeyshareError::TargetHeightNotInFuture {
                target: msg.target_block_height,
                current: self.height,
            });
        }
        let max_expiry = self
            .store
            .load_scheduled_keys()?
            .max_expiry()
            .ok_or(KeyshareError::ActivePubKeyNotFound)?;
        if msg.target_block_height > max_expiry {
            return Err(KeyshareError::TargetHeightBeyondKeys {
                target: msg.target_block_height,
                expiry: max_expiry,
            });
        }

        let target = msg.target_block_height;
        let tx = EncryptedTransaction::new(target, msg.creator.clone(), msg.data);
        let index = self.store.append_encrypted_tx(target, tx)?;
        debug!("Encrypted tx from {} at {target}/{index}", msg.creator);

        Ok((
            index,
            vec![Event::EncryptedTxSubmitted {
                creator: msg.creator,
                target_height: target,
                index,
            }],
        ))
    }

    pub fn submit_key_share(&mut self, msg: MsgSubmitKeyShare) -> Result<(ShareOutcome, Vec<Event>)> {
        if msg.share_data.is_empty() {
            return Err(KeyshareError::InvalidKeyShare("share data cannot be empty".into()));
        }
        if msg.share_index == 0 {
            return Err(KeyshareError::InvalidKeyShare("share index starts at 1".into()));
        }

        let request = match &msg.condition {
            Condition::Identity(id) => self.store.decryption_request(id)?,
            Condition::Height(_) => None,
        };
        let pinned = request.as_ref().map(|r| r.pubkey.as_str());

        // An identity aggregate started under another key than the one its
        // request is pinned to cannot answer that request.
        let existing = self
            .store
            .load_aggregate(&msg.condition)?
            .filter(|agg| pinned.is_none_or(|key| key == agg.public_key));
        let aggregate = match existing {
            Some(existing) => existing,
            None => {
                let epochs = self.store.load_epochs()?;
                let epoch = msg.condition.covering_epoch(&epochs, pinned)?;
                AggregatedKeyShare::new(
                    msg.condition.clone(),
                    &epoch.public_key,
                    self.params.threshold_for(epoch.number_of_validators),
                )
            }
        };

        if !aggregate.has_share_from(&msg.creator) {
            aggregate.check_share(
                msg.share_index,
                &msg.share_data,
                self.combiner.max_share_index(),
            )?;
        }

        let was_ready = aggregate.is_ready();
        let share = KeyShare {
            validator: msg.creator,
            condition: msg.condition,
            share_index: msg.share_index,
            share_data: msg.share_data,
            submitted_at: self.height,
        };
        let (next, outcome, events) = aggregate.submit_share(share, &self.combiner, self.height);

        if outcome == ShareOutcome::AlreadySubmitted {
            return Ok((outcome, events));
        }
        self.store.store_aggregate(&next)?;

        if !was_ready && next.is_ready() {
            if let Some(mut req) = request {
                if req.absorb(Some(&next)) {
                    self.store.store_decryption_request(&req)?;
                }
            }
        }
        Ok((outcome, events))
    }

    /// Attach a key encrypted to `requester` to an identity's private request.
    pub fn record_private_decryption_key(
        &mut self,
        identity: &str,
        key: PrivateDecryptionKey,
    ) -> Result<()> {
        if key.encrypted_key.is_empty() {
            return Err(KeyshareError::InvalidKeyShare("encrypted key cannot be empty".into()));
        }
        let mut req = self
            .store
            .private_request(identity)?
            .ok_or_else(|| KeyshareError::RequestNotFound(identity.to_string()))?;
        debug!("Private key for {identity} recorded for {}", key.requester);
        req.record(key);
        self.store.store_private_request(&req)
    }

    /// Route one message to its command. Messages owned elsewhere are ignored.
    pub fn deliver(&mut self, msg: Msg) -> Result<Vec<Event>> {
        match msg {
            Msg::SubmitEncryptedTx(m) => self.submit_encrypted_tx(m).map(|(_, events)| events),
            Msg::SubmitKeyShare(m) => self.submit_key_share(m).map(|(_, events)| events),
            Msg::CreateQueuedPublicKey(m) => self.create_queued_public_key(m),
            Msg::Other { type_url } => {
                debug!("Ignoring {type_url}");
                Ok(Vec::new())
            }
        }
    }

    // ========================================================================
    // Block hook
    // ========================================================================

    /// Advance to `height`: rotate keys, then settle the batch for `height - 1`.
    pub fn begin_block(&mut self, height: u64) -> Result<BlockOutcome> {
        self.height = height;

        let epochs = self.store.load_epochs()?;
        let (next, mut events) = epochs.promote_expired(height);
        let scheduled = self.store.load_scheduled_keys()?;
        let promoted = scheduled.promote(height);

        let mut writes = Vec::new();
        if next != epochs {
            writes.extend(next.writes()?);
        }
        if promoted != scheduled {
            writes.extend(promoted.writes()?);
        }
        if !writes.is_empty() {
            self.store.write_batch(writes)?;
            epoch::log_promotion(height, &events);
        }

        let drained = match height.checked_sub(1) {
            Some(target) if target > 0 => self.drain(target, height, &mut events)?,
            _ => DrainedBatch::Empty,
        };

        Ok(BlockOutcome {
            height,
            drained,
            events,
        })
    }

    fn drain(&mut self, target: u64, height: u64, events: &mut Vec<Event>) -> Result<DrainedBatch> {
        let mut batch = self.store.encrypted_txs(target)?;
        let pending: Vec<u64> = batch
            .txs
            .iter()
            .filter(|tx| tx.is_pending())
            .map(|tx| tx.index)
            .collect();
        if pending.is_empty() {
            return Ok(DrainedBatch::Empty);
        }

        let aggregate = self.store.load_aggregate(&Condition::Height(target))?;
        match aggregate.filter(AggregatedKeyShare::is_ready) {
            Some(agg) => {
                for &index in &pending {
                    batch.mark_processed(index, height);
                }
                self.store.store_encrypted_txs(&batch)?;
                info!("Height {target}: {} encrypted txs ready", pending.len());
                Ok(DrainedBatch::Ready {
                    height: target,
                    key: agg.aggregated_value,
                    txs: select(&batch, &pending),
                })
            }
            None => {
                let count = batch.mark_all_expired();
                self.store.store_encrypted_txs(&batch)?;
                warn!("Height {target}: no decryption key, {count} encrypted txs expired");
                events.push(Event::EncryptedTxsExpired {
                    height: target,
                    count,
                });
                Ok(DrainedBatch::Expired {
                    height: target,
                    txs: select(&batch, &pending),
                })
            }
        }
    }

    // ========================================================================
    // Ledger maintenance
    // ========================================================================

    /// No-op when the height or index does not exist.
    pub fn mark_processed(&mut self, height: u64, index: u64, processed_at: u64) -> Result<()> {
        self.store.mark_encrypted_tx_processed(height, index, processed_at)
    }

    pub fn mark_all_expired(&mut self, height: u64) -> Result<u64> {
        self.store.mark_all_encrypted_txs_expired(height)
    }

    /// Remove one entry; later entries shift down by one.
    pub fn remove_encrypted_tx(&mut self, height: u64, index: u64) -> Result<EncryptedTransaction> {
        self.store.remove_encrypted_tx(height, index)
    }

    /// Drop every entry targeting `height`. Other heights are untouched.
    pub fn remove_all_from_height(&mut self, height: u64) -> Result<bool> {
        self.store.remove_encrypted_tx_batch(height)
    }

    // ========================================================================
    // Packets and channels
    // ========================================================================

    pub fn on_recv_packet(&mut self, packet: &Packet) -> (Acknowledgement, Vec<Event>) {
        broker::on_recv_packet(&mut self.store, packet)
    }

    pub fn on_acknowledgement_packet(&mut self, packet: &Packet, ack: &Acknowledgement) -> Result<()> {
        broker::on_acknowledgement_packet(packet, ack)
    }

    pub fn on_timeout_packet(&mut self, packet: &Packet) -> Result<()> {
        broker::on_timeout_packet(packet)
    }

    pub fn on_chan_open_init(&self, port_id: &str, version: &str) -> Result<String> {
        channel::on_chan_open_init(&self.channel, port_id, version)
    }

    pub fn on_chan_open_try(&self, port_id: &str, counterparty_version: &str) -> Result<String> {
        channel::on_chan_open_try(&self.channel, port_id, counterparty_version)
    }

    pub fn on_chan_open_ack(&self, counterparty_version: &str) -> Result<()> {
        channel::on_chan_open_ack(&self.channel, counterparty_version)
    }

    pub fn on_chan_open_confirm(&mut self, port_id: &str, channel_id: &str) -> Result<()> {
        channel::on_chan_open_confirm(&mut self.store, &self.channel, port_id, channel_id)
    }

    pub fn on_chan_close_init(&self, port_id: &str, channel_id: &str) -> Result<()> {
        channel::on_chan_close_init(port_id, channel_id)
    }

    pub fn on_chan_close_confirm(&self, port_id: &str, channel_id: &str) -> Result<()> {
        channel::on_chan_close_confirm(port_id, channel_id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn epochs(&self) -> Result<EpochSet> {
        self.store.load_epochs()
    }

    pub fn active_pub_key(&self) -> Result<Option<PublicKeyEpoch>> {
        Ok(self.store.load_epochs()?.active)
    }

    pub fn queued_pub_key(&self) -> Result<Option<PublicKeyEpoch>> {
        Ok(self.store.load_epochs()?.queued)
    }

    pub fn scheduled_keys(&self) -> Result<ScheduledKeys> {
        self.store.load_scheduled_keys()
    }

    pub fn encrypted_tx(&self, height: u64, index: u64) -> Result<Option<EncryptedTransaction>> {
        Ok(self.store.encrypted_txs(height)?.get(index).cloned())
    }

    pub fn encrypted_txs(&self, height: u64) -> Result<EncryptedTxBatch> {
        self.store.encrypted_txs(height)
    }

    pub fn encrypted_txs_from_height(&self, height: u64) -> Result<Vec<EncryptedTxBatch>> {
        self.store.encrypted_txs_from_height(height)
    }

    pub fn all_encrypted_txs(&self) -> Result<Vec<EncryptedTxBatch>> {
        self.store.all_encrypted_txs()
    }

    /// `(value, ready)` for a condition; empty and not ready if unseen.
    pub fn aggregated(&self, condition: &Condition) -> Result<(Vec<u8>, bool)> {
        Ok(self
            .store
            .load_aggregate(condition)?
            .map(|agg| {
                let (value, ready) = agg.get_aggregated();
                (value.to_vec(), ready)
            })
            .unwrap_or_default())
    }

    pub fn aggregate(&self, condition: &Condition) -> Result<Option<AggregatedKeyShare>> {
        self.store.load_aggregate(condition)
    }

    pub fn decryption_request(&self, identity: &str) -> Result<Option<DecryptionKeyRequest>> {
        self.store.decryption_request(identity)
    }

    pub fn private_request(&self, identity: &str) -> Result<Option<PrivateDecryptionKeyRequest>> {
        self.store.private_request(identity)
    }

    pub fn bound_channel(&self) -> Result<Option<ChannelEnd>> {
        self.store.bound_channel()
    }
}

fn select(batch: &EncryptedTxBatch, indices: &[u64]) -> Vec<EncryptedTransaction> {
    indices.iter().filter_map(|&i| batch.get(i).cloned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemStore, WriteOp};
    use keyshare_threshold::split_secret;

    fn keeper() -> Keeper<MemStore> {
        let params = Params::default().with_trusted(&["alice"]).with_key_expiry(50);
        Keeper::new(MemStore::new(), params, ChannelConfig::default(), ShamirCombiner::new())
    }

    fn queue(keeper: &mut Keeper<MemStore>, key: &str, validators: u64) -> Vec<Event> {
        keeper
            .create_queued_public_key(MsgCreateQueuedPublicKey {
                creator: "alice".into(),
                public_key: key.into(),
                commitments: vec!["c".into(); validators as usize],
                number_of_validators: validators,
            })
            .unwrap()
    }

    fn encrypted(target: u64, data: &[u8]) -> MsgSubmitEncryptedTx {
        MsgSubmitEncryptedTx {
            creator: "user".into(),
            data: data.to_vec(),
            target_block_height: target,
        }
    }

    /// Refuses any batch touching the scheduled-key mirror.
    #[derive(Default)]
    struct MirrorFailsStore {
        inner: MemStore,
    }

    impl KvStore for MirrorFailsStore {
        fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&mut self, key: &[u8], value: Vec<u8>) -> anyhow::Result<()> {
            self.inner.put(key, value)
        }

        fn delete(&mut self, key: &[u8]) -> anyhow::Result<()> {
            self.inner.delete(key)
        }

        fn write_batch(&mut self, ops: Vec<WriteOp>) -> anyhow::Result<()> {
            let touches_mirror = ops.iter().any(|op| match op {
                WriteOp::Put(key, _) | WriteOp::Delete(key) => key.starts_with(b"scheduled-key/"),
            });
            if touches_mirror {
                anyhow::bail!("disk full");
            }
            self.inner.write_batch(ops)
        }

        fn scan_prefix(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan_prefix(prefix)
        }
    }

    #[test]
    fn failed_mirror_write_leaves_epochs_untouched() {
        let params = Params::default().with_trusted(&["alice"]).with_key_expiry(50);
        let mut k = Keeper::new(
            MirrorFailsStore::default(),
            params,
            ChannelConfig::default(),
            ShamirCombiner::new(),
        );

        let err = k
            .create_queued_public_key(MsgCreateQueuedPublicKey {
                creator: "alice".into(),
                public_key: "K1".into(),
                commitments: vec!["c".into()],
                number_of_validators: 1,
            })
            .unwrap_err();

        assert!(matches!(err, KeyshareError::Storage(_)));
        assert_eq!(k.epochs().unwrap(), EpochSet::default());
        assert!(k.store().inner.is_empty());
    }

    #[test]
    fn queued_key_is_mirrored_to_schedule() {
        let mut k = keeper();
        k.begin_block(100).unwrap();
        queue(&mut k, "K1", 4);

        let scheduled = k.scheduled_keys().unwrap();
        assert_eq!(scheduled.queued.unwrap().expiry, 150);
        assert!(scheduled.active.is_none());

        k.begin_block(101).unwrap();
        assert_eq!(k.active_pub_key().unwrap().unwrap().public_key, "K1");
        assert_eq!(k.scheduled_keys().unwrap().active.unwrap().public_key, "K1");
    }

    #[test]
    fn encrypted_tx_validation() {
        let mut k = keeper();
        k.begin_block(10).unwrap();

        assert!(matches!(
            k.submit_encrypted_tx(encrypted(20, b"x")),
            Err(KeyshareError::ActivePubKeyNotFound)
        ));

        queue(&mut k, "K1", 1);
        assert!(matches!(
            k.submit_encrypted_tx(encrypted(20, b"")),
            Err(KeyshareError::InvalidEncryptedTx(_))
        ));
        assert!(matches!(
            k.submit_encrypted_tx(encrypted(10, b"x")),
            Err(KeyshareError::TargetHeightNotInFuture { target: 10, current: 10 })
        ));
        assert!(matches!(
            k.submit_encrypted_tx(encrypted(61, b"x")),
            Err(KeyshareError::TargetHeightBeyondKeys { target: 61, expiry: 60 })
        ));

        let (index, events) = k.submit_encrypted_tx(encrypted(60, b"x")).unwrap();
        assert_eq!(index, 0);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn ready_height_is_processed_on_next_block() {
        let mut k = keeper();
        k.begin_block(1).unwrap();
        queue(&mut k, "K1", 3);
        k.begin_block(2).unwrap();

        k.submit_encrypted_tx(encrypted(5, b"a")).unwrap();
        k.submit_encrypted_tx(encrypted(5, b"b")).unwrap();

        let secret = [9u8; 32];
        let shares = split_secret(&secret, 2, 3).unwrap();
        for (i, share) in shares.iter().take(2).enumerate() {
            k.submit_key_share(MsgSubmitKeyShare {
                creator: format!("val{i}"),
                condition: Condition::Height(5),
                share_index: share.index,
                share_data: share.value.clone(),
            })
            .unwrap();
        }

        let outcome = k.begin_block(6).unwrap();
        match outcome.drained {
            DrainedBatch::Ready { height, key, txs } => {
                assert_eq!(height, 5);
                assert_eq!(key, secret.to_vec());
                assert_eq!(txs.len(), 2);
            }
            other => panic!("expected ready batch, got {other:?}"),
        }
        assert!(k.encrypted_txs(5).unwrap().txs.iter().all(|tx| tx.processed_at_height == 6));

        // Already settled; a replayed block drains nothing.
        assert_eq!(k.begin_block(6).unwrap().drained, DrainedBatch::Empty);
    }

    #[test]
    fn missing_key_expires_height() {
        let mut k = keeper();
        k.begin_block(1).unwrap();
        queue(&mut k, "K1", 3);
        k.submit_encrypted_tx(encrypted(3, b"a")).unwrap();

        let outcome = k.begin_block(4).unwrap();
        assert!(matches!(outcome.drained, DrainedBatch::Expired { height: 3, ref txs } if txs.len() == 1));
        assert!(outcome
            .events
            .contains(&Event::EncryptedTxsExpired { height: 3, count: 1 }));
        assert!(k.encrypted_tx(3, 0).unwrap().unwrap().expired);
    }

    #[test]
    fn key_share_validation() {
        let mut k = keeper();
        let msg = |index: u64, data: Vec<u8>| MsgSubmitKeyShare {
            creator: "val0".into(),
            condition: Condition::Height(5),
            share_index: index,
            share_data: data,
        };

        assert!(matches!(
            k.submit_key_share(msg(1, Vec::new())),
            Err(KeyshareError::InvalidKeyShare(_))
        ));
        assert!(matches!(
            k.submit_key_share(msg(0, vec![1])),
            Err(KeyshareError::InvalidKeyShare(_))
        ));
        assert!(matches!(
            k.submit_key_share(msg(1, vec![1])),
            Err(KeyshareError::NoEpochForCondition(_))
        ));
    }

    #[test]
    fn private_keys_need_an_open_request() {
        let mut k = keeper();
        let key = PrivateDecryptionKey {
            requester: "bob".into(),
            secp_pubkey: "02ab".into(),
            encrypted_key: vec![1],
        };
        assert!(matches!(
            k.record_private_decryption_key("id", key),
            Err(KeyshareError::RequestNotFound(_))
        ));
    }

    #[test]
    fn foreign_messages_are_ignored() {
        let mut k = keeper();
        let events = k
            .deliver(Msg::Other {
                type_url: "/bank.MsgSend".into(),
            })
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn params_update_is_validated() {
        let mut k = keeper();
        assert!(k.set_params(Params::default().with_key_expiry(0)).is_err());
        k.set_params(Params::default().with_key_expiry(7)).unwrap();
        assert_eq!(k.params().key_expiry, 7);
        assert_eq!(k.store().load_params().unwrap().unwrap().key_expiry, 7);
    }
}
