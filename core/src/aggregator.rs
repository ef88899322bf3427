//! Key Share Aggregator
//!
//! Collects validator key shares per condition and combines them once a
//! quorum is reached.
//!
//! ```text
//!   Empty ──first share──▶ Collecting ──threshold distinct validators──▶ Ready
//!                              ▲   │                                     │
//!                              └───┘ more shares                         └─ later shares are
//!                                                                           recorded, never recombined
//! ```
//!
//! The combination itself is delegated to a [`Combiner`]; the aggregator only
//! owns the bookkeeping.

use std::collections::HashSet;
use std::fmt;

use keyshare_threshold::{Combiner, Share};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

use crate::epoch::{EpochSet, PublicKeyEpoch};
use crate::error::{KeyshareError, Result};
use crate::events::Event;
use crate::keys;
use crate::storage::codec::wincode_record;
use crate::storage::{KvStore, Record, load, save};

// ============================================================================
// Conditions
// ============================================================================

/// What a batch of key shares unlocks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Every encrypted tx targeting this height
    Height(u64),
    /// An opaque identity requested over a channel
    Identity(String),
}

impl Condition {
    /// Store key suffix. Heights are big-endian so they scan in order.
    pub fn store_key(&self) -> Vec<u8> {
        match self {
            Condition::Height(h) => {
                let mut key = b"h/".to_vec();
                key.extend_from_slice(&h.to_be_bytes());
                key
            }
            Condition::Identity(id) => {
                let mut key = b"i/".to_vec();
                key.extend_from_slice(id.as_bytes());
                key
            }
        }
    }

    /// The epoch whose validator set decides this condition.
    ///
    /// Identities follow the pubkey pinned on their request when there is one.
    pub fn covering_epoch<'a>(
        &self,
        epochs: &'a EpochSet,
        pinned_pubkey: Option<&str>,
    ) -> Result<&'a PublicKeyEpoch> {
        let epoch = match self {
            Condition::Height(h) => epochs.epoch_for_height(*h),
            Condition::Identity(_) => match pinned_pubkey {
                Some(pubkey) => epochs.epoch_with_key(pubkey),
                None => epochs.active.as_ref(),
            },
        };
        epoch.ok_or_else(|| KeyshareError::NoEpochForCondition(self.to_string()))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Height(h) => write!(f, "height:{h}"),
            Condition::Identity(id) => write!(f, "identity:{id}"),
        }
    }
}

// ============================================================================
// Shares
// ============================================================================

/// One validator's contribution toward a condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct KeyShare {
    pub validator: String,
    pub condition: Condition,
    /// Evaluation point of the share, 1-based
    pub share_index: u64,
    #[serde(with = "hex::serde")]
    pub share_data: Vec<u8>,
    pub submitted_at: u64,
}

/// Combined result for one condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct AggregatedKeyShare {
    pub condition: Condition,
    /// Public key of the epoch the shares belong to
    pub public_key: String,
    /// Distinct validators needed before combining
    pub threshold: u64,
    pub shares: Vec<KeyShare>,
    /// Empty until the condition is ready
    #[serde(with = "hex::serde")]
    pub aggregated_value: Vec<u8>,
    /// Height the quorum was reached at, 0 while collecting
    pub ready_at: u64,
}

wincode_record!(AggregatedKeyShare);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    Accepted { ready: bool },
    /// The validator already contributed to this condition
    AlreadySubmitted,
}

impl AggregatedKeyShare {
    pub fn new(condition: Condition, public_key: impl Into<String>, threshold: u64) -> Self {
        Self {
            condition,
            public_key: public_key.into(),
            threshold: threshold.max(1),
            shares: Vec::new(),
            aggregated_value: Vec::new(),
            ready_at: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.aggregated_value.is_empty()
    }

    pub fn has_share_from(&self, validator: &str) -> bool {
        self.shares.iter().any(|s| s.validator == validator)
    }

    /// `(value, ready)`; the value is empty while collecting.
    pub fn get_aggregated(&self) -> (&[u8], bool) {
        (&self.aggregated_value, self.is_ready())
    }

    /// Reject a share that could never take part in a combination next to
    /// the ones already stored.
    pub fn check_share(&self, share_index: u64, share_data: &[u8], max_index: u64) -> Result<()> {
        if share_data.is_empty() {
            return Err(KeyshareError::InvalidKeyShare("share data cannot be empty".into()));
        }
        if share_index == 0 || share_index > max_index {
            return Err(KeyshareError::InvalidKeyShare(format!(
                "share index {share_index} outside 1..={max_index}"
            )));
        }
        if self.shares.iter().any(|s| s.share_index == share_index) {
            return Err(KeyshareError::InvalidKeyShare(format!(
                "share index {share_index} already taken for {}",
                self.condition
            )));
        }
        if let Some(first) = self.shares.first() {
            if first.share_data.len() != share_data.len() {
                return Err(KeyshareError::InvalidKeyShare(format!(
                    "share length {} does not match {}",
                    share_data.len(),
                    first.share_data.len()
                )));
            }
        }
        Ok(())
    }

    /// Shares that can be combined together: the first share per index, with
    /// the index in range and all of one length. The earliest length that
    /// reaches the threshold wins; `None` until one does.
    fn usable_quorum(&self, max_index: u64) -> Option<Vec<Share>> {
        let mut seen = HashSet::new();
        let valid: Vec<&KeyShare> = self
            .shares
            .iter()
            .filter(|s| s.share_index >= 1 && s.share_index <= max_index)
            .filter(|s| !s.share_data.is_empty())
            .filter(|s| seen.insert(s.share_index))
            .collect();

        let mut widths: Vec<usize> = Vec::new();
        for share in &valid {
            if !widths.contains(&share.share_data.len()) {
                widths.push(share.share_data.len());
            }
        }

        widths.into_iter().find_map(|width| {
            let group: Vec<Share> = valid
                .iter()
                .filter(|s| s.share_data.len() == width)
                .map(|s| Share::new(s.share_index, s.share_data.clone()))
                .collect();
            (group.len() as u64 >= self.threshold).then_some(group)
        })
    }

    /// Record a share and combine if this one completes the quorum.
    ///
    /// A combiner failure is logged and leaves the condition collecting.
    pub fn submit_share<C: Combiner + ?Sized>(
        &self,
        share: KeyShare,
        combiner: &C,
        height: u64,
    ) -> (AggregatedKeyShare, ShareOutcome, Vec<Event>) {
        if self.has_share_from(&share.validator) {
            debug!(
                "{}: duplicate share from {}",
                self.condition, share.validator
            );
            return (self.clone(), ShareOutcome::AlreadySubmitted, Vec::new());
        }

        let mut next = self.clone();
        next.shares.push(share);

        let mut events = Vec::new();
        let quorum = if next.is_ready() {
            None
        } else {
            next.usable_quorum(combiner.max_share_index())
        };
        if let Some(shares) = quorum {
            match combiner.combine(&shares, next.threshold as usize) {
                Ok(value) if !value.is_empty() => {
                    info!(
                        "{}: aggregated {} shares under {}",
                        next.condition,
                        next.shares.len(),
                        next.public_key
                    );
                    next.aggregated_value = value;
                    next.ready_at = height;
                    events.push(Event::KeyShareAggregated {
                        condition: next.condition.to_string(),
                        pubkey: next.public_key.clone(),
                        shares: next.shares.len() as u64,
                    });
                }
                Ok(_) => warn!("{}: combiner returned an empty value", next.condition),
                Err(e) => warn!("{}: combination failed: {e}", next.condition),
            }
        }

        let ready = next.is_ready();
        (next, ShareOutcome::Accepted { ready }, events)
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Aggregation keyspace accessors
pub trait AggregatorStore: KvStore {
    fn load_aggregate(&self, condition: &Condition) -> Result<Option<AggregatedKeyShare>> {
        Ok(load(self, &keys::keyshare_agg_key(&condition.store_key()))?)
    }

    fn store_aggregate(&mut self, aggregate: &AggregatedKeyShare) -> Result<()> {
        let key = keys::keyshare_agg_key(&aggregate.condition.store_key());
        Ok(save(self, &key, aggregate)?)
    }

    fn all_aggregates(&self) -> Result<Vec<AggregatedKeyShare>> {
        self.scan_prefix(keys::KEYSHARE_AGG_PREFIX)?
            .into_iter()
            .map(|(_, bytes)| AggregatedKeyShare::decode(&bytes).map_err(KeyshareError::from))
            .collect()
    }
}

impl<S: KvStore + ?Sized> AggregatorStore for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use keyshare_threshold::{ShamirCombiner, ThresholdError, split_secret};

    fn share_from(validator: &str, condition: &Condition, share: &Share) -> KeyShare {
        KeyShare {
            validator: validator.into(),
            condition: condition.clone(),
            share_index: share.index,
            share_data: share.value.clone(),
            submitted_at: 1,
        }
    }

    #[test]
    fn becomes_ready_exactly_once() {
        let secret = [7u8; 32];
        let shares = split_secret(&secret, 3, 4).unwrap();
        let condition = Condition::Height(500);
        let combiner = ShamirCombiner::new();

        let mut agg = AggregatedKeyShare::new(condition.clone(), "K1", 3);
        let mut aggregated_events = 0;
        for (i, share) in shares.iter().enumerate() {
            let (next, outcome, events) =
                agg.submit_share(share_from(&format!("val{i}"), &condition, share), &combiner, 10 + i as u64);
            aggregated_events += events.len();
            agg = next;
            assert_eq!(outcome, ShareOutcome::Accepted { ready: i >= 2 });
        }

        assert_eq!(aggregated_events, 1);
        assert_eq!(agg.shares.len(), 4);
        assert_eq!(agg.ready_at, 12);
        assert_eq!(agg.get_aggregated(), (&secret[..], true));
    }

    #[test]
    fn duplicate_validator_is_reported_not_stored() {
        let condition = Condition::Identity("req-1".into());
        let agg = AggregatedKeyShare::new(condition.clone(), "K1", 2);
        let share = Share::new(1, vec![1]);

        let (agg, _, _) = agg.submit_share(share_from("val0", &condition, &share), &ShamirCombiner, 1);
        let (again, outcome, events) =
            agg.submit_share(share_from("val0", &condition, &share), &ShamirCombiner, 2);

        assert_eq!(outcome, ShareOutcome::AlreadySubmitted);
        assert!(events.is_empty());
        assert_eq!(again, agg);
    }

    #[test]
    fn combiner_failure_keeps_collecting() {
        let failing = |_: &[Share], _: usize| -> std::result::Result<Vec<u8>, ThresholdError> {
            Err(ThresholdError::EmptyShare)
        };
        let condition = Condition::Height(1);
        let agg = AggregatedKeyShare::new(condition.clone(), "K1", 1);

        let (agg, outcome, events) =
            agg.submit_share(share_from("val0", &condition, &Share::new(1, vec![1])), &failing, 1);
        assert_eq!(outcome, ShareOutcome::Accepted { ready: false });
        assert!(events.is_empty());
        let (value, ready) = agg.get_aggregated();
        assert!(value.is_empty());
        assert!(!ready);
    }

    #[test]
    fn bad_shares_inside_the_first_quorum_are_skipped() {
        let secret = [3u8; 16];
        let shares = split_secret(&secret, 2, 3).unwrap();
        let condition = Condition::Identity("req-1".into());
        let mut agg = AggregatedKeyShare::new(condition.clone(), "K1", 2);

        let out_of_range = Share::new(300, shares[1].value.clone());
        let reused_index = Share::new(shares[0].index, vec![0xff; 16]);
        let short = Share::new(2, vec![1]);
        let submitted = [&shares[0], &out_of_range, &reused_index, &short];
        for (i, share) in submitted.into_iter().enumerate() {
            let (next, outcome, _) =
                agg.submit_share(share_from(&format!("val{i}"), &condition, share), &ShamirCombiner, 1);
            assert_eq!(outcome, ShareOutcome::Accepted { ready: false });
            agg = next;
        }

        let (agg, outcome, events) =
            agg.submit_share(share_from("val9", &condition, &shares[2]), &ShamirCombiner, 2);
        assert_eq!(outcome, ShareOutcome::Accepted { ready: true });
        assert_eq!(events.len(), 1);
        assert_eq!(agg.aggregated_value, secret.to_vec());
    }

    #[test]
    fn check_share_rejects_incompatible_shares() {
        let condition = Condition::Height(4);
        let agg = AggregatedKeyShare::new(condition.clone(), "K1", 2);
        let (agg, _, _) = agg.submit_share(
            share_from("val0", &condition, &Share::new(1, vec![1, 2])),
            &ShamirCombiner,
            1,
        );

        assert!(agg.check_share(2, &[3, 4], 255).is_ok());
        let rejected: [(u64, Vec<u8>); 5] = [
            (0, vec![3, 4]),
            (256, vec![3, 4]),
            (1, vec![3, 4]),
            (2, vec![3]),
            (2, Vec::new()),
        ];
        for (index, data) in rejected {
            assert!(matches!(
                agg.check_share(index, &data, 255),
                Err(KeyshareError::InvalidKeyShare(_))
            ));
        }
    }

    #[test]
    fn condition_keys_do_not_collide() {
        assert_ne!(
            Condition::Height(0x6869).store_key(),
            Condition::Identity("hi".into()).store_key()
        );
        assert!(Condition::Height(9).store_key() < Condition::Height(10).store_key());
        assert_eq!(Condition::Identity("x".into()).to_string(), "identity:x");
    }

    #[test]
    fn aggregates_persist() {
        let mut store = crate::storage::MemStore::new();
        let agg = AggregatedKeyShare::new(Condition::Identity("req-1".into()), "K1", 2);
        store.store_aggregate(&agg).unwrap();

        assert_eq!(store.load_aggregate(&agg.condition).unwrap(), Some(agg.clone()));
        assert_eq!(store.load_aggregate(&Condition::Height(1)).unwrap(), None);
        assert_eq!(store.all_aggregates().unwrap(), vec![agg]);
    }
}
