//! Epoch Manager
//!
//! Owns the rotation of the network's public encryption key.
//!
//! ```text
//!   CreateQueuedKey            PromoteExpiredKey (height >= active.expiry)
//!  ───────────────▶ Queued ─────────────────────────────▶ Active ──▶ discarded
//!                   (≤ 1)                                  (≤ 1)
//! ```
//!
//! Expiry windows are chained: a queued key expires `key_expiry` blocks after
//! the key active when it was queued, or `key_expiry` blocks after the current
//! height when nothing is active.

use log::info;
use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

use crate::error::{KeyshareError, Result};
use crate::events::Event;
use crate::keys;
use crate::params::Params;
use crate::storage::codec::wincode_record;
use crate::storage::{KvStore, WriteOp, load, save};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "snake_case")]
pub enum EpochStatus {
    Queued,
    Active,
}

/// One rotation of the network's public encryption key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct PublicKeyEpoch {
    pub public_key: String,
    pub creator: String,
    pub commitments: Vec<String>,
    pub number_of_validators: u64,
    pub expiry_height: u64,
    pub status: EpochStatus,
}

wincode_record!(PublicKeyEpoch);

/// Command to queue the next public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateQueuedKey {
    pub creator: String,
    pub public_key: String,
    pub commitments: Vec<String>,
    pub number_of_validators: u64,
}

/// The `(creator, public key, expiry)` tuple mirrored to the tx scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct ScheduledKey {
    pub creator: String,
    pub public_key: String,
    pub expiry: u64,
}

wincode_record!(ScheduledKey);

impl From<&PublicKeyEpoch> for ScheduledKey {
    fn from(epoch: &PublicKeyEpoch) -> Self {
        Self {
            creator: epoch.creator.clone(),
            public_key: epoch.public_key.clone(),
            expiry: epoch.expiry_height,
        }
    }
}

/// The active and queued epochs at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochSet {
    pub active: Option<PublicKeyEpoch>,
    pub queued: Option<PublicKeyEpoch>,
}

/// Result of a successful [`EpochSet::create_queued_key`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedKeyTransition {
    pub epochs: EpochSet,
    pub scheduled: ScheduledKey,
    pub events: Vec<Event>,
}

// ============================================================================
// Transitions
// ============================================================================

impl EpochSet {
    /// Store ops replacing both epoch slots; an empty slot deletes its key.
    pub fn writes(&self) -> Result<Vec<WriteOp>> {
        Ok(vec![
            WriteOp::upsert(keys::ACTIVE_EPOCH_KEY, self.active.as_ref())?,
            WriteOp::upsert(keys::QUEUED_EPOCH_KEY, self.queued.as_ref())?,
        ])
    }

    /// Queue the next public key.
    ///
    /// Every check runs before anything is built, so a rejected command
    /// leaves `self` untouched.
    pub fn create_queued_key(
        &self,
        params: &Params,
        height: u64,
        msg: CreateQueuedKey,
    ) -> Result<QueuedKeyTransition> {
        if !params.is_trusted(&msg.creator) {
            return Err(KeyshareError::NotTrusted(msg.creator));
        }
        if self.queued.is_some() {
            return Err(KeyshareError::QueuedKeyAlreadyExists);
        }
        if msg.commitments.is_empty() {
            return Err(KeyshareError::EmptyCommitments);
        }
        if msg.number_of_validators == 0 {
            return Err(KeyshareError::InvalidValidatorCount);
        }
        if msg.public_key.is_empty() {
            return Err(KeyshareError::EmptyPublicKey);
        }

        let previous_expiry = self.active.as_ref().map_or(0, |a| a.expiry_height);
        let base = self.active.as_ref().map_or(height, |a| a.expiry_height);
        let expiry_height = base
            .checked_add(params.key_expiry)
            .ok_or(KeyshareError::ExpiryOverflow {
                base,
                key_expiry: params.key_expiry,
            })?;

        let queued = PublicKeyEpoch {
            public_key: msg.public_key,
            creator: msg.creator,
            commitments: msg.commitments,
            number_of_validators: msg.number_of_validators,
            expiry_height,
            status: EpochStatus::Queued,
        };

        let event = Event::QueuedPubKeyCreated {
            creator: queued.creator.clone(),
            pubkey: queued.public_key.clone(),
            previous_expiry,
            new_expiry: expiry_height,
            number_of_validators: queued.number_of_validators,
        };

        Ok(QueuedKeyTransition {
            scheduled: ScheduledKey::from(&queued),
            epochs: EpochSet {
                active: self.active.clone(),
                queued: Some(queued),
            },
            events: vec![event],
        })
    }

    /// Block-boundary hook.
    ///
    /// Once the active key has expired the queued key (if any) takes over and
    /// the old key is dropped. Without an active key a queued key is promoted
    /// straight away. Expiring with nothing queued leaves the network without
    /// an active key until one is queued.
    pub fn promote_expired(&self, height: u64) -> (EpochSet, Vec<Event>) {
        let active_expired = match &self.active {
            Some(active) => height >= active.expiry_height,
            None => true,
        };
        if !active_expired {
            return (self.clone(), Vec::new());
        }

        let mut events = Vec::new();
        let next = match &self.queued {
            Some(queued) => {
                let mut promoted = queued.clone();
                promoted.status = EpochStatus::Active;
                events.push(Event::QueuedPubKeyActivated {
                    pubkey: promoted.public_key.clone(),
                    expiry: promoted.expiry_height,
                });
                EpochSet {
                    active: Some(promoted),
                    queued: None,
                }
            }
            None => {
                if let Some(active) = &self.active {
                    events.push(Event::ActivePubKeyExpired {
                        pubkey: active.public_key.clone(),
                        expiry: active.expiry_height,
                    });
                }
                EpochSet::default()
            }
        };

        (next, events)
    }

    /// The epoch whose window covers `height`.
    pub fn epoch_for_height(&self, height: u64) -> Option<&PublicKeyEpoch> {
        if let Some(active) = &self.active {
            if height <= active.expiry_height {
                return Some(active);
            }
        }
        self.queued
            .as_ref()
            .filter(|queued| height <= queued.expiry_height)
    }

    /// The active or queued epoch carrying `public_key`.
    pub fn epoch_with_key(&self, public_key: &str) -> Option<&PublicKeyEpoch> {
        self.active
            .iter()
            .chain(self.queued.iter())
            .find(|e| e.public_key == public_key)
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Epoch keyspace accessors
pub trait EpochStore: KvStore {
    fn load_epochs(&self) -> Result<EpochSet> {
        Ok(EpochSet {
            active: load(self, keys::ACTIVE_EPOCH_KEY)?,
            queued: load(self, keys::QUEUED_EPOCH_KEY)?,
        })
    }

    fn store_epochs(&mut self, epochs: &EpochSet) -> Result<()> {
        Ok(self.write_batch(epochs.writes()?)?)
    }

    fn load_params(&self) -> Result<Option<Params>> {
        Ok(load(self, keys::PARAMS_KEY)?)
    }

    fn store_params(&mut self, params: &Params) -> Result<()> {
        Ok(save(self, keys::PARAMS_KEY, params)?)
    }
}

impl<S: KvStore + ?Sized> EpochStore for S {}

/// Log a promotion the way the block driver reports it.
pub(crate) fn log_promotion(height: u64, events: &[Event]) {
    for event in events {
        match event {
            Event::QueuedPubKeyActivated { pubkey, expiry } => {
                info!("height {height}: activated key {pubkey} (expires at {expiry})")
            }
            Event::ActivePubKeyExpired { pubkey, expiry } => {
                info!("height {height}: key {pubkey} expired at {expiry}, nothing queued")
            }
            _ => {}
        }
    }
}
