//! Request Broker
//!
//! Answers cross-chain polls for the current keys, an identity's aggregated
//! key share, its decryption key, or per-requester encrypted keys.
//!
//! ```text
//!   Packet ─▶ decode ─▶ validate_basic ─▶ load / create request ─▶ verify_channel
//!                                              │ (pins both ends)
//!                                              ▼
//!                         pubkey guard ─▶ answer from aggregator ─▶ first poll? emit once
//!                                                                       │
//!                                              persist ◀────────────────┘
//!                                                 │
//!                                                 ▼
//!                                          Acknowledgement
//! ```
//!
//! Every failure becomes an error acknowledgement. Nothing is persisted unless
//! the whole handler succeeds, so replaying a packet is harmless.

pub mod channel;
pub mod packet;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

use crate::aggregator::{AggregatedKeyShare, AggregatorStore, Condition};
use crate::epoch::{EpochSet, EpochStore};
use crate::error::{KeyshareError, Result};
use crate::events::Event;
use crate::keys;
use crate::storage::codec::wincode_record;
use crate::storage::{KvStore, Record, load, save};

pub use channel::{ChannelEnd, ChannelStore, verify_channel};
pub use packet::{
    AckError, Acknowledgement, CurrentKeysPacketAck, GetAggrKeysharePacketAck,
    GetDecryptionKeyPacketAck, GetPrivateDecryptionKeyPacketAck, KeyInfo, Packet, PacketData,
};

use packet::{
    GetAggrKeysharePacketData, GetDecryptionKeyPacketData, GetPrivateDecryptionKeyPacketData,
};

// ============================================================================
// Request records
// ============================================================================

/// Polling state for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct DecryptionKeyRequest {
    pub identity: String,
    /// Active public key at first contact
    pub pubkey: String,
    /// Sending side, pinned at first contact
    pub counterparty: ChannelEnd,
    /// Receiving side, pinned at first contact
    pub local: ChannelEnd,
    /// Empty until the identity's shares are combined
    #[serde(with = "hex::serde")]
    pub decryption_key: Vec<u8>,
    /// Validators were asked to start sending shares
    pub generation_started: bool,
    pub fulfilled: bool,
}

wincode_record!(DecryptionKeyRequest);

impl DecryptionKeyRequest {
    fn pinned(identity: &str, pubkey: &str, packet: &Packet) -> Self {
        Self {
            identity: identity.to_string(),
            pubkey: pubkey.to_string(),
            counterparty: packet.source(),
            local: packet.destination(),
            decryption_key: Vec::new(),
            generation_started: false,
            fulfilled: false,
        }
    }

    /// Copy a ready aggregate made under the pinned key into the request.
    /// Returns true if it changed.
    pub fn absorb(&mut self, aggregate: Option<&AggregatedKeyShare>) -> bool {
        match aggregate {
            Some(agg) if agg.is_ready() && !self.fulfilled && agg.public_key == self.pubkey => {
                self.decryption_key = agg.aggregated_value.clone();
                self.fulfilled = true;
                true
            }
            _ => false,
        }
    }
}

/// A decryption key encrypted to one requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct PrivateDecryptionKey {
    pub requester: String,
    pub secp_pubkey: String,
    #[serde(with = "hex::serde")]
    pub encrypted_key: Vec<u8>,
}

/// Polling state for one identity's private keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct PrivateDecryptionKeyRequest {
    pub identity: String,
    pub pubkey: String,
    pub counterparty: ChannelEnd,
    pub local: ChannelEnd,
    pub private_decryption_keys: Vec<PrivateDecryptionKey>,
    /// Requesters validators were already asked to serve
    pub started_for: Vec<String>,
}

wincode_record!(PrivateDecryptionKeyRequest);

impl PrivateDecryptionKeyRequest {
    fn pinned(identity: &str, pubkey: &str, packet: &Packet) -> Self {
        Self {
            identity: identity.to_string(),
            pubkey: pubkey.to_string(),
            counterparty: packet.source(),
            local: packet.destination(),
            private_decryption_keys: Vec::new(),
            started_for: Vec::new(),
        }
    }

    pub fn has_key_for(&self, requester: &str) -> bool {
        self.private_decryption_keys
            .iter()
            .any(|k| k.requester == requester)
    }

    /// Insert or replace the key held for `key.requester`.
    pub fn record(&mut self, key: PrivateDecryptionKey) {
        match self
            .private_decryption_keys
            .iter_mut()
            .find(|k| k.requester == key.requester)
        {
            Some(existing) => *existing = key,
            None => self.private_decryption_keys.push(key),
        }
    }
}

/// Request keyspace accessors
pub trait BrokerStore: KvStore {
    fn decryption_request(&self, identity: &str) -> Result<Option<DecryptionKeyRequest>> {
        Ok(load(self, &keys::decryption_request_key(identity))?)
    }

    fn store_decryption_request(&mut self, req: &DecryptionKeyRequest) -> Result<()> {
        Ok(save(self, &keys::decryption_request_key(&req.identity), req)?)
    }

    fn all_decryption_requests(&self) -> Result<Vec<DecryptionKeyRequest>> {
        self.scan_prefix(keys::DECRYPTION_REQUEST_PREFIX)?
            .into_iter()
            .map(|(_, bytes)| DecryptionKeyRequest::decode(&bytes).map_err(KeyshareError::from))
            .collect()
    }

    fn private_request(&self, identity: &str) -> Result<Option<PrivateDecryptionKeyRequest>> {
        Ok(load(self, &keys::private_request_key(identity))?)
    }

    fn store_private_request(&mut self, req: &PrivateDecryptionKeyRequest) -> Result<()> {
        Ok(save(self, &keys::private_request_key(&req.identity), req)?)
    }

    fn all_private_requests(&self) -> Result<Vec<PrivateDecryptionKeyRequest>> {
        self.scan_prefix(keys::PRIVATE_REQUEST_PREFIX)?
            .into_iter()
            .map(|(_, bytes)| {
                PrivateDecryptionKeyRequest::decode(&bytes).map_err(KeyshareError::from)
            })
            .collect()
    }
}

impl<S: KvStore + ?Sized> BrokerStore for S {}

// ============================================================================
// Pure handlers
// ============================================================================

/// Outcome of a handler: the record to persist (if it changed), the ack
/// payload and the events to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled<R, A> {
    pub record: Option<R>,
    pub ack: A,
    pub events: Vec<Event>,
}

pub fn handle_current_keys(epochs: &EpochSet) -> Result<CurrentKeysPacketAck> {
    let key_info = |e: &crate::epoch::PublicKeyEpoch| KeyInfo {
        public_key: e.public_key.clone(),
        creator: e.creator.clone(),
        expiry: e.expiry_height,
    };
    let active = epochs
        .active
        .as_ref()
        .ok_or(KeyshareError::ActivePubKeyNotFound)?;
    Ok(CurrentKeysPacketAck {
        active_key: key_info(active),
        queued_key: epochs.queued.as_ref().map(key_info),
    })
}

/// Load the identity's request or pin a new one to the active key, then
/// check the packet arrived on the pinned channel pair.
fn resolve_request(
    epochs: &EpochSet,
    existing: Option<DecryptionKeyRequest>,
    identity: &str,
    packet: &Packet,
) -> Result<(DecryptionKeyRequest, bool)> {
    let (req, created) = match existing {
        Some(req) => (req, false),
        None => {
            let active = epochs
                .active
                .as_ref()
                .ok_or(KeyshareError::ActivePubKeyNotFound)?;
            (
                DecryptionKeyRequest::pinned(identity, &active.public_key, packet),
                true,
            )
        }
    };
    verify_channel(&req.counterparty, &req.local, packet)?;
    Ok((req, created))
}

/// Emit the start-generation event the first time an identity is polled
/// without an answer.
fn start_generation_once(req: &mut DecryptionKeyRequest) -> Vec<Event> {
    if req.decryption_key.is_empty() && !req.generation_started {
        req.generation_started = true;
        info!("start key share generation for {}", req.identity);
        return vec![Event::KeyShareGenerationStarted {
            identity: req.identity.clone(),
        }];
    }
    Vec::new()
}

pub fn handle_get_aggr_keyshare(
    epochs: &EpochSet,
    existing: Option<DecryptionKeyRequest>,
    aggregate: Option<&AggregatedKeyShare>,
    packet: &Packet,
    data: &GetAggrKeysharePacketData,
) -> Result<Handled<DecryptionKeyRequest, GetAggrKeysharePacketAck>> {
    let (mut req, created) = resolve_request(epochs, existing, &data.identity, packet)?;

    let absorbed = req.absorb(aggregate);
    let events = start_generation_once(&mut req);
    let changed = created || absorbed || !events.is_empty();

    Ok(Handled {
        ack: GetAggrKeysharePacketAck {
            identity: req.identity.clone(),
            pubkey: req.pubkey.clone(),
            aggr_keyshare: req.decryption_key.clone(),
        },
        record: changed.then_some(req),
        events,
    })
}

pub fn handle_get_decryption_key(
    epochs: &EpochSet,
    existing: Option<DecryptionKeyRequest>,
    aggregate: Option<&AggregatedKeyShare>,
    packet: &Packet,
    data: &GetDecryptionKeyPacketData,
) -> Result<Handled<DecryptionKeyRequest, GetDecryptionKeyPacketAck>> {
    let (mut req, created) = resolve_request(epochs, existing, &data.identity, packet)?;

    let active = epochs.active.as_ref().map(|e| e.public_key.as_str());
    if active != Some(req.pubkey.as_str()) {
        let queued = epochs.queued.as_ref().map(|e| e.public_key.as_str());
        if queued == Some(req.pubkey.as_str()) {
            return Err(KeyshareError::RetryAfterActivation);
        }
        return Err(KeyshareError::PubkeyNotFound);
    }

    let absorbed = req.absorb(aggregate);
    let events = start_generation_once(&mut req);
    let changed = created || absorbed || !events.is_empty();

    Ok(Handled {
        ack: GetDecryptionKeyPacketAck {
            identity: req.identity.clone(),
            pubkey: req.pubkey.clone(),
            decryption_key: req.decryption_key.clone(),
        },
        record: changed.then_some(req),
        events,
    })
}

pub fn handle_get_private_decryption_key(
    epochs: &EpochSet,
    existing: Option<PrivateDecryptionKeyRequest>,
    packet: &Packet,
    data: &GetPrivateDecryptionKeyPacketData,
) -> Result<Handled<PrivateDecryptionKeyRequest, GetPrivateDecryptionKeyPacketAck>> {
    let (mut req, created) = match existing {
        Some(req) => (req, false),
        None => {
            let active = epochs
                .active
                .as_ref()
                .ok_or(KeyshareError::ActivePubKeyNotFound)?;
            (
                PrivateDecryptionKeyRequest::pinned(&data.identity, &active.public_key, packet),
                true,
            )
        }
    };
    verify_channel(&req.counterparty, &req.local, packet)?;

    let mut events = Vec::new();
    if !req.has_key_for(&data.requester) && !req.started_for.contains(&data.requester) {
        req.started_for.push(data.requester.clone());
        info!(
            "start encrypted key share generation for {} ({})",
            data.identity, data.requester
        );
        events.push(Event::EncryptedKeyShareGenerationStarted {
            identity: data.identity.clone(),
            requester: data.requester.clone(),
            pubkey: data.secp_pubkey.clone(),
        });
    }
    let changed = created || !events.is_empty();

    Ok(Handled {
        ack: GetPrivateDecryptionKeyPacketAck {
            identity: req.identity.clone(),
            pubkey: req.pubkey.clone(),
            private_decryption_keys: req.private_decryption_keys.clone(),
        },
        record: changed.then_some(req),
        events,
    })
}

// ============================================================================
// Dispatch
// ============================================================================

fn dispatch<S: KvStore + ?Sized>(store: &mut S, packet: &Packet) -> Result<(Acknowledgement, Vec<Event>)> {
    let data = PacketData::decode(&packet.data)?;
    data.validate_basic()?;
    debug!("packet {} ({})", packet.sequence, data.kind());

    let epochs = store.load_epochs()?;
    match &data {
        PacketData::CurrentKeys(_) => {
            let ack = handle_current_keys(&epochs)?;
            Ok((Acknowledgement::result(&ack), Vec::new()))
        }
        PacketData::GetAggrKeyshare(d) => {
            let existing = store.decryption_request(&d.identity)?;
            let aggregate = store.load_aggregate(&Condition::Identity(d.identity.clone()))?;
            let handled = handle_get_aggr_keyshare(&epochs, existing, aggregate.as_ref(), packet, d)?;
            if let Some(req) = &handled.record {
                store.store_decryption_request(req)?;
            }
            Ok((Acknowledgement::result(&handled.ack), handled.events))
        }
        PacketData::GetDecryptionKey(d) => {
            let existing = store.decryption_request(&d.identity)?;
            let aggregate = store.load_aggregate(&Condition::Identity(d.identity.clone()))?;
            let handled = handle_get_decryption_key(&epochs, existing, aggregate.as_ref(), packet, d)?;
            if let Some(req) = &handled.record {
                store.store_decryption_request(req)?;
            }
            Ok((Acknowledgement::result(&handled.ack), handled.events))
        }
        PacketData::GetPrivateDecryptionKey(d) => {
            let existing = store.private_request(&d.identity)?;
            let handled = handle_get_private_decryption_key(&epochs, existing, packet, d)?;
            if let Some(req) = &handled.record {
                store.store_private_request(req)?;
            }
            Ok((Acknowledgement::result(&handled.ack), handled.events))
        }
    }
}

/// Handle one inbound packet. Never fails: errors become error acks.
pub fn on_recv_packet<S: KvStore + ?Sized>(store: &mut S, packet: &Packet) -> (Acknowledgement, Vec<Event>) {
    match dispatch(store, packet) {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!("packet {} rejected: {err}", packet.sequence);
            (Acknowledgement::error(&err), Vec::new())
        }
    }
}

/// This module never sends requests, so no acknowledgement is expected.
pub fn on_acknowledgement_packet(_packet: &Packet, _ack: &Acknowledgement) -> Result<()> {
    Err(KeyshareError::UnexpectedAcknowledgement)
}

pub fn on_timeout_packet(_packet: &Packet) -> Result<()> {
    Ok(())
}
