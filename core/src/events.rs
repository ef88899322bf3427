//! Module events
//!
//! Transitions return the events they caused instead of pushing them into an
//! ambient sink; whoever drives the transition decides what to do with them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A trusted creator queued the next public key
    QueuedPubKeyCreated {
        creator: String,
        pubkey: String,
        /// Expiry of the key active at creation time, 0 if none
        previous_expiry: u64,
        new_expiry: u64,
        number_of_validators: u64,
    },
    /// The queued key replaced the expired active key
    QueuedPubKeyActivated { pubkey: String, expiry: u64 },
    /// The active key expired with nothing queued behind it
    ActivePubKeyExpired { pubkey: String, expiry: u64 },
    /// A condition reached quorum and was combined
    KeyShareAggregated {
        condition: String,
        pubkey: String,
        shares: u64,
    },
    /// Validators should start sending shares for this identity
    KeyShareGenerationStarted { identity: String },
    /// Validators should start sending shares encrypted to a requester
    EncryptedKeyShareGenerationStarted {
        identity: String,
        requester: String,
        pubkey: String,
    },
    EncryptedTxSubmitted {
        creator: String,
        target_height: u64,
        index: u64,
    },
    /// A target height passed without a usable decryption key
    EncryptedTxsExpired { height: u64, count: u64 },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::QueuedPubKeyCreated { .. } => "queued_pub_key_created",
            Event::QueuedPubKeyActivated { .. } => "queued_pub_key_activated",
            Event::ActivePubKeyExpired { .. } => "active_pub_key_expired",
            Event::KeyShareAggregated { .. } => "keyshare_aggregated",
            Event::KeyShareGenerationStarted { .. } => "start_send_general_keyshare",
            Event::EncryptedKeyShareGenerationStarted { .. } => "start_send_encrypted_keyshare",
            Event::EncryptedTxSubmitted { .. } => "encrypted_tx_submitted",
            Event::EncryptedTxsExpired { .. } => "encrypted_txs_expired",
        }
    }
}
