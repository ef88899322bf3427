//! Command messages
//!
//! The three commands users and validators submit, plus a catch-all for
//! anything else a transaction may carry.

use serde::{Deserialize, Serialize};

use crate::aggregator::Condition;

pub const SUBMIT_ENCRYPTED_TX_TYPE_URL: &str = "/keyshare.MsgSubmitEncryptedTx";
pub const SUBMIT_KEY_SHARE_TYPE_URL: &str = "/keyshare.MsgSubmitKeyShare";
pub const CREATE_QUEUED_PUBLIC_KEY_TYPE_URL: &str = "/keyshare.MsgCreateQueuedPublicKey";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSubmitEncryptedTx {
    pub creator: String,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    pub target_block_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSubmitKeyShare {
    /// Validator address
    pub creator: String,
    pub condition: Condition,
    pub share_index: u64,
    #[serde(with = "hex::serde")]
    pub share_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCreateQueuedPublicKey {
    pub creator: String,
    pub public_key: String,
    pub commitments: Vec<String>,
    pub number_of_validators: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Msg {
    SubmitEncryptedTx(MsgSubmitEncryptedTx),
    SubmitKeyShare(MsgSubmitKeyShare),
    CreateQueuedPublicKey(MsgCreateQueuedPublicKey),
    /// A message owned by another module
    Other { type_url: String },
}

impl Msg {
    pub fn type_url(&self) -> &str {
        match self {
            Msg::SubmitEncryptedTx(_) => SUBMIT_ENCRYPTED_TX_TYPE_URL,
            Msg::SubmitKeyShare(_) => SUBMIT_KEY_SHARE_TYPE_URL,
            Msg::CreateQueuedPublicKey(_) => CREATE_QUEUED_PUBLIC_KEY_TYPE_URL,
            Msg::Other { type_url } => type_url,
        }
    }

    pub fn is_key_share(&self) -> bool {
        matches!(self, Msg::SubmitKeyShare(_))
    }
}

/// A transaction as seen by admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub msgs: Vec<Msg>,
}

impl Tx {
    pub fn new(msgs: Vec<Msg>) -> Self {
        Self { msgs }
    }
}
