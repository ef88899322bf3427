//! Packet wire types
//!
//! Packet payloads are JSON envelopes:
//!
//! ```text
//!   { "type": "get_decryption_key", "data": { "identity": "req-1" } }
//! ```
//!
//! Decoding is closed over [`PacketData`]; any other `type` yields
//! [`KeyshareError::UnrecognizedPacket`].

use serde::{Deserialize, Serialize};

use crate::broker::channel::ChannelEnd;
use crate::broker::PrivateDecryptionKey;
use crate::error::{ErrorKind, KeyshareError, Result};

/// An inbound cross-chain packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub sequence: u64,
    pub source_port: String,
    pub source_channel: String,
    pub destination_port: String,
    pub destination_channel: String,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl Packet {
    pub fn source(&self) -> ChannelEnd {
        ChannelEnd::new(&self.source_port, &self.source_channel)
    }

    pub fn destination(&self) -> ChannelEnd {
        ChannelEnd::new(&self.destination_port, &self.destination_channel)
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentKeysPacketData {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAggrKeysharePacketData {
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDecryptionKeyPacketData {
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPrivateDecryptionKeyPacketData {
    pub identity: String,
    pub requester: String,
    /// Requester key the shares are encrypted to
    pub secp_pubkey: String,
}

/// Every packet kind this module answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PacketData {
    CurrentKeys(CurrentKeysPacketData),
    GetAggrKeyshare(GetAggrKeysharePacketData),
    GetDecryptionKey(GetDecryptionKeyPacketData),
    GetPrivateDecryptionKey(GetPrivateDecryptionKeyPacketData),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn payload<T: for<'de> Deserialize<'de>>(kind: &str, data: serde_json::Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| KeyshareError::InvalidPacket(format!("{kind}: {e}")))
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(KeyshareError::InvalidPacket(format!("{field} cannot be empty")));
    }
    Ok(())
}

impl PacketData {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| KeyshareError::InvalidPacket(e.to_string()))?;

        let data = envelope.data;
        let packet = match envelope.kind.as_str() {
            "current_keys" => {
                if data.is_null() {
                    PacketData::CurrentKeys(CurrentKeysPacketData::default())
                } else {
                    PacketData::CurrentKeys(payload("current_keys", data)?)
                }
            }
            "get_aggr_keyshare" => PacketData::GetAggrKeyshare(payload("get_aggr_keyshare", data)?),
            "get_decryption_key" => {
                PacketData::GetDecryptionKey(payload("get_decryption_key", data)?)
            }
            "get_private_decryption_key" => {
                PacketData::GetPrivateDecryptionKey(payload("get_private_decryption_key", data)?)
            }
            other => return Err(KeyshareError::UnrecognizedPacket(other.to_string())),
        };
        Ok(packet)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| KeyshareError::InvalidPacket(e.to_string()))
    }

    pub fn validate_basic(&self) -> Result<()> {
        match self {
            PacketData::CurrentKeys(_) => Ok(()),
            PacketData::GetAggrKeyshare(d) => require("identity", &d.identity),
            PacketData::GetDecryptionKey(d) => require("identity", &d.identity),
            PacketData::GetPrivateDecryptionKey(d) => {
                require("identity", &d.identity)?;
                require("requester", &d.requester)?;
                require("secp_pubkey", &d.secp_pubkey)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PacketData::CurrentKeys(_) => "current_keys",
            PacketData::GetAggrKeyshare(_) => "get_aggr_keyshare",
            PacketData::GetDecryptionKey(_) => "get_decryption_key",
            PacketData::GetPrivateDecryptionKey(_) => "get_private_decryption_key",
        }
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            PacketData::CurrentKeys(_) => None,
            PacketData::GetAggrKeyshare(d) => Some(&d.identity),
            PacketData::GetDecryptionKey(d) => Some(&d.identity),
            PacketData::GetPrivateDecryptionKey(d) => Some(&d.identity),
        }
    }
}

// ============================================================================
// Acknowledgements
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub public_key: String,
    pub creator: String,
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentKeysPacketAck {
    pub active_key: KeyInfo,
    pub queued_key: Option<KeyInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAggrKeysharePacketAck {
    pub identity: String,
    pub pubkey: String,
    /// Empty until the identity's shares are combined
    #[serde(with = "hex::serde")]
    pub aggr_keyshare: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDecryptionKeyPacketAck {
    pub identity: String,
    pub pubkey: String,
    #[serde(with = "hex::serde")]
    pub decryption_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPrivateDecryptionKeyPacketAck {
    pub identity: String,
    pub pubkey: String,
    pub private_decryption_keys: Vec<PrivateDecryptionKey>,
}

/// Structured failure carried back to the counterparty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Response correlated to one inbound packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acknowledgement {
    Result(#[serde(with = "hex::serde")] Vec<u8>),
    Error(AckError),
}

impl Acknowledgement {
    /// Success acknowledgement carrying `ack` as JSON.
    pub fn result<T: Serialize>(ack: &T) -> Self {
        match serde_json::to_vec(ack) {
            Ok(bytes) => Acknowledgement::Result(bytes),
            Err(e) => Acknowledgement::Error(AckError {
                kind: ErrorKind::Invariant,
                message: format!("failed to encode acknowledgement: {e}"),
            }),
        }
    }

    pub fn error(err: &KeyshareError) -> Self {
        Acknowledgement::Error(AckError {
            kind: err.kind(),
            message: err.to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Acknowledgement::Result(_))
    }

    /// Decode the success payload.
    pub fn decode_result<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        match self {
            Acknowledgement::Result(bytes) => serde_json::from_slice(bytes).ok(),
            Acknowledgement::Error(_) => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Acknowledgement::Result(_) => None,
            Acknowledgement::Error(e) => Some(e.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_envelopes() {
        let raw = br#"{"type":"get_decryption_key","data":{"identity":"req-1"}}"#;
        assert_eq!(
            PacketData::decode(raw).unwrap(),
            PacketData::GetDecryptionKey(GetDecryptionKeyPacketData {
                identity: "req-1".into()
            })
        );

        let bare = br#"{"type":"current_keys"}"#;
        assert_eq!(
            PacketData::decode(bare).unwrap(),
            PacketData::CurrentKeys(CurrentKeysPacketData {})
        );
    }

    #[test]
    fn encode_matches_decode() {
        let packet = PacketData::GetPrivateDecryptionKey(GetPrivateDecryptionKeyPacketData {
            identity: "id".into(),
            requester: "alice".into(),
            secp_pubkey: "02ab".into(),
        });
        let bytes = packet.encode().unwrap();
        assert_eq!(PacketData::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn unknown_type_is_unrecognized() {
        let raw = br#"{"type":"aggr_keyshare_data","data":{}}"#;
        assert!(matches!(
            PacketData::decode(raw),
            Err(KeyshareError::UnrecognizedPacket(kind)) if kind == "aggr_keyshare_data"
        ));
    }

    #[test]
    fn malformed_payloads_are_invalid() {
        assert!(matches!(
            PacketData::decode(b"not json"),
            Err(KeyshareError::InvalidPacket(_))
        ));
        assert!(matches!(
            PacketData::decode(br#"{"type":"get_aggr_keyshare","data":{}}"#),
            Err(KeyshareError::InvalidPacket(_))
        ));
    }

    #[test]
    fn validate_basic_rejects_blank_fields() {
        let blank = PacketData::GetAggrKeyshare(GetAggrKeysharePacketData {
            identity: "  ".into(),
        });
        assert!(blank.validate_basic().is_err());

        let missing_requester = PacketData::GetPrivateDecryptionKey(GetPrivateDecryptionKeyPacketData {
            identity: "id".into(),
            requester: String::new(),
            secp_pubkey: "02ab".into(),
        });
        assert!(missing_requester.validate_basic().is_err());
    }

    #[test]
    fn error_ack_carries_kind() {
        let ack = Acknowledgement::error(&KeyshareError::RetryAfterActivation);
        assert!(!ack.is_success());
        assert_eq!(ack.error_kind(), Some(ErrorKind::Retryable));

        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("retryable"));
    }

    #[test]
    fn result_ack_round_trips_payload() {
        let payload = GetDecryptionKeyPacketAck {
            identity: "req-1".into(),
            pubkey: "K1".into(),
            decryption_key: vec![0xab],
        };
        let ack = Acknowledgement::result(&payload);
        assert!(ack.is_success());
        assert_eq!(ack.decode_result::<GetDecryptionKeyPacketAck>(), Some(payload));
    }
}
