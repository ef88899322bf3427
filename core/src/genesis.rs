//! Genesis import and export
//!
//! The full module state as one JSON document.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::aggregator::{AggregatedKeyShare, AggregatorStore};
use crate::broker::{BrokerStore, DecryptionKeyRequest, PrivateDecryptionKeyRequest};
use crate::epoch::{EpochSet, EpochStatus, EpochStore, PublicKeyEpoch};
use crate::error::{KeyshareError, Result};
use crate::ledger::{EncryptedTxBatch, LedgerStore, ScheduledKeys};
use crate::params::Params;
use crate::storage::KvStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    pub params: Params,
    #[serde(default)]
    pub active_epoch: Option<PublicKeyEpoch>,
    #[serde(default)]
    pub queued_epoch: Option<PublicKeyEpoch>,
    #[serde(default)]
    pub encrypted_tx_batches: Vec<EncryptedTxBatch>,
    #[serde(default)]
    pub aggregated_key_shares: Vec<AggregatedKeyShare>,
    #[serde(default)]
    pub decryption_requests: Vec<DecryptionKeyRequest>,
    #[serde(default)]
    pub private_decryption_requests: Vec<PrivateDecryptionKeyRequest>,
}

fn invalid(msg: impl Into<String>) -> KeyshareError {
    KeyshareError::InvalidGenesis(msg.into())
}

impl GenesisState {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| invalid(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read genesis file: {}", path.display()))?;
        Self::from_json(&bytes)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.params.validate()?;

        if let Some(active) = &self.active_epoch {
            if active.status != EpochStatus::Active {
                return Err(invalid("active epoch must have active status"));
            }
        }
        if let Some(queued) = &self.queued_epoch {
            if queued.status != EpochStatus::Queued {
                return Err(invalid("queued epoch must have queued status"));
            }
            if queued.commitments.is_empty() || queued.number_of_validators == 0 {
                return Err(invalid("queued epoch needs commitments and validators"));
            }
            if let Some(active) = &self.active_epoch {
                if queued.expiry_height <= active.expiry_height {
                    return Err(invalid(format!(
                        "queued expiry {} must follow active expiry {}",
                        queued.expiry_height, active.expiry_height
                    )));
                }
            }
        }

        let mut heights = HashSet::new();
        for batch in &self.encrypted_tx_batches {
            if !heights.insert(batch.height) {
                return Err(invalid(format!("duplicate encrypted tx height {}", batch.height)));
            }
            if !batch.is_well_ordered() {
                return Err(invalid(format!(
                    "encrypted txs at height {} are not indexed by position",
                    batch.height
                )));
            }
        }

        let mut conditions = HashSet::new();
        for agg in &self.aggregated_key_shares {
            if !conditions.insert(&agg.condition) {
                return Err(invalid(format!("duplicate aggregate for {}", agg.condition)));
            }
        }

        let mut identities = HashSet::new();
        for req in &self.decryption_requests {
            if !identities.insert(req.identity.as_str()) {
                return Err(invalid(format!("duplicate request for {}", req.identity)));
            }
        }

        let mut private = HashSet::new();
        for req in &self.private_decryption_requests {
            if !private.insert(req.identity.as_str()) {
                return Err(invalid(format!("duplicate private request for {}", req.identity)));
            }
        }

        Ok(())
    }
}

/// Validate and write `genesis` into an empty store.
pub fn init_genesis<S: KvStore + ?Sized>(store: &mut S, genesis: &GenesisState) -> Result<()> {
    genesis.validate()?;

    store.store_params(&genesis.params)?;
    let epochs = EpochSet {
        active: genesis.active_epoch.clone(),
        queued: genesis.queued_epoch.clone(),
    };
    store.store_epochs(&epochs)?;
    store.store_scheduled_keys(&ScheduledKeys {
        active: epochs.active.as_ref().map(Into::into),
        queued: epochs.queued.as_ref().map(Into::into),
    })?;

    for batch in &genesis.encrypted_tx_batches {
        store.store_encrypted_txs(batch)?;
    }
    for agg in &genesis.aggregated_key_shares {
        store.store_aggregate(agg)?;
    }
    for req in &genesis.decryption_requests {
        store.store_decryption_request(req)?;
    }
    for req in &genesis.private_decryption_requests {
        store.store_private_request(req)?;
    }
    Ok(())
}

pub fn export_genesis<S: KvStore + ?Sized>(store: &S) -> Result<GenesisState> {
    let epochs = store.load_epochs()?;
    Ok(GenesisState {
        params: store.load_params()?.unwrap_or_default(),
        active_epoch: epochs.active,
        queued_epoch: epochs.queued,
        encrypted_tx_batches: store.all_encrypted_txs()?,
        aggregated_key_shares: store.all_aggregates()?,
        decryption_requests: store.all_decryption_requests()?,
        private_decryption_requests: store.all_private_requests()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Condition;
    use crate::ledger::EncryptedTransaction;
    use crate::storage::MemStore;

    fn epoch(key: &str, expiry: u64, status: EpochStatus) -> PublicKeyEpoch {
        PublicKeyEpoch {
            public_key: key.into(),
            creator: "alice".into(),
            commitments: vec!["c1".into()],
            number_of_validators: 1,
            expiry_height: expiry,
            status,
        }
    }

    fn populated() -> GenesisState {
        let mut batch = EncryptedTxBatch::new(20);
        batch.append(EncryptedTransaction::new(20, "user", vec![1, 2]));
        GenesisState {
            params: Params::default().with_trusted(&["alice"]),
            active_epoch: Some(epoch("K1", 100, EpochStatus::Active)),
            queued_epoch: Some(epoch("K2", 200, EpochStatus::Queued)),
            encrypted_tx_batches: vec![batch],
            aggregated_key_shares: vec![AggregatedKeyShare::new(Condition::Height(20), "K1", 1)],
            ..Default::default()
        }
    }

    #[test]
    fn default_is_valid() {
        GenesisState::default().validate().unwrap();
    }

    #[test]
    fn init_then_export_preserves_state() {
        let genesis = populated();
        let mut store = MemStore::new();
        init_genesis(&mut store, &genesis).unwrap();

        assert_eq!(export_genesis(&store).unwrap(), genesis);
        assert_eq!(store.load_scheduled_keys().unwrap().max_expiry(), Some(200));
    }

    #[test]
    fn json_round_trip() {
        let genesis = populated();
        let json = genesis.to_json().unwrap();
        assert_eq!(GenesisState::from_json(json.as_bytes()).unwrap(), genesis);
    }

    #[test]
    fn rejects_gapped_batches() {
        let mut genesis = populated();
        genesis.encrypted_tx_batches[0].txs[0].index = 3;
        assert!(matches!(genesis.validate(), Err(KeyshareError::InvalidGenesis(_))));
    }

    #[test]
    fn rejects_duplicates() {
        let mut genesis = populated();
        genesis
            .encrypted_tx_batches
            .push(genesis.encrypted_tx_batches[0].clone());
        assert!(genesis.validate().is_err());

        let mut genesis = populated();
        genesis
            .aggregated_key_shares
            .push(genesis.aggregated_key_shares[0].clone());
        assert!(genesis.validate().is_err());
    }

    #[test]
    fn chaining_survives_a_key_expiry_change() {
        // queued at expiry 100 + 100, exported after governance moved key_expiry
        let mut genesis = populated();
        genesis.params = genesis.params.clone().with_key_expiry(30);
        genesis.validate().unwrap();

        let mut store = MemStore::new();
        init_genesis(&mut store, &genesis).unwrap();
        assert_eq!(export_genesis(&store).unwrap(), genesis);
    }

    #[test]
    fn rejects_unchained_queued_expiry() {
        let mut genesis = populated();
        genesis.queued_epoch = Some(epoch("K2", 50, EpochStatus::Queued));
        assert!(genesis.validate().is_err());
    }
}
