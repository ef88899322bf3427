//! Keyshare Core
//!
//! Threshold-encryption key lifecycle for a block-producing chain.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Keeper                                   │
//! │                                                                  │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────┐  │
//! │  │   Epochs    │  │   Ledger    │  │ Aggregator  │  │ Broker  │  │
//! │  │ active/queue│  │ encrypted tx│  │ key shares  │  │ packets │  │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └────┬────┘  │
//! │         └────────────────┴────────┬───────┴──────────────┘       │
//! │                                   ▼                              │
//! │                        KvStore (RocksDB / memory)                │
//! └─────────────────────────────────────────────────────────────────┘
//!          ▲                                   ▲
//!      LaneMempool ── NodeService ── tick ─────┘
//! ```

pub mod aggregator;
pub mod broker;
pub mod epoch;
pub mod error;
pub mod events;
pub mod genesis;
pub mod keeper;
pub mod keys;
pub mod lane;
pub mod ledger;
pub mod msgs;
pub mod node;
pub mod params;
pub mod storage;

pub use aggregator::{AggregatedKeyShare, Condition, KeyShare, ShareOutcome};
pub use broker::{Acknowledgement, ChannelEnd, DecryptionKeyRequest, Packet, PacketData};
pub use epoch::{EpochSet, EpochStatus, PublicKeyEpoch};
pub use error::{ErrorKind, KeyshareError, Result};
pub use events::Event;
pub use genesis::{GenesisState, export_genesis, init_genesis};
pub use keeper::{BlockOutcome, DrainedBatch, Keeper};
pub use lane::{Lane, LaneMempool, classify};
pub use ledger::{EncryptedTransaction, EncryptedTxBatch};
pub use msgs::{Msg, Tx};
pub use node::{NodeConfig, NodeService};
pub use params::Params;
pub use storage::{KvStore, MemStore, RocksDbStore};
