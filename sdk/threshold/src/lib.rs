//! Keyshare Threshold Combination
//!
//! The pluggable primitive that turns a quorum of validator key shares into a
//! single aggregated value (a decryption key). The keyshare state machine only
//! decides *when* and *on what* to call it; the math lives here.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Key Share Aggregation                        │
//! │                                                                  │
//! │  Validator 1 ──share──┐                                         │
//! │  Validator 2 ──share──┼──▶ Aggregator ──(K of N)──▶ Combiner    │
//! │  Validator N ──share──┘    (dedup, quorum)          │           │
//! │                                                      ▼           │
//! │                                            aggregated value      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod combiner;
pub mod gf256;
pub mod shamir;

pub use combiner::{Combiner, Share, ThresholdError};
pub use shamir::{ShamirCombiner, split_secret};
