//! Admission Lane
//!
//! Key-share submissions jump ahead of ordinary transactions so decryption
//! keys land before the heights they unlock.
//!
//! ```text
//!   insert(tx) ──classify──┬──▶ [ KeyShare lane ] ──┐
//!                          │                        ├──▶ select(max): key shares first,
//!                          └──▶ [ Default lane  ] ──┘    FIFO inside each lane
//! ```

use std::collections::VecDeque;

use anyhow::{Result, bail};
use log::debug;

use crate::msgs::Tx;

const DEFAULT_MAX_PENDING: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    KeyShare,
    Default,
}

/// Any transaction carrying a key-share submission is prioritized.
pub fn classify(tx: &Tx) -> Lane {
    if tx.msgs.iter().any(|m| m.is_key_share()) {
        Lane::KeyShare
    } else {
        Lane::Default
    }
}

/// Two FIFO queues feeding block proposal
#[derive(Debug)]
pub struct LaneMempool {
    key_share: VecDeque<Tx>,
    default: VecDeque<Tx>,
    /// Maximum transactions held across both lanes
    max_pending: usize,
}

impl Default for LaneMempool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

impl LaneMempool {
    pub fn new(max_pending: usize) -> Self {
        Self {
            key_share: VecDeque::new(),
            default: VecDeque::new(),
            max_pending,
        }
    }

    /// Queue a transaction in its lane
    pub fn insert(&mut self, tx: Tx) -> Result<Lane> {
        if self.len() >= self.max_pending {
            bail!("Mempool full ({} pending)", self.len());
        }

        let lane = classify(&tx);
        match lane {
            Lane::KeyShare => self.key_share.push_back(tx),
            Lane::Default => self.default.push_back(tx),
        }
        debug!("Queued tx in {lane:?} lane");
        Ok(lane)
    }

    /// Take up to `max` transactions, key-share lane first
    pub fn select(&mut self, max: usize) -> Vec<Tx> {
        let from_key_share = max.min(self.key_share.len());
        let mut selected: Vec<Tx> = self.key_share.drain(..from_key_share).collect();

        let from_default = (max - selected.len()).min(self.default.len());
        selected.extend(self.default.drain(..from_default));
        selected
    }

    pub fn len(&self) -> usize {
        self.key_share.len() + self.default.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lane_len(&self, lane: Lane) -> usize {
        match lane {
            Lane::KeyShare => self.key_share.len(),
            Lane::Default => self.default.len(),
        }
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }
}
