//! Block driver
//!
//! Runs the keeper on a timer: every tick opens a new block, settles the
//! previous height and executes transactions pulled from the lane mempool.
//!
//! ```text
//!   submit(tx) ──▶ LaneMempool ──┐
//!   packet     ──────────────────┤      tick
//!                                ▼       │
//!                    ┌──────────────────────────────┐
//!                    │ begin_block(h) ─▶ deliver txs│──▶ BlockOutcome channel
//!                    └──────────────────────────────┘
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use keyshare_threshold::Combiner;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::broker::{Acknowledgement, Packet};
use crate::events::Event;
use crate::keeper::{BlockOutcome, DrainedBatch, Keeper};
use crate::keys;
use crate::lane::{Lane, LaneMempool};
use crate::msgs::Tx;
use crate::storage::KvStore;

/// Driver settings
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub block_interval: Duration,
    /// Transactions executed per block
    pub max_block_txs: usize,
    pub max_pending: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_millis(1000),
            max_block_txs: 500,
            max_pending: 10_000,
        }
    }
}

impl From<&keyshare_config::NodeConfig> for NodeConfig {
    fn from(cfg: &keyshare_config::NodeConfig) -> Self {
        Self {
            block_interval: Duration::from_millis(cfg.block_interval_ms.max(1)),
            ..Self::default()
        }
    }
}

/// Messages for the node service
pub enum NodeCommand {
    /// Queue a transaction for the next block
    Submit(Tx, oneshot::Sender<Result<Lane>>),
    /// Handle an inbound packet immediately
    Packet(Packet, oneshot::Sender<(Acknowledgement, Vec<Event>)>),
    /// Current height
    Height(oneshot::Sender<u64>),
    Shutdown,
}

/// Last executed height, persisted so a restart resumes where it stopped
pub fn load_height<S: KvStore + ?Sized>(store: &S) -> Result<u64> {
    match store.get(keys::NODE_HEIGHT_KEY)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .context("corrupt node height record")?;
            Ok(u64::from_be_bytes(raw))
        }
        None => Ok(0),
    }
}

fn store_height<S: KvStore + ?Sized>(store: &mut S, height: u64) -> Result<()> {
    store.put(keys::NODE_HEIGHT_KEY, height.to_be_bytes().to_vec())
}

/// Execute one block: hook first, then the selected transactions.
pub fn produce_block<S: KvStore, C: Combiner>(
    keeper: &mut Keeper<S, C>,
    mempool: &mut LaneMempool,
    height: u64,
    max_txs: usize,
) -> Result<BlockOutcome> {
    let mut outcome = keeper.begin_block(height)?;

    for tx in mempool.select(max_txs) {
        for msg in tx.msgs {
            let type_url = msg.type_url().to_string();
            match keeper.deliver(msg) {
                Ok(events) => outcome.events.extend(events),
                Err(e) => warn!("Height {height}: {type_url} failed: {e}"),
            }
        }
    }

    store_height(keeper.store_mut(), height)?;
    Ok(outcome)
}

/// Async wrapper driving a keeper on a timer
pub struct NodeService {
    command_tx: mpsc::Sender<NodeCommand>,
}

impl NodeService {
    /// Start the service; block outcomes are streamed on the returned receiver.
    pub fn start<S, C>(
        mut keeper: Keeper<S, C>,
        config: NodeConfig,
    ) -> Result<(Self, mpsc::Receiver<BlockOutcome>)>
    where
        S: KvStore + Send + 'static,
        C: Combiner + Send + 'static,
    {
        let (command_tx, mut command_rx) = mpsc::channel::<NodeCommand>(1000);
        let (outcome_tx, outcome_rx) = mpsc::channel::<BlockOutcome>(100);

        let mut height = load_height(keeper.store())?;
        let mut mempool = LaneMempool::new(config.max_pending);
        info!("Node starting after height {height}");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.block_interval);

            loop {
                tokio::select! {
                    Some(cmd) = command_rx.recv() => {
                        match cmd {
                            NodeCommand::Submit(tx, reply) => {
                                let _ = reply.send(mempool.insert(tx));
                            }
                            NodeCommand::Packet(packet, reply) => {
                                let _ = reply.send(keeper.on_recv_packet(&packet));
                            }
                            NodeCommand::Height(reply) => {
                                let _ = reply.send(height);
                            }
                            NodeCommand::Shutdown => {
                                info!("Node stopped at height {height}");
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        let next = height + 1;
                        match produce_block(&mut keeper, &mut mempool, next, config.max_block_txs) {
                            Ok(outcome) => {
                                height = next;
                                match &outcome.drained {
                                    DrainedBatch::Ready { height: target, txs, .. } => {
                                        info!("Block {next}: {} txs from height {target} ready to decrypt", txs.len())
                                    }
                                    DrainedBatch::Expired { height: target, txs } => {
                                        warn!("Block {next}: {} txs from height {target} expired", txs.len())
                                    }
                                    DrainedBatch::Empty => debug!("Block {next}"),
                                }
                                if outcome_tx.try_send(outcome).is_err() {
                                    debug!("Block {next}: outcome dropped, no reader");
                                }
                            }
                            Err(e) => warn!("Block {next} failed: {e}"),
                        }
                    }
                }
            }
        });

        Ok((Self { command_tx }, outcome_rx))
    }

    pub async fn submit(&self, tx: Tx) -> Result<Lane> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(NodeCommand::Submit(tx, reply_tx))
            .await
            .context("node service unavailable")?;
        reply_rx.await.context("node service crashed")?
    }

    pub async fn recv_packet(&self, packet: Packet) -> Result<(Acknowledgement, Vec<Event>)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(NodeCommand::Packet(packet, reply_tx))
            .await
            .context("node service unavailable")?;
        reply_rx.await.context("node service crashed")
    }

    pub async fn height(&self) -> Result<u64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(NodeCommand::Height(reply_tx))
            .await
            .context("node service unavailable")?;
        reply_rx.await.context("node service crashed")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(NodeCommand::Shutdown)
            .await
            .context("node service unavailable")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::{Msg, MsgCreateQueuedPublicKey};
    use crate::params::Params;
    use crate::storage::MemStore;
    use keyshare_config::ChannelConfig;
    use keyshare_threshold::ShamirCombiner;

    fn keeper() -> Keeper<MemStore> {
        let params = Params::default().with_trusted(&["alice"]).with_key_expiry(1000);
        Keeper::new(MemStore::new(), params, ChannelConfig::default(), ShamirCombiner::new())
    }

    fn queue_tx() -> Tx {
        Tx::new(vec![Msg::CreateQueuedPublicKey(MsgCreateQueuedPublicKey {
            creator: "alice".into(),
            public_key: "K1".into(),
            commitments: vec!["c1".into()],
            number_of_validators: 1,
        })])
    }

    #[test]
    fn produce_block_persists_height() {
        let mut k = keeper();
        let mut pool = LaneMempool::default();
        pool.insert(queue_tx()).unwrap();

        let outcome = produce_block(&mut k, &mut pool, 1, 10).unwrap();
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, Event::QueuedPubKeyCreated { .. })));
        assert_eq!(load_height(k.store()).unwrap(), 1);

        produce_block(&mut k, &mut pool, 2, 10).unwrap();
        assert_eq!(k.active_pub_key().unwrap().unwrap().public_key, "K1");
    }

    #[tokio::test]
    async fn service_produces_blocks_and_answers_commands() {
        let config = NodeConfig {
            block_interval: Duration::from_millis(5),
            ..NodeConfig::default()
        };
        let (node, mut outcomes) = NodeService::start(keeper(), config).unwrap();

        assert_eq!(node.submit(queue_tx()).await.unwrap(), Lane::Default);

        let mut activated = false;
        for _ in 0..10 {
            let outcome = outcomes.recv().await.unwrap();
            if outcome
                .events
                .iter()
                .any(|e| matches!(e, Event::QueuedPubKeyActivated { .. }))
            {
                activated = true;
                break;
            }
        }
        assert!(activated);
        assert!(node.height().await.unwrap() >= 2);

        node.shutdown().await.unwrap();
    }
}
