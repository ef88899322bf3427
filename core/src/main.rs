//! Keyshare node
//!
//! Opens the RocksDB state, seeds it from genesis on first start and drives
//! the keeper's block hook on a timer until Ctrl-C.

use anyhow::{Context, Result};
use log::info;
use std::path::Path;
use tokio::signal;

use keyshare_config::KeyshareConfig;
use keyshare_core::epoch::EpochStore;
use keyshare_core::node::{self, NodeConfig, NodeService};
use keyshare_core::{GenesisState, Keeper, RocksDbStore, init_genesis};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = KeyshareConfig::load()?;

    info!("============================================");
    info!("          KEYSHARE NODE v{}", env!("CARGO_PKG_VERSION"));
    info!("============================================");
    info!("DB path           : {}", config.database.path);
    info!("Port              : {}", config.channel.port_id);
    info!("Key expiry        : {} blocks", config.params.key_expiry);
    info!("Trusted addresses : {}", config.params.trusted_addresses.len());
    info!("Block interval    : {}ms", config.node.block_interval_ms);
    info!("============================================");

    let mut store = RocksDbStore::open(&config.database.path)
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;

    if store.load_params()?.is_none() {
        let genesis = match &config.node.genesis_path {
            Some(path) => GenesisState::load(Path::new(path))?,
            None => GenesisState {
                params: (&config.params).into(),
                ..Default::default()
            },
        };
        init_genesis(&mut store, &genesis)?;
        info!("Initialized state from genesis");
    } else {
        info!("Resuming after height {}", node::load_height(&store)?);
    }

    let params = store.load_params()?.unwrap_or_default();
    let mut keeper = Keeper::from_config(store, &config);
    keeper.set_params(params)?;

    let (service, mut outcomes) = NodeService::start(keeper, NodeConfig::from(&config.node))?;
    tokio::spawn(async move { while outcomes.recv().await.is_some() {} });

    info!("Keyshare node is ready");

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    service.shutdown().await?;

    info!("Keyshare node stopped");
    Ok(())
}
