//! Channel handshake and addressing
//!
//! Every inbound request pins the two channel ends it arrived on. Later
//! packets for the same identity must arrive on exactly the same pair.

use keyshare_config::ChannelConfig;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

use crate::broker::packet::Packet;
use crate::error::{KeyshareError, Result};
use crate::keys;
use crate::storage::codec::wincode_record;
use crate::storage::{KvStore, load, save};

/// One side of a channel: `(port, channel)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct ChannelEnd {
    pub port_id: String,
    pub channel_id: String,
}

wincode_record!(ChannelEnd);

impl ChannelEnd {
    pub fn new(port_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            port_id: port_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

/// The single authorization check shared by every identity-keyed handler.
///
/// `counterparty` must match the packet's source and `local` its destination.
pub fn verify_channel(counterparty: &ChannelEnd, local: &ChannelEnd, packet: &Packet) -> Result<()> {
    if *counterparty != packet.source() || *local != packet.destination() {
        warn!(
            "packet {} from {}/{} does not match pinned {}/{}",
            packet.sequence,
            packet.source_port,
            packet.source_channel,
            counterparty.port_id,
            counterparty.channel_id
        );
        return Err(KeyshareError::Unauthorized);
    }
    Ok(())
}

// ============================================================================
// Handshake
// ============================================================================

fn check_port(config: &ChannelConfig, port_id: &str) -> Result<()> {
    if config.port_id != port_id {
        return Err(KeyshareError::InvalidPort {
            got: port_id.into(),
            expected: config.port_id.clone(),
        });
    }
    Ok(())
}

fn is_known_version(config: &ChannelConfig, version: &str) -> bool {
    version == config.version || version == config.keyshare_version
}

/// Either channel version may be proposed locally.
pub fn on_chan_open_init(config: &ChannelConfig, port_id: &str, version: &str) -> Result<String> {
    check_port(config, port_id)?;
    if !is_known_version(config, version) {
        return Err(KeyshareError::InvalidVersion {
            got: version.into(),
            expected: config.version.clone(),
        });
    }
    Ok(version.to_string())
}

/// A counterparty opening toward us must speak the base version.
pub fn on_chan_open_try(
    config: &ChannelConfig,
    port_id: &str,
    counterparty_version: &str,
) -> Result<String> {
    check_port(config, port_id)?;
    if counterparty_version != config.version {
        return Err(KeyshareError::InvalidVersion {
            got: counterparty_version.into(),
            expected: config.version.clone(),
        });
    }
    Ok(config.version.clone())
}

pub fn on_chan_open_ack(config: &ChannelConfig, counterparty_version: &str) -> Result<()> {
    if !is_known_version(config, counterparty_version) {
        return Err(KeyshareError::InvalidVersion {
            got: counterparty_version.into(),
            expected: config.version.clone(),
        });
    }
    Ok(())
}

/// Record the channel the module is now bound to.
pub fn on_chan_open_confirm<S: ChannelStore + ?Sized>(
    store: &mut S,
    config: &ChannelConfig,
    port_id: &str,
    channel_id: &str,
) -> Result<()> {
    check_port(config, port_id)?;
    store.store_bound_channel(&ChannelEnd::new(port_id, channel_id))?;
    info!("bound to channel {port_id}/{channel_id}");
    Ok(())
}

pub fn on_chan_close_init(_port_id: &str, _channel_id: &str) -> Result<()> {
    Err(KeyshareError::ChannelCloseNotAllowed)
}

pub fn on_chan_close_confirm(_port_id: &str, _channel_id: &str) -> Result<()> {
    Ok(())
}

/// Bound-channel accessors
pub trait ChannelStore: KvStore {
    fn bound_channel(&self) -> Result<Option<ChannelEnd>> {
        Ok(load(self, keys::BOUND_CHANNEL_KEY)?)
    }

    fn store_bound_channel(&mut self, end: &ChannelEnd) -> Result<()> {
        Ok(save(self, keys::BOUND_CHANNEL_KEY, end)?)
    }
}

impl<S: KvStore + ?Sized> ChannelStore for S {}
