//! State layout
//!
//! Logical key prefixes for every record the module persists. Heights are
//! big-endian so prefix scans come back in height order.

pub const ACTIVE_EPOCH_KEY: &[u8] = b"active-epoch";
pub const QUEUED_EPOCH_KEY: &[u8] = b"queued-epoch";
pub const PARAMS_KEY: &[u8] = b"params";
pub const BOUND_CHANNEL_KEY: &[u8] = b"bound-channel";
pub const NODE_HEIGHT_KEY: &[u8] = b"node/height";

/// Mirror of the key schedule kept on the encrypted-tx side
pub const SCHEDULED_ACTIVE_KEY: &[u8] = b"scheduled-key/active";
pub const SCHEDULED_QUEUED_KEY: &[u8] = b"scheduled-key/queued";

pub const ENCRYPTED_TX_PREFIX: &[u8] = b"encrypted-tx/";
pub const KEYSHARE_AGG_PREFIX: &[u8] = b"keyshare-agg/";
pub const DECRYPTION_REQUEST_PREFIX: &[u8] = b"decryption-request/";
pub const PRIVATE_REQUEST_PREFIX: &[u8] = b"private-decryption-request/";

fn prefixed(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

pub fn encrypted_tx_key(height: u64) -> Vec<u8> {
    prefixed(ENCRYPTED_TX_PREFIX, &height.to_be_bytes())
}

pub fn keyshare_agg_key(condition_key: &[u8]) -> Vec<u8> {
    prefixed(KEYSHARE_AGG_PREFIX, condition_key)
}

pub fn decryption_request_key(identity: &str) -> Vec<u8> {
    prefixed(DECRYPTION_REQUEST_PREFIX, identity.as_bytes())
}

pub fn private_request_key(identity: &str) -> Vec<u8> {
    prefixed(PRIVATE_REQUEST_PREFIX, identity.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_keys_sort_numerically() {
        assert!(encrypted_tx_key(9) < encrypted_tx_key(10));
        assert!(encrypted_tx_key(255) < encrypted_tx_key(256));
    }
}
