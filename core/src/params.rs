//! Module parameters
//!
//! Passed explicitly into every transition instead of being read from a
//! process-wide parameter store.

use keyshare_config::ParamsConfig;
use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

use crate::error::{KeyshareError, Result};
use crate::storage::codec::wincode_record;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
pub struct Params {
    /// Blocks each public key stays active for
    pub key_expiry: u64,
    /// Addresses allowed to queue a new public key
    pub trusted_addresses: Vec<String>,
    /// Quorum is `ceil(validators * numerator / denominator)`
    pub threshold_numerator: u64,
    pub threshold_denominator: u64,
}

wincode_record!(Params);

impl Default for Params {
    fn default() -> Self {
        Params::from(&ParamsConfig::default())
    }
}

impl From<&ParamsConfig> for Params {
    fn from(cfg: &ParamsConfig) -> Self {
        Self {
            key_expiry: cfg.key_expiry,
            trusted_addresses: cfg.trusted_addresses.clone(),
            threshold_numerator: cfg.threshold_numerator,
            threshold_denominator: cfg.threshold_denominator,
        }
    }
}

impl Params {
    pub fn with_trusted(mut self, addresses: &[&str]) -> Self {
        self.trusted_addresses = addresses.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_key_expiry(mut self, key_expiry: u64) -> Self {
        self.key_expiry = key_expiry;
        self
    }

    pub fn is_trusted(&self, address: &str) -> bool {
        self.trusted_addresses.iter().any(|a| a == address)
    }

    /// Minimum distinct-validator share count for an epoch of `validators`.
    pub fn threshold_for(&self, validators: u64) -> u64 {
        let num = validators as u128 * self.threshold_numerator as u128;
        let den = self.threshold_denominator.max(1) as u128;
        (num.div_ceil(den) as u64).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_expiry == 0 {
            return Err(KeyshareError::InvalidGenesis(
                "key_expiry must be greater than zero".into(),
            ));
        }
        if self.threshold_denominator == 0
            || self.threshold_numerator == 0
            || self.threshold_numerator > self.threshold_denominator
        {
            return Err(KeyshareError::InvalidGenesis(format!(
                "invalid threshold ratio {}/{}",
                self.threshold_numerator, self.threshold_denominator
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_thirds_rounds_up() {
        let params = Params::default();
        assert_eq!(params.threshold_for(1), 1);
        assert_eq!(params.threshold_for(3), 2);
        assert_eq!(params.threshold_for(4), 3);
        assert_eq!(params.threshold_for(10), 7);
    }

    #[test]
    fn threshold_never_zero() {
        let params = Params::default();
        assert_eq!(params.threshold_for(0), 1);
    }

    #[test]
    fn trusted_lookup() {
        let params = Params::default().with_trusted(&["alice"]);
        assert!(params.is_trusted("alice"));
        assert!(!params.is_trusted("bob"));
    }
}
