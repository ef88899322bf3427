//! Combiner interface
//!
//! Any scheme that can turn `threshold` shares into one value plugs in here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One validator's share as seen by a combiner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// Evaluation point of the share (1-indexed)
    pub index: u64,
    /// Raw share bytes
    pub value: Vec<u8>,
}

impl Share {
    pub fn new(index: u64, value: Vec<u8>) -> Self {
        Self { index, value }
    }
}

/// Threshold combination errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThresholdError {
    #[error("insufficient shares: got {got}, need {need}")]
    InsufficientShares { got: usize, need: usize },

    #[error("invalid threshold: k={k}, n={n}")]
    InvalidThreshold { k: usize, n: usize },

    #[error("invalid share index {0}")]
    InvalidShareIndex(u64),

    #[error("duplicate share index {0}")]
    DuplicateShareIndex(u64),

    #[error("share length mismatch: expected {expected}, got {got}")]
    ShareLengthMismatch { expected: usize, got: usize },

    #[error("empty share")]
    EmptyShare,
}

/// Combines a quorum of shares into an aggregated value.
///
/// Implementations must be deterministic: every validator runs the same
/// combination over the same shares and must arrive at the same bytes.
pub trait Combiner {
    fn combine(&self, shares: &[Share], threshold: usize) -> Result<Vec<u8>, ThresholdError>;

    /// Largest share index the scheme can evaluate at.
    fn max_share_index(&self) -> u64 {
        u64::MAX
    }
}

impl<F> Combiner for F
where
    F: Fn(&[Share], usize) -> Result<Vec<u8>, ThresholdError>,
{
    fn combine(&self, shares: &[Share], threshold: usize) -> Result<Vec<u8>, ThresholdError> {
        self(shares, threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_combiners() {
        let concat = |shares: &[Share], _threshold: usize| -> Result<Vec<u8>, ThresholdError> {
            Ok(shares.iter().flat_map(|s| s.value.clone()).collect())
        };

        let shares = vec![Share::new(1, vec![1, 2]), Share::new(2, vec![3])];
        assert_eq!(concat.combine(&shares, 2).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn trait_objects_dispatch() {
        let boxed: Box<dyn Combiner> = Box::new(
            |shares: &[Share], threshold: usize| -> Result<Vec<u8>, ThresholdError> {
                if shares.len() < threshold {
                    return Err(ThresholdError::InsufficientShares {
                        got: shares.len(),
                        need: threshold,
                    });
                }
                Ok(vec![shares.len() as u8])
            },
        );

        let shares = vec![Share::new(1, vec![0])];
        assert_eq!(boxed.combine(&shares, 1).unwrap(), vec![1]);
        assert!(matches!(
            boxed.combine(&shares, 2),
            Err(ThresholdError::InsufficientShares { got: 1, need: 2 })
        ));
    }
}
