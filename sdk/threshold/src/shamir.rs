//! Shamir secret sharing over GF(256)
//!
//! Reference combiner used by dev networks and tests. Each byte of the secret
//! is shared independently, so shares are as long as the secret.

use std::collections::HashSet;

use rand::RngCore;

use crate::combiner::{Combiner, Share, ThresholdError};
use crate::gf256;

/// Share indices are GF(256) evaluation points, so 1..=255.
const MAX_SHARES: usize = 255;

/// Lagrange interpolation at x = 0 over the first `threshold` shares.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShamirCombiner;

impl ShamirCombiner {
    pub fn new() -> Self {
        Self
    }
}

impl Combiner for ShamirCombiner {
    fn max_share_index(&self) -> u64 {
        MAX_SHARES as u64
    }

    fn combine(&self, shares: &[Share], threshold: usize) -> Result<Vec<u8>, ThresholdError> {
        if threshold == 0 {
            return Err(ThresholdError::InvalidThreshold {
                k: threshold,
                n: shares.len(),
            });
        }
        if shares.len() < threshold {
            return Err(ThresholdError::InsufficientShares {
                got: shares.len(),
                need: threshold,
            });
        }

        let quorum = &shares[..threshold];
        let width = quorum[0].value.len();
        if width == 0 {
            return Err(ThresholdError::EmptyShare);
        }

        let mut seen = HashSet::with_capacity(threshold);
        let mut points = Vec::with_capacity(threshold);
        for share in quorum {
            if share.index == 0 || share.index > MAX_SHARES as u64 {
                return Err(ThresholdError::InvalidShareIndex(share.index));
            }
            if !seen.insert(share.index) {
                return Err(ThresholdError::DuplicateShareIndex(share.index));
            }
            if share.value.len() != width {
                return Err(ThresholdError::ShareLengthMismatch {
                    expected: width,
                    got: share.value.len(),
                });
            }
            points.push(share.index as u8);
        }

        // Basis weights L_i(0) are shared by every byte position.
        let weights: Vec<u8> = points
            .iter()
            .enumerate()
            .map(|(i, &xi)| {
                let (num, den) = points.iter().enumerate().filter(|(j, _)| *j != i).fold(
                    (1u8, 1u8),
                    |(num, den), (_, &xj)| (gf256::mul(num, xj), gf256::mul(den, xi ^ xj)),
                );
                gf256::div(num, den)
            })
            .collect();

        let secret = (0..width)
            .map(|byte| {
                quorum
                    .iter()
                    .zip(&weights)
                    .fold(0u8, |acc, (share, &w)| acc ^ gf256::mul(share.value[byte], w))
            })
            .collect();

        Ok(secret)
    }
}

/// Split `secret` into `total` shares, any `threshold` of which recombine it.
pub fn split_secret(
    secret: &[u8],
    threshold: usize,
    total: usize,
) -> Result<Vec<Share>, ThresholdError> {
    if threshold == 0 || threshold > total || total > MAX_SHARES {
        return Err(ThresholdError::InvalidThreshold {
            k: threshold,
            n: total,
        });
    }
    if secret.is_empty() {
        return Err(ThresholdError::EmptyShare);
    }

    let mut rng = rand::thread_rng();
    let mut shares: Vec<Share> = (1..=total as u64)
        .map(|index| Share::new(index, vec![0u8; secret.len()]))
        .collect();

    let mut coeffs = vec![0u8; threshold];
    for (byte, &s) in secret.iter().enumerate() {
        // f(x) = s + a1*x + ... + a_{k-1}*x^{k-1}
        coeffs[0] = s;
        rng.fill_bytes(&mut coeffs[1..]);

        for share in shares.iter_mut() {
            let x = share.index as u8;
            // Horner evaluation from the highest coefficient down
            let y = coeffs
                .iter()
                .rev()
                .fold(0u8, |acc, &c| gf256::mul(acc, x) ^ c);
            share.value[byte] = y;
        }
    }

    Ok(shares)
}
