use keyshare_threshold::{Combiner, ShamirCombiner, Share, ThresholdError, split_secret};

fn quorum_for(secret: &[u8], k: usize, n: usize) -> Vec<Share> {
    split_secret(secret, k, n).expect("split failed")
}

#[test]
fn two_thirds_of_four_recovers_key() {
    let key = hex::decode("0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0")
        .unwrap();
    let shares = quorum_for(&key, 3, 4);

    // shares can arrive in any order
    let arrived = vec![shares[3].clone(), shares[0].clone(), shares[2].clone()];
    let combined = ShamirCombiner::new().combine(&arrived, 3).unwrap();

    assert_eq!(hex::encode(combined), hex::encode(&key));
}

#[test]
fn below_quorum_cannot_combine() {
    let shares = quorum_for(&[1u8; 16], 3, 4);
    let result = ShamirCombiner::new().combine(&shares[..2], 3);
    assert_eq!(
        result,
        Err(ThresholdError::InsufficientShares { got: 2, need: 3 })
    );
}

#[test]
fn wrong_quorum_gives_wrong_key() {
    let key = [9u8; 32];
    let shares = quorum_for(&key, 3, 5);

    // interpolating with too low a degree does not reveal the key
    let combined = ShamirCombiner::new().combine(&shares[..2], 2).unwrap();
    assert_ne!(combined, key.to_vec());
}

#[test]
fn combiner_can_be_swapped_for_a_trait_object() {
    let combiners: Vec<Box<dyn Combiner>> = vec![
        Box::new(ShamirCombiner::new()),
        Box::new(|shares: &[Share], _k: usize| -> Result<Vec<u8>, ThresholdError> {
            Ok(shares.iter().map(|s| s.index as u8).collect())
        }),
    ];

    let shares = quorum_for(&[3u8; 8], 2, 3);
    let outputs: Vec<Vec<u8>> = combiners
        .iter()
        .map(|c| c.combine(&shares, 2).unwrap())
        .collect();

    assert_eq!(outputs[0], vec![3u8; 8]);
    assert_eq!(outputs[1], vec![1, 2, 3]);
}
