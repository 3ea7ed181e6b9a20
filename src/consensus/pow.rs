// Proof of work: difficulty grows with Chebyshev distance from the origin
use sha2::{Digest, Sha256};

use crate::primitives::cell::GridIndex;

/// Leading zero hex digits required of a proof digest at `index`:
/// max(|x|, |y|, |z|), saturated to the digest length.
pub fn difficulty(index: &GridIndex) -> usize {
    index
        .0
        .iter()
        .map(|v| v.unsigned_abs())
        .max()
        .unwrap_or(0)
        .min(64) as usize
}

/// Does SHA-256(challenge ++ proof) carry `difficulty(index)` leading zeros?
///
/// The challenge digest text and the decimal proof are concatenated with no
/// separator before hashing; this rule is bit-identical across peers.
pub fn valid_proof(challenge: &str, proof: u64, index: &GridIndex) -> bool {
    let required = difficulty(index);
    if required == 0 {
        return true;
    }
    let guess = format!("{challenge}{proof}");
    let digest = hex::encode(Sha256::digest(guess.as_bytes()));
    digest.bytes().take(required).all(|b| b == b'0')
}

/// Proof check for cells that may not be mined yet. A missing proof passes
/// only where the difficulty is zero.
pub fn proof_satisfies(challenge: &str, proof: Option<u64>, index: &GridIndex) -> bool {
    match proof {
        Some(p) => valid_proof(challenge, p, index),
        None => difficulty(index) == 0,
    }
}

/// Ascending scan from zero; returns the smallest valid nonce.
pub fn proof_of_work(challenge: &str, index: &GridIndex) -> u64 {
    let mut proof: u64 = 0;
    while !valid_proof(challenge, proof, index) {
        proof += 1;
    }
    proof
}
