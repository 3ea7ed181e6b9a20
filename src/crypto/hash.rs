// Canonical serialization and the two cell digests
//
// JSON used as a hash input is fragile, so every digest routes through one
// canonical encoder: keys sorted lexicographically, compact separators,
// integers as decimals, indices as arrays, no trailing newline. The two
// digests must be byte-for-byte reproducible across peers.
use std::collections::BTreeMap;

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::primitives::cell::Cell;

/// SHA-256, hex-encoded
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Canonical JSON text for an arbitrary value. `serde_json`'s default map is
/// ordered (BTreeMap), so object keys come out sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn digest_fields(fields: BTreeMap<&str, Value>) -> String {
    let encoded = serde_json::to_string(&fields).unwrap_or_default();
    sha256_hex(encoded.as_bytes())
}

/// The chaining digest: every field except `data` and `updated`. Used for
/// `previous_hash` links and for comparing cell identity across nodes.
pub fn hash_cell(cell: &Cell) -> String {
    digest_fields(BTreeMap::from([
        ("index", json!(cell.index)),
        ("owner", json!(cell.owner)),
        ("previous_hash", json!(cell.previous_hash)),
        ("previous_index", json!(cell.previous_index)),
        ("proof", json!(cell.proof)),
        ("timestamp", json!(cell.timestamp)),
    ]))
}

/// The proof-of-work challenge digest: `owner`, `index` and `previous_hash`
/// only, so the proof commits to the miner and the chain position but not to
/// the nonce being searched.
pub fn hash_cell_without_proof(cell: &Cell) -> String {
    digest_fields(BTreeMap::from([
        ("index", json!(cell.index)),
        ("owner", json!(cell.owner)),
        ("previous_hash", json!(cell.previous_hash)),
    ]))
}
