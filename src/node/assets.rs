// Asset bundles: chunked storage and reassembly
//
// A bundle uploaded under logical name N is stored as rows N_0, N_1, … of at
// most 400 000 bytes, all stamped with the upload time. Concatenating the
// rows in index order reconstitutes the bundle. Entry payloads reference
// bundles through their `filepath` field.
use std::collections::HashSet;

use crate::node::store::{PersistentStore, Row, StoreError, Table};
use crate::primitives::cell::Grid;

/// Row key of one bundle chunk.
pub fn chunk_name(name: &str, ix: usize) -> String {
    format!("{name}_{ix}")
}

/// Logical bundle name of a chunk row key (strips the `_N` suffix).
pub fn logical_name(chunk: &str) -> &str {
    match chunk.rsplit_once('_') {
        Some((name, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => name,
        _ => chunk,
    }
}

/// Store a bundle, splitting it into chunk rows. Idempotent: if chunk `N_0`
/// already exists the bundle was uploaded before and the whole write is
/// skipped. Returns whether anything was written.
pub async fn store_bundle(
    store: &PersistentStore,
    name: &str,
    bundle: &[u8],
    now_ms: u64,
) -> Result<bool, StoreError> {
    let probe = store
        .query_chunks(Table::Assets, &chunk_name(name, 0), None)
        .await?;
    if !probe.is_empty() {
        return Ok(false);
    }

    for (ix, chunk) in bundle.chunks(crate::config::BUNDLE_CHUNK_BYTES).enumerate() {
        store
            .put_chunk(
                Table::Assets,
                Row {
                    key: chunk_name(name, ix),
                    time: now_ms,
                    value: chunk.to_vec(),
                },
            )
            .await?;
    }
    Ok(true)
}

/// Reassemble a bundle from rows newer than `since_ms`, following chunk
/// indices until a gap. An empty result means the bundle is absent or stale.
pub async fn read_bundle(
    store: &PersistentStore,
    name: &str,
    since_ms: u64,
) -> Result<Vec<u8>, StoreError> {
    let mut bundle = Vec::new();
    let mut ix = 0usize;
    loop {
        let rows = store
            .query_chunks(Table::Assets, &chunk_name(name, ix), Some(since_ms))
            .await?;
        match rows.into_iter().next() {
            Some(row) => bundle.extend_from_slice(&row.value),
            None => break,
        }
        ix += 1;
    }
    Ok(bundle)
}

/// Every `filepath` referenced by any entry payload in any cell. Entry
/// payloads are JSON objects keyed by asset id; unparseable payloads
/// contribute nothing.
pub fn referenced_filepaths(grid: &Grid) -> HashSet<String> {
    let mut filepaths = HashSet::new();
    for cell in grid.values() {
        for entry in &cell.data {
            let Ok(payload) = serde_json::from_str::<serde_json::Value>(&entry.data) else {
                continue;
            };
            let Some(assets) = payload.as_object() else {
                continue;
            };
            for fields in assets.values() {
                if let Some(filepath) = fields.get("filepath").and_then(|v| v.as_str()) {
                    filepaths.insert(filepath.to_string());
                }
            }
        }
    }
    filepaths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::store_memory::MemoryStore;
    use crate::primitives::cell::{Cell, Entry, GridIndex};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_store() -> PersistentStore {
        PersistentStore::with_timing(
            Arc::new(MemoryStore::new()),
            Duration::ZERO,
            Duration::ZERO,
        )
    }

    #[test]
    fn test_logical_name_strips_suffix() {
        assert_eq!(logical_name("castle_0"), "castle");
        assert_eq!(logical_name("castle_12"), "castle");
        assert_eq!(logical_name("under_score_3"), "under_score");
        assert_eq!(logical_name("no-suffix"), "no-suffix");
        assert_eq!(logical_name("odd_tail"), "odd_tail");
    }

    #[tokio::test]
    async fn test_bundle_chunk_sizes() {
        let store = fast_store();
        let bundle = vec![7u8; 900_000];
        assert!(store_bundle(&store, "big", &bundle, 1000).await.unwrap());

        let c0 = store
            .query_chunks(Table::Assets, "big_0", None)
            .await
            .unwrap();
        let c1 = store
            .query_chunks(Table::Assets, "big_1", None)
            .await
            .unwrap();
        let c2 = store
            .query_chunks(Table::Assets, "big_2", None)
            .await
            .unwrap();
        assert_eq!(c0[0].value.len(), 400_000);
        assert_eq!(c1[0].value.len(), 400_000);
        assert_eq!(c2[0].value.len(), 100_000);
        assert!(store
            .query_chunks(Table::Assets, "big_3", None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_bundle_roundtrip() {
        let store = fast_store();
        let bundle: Vec<u8> = (0..900_000u32).map(|i| (i % 251) as u8).collect();
        store_bundle(&store, "world", &bundle, 42).await.unwrap();

        let back = read_bundle(&store, "world", 0).await.unwrap();
        assert_eq!(back, bundle);

        // Rows stamped at 42 are invisible to a since=42 read
        let stale = read_bundle(&store, "world", 42).await.unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn test_store_bundle_is_idempotent() {
        let store = fast_store();
        assert!(store_bundle(&store, "dup", b"abc", 1).await.unwrap());
        assert!(!store_bundle(&store, "dup", b"xyz", 2).await.unwrap());
        assert_eq!(read_bundle(&store, "dup", 0).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_store_bundle_survives_throttling() {
        let inner = Arc::new(MemoryStore::new());
        inner.throttle_next(2);
        let store = PersistentStore::with_timing(inner, Duration::ZERO, Duration::ZERO);
        assert!(store_bundle(&store, "slow", b"payload", 7).await.unwrap());
        assert_eq!(read_bundle(&store, "slow", 0).await.unwrap(), b"payload");
    }

    #[test]
    fn test_referenced_filepaths() {
        let mut grid = Grid::new();
        let mut cell = Cell::genesis();
        cell.data.push(Entry {
            data: r#"{"a1":{"filepath":"castle","position":[1,2,3]},"a2":{"filepath":"moat"}}"#
                .into(),
            signature: "sig".into(),
            updated: 1,
            approved: true,
        });
        cell.data.push(Entry {
            data: "not json".into(),
            signature: "sig".into(),
            updated: 2,
            approved: false,
        });
        grid.insert(GridIndex::ORIGIN, cell);

        let refs = referenced_filepaths(&grid);
        assert_eq!(refs.len(), 2);
        assert!(refs.contains("castle"));
        assert!(refs.contains("moat"));
    }
}
