// In-memory ChunkStore for unit tests and ephemeral nodes
//
// Mirrors the durable backend's semantics, including pagination and cell
// versioning, and can be armed to reject the next N writes with `Throttled`
// to exercise the retry policy.
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use super::store::{ChunkStore, Row, SaveGuard, ScanPage, StoreError, Table};

const SCAN_PAGE: usize = 100;

#[derive(Default)]
pub struct MemoryStore {
    assets: Mutex<BTreeMap<(String, u64), Vec<u8>>>,
    grid: Mutex<BTreeMap<String, String>>,
    versions: Mutex<HashMap<String, u64>>,
    throttle_budget: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with `Throttled`.
    pub fn throttle_next(&self, n: u32) {
        self.throttle_budget.store(n, Ordering::SeqCst);
    }

    fn maybe_throttle(&self) -> Result<(), StoreError> {
        let current = self.throttle_budget.load(Ordering::SeqCst);
        if current > 0
            && self
                .throttle_budget
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::Throttled);
        }
        Ok(())
    }

    pub fn asset_row_count(&self) -> usize {
        self.assets.lock().unwrap().len()
    }
}

impl ChunkStore for MemoryStore {
    fn put_chunk(&self, table: Table, row: Row) -> Result<(), StoreError> {
        self.maybe_throttle()?;
        match table {
            Table::Assets => {
                self.assets
                    .lock()
                    .unwrap()
                    .insert((row.key, row.time), row.value);
            }
            Table::Grid => {
                self.grid.lock().unwrap().insert(
                    row.key,
                    String::from_utf8(row.value)
                        .map_err(|_| StoreError::Corruption("non-utf8 grid chunk"))?,
                );
            }
        }
        Ok(())
    }

    fn query_chunks(
        &self,
        table: Table,
        key: &str,
        newer_than: Option<u64>,
    ) -> Result<Vec<Row>, StoreError> {
        match table {
            Table::Assets => {
                let assets = self.assets.lock().unwrap();
                Ok(assets
                    .range((key.to_string(), 0)..=(key.to_string(), u64::MAX))
                    .filter(|((_, time), _)| newer_than.is_none_or(|t| *time > t))
                    .map(|((name, time), value)| Row {
                        key: name.clone(),
                        time: *time,
                        value: value.clone(),
                    })
                    .collect())
            }
            Table::Grid => {
                let grid = self.grid.lock().unwrap();
                Ok(grid
                    .get(key)
                    .map(|text| {
                        vec![Row {
                            key: key.to_string(),
                            time: 0,
                            value: text.clone().into_bytes(),
                        }]
                    })
                    .unwrap_or_default())
            }
        }
    }

    fn scan_keys(&self, table: Table, start: Option<String>) -> Result<ScanPage, StoreError> {
        let keys: Vec<String> = match table {
            Table::Assets => {
                let assets = self.assets.lock().unwrap();
                assets
                    .keys()
                    .map(|(name, _)| name.clone())
                    .filter(|name| start.as_ref().is_none_or(|s| name > s))
                    .collect()
            }
            Table::Grid => {
                let grid = self.grid.lock().unwrap();
                grid.keys()
                    .filter(|name| start.as_ref().is_none_or(|s| *name > s))
                    .cloned()
                    .collect()
            }
        };

        let mut names: Vec<String> = Vec::new();
        for name in keys {
            if names.last() != Some(&name) {
                names.push(name);
            }
            if names.len() == SCAN_PAGE {
                break;
            }
        }
        let next = (names.len() == SCAN_PAGE).then(|| names.last().cloned()).flatten();
        Ok(ScanPage { names, next })
    }

    fn delete_key(&self, table: Table, key: &str) -> Result<(), StoreError> {
        match table {
            Table::Assets => {
                let mut assets = self.assets.lock().unwrap();
                let doomed: Vec<(String, u64)> = assets
                    .range((key.to_string(), 0)..=(key.to_string(), u64::MAX))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in doomed {
                    assets.remove(&k);
                }
            }
            Table::Grid => {
                self.grid.lock().unwrap().remove(key);
            }
        }
        Ok(())
    }

    fn save_cell(
        &self,
        prefix: &str,
        chunks: Vec<String>,
        guard: SaveGuard,
    ) -> Result<u64, StoreError> {
        self.maybe_throttle()?;
        let mut versions = self.versions.lock().unwrap();
        let current = versions.get(prefix).copied();
        if let SaveGuard::IfVersion(expected) = guard
            && current != Some(expected)
        {
            return Err(StoreError::VersionMismatch);
        }

        let mut grid = self.grid.lock().unwrap();
        let stale: Vec<String> = grid
            .range(format!("{prefix}_")..)
            .take_while(|(k, _)| k.starts_with(&format!("{prefix}_")))
            .map(|(k, _)| k.clone())
            .collect();
        for k in stale {
            grid.remove(&k);
        }
        for (ix, chunk) in chunks.into_iter().enumerate() {
            grid.insert(format!("{prefix}_{ix}"), chunk);
        }

        let version = current.unwrap_or(0) + 1;
        versions.insert(prefix.to_string(), version);
        Ok(version)
    }

    fn load_cell(&self, prefix: &str) -> Result<Option<(String, u64)>, StoreError> {
        let grid = self.grid.lock().unwrap();
        let mut text = String::new();
        let mut ix = 0usize;
        while let Some(chunk) = grid.get(&format!("{prefix}_{ix}")) {
            text.push_str(chunk);
            ix += 1;
        }
        if ix == 0 {
            return Ok(None);
        }
        let version = self
            .versions
            .lock()
            .unwrap()
            .get(prefix)
            .copied()
            .unwrap_or(1);
        Ok(Some((text, version)))
    }
}
