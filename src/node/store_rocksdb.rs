// RocksDB-backed ChunkStore
//
// Column families:
//   "assets"    : name ++ 0x00 ++ time[8] BE → bundle chunk bytes
//   "grid"      : chunk key text             → serialized cell chunk text
//   "grid_meta" : cell key prefix            → version[8] LE
//
// The byte 0x00 separates the composite asset key; bundle names are client
// field names and never contain NUL. Cell saves are serialized through an
// internal lock so the version check and the batch write are atomic.
use std::path::Path;
use std::sync::{Arc, Mutex};

use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};

use super::store::{ChunkStore, Row, SaveGuard, ScanPage, StoreError, Table};

const CF_ASSETS: &str = "assets";
const CF_GRID: &str = "grid";
const CF_GRID_META: &str = "grid_meta";

const SCAN_PAGE: usize = 100;

pub struct GridStore {
    db: Arc<DB>,
    swap_lock: Mutex<()>,
}

impl GridStore {
    /// Open or create the store. Write-buffer and compression tuning follows
    /// the workload: large sequential chunk writes, point reads.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_target_file_size_base(64 * 1024 * 1024);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_level_compaction_dynamic_level_bytes(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_ASSETS, opts.clone()),
            ColumnFamilyDescriptor::new(CF_GRID, opts.clone()),
            ColumnFamilyDescriptor::new(CF_GRID_META, opts.clone()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs).map_err(backend)?;
        Ok(GridStore {
            db: Arc::new(db),
            swap_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::Corruption("column family not found"))
    }

    fn cf_for(&self, table: Table) -> Result<&rocksdb::ColumnFamily, StoreError> {
        match table {
            Table::Assets => self.cf(CF_ASSETS),
            Table::Grid => self.cf(CF_GRID),
        }
    }
}

fn backend(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn asset_key(name: &str, time: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 9);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key.extend_from_slice(&time.to_be_bytes());
    key
}

fn split_asset_key(raw: &[u8]) -> Result<(String, u64), StoreError> {
    let sep = raw
        .iter()
        .rposition(|&b| b == 0)
        .ok_or(StoreError::Corruption("asset key missing separator"))?;
    if raw.len() != sep + 9 {
        return Err(StoreError::Corruption("asset key truncated"));
    }
    let name = String::from_utf8(raw[..sep].to_vec())
        .map_err(|_| StoreError::Corruption("non-utf8 asset name"))?;
    let time = u64::from_be_bytes(
        raw[sep + 1..]
            .try_into()
            .map_err(|_| StoreError::Corruption("asset key truncated"))?,
    );
    Ok((name, time))
}

impl ChunkStore for GridStore {
    fn put_chunk(&self, table: Table, row: Row) -> Result<(), StoreError> {
        let cf = self.cf_for(table)?;
        match table {
            Table::Assets => self
                .db
                .put_cf(cf, asset_key(&row.key, row.time), row.value)
                .map_err(backend),
            Table::Grid => self
                .db
                .put_cf(cf, row.key.as_bytes(), row.value)
                .map_err(backend),
        }
    }

    fn query_chunks(
        &self,
        table: Table,
        key: &str,
        newer_than: Option<u64>,
    ) -> Result<Vec<Row>, StoreError> {
        match table {
            Table::Assets => {
                let cf = self.cf(CF_ASSETS)?;
                let mut prefix = key.as_bytes().to_vec();
                prefix.push(0);

                let mut rows = Vec::new();
                let iter = self
                    .db
                    .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
                for item in iter {
                    let (raw, value) = item.map_err(backend)?;
                    if !raw.starts_with(&prefix) {
                        break;
                    }
                    let (name, time) = split_asset_key(&raw)?;
                    if newer_than.is_none_or(|t| time > t) {
                        rows.push(Row {
                            key: name,
                            time,
                            value: value.to_vec(),
                        });
                    }
                }
                Ok(rows)
            }
            Table::Grid => {
                let cf = self.cf(CF_GRID)?;
                match self.db.get_cf(cf, key.as_bytes()).map_err(backend)? {
                    Some(value) => Ok(vec![Row {
                        key: key.to_string(),
                        time: 0,
                        value,
                    }]),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    fn scan_keys(&self, table: Table, start: Option<String>) -> Result<ScanPage, StoreError> {
        let cf = self.cf_for(table)?;

        // The continuation token is the hex of the last raw key handed out;
        // resume strictly after it.
        let seek: Vec<u8> = match &start {
            Some(token) => {
                let mut raw = hex::decode(token)
                    .map_err(|_| StoreError::Corruption("bad scan token"))?;
                raw.push(0);
                raw
            }
            None => Vec::new(),
        };

        let mode = if start.is_some() {
            IteratorMode::From(&seek, Direction::Forward)
        } else {
            IteratorMode::Start
        };

        let mut names: Vec<String> = Vec::new();
        let mut last_raw: Option<Vec<u8>> = None;
        let mut rows_seen = 0usize;
        for item in self.db.iterator_cf(cf, mode) {
            let (raw, _) = item.map_err(backend)?;
            let name = match table {
                Table::Assets => split_asset_key(&raw)?.0,
                Table::Grid => String::from_utf8(raw.to_vec())
                    .map_err(|_| StoreError::Corruption("non-utf8 grid key"))?,
            };
            if names.last() != Some(&name) {
                names.push(name);
            }
            last_raw = Some(raw.to_vec());
            rows_seen += 1;
            if rows_seen == SCAN_PAGE {
                break;
            }
        }

        let next = (rows_seen == SCAN_PAGE)
            .then(|| last_raw.map(|raw| hex::encode(raw)))
            .flatten();
        Ok(ScanPage { names, next })
    }

    fn delete_key(&self, table: Table, key: &str) -> Result<(), StoreError> {
        match table {
            Table::Assets => {
                let cf = self.cf(CF_ASSETS)?;
                let mut prefix = key.as_bytes().to_vec();
                prefix.push(0);

                let mut batch = WriteBatch::default();
                let iter = self
                    .db
                    .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
                for item in iter {
                    let (raw, _) = item.map_err(backend)?;
                    if !raw.starts_with(&prefix) {
                        break;
                    }
                    batch.delete_cf(cf, raw);
                }
                self.db.write(batch).map_err(backend)
            }
            Table::Grid => {
                let cf = self.cf(CF_GRID)?;
                self.db.delete_cf(cf, key.as_bytes()).map_err(backend)
            }
        }
    }

    fn save_cell(
        &self,
        prefix: &str,
        chunks: Vec<String>,
        guard: SaveGuard,
    ) -> Result<u64, StoreError> {
        let _held = self.swap_lock.lock().unwrap_or_else(|e| e.into_inner());

        let cf_meta = self.cf(CF_GRID_META)?;
        let cf_grid = self.cf(CF_GRID)?;

        let current = self
            .db
            .get_cf(cf_meta, prefix.as_bytes())
            .map_err(backend)?
            .map(|raw| {
                raw.as_slice()
                    .try_into()
                    .map(u64::from_le_bytes)
                    .map_err(|_| StoreError::Corruption("bad cell version"))
            })
            .transpose()?;

        if let SaveGuard::IfVersion(expected) = guard
            && current != Some(expected)
        {
            return Err(StoreError::VersionMismatch);
        }

        let mut batch = WriteBatch::default();
        let row_prefix = format!("{prefix}_");
        let iter = self.db.iterator_cf(
            cf_grid,
            IteratorMode::From(row_prefix.as_bytes(), Direction::Forward),
        );
        for item in iter {
            let (raw, _) = item.map_err(backend)?;
            if !raw.starts_with(row_prefix.as_bytes()) {
                break;
            }
            batch.delete_cf(cf_grid, raw);
        }

        for (ix, chunk) in chunks.into_iter().enumerate() {
            batch.put_cf(cf_grid, format!("{prefix}_{ix}").as_bytes(), chunk.as_bytes());
        }

        let version = current.unwrap_or(0) + 1;
        batch.put_cf(cf_meta, prefix.as_bytes(), version.to_le_bytes());
        self.db.write(batch).map_err(backend)?;
        Ok(version)
    }

    fn load_cell(&self, prefix: &str) -> Result<Option<(String, u64)>, StoreError> {
        let cf_grid = self.cf(CF_GRID)?;
        let mut text = String::new();
        let mut ix = 0usize;
        loop {
            match self
                .db
                .get_cf(cf_grid, format!("{prefix}_{ix}").as_bytes())
                .map_err(backend)?
            {
                Some(chunk) => {
                    text.push_str(
                        std::str::from_utf8(&chunk)
                            .map_err(|_| StoreError::Corruption("non-utf8 grid chunk"))?,
                    );
                    ix += 1;
                }
                None => break,
            }
        }
        if ix == 0 {
            return Ok(None);
        }

        let cf_meta = self.cf(CF_GRID_META)?;
        let version = self
            .db
            .get_cf(cf_meta, prefix.as_bytes())
            .map_err(backend)?
            .and_then(|raw| raw.as_slice().try_into().ok().map(u64::from_le_bytes))
            .unwrap_or(1);
        Ok(Some((text, version)))
    }
}
