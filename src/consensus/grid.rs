// The Blockgrid: cells-as-blocks over a 3-D lattice
//
// Cells are never deleted locally; reconciliation may replace the whole grid.
// Mining a cell sets owner and proof exactly once and materializes the
// absent neighbours as empty unmined cells chained to the miner's hash.
use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::consensus::pow;
use crate::crypto::hash::{hash_cell, hash_cell_without_proof};
use crate::crypto::rsa;
use crate::node::store::{PersistentStore, SaveGuard, StoreError, chunk_cell_text};
use crate::primitives::cell::{Cell, Entry, GENESIS_PREVIOUS_HASH, Grid, GridIndex};

#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("previous block has not been mined")]
    PreviousNotMined,
    #[error("block has already been mined")]
    AlreadyMined,
    #[error("block already exists at {0}")]
    Occupied(GridIndex),
    #[error("no block at {0}")]
    UnknownIndex(GridIndex),
    #[error("proof of work rejected")]
    InvalidProof,
    #[error("stored cell at {0} failed to deserialize")]
    Corrupt(GridIndex),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Blockgrid {
    grid: Grid,
    nodes: HashSet<String>,
    store: PersistentStore,
}

impl Blockgrid {
    /// Rehydrate the grid from the store, creating a fresh genesis when the
    /// store is empty.
    pub async fn open(store: PersistentStore) -> Result<Self, GridError> {
        let grid = load_grid(&store).await?;
        let mut blockgrid = Blockgrid {
            grid,
            nodes: HashSet::new(),
            store,
        };

        if blockgrid.grid.is_empty() {
            blockgrid
                .new_block(
                    GridIndex::ORIGIN,
                    GENESIS_PREVIOUS_HASH.to_string(),
                    GridIndex::ORIGIN,
                )
                .await?;
        }
        Ok(blockgrid)
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    pub fn cell(&self, index: &GridIndex) -> Option<&Cell> {
        self.grid.get(index)
    }

    pub fn nodes(&self) -> &HashSet<String> {
        &self.nodes
    }

    /// Remember a peer by its authority part, e.g. `"192.168.0.5:5000"`.
    /// Accepts full URLs or bare host:port.
    pub fn register_node(&mut self, address: &str) {
        let netloc = address
            .trim()
            .strip_prefix("http://")
            .or_else(|| address.trim().strip_prefix("https://"))
            .unwrap_or(address.trim());
        let netloc = netloc.split('/').next().unwrap_or(netloc);
        if !netloc.is_empty() {
            self.nodes.insert(netloc.to_string());
        }
    }

    /// Swap the in-memory grid wholesale. Used by reconciliation and by the
    /// replace endpoint; does not touch the store.
    pub fn replace_grid(&mut self, other: Grid) {
        self.grid = other;
    }

    /// Create and persist an empty, unmined cell.
    pub async fn new_block(
        &mut self,
        index: GridIndex,
        previous_hash: String,
        previous_index: GridIndex,
    ) -> Result<(), GridError> {
        if self.grid.contains_key(&index) {
            return Err(GridError::Occupied(index));
        }
        let cell = Cell::unmined(index, previous_hash, previous_index);
        self.persist(&cell).await?;
        self.grid.insert(index, cell);
        Ok(())
    }

    /// Append an entry to a cell. No signature verification happens here;
    /// entries are checked during cross-node validation.
    pub async fn new_transaction(
        &mut self,
        index: GridIndex,
        data: String,
        signature: String,
        updated_ms: u64,
        approved: bool,
    ) -> Result<GridIndex, GridError> {
        let cell = self
            .grid
            .get_mut(&index)
            .ok_or(GridError::UnknownIndex(index))?;
        cell.data.push(Entry {
            data,
            signature,
            updated: updated_ms,
            approved,
        });
        cell.updated = cell.updated.max(updated_ms);
        let snapshot = cell.clone();
        self.persist(&snapshot).await?;
        Ok(index)
    }

    /// The proof-of-work challenge a miner must solve to claim `index`:
    /// the cell as it stands with the candidate owner filled in.
    pub fn mine_challenge(&self, index: &GridIndex, owner: &str) -> Result<String, GridError> {
        let cell = self.grid.get(index).ok_or(GridError::PreviousNotMined)?;
        if cell.is_mined() {
            return Err(GridError::AlreadyMined);
        }
        let mut candidate = cell.clone();
        candidate.owner = Some(owner.to_string());
        Ok(hash_cell_without_proof(&candidate))
    }

    /// Assign owner and proof to an unmined cell, then materialize each
    /// absent neighbour chained to this cell's hash. Owner and proof are set
    /// exactly once; a second miner of the same cell is rejected.
    pub async fn sign_block(
        &mut self,
        index: GridIndex,
        proof: u64,
        owner: String,
    ) -> Result<Cell, GridError> {
        let cell = self.grid.get(&index).ok_or(GridError::PreviousNotMined)?;
        if cell.is_mined() {
            return Err(GridError::AlreadyMined);
        }

        let mut mined = cell.clone();
        mined.owner = Some(owner);
        let challenge = hash_cell_without_proof(&mined);
        if !pow::valid_proof(&challenge, proof, &index) {
            return Err(GridError::InvalidProof);
        }
        mined.proof = Some(proof);

        self.persist(&mined).await?;
        self.grid.insert(index, mined.clone());

        // Expand the frontier
        let frontier_hash = hash_cell(&mined);
        for neighbour in index.neighbours() {
            if !self.grid.contains_key(&neighbour) {
                self.new_block(neighbour, frontier_hash.clone(), index).await?;
            }
        }
        Ok(mined)
    }

    /// Mine and claim a cell in one call: solve the challenge by ascending
    /// scan, then sign.
    pub async fn mine_block(&mut self, index: GridIndex, owner: &str) -> Result<Cell, GridError> {
        let challenge = self.mine_challenge(&index, owner)?;
        let proof = pow::proof_of_work(&challenge, &index);
        self.sign_block(index, proof, owner.to_string()).await
    }

    /// Is the other grid more authoritative than ours?
    pub fn compare_grids(&self, other: &Grid) -> bool {
        valid_grid(other) && other.len() > self.grid.len()
    }

    /// Merge `shorter` into `longer`: same-owner cells with strictly newer
    /// data have their data copied across; cells absent from `longer` are
    /// inserted. Every change is persisted.
    pub async fn update_grid(&self, mut longer: Grid, shorter: &Grid) -> Result<Grid, GridError> {
        for (index, cell) in shorter {
            match longer.get_mut(index) {
                Some(ours) => {
                    if pow::proof_satisfies(&hash_cell_without_proof(cell), cell.proof, index)
                        && cell.owner == ours.owner
                        && cell.updated > ours.updated
                    {
                        ours.data = cell.data.clone();
                        ours.updated = cell.updated;
                        let snapshot = ours.clone();
                        self.persist(&snapshot).await?;
                    }
                }
                None => {
                    self.persist(cell).await?;
                    longer.insert(*index, cell.clone());
                }
            }
        }
        Ok(longer)
    }

    /// Entries at a cell, with unapproved entries hidden from non-moderators.
    pub fn visible_entries(&self, index: &GridIndex, moderator: bool) -> Vec<&Entry> {
        self.grid
            .get(index)
            .map(|cell| {
                cell.data
                    .iter()
                    .filter(|e| e.approved || moderator)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Destructively rewrite every entry payload at `index`, dropping assets
    /// whose `"<asset_id>,<filepath>"` tag is listed. The caller holds the
    /// process-wide destructive-edit mutex; this loop supplies the optimistic
    /// retry: re-read the cell from the store, apply the edit, save guarded,
    /// and start over if a concurrent write bumped the version.
    pub async fn strip_assets(
        &mut self,
        index: GridIndex,
        tags: &HashSet<String>,
    ) -> Result<(), GridError> {
        if !self.grid.contains_key(&index) {
            return Err(GridError::UnknownIndex(index));
        }
        let prefix = index.storage_key();

        loop {
            let (mut cell, guard) = match self.store.load_cell(&prefix).await? {
                Some((text, version)) => (
                    serde_json::from_str::<Cell>(&text)
                        .map_err(|_| GridError::Corrupt(index))?,
                    SaveGuard::IfVersion(version),
                ),
                None => (
                    self.grid
                        .get(&index)
                        .cloned()
                        .ok_or(GridError::UnknownIndex(index))?,
                    SaveGuard::Unconditional,
                ),
            };

            for entry in &mut cell.data {
                let Ok(Value::Object(mut payload)) = serde_json::from_str::<Value>(&entry.data)
                else {
                    continue;
                };
                payload.retain(|asset_id, fields| {
                    match fields.get("filepath").and_then(|v| v.as_str()) {
                        Some(filepath) => !tags.contains(&format!("{asset_id},{filepath}")),
                        None => true,
                    }
                });
                entry.data = serde_json::to_string(&Value::Object(payload)).unwrap_or_default();
            }

            let text =
                serde_json::to_string(&cell).map_err(|_| GridError::Corrupt(index))?;
            match self
                .store
                .save_cell(&prefix, chunk_cell_text(&text), guard)
                .await
            {
                Ok(_) => {
                    self.grid.insert(index, cell);
                    return Ok(());
                }
                Err(StoreError::VersionMismatch) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn persist(&self, cell: &Cell) -> Result<(), GridError> {
        let text = serde_json::to_string(cell).map_err(|_| GridError::Corrupt(cell.index))?;
        self.store
            .save_cell(
                &cell.index.storage_key(),
                chunk_cell_text(&text),
                SaveGuard::Unconditional,
            )
            .await?;
        Ok(())
    }
}

/// Validate a grid against the chain, proof and signature rules. Genesis is
/// trusted; an empty unmined cell only has to chain correctly; everything
/// else must carry a valid proof and verifying entries.
pub fn valid_grid(other: &Grid) -> bool {
    for (index, cell) in other {
        if *index == GridIndex::ORIGIN {
            continue;
        }

        let Some(previous) = other.get(&cell.previous_index) else {
            return false;
        };
        if cell.previous_hash != hash_cell(previous) {
            return false;
        }

        if cell.owner.is_none() && cell.data.is_empty() {
            continue;
        }

        if !pow::proof_satisfies(&hash_cell_without_proof(cell), cell.proof, index) {
            return false;
        }

        let Some(owner) = &cell.owner else {
            return false;
        };
        for entry in &cell.data {
            if !rsa::verify_b64(owner, entry.data.as_bytes(), &entry.signature) {
                return false;
            }
        }
    }
    true
}

async fn load_grid(store: &PersistentStore) -> Result<Grid, GridError> {
    let mut grid = HashMap::new();
    let r = crate::config::HYDRATE_RADIUS;
    for x in -r..=r {
        for y in -r..=r {
            for z in -r..=r {
                let index = GridIndex::new(x, y, z);
                if let Some((text, _)) = store.load_cell(&index.storage_key()).await? {
                    let cell = serde_json::from_str::<Cell>(&text)
                        .map_err(|_| GridError::Corrupt(index))?;
                    grid.insert(index, cell);
                }
            }
        }
    }
    Ok(grid)
}
