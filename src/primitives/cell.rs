// Data Structures: grid index, cell, entry
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// The hash a genesis cell chains back to
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Position of a cell in the unbounded 3-D lattice.
///
/// Three key renderings, all stable wire contracts:
///   JSON form     `[x, y, z]`         (request bodies, cell fields)
///   wire map key  `"x:y:z"`           (grid objects on the wire)
///   storage key   `"(x, y, z)"`       (chunk-row key prefix in the Grid table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridIndex(pub [i64; 3]);

impl GridIndex {
    pub const ORIGIN: GridIndex = GridIndex([0, 0, 0]);

    pub fn new(x: i64, y: i64, z: i64) -> Self {
        GridIndex([x, y, z])
    }

    /// The six axis-adjacent indices.
    pub fn neighbours(&self) -> [GridIndex; 6] {
        let [x, y, z] = self.0;
        [
            GridIndex([x - 1, y, z]),
            GridIndex([x + 1, y, z]),
            GridIndex([x, y - 1, z]),
            GridIndex([x, y + 1, z]),
            GridIndex([x, y, z - 1]),
            GridIndex([x, y, z + 1]),
        ]
    }

    /// True iff the two indices differ by exactly one on exactly one axis.
    pub fn is_neighbour_of(&self, other: &GridIndex) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).abs())
            .sum::<i64>()
            == 1
    }

    /// Maps a world position onto its grid cell: floor(p / 500) per axis.
    pub fn from_world(position: [f64; 3]) -> Self {
        GridIndex(position.map(|p| (p / crate::config::WORLD_CELL_SIZE).floor() as i64))
    }

    /// Wire map key, e.g. `"0:-1:2"`.
    pub fn wire_key(&self) -> String {
        let [x, y, z] = self.0;
        format!("{x}:{y}:{z}")
    }

    pub fn from_wire_key(key: &str) -> Option<Self> {
        let mut parts = key.split(':');
        let x = parts.next()?.parse().ok()?;
        let y = parts.next()?.parse().ok()?;
        let z = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(GridIndex([x, y, z]))
    }

    /// Chunk-row key prefix in the Grid table, e.g. `"(0, -1, 2)"`.
    pub fn storage_key(&self) -> String {
        let [x, y, z] = self.0;
        format!("({x}, {y}, {z})")
    }
}

impl fmt::Display for GridIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// One signed data item appended to a cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    /// Opaque payload: a JSON object keyed by user asset ids
    pub data: String,
    /// Base64 signature over `data`
    pub signature: String,
    /// Millisecond timestamp of this entry
    pub updated: u64,
    /// Moderator-submitted entries are approved on arrival
    pub approved: bool,
}

/// One record per grid index. Mined cells carry an owner and a proof-of-work;
/// pending cells carry neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub index: GridIndex,
    pub timestamp: u64,
    pub updated: u64,
    pub data: Vec<Entry>,
    pub proof: Option<u64>,
    /// PEM-encoded RSA public key of the miner
    pub owner: Option<String>,
    pub previous_hash: String,
    pub previous_index: GridIndex,
}

impl Cell {
    /// A freshly materialized, unmined cell.
    pub fn unmined(index: GridIndex, previous_hash: String, previous_index: GridIndex) -> Self {
        let now = now_ms();
        Cell {
            index,
            timestamp: now,
            updated: now,
            data: Vec::new(),
            proof: None,
            owner: None,
            previous_hash,
            previous_index,
        }
    }

    pub fn genesis() -> Self {
        Cell::unmined(
            GridIndex::ORIGIN,
            GENESIS_PREVIOUS_HASH.to_string(),
            GridIndex::ORIGIN,
        )
    }

    pub fn is_mined(&self) -> bool {
        self.owner.is_some()
    }
}

/// The grid itself: a mapping from index to cell, unbounded in all six
/// directions. Neighbours are never pointers; they are materialized as map
/// entries when a cell is mined.
pub type Grid = HashMap<GridIndex, Cell>;

/// Wire form of a grid: `{"x:y:z": cell}`.
pub fn grid_to_wire(grid: &Grid) -> serde_json::Map<String, serde_json::Value> {
    grid.iter()
        .map(|(idx, cell)| {
            (
                idx.wire_key(),
                serde_json::to_value(cell).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect()
}

pub fn grid_from_wire(wire: &serde_json::Value) -> Option<Grid> {
    let map = wire.as_object()?;
    let mut grid = Grid::with_capacity(map.len());
    for (key, value) in map {
        let idx = GridIndex::from_wire_key(key)?;
        let cell: Cell = serde_json::from_value(value.clone()).ok()?;
        grid.insert(idx, cell);
    }
    Some(grid)
}

/// Milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbours() {
        let idx = GridIndex::new(1, -2, 3);
        let n = idx.neighbours();
        assert_eq!(n.len(), 6);
        for candidate in n {
            assert!(idx.is_neighbour_of(&candidate));
            assert!(candidate.is_neighbour_of(&idx));
        }
        assert!(!idx.is_neighbour_of(&idx));
        assert!(!idx.is_neighbour_of(&GridIndex::new(2, -1, 3)));
    }

    #[test]
    fn test_wire_key_roundtrip() {
        for idx in [
            GridIndex::ORIGIN,
            GridIndex::new(1, 0, -1),
            GridIndex::new(-12, 44, 7),
        ] {
            assert_eq!(GridIndex::from_wire_key(&idx.wire_key()), Some(idx));
        }
        assert_eq!(GridIndex::from_wire_key("1:2"), None);
        assert_eq!(GridIndex::from_wire_key("1:2:3:4"), None);
        assert_eq!(GridIndex::from_wire_key("a:b:c"), None);
    }

    #[test]
    fn test_storage_key_format() {
        assert_eq!(GridIndex::ORIGIN.storage_key(), "(0, 0, 0)");
        assert_eq!(GridIndex::new(-1, 2, 0).storage_key(), "(-1, 2, 0)");
    }

    #[test]
    fn test_world_to_cell_floors() {
        assert_eq!(
            GridIndex::from_world([0.0, 499.9, 500.0]),
            GridIndex::new(0, 0, 1)
        );
        // Negative positions floor away from zero
        assert_eq!(
            GridIndex::from_world([-0.1, -500.0, -500.1]),
            GridIndex::new(-1, -1, -2)
        );
    }

    #[test]
    fn test_index_json_form_is_array() {
        let idx = GridIndex::new(1, -2, 3);
        assert_eq!(serde_json::to_string(&idx).unwrap(), "[1,-2,3]");
    }

    #[test]
    fn test_grid_wire_roundtrip() {
        let mut grid = Grid::new();
        grid.insert(GridIndex::ORIGIN, Cell::genesis());
        grid.insert(
            GridIndex::new(0, 0, 1),
            Cell::unmined(GridIndex::new(0, 0, 1), "ab".into(), GridIndex::ORIGIN),
        );

        let wire = serde_json::Value::Object(grid_to_wire(&grid));
        let back = grid_from_wire(&wire).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[&GridIndex::ORIGIN].previous_hash, GENESIS_PREVIOUS_HASH);
    }
}
