// Storage modules
pub mod assets;        // Bundle chunking over the Assets table
pub mod store;         // ChunkStore contract + throughput-governed wrapper
pub mod store_memory;  // In-memory implementation (tests, ephemeral nodes)
pub mod store_rocksdb; // RocksDB implementation (production)
pub mod sweeper;       // Periodic orphaned-bundle sweep

pub use store::PersistentStore;
pub use store_rocksdb::GridStore;
