pub mod blob;
pub mod db;
pub mod memory;
pub mod state;

pub use blob::{BlobHash, BlobStore};
pub use db::RocksDbStore;
pub use memory::{MemoryBlobStore, MemoryState};
pub use state::{StoredEntry, WorldState};
