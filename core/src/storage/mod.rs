//! Durable keyed state
//!
//! Every component reads and writes its own keyspace through the [`KvStore`]
//! trait, so the same state machine runs over RocksDB on a node and over an
//! in-memory map in tests.

pub mod codec;
pub mod db;
pub mod memory;
pub mod state;

pub use codec::{Record, load, save};
pub use db::RocksDbStore;
pub use memory::MemStore;
pub use state::{KvStore, WriteOp};
