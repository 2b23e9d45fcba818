//! Storage adapters that live inside the domain crate.
//!
//! The in-memory store backs unit tests and the demo binary. The SQLite
//! store lives in its own crate.

pub(crate) mod eval;
pub mod memory_store;

pub use memory_store::MemoryStore;
