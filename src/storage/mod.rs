//! Persistent Storage Module
//!
//! SQLite-backed key-value persistence with mixed inline/external value
//! placement and staged-trash space reclamation.

mod file_store;
mod item;
mod kv;
mod metadata;

// Re-export public types
pub use item::Item;
pub use kv::{KvStorage, StorageMode};
