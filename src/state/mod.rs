//! Transfer state persistence
//!
//! Handles:
//! - Transfer records and their status machine
//! - Relayer signatures
//! - Audit trail of transitions and classified errors
//! - Block checkpoints for restart recovery
//! - Token registry and validator set versions

mod manager;
mod memory;
mod store;

pub use manager::StateManager;
pub use memory::MemoryStore;
pub use store::TransferStore;
