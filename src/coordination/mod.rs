//! Coordination engine for the transfer pipeline
//!
//! The coordination engine:
//! 1. Consumes event batches and reorg signals from every chain watcher
//! 2. Records validated transfers and drives them through signing
//! 3. Hands threshold-signed transfers to the executor, one owner per id
//! 4. Replays durable state and escalates stalled signature collection

pub mod engine;

pub use engine::{CoordinationEngine, EngineConfig};
