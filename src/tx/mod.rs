//! Destination release submission with nonce management and gas pricing

mod executor;
mod gas;
mod nonce;

pub use executor::{Destination, ExecutionOutcome, TransactionExecutor};
pub use gas::GasEstimator;
pub use nonce::NonceManager;
