//! Storage interface for transfers, signatures and relayer bookkeeping
//!
//! The store is the single source of truth for exactly-once processing.
//! Every implementation must give the same guarantees:
//! - `record_transfer` is insert-only and reports [`RelayerError::DuplicateTransfer`]
//! - status changes are compare-and-swap on the current status
//! - a relayer holds at most one signature per transfer; repeats are no-ops
//!
//! [`RelayerError::DuplicateTransfer`]: crate::error::RelayerError::DuplicateTransfer

use crate::config::ChainConfig;
use crate::error::RelayerResult;
use crate::types::{
    AuditEntry, Checkpoint, Signature, SupportedToken, Transfer, TransferStats, TransferStatus,
    ValidatorSet,
};

use async_trait::async_trait;

#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn health_check(&self) -> RelayerResult<()>;

    /// Insert a new transfer in `Pending`. Fails if the id already exists.
    async fn record_transfer(&self, transfer: &Transfer) -> RelayerResult<()>;

    async fn get_transfer(&self, id: &str) -> RelayerResult<Option<Transfer>>;

    /// Move `id` from `from` to `to` if, and only if, it is currently in `from`.
    ///
    /// Returns `Ok(false)` when another writer changed the status first.
    /// Edges outside the state machine fail with `InvalidStateTransition`.
    async fn transition(
        &self,
        id: &str,
        from: TransferStatus,
        to: TransferStatus,
        reason: Option<&str>,
    ) -> RelayerResult<bool>;

    /// `Executing -> Completed`, keeping any previously recorded destination hash
    /// when `destination_tx_hash` is `None`
    async fn mark_transfer_complete(
        &self,
        id: &str,
        destination_tx_hash: Option<&str>,
    ) -> RelayerResult<bool>;

    /// Record the hash of a submitted release while the transfer is `Executing`
    async fn set_destination_tx(&self, id: &str, tx_hash: &str) -> RelayerResult<()>;

    /// Forget a release hash whose transaction never reached the chain.
    /// Only applies while the transfer is `Executing` or `UnderReview`;
    /// returns `false` in any other status.
    async fn clear_destination_tx(&self, id: &str) -> RelayerResult<bool>;

    async fn update_confirmations(&self, id: &str, confirmations: u64) -> RelayerResult<()>;

    /// True iff the transfer exists and is `Completed` or `Failed`
    async fn is_transfer_processed(&self, id: &str) -> RelayerResult<bool>;

    async fn get_transfers_by_status(
        &self,
        status: TransferStatus,
        limit: usize,
    ) -> RelayerResult<Vec<Transfer>>;

    /// Transfers whose source event lies in `[from_block, to_block]` on `chain_id`
    async fn get_transfers_in_block_range(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<Transfer>>;

    /// Newest first
    async fn list_transfers(&self, offset: usize, limit: usize) -> RelayerResult<Vec<Transfer>>;

    async fn get_stats(&self) -> RelayerResult<TransferStats>;

    /// Returns `false` if this relayer already has a signature for the transfer
    async fn add_signature(&self, signature: &Signature) -> RelayerResult<bool>;

    /// Ordered by relayer address
    async fn get_signatures(&self, transfer_id: &str) -> RelayerResult<Vec<Signature>>;

    async fn signature_count(&self, transfer_id: &str) -> RelayerResult<usize>;

    async fn has_signed(&self, transfer_id: &str, relayer_address: &str) -> RelayerResult<bool>;

    async fn append_audit(&self, entry: &AuditEntry) -> RelayerResult<()>;

    /// Oldest first
    async fn get_audit_trail(&self, transfer_id: &str) -> RelayerResult<Vec<AuditEntry>>;

    async fn get_checkpoint(&self, chain_id: u64) -> RelayerResult<Option<Checkpoint>>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> RelayerResult<()>;

    async fn upsert_token(&self, token: &SupportedToken) -> RelayerResult<()>;

    async fn get_token(&self, chain_id: u64, token_address: &str) -> RelayerResult<Option<SupportedToken>>;

    async fn list_tokens(&self) -> RelayerResult<Vec<SupportedToken>>;

    /// Persist a validator set version. Versions are insert-only.
    async fn save_validator_set(&self, set: &ValidatorSet) -> RelayerResult<()>;

    async fn latest_validator_set(&self) -> RelayerResult<Option<ValidatorSet>>;

    async fn upsert_chain_config(&self, config: &ChainConfig) -> RelayerResult<()>;
}
