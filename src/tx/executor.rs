//! Destination-side release submission
//!
//! Only the relayer that wins the `Signed -> Executing` compare-and-swap
//! submits. A destination "already processed" answer means another relayer's
//! release landed first and counts as success.
//!
//! A release is signed locally and its hash stored before broadcast. From
//! then on the transfer waits on that hash; a new transaction is signed only
//! after the node definitely rejected the previous one.

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::adapter::{ChainAdapter, ReleaseCall, SignedRelease};
use crate::chain::finality::{FinalityStatus, FinalityTracker};
use crate::consensus::SignatureCoordinator;
use crate::error::{RelayerError, RelayerResult};
use crate::retry::RetryPolicy;
use crate::state::TransferStore;
use crate::types::{AuditEntry, Transfer, TransferStatus};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Everything needed to release funds on one destination chain
pub struct Destination {
    pub adapter: Arc<dyn ChainAdapter>,
    pub finality: Arc<FinalityTracker>,
    pub gas: GasEstimator,
    /// Interval between finality checks of a submitted release
    pub poll_interval: Duration,
    /// Give up waiting for a release to finalize after this long
    pub finality_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Our release finalized
    Completed { tx_hash: String },
    /// The destination contract had already processed the transfer
    CompletedElsewhere,
    /// Another writer moved the transfer first; nothing was submitted
    NotClaimed,
    /// The transfer was moved to UnderReview or Failed
    Escalated(TransferStatus),
}

pub struct TransactionExecutor {
    store: Arc<dyn TransferStore>,
    coordinator: Arc<SignatureCoordinator>,
    destinations: HashMap<u64, Destination>,
    nonces: NonceManager,
    retry: RetryPolicy,
}

impl TransactionExecutor {
    pub fn new(
        store: Arc<dyn TransferStore>,
        coordinator: Arc<SignatureCoordinator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            coordinator,
            destinations: HashMap::new(),
            nonces: NonceManager::new(),
            retry,
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destinations
            .insert(destination.adapter.chain_id(), destination);
        self
    }

    /// Claim a Signed transfer and release it on the destination chain
    pub async fn execute(&self, transfer: &Transfer) -> RelayerResult<ExecutionOutcome> {
        let claimed = self
            .store
            .transition(
                &transfer.id,
                TransferStatus::Signed,
                TransferStatus::Executing,
                Some("claimed for submission"),
            )
            .await?;
        if !claimed {
            debug!("Transfer {} claimed elsewhere, not submitting", transfer.id);
            return Ok(ExecutionOutcome::NotClaimed);
        }
        crate::metrics::record_transition(TransferStatus::Executing);

        let mut executing = transfer.clone();
        executing.status = TransferStatus::Executing;
        self.resume(&executing).await
    }

    /// Drive an Executing transfer to a terminal or review state. Used after
    /// a claim and when replaying Executing transfers on restart.
    pub async fn resume(&self, transfer: &Transfer) -> RelayerResult<ExecutionOutcome> {
        match self.drive(transfer).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.escalate(transfer, e).await,
        }
    }

    async fn drive(&self, transfer: &Transfer) -> RelayerResult<ExecutionOutcome> {
        let destination = self
            .destinations
            .get(&transfer.destination_chain)
            .ok_or(RelayerError::ChainNotFound {
                chain_id: transfer.destination_chain,
            })?;

        let tx_hash = match &transfer.destination_tx_hash {
            Some(hash) => {
                info!("Resuming finality wait for {} ({})", transfer.id, hash);
                hash.clone()
            }
            None => match self.submit(transfer, destination).await {
                Ok(hash) => hash,
                Err(RelayerError::AlreadyProcessed { .. }) => {
                    return self.complete_elsewhere(transfer).await;
                }
                Err(e) => return Err(e),
            },
        };

        self.await_finality(transfer, destination, &tx_hash).await
    }

    async fn submit(&self, transfer: &Transfer, destination: &Destination) -> RelayerResult<String> {
        let signatures = self.coordinator.collected(&transfer.id).await?;
        let call = ReleaseCall {
            transfer_id: transfer.id.clone(),
            source_kind: transfer.kind,
            token: transfer.token.clone(),
            amount: transfer.amount,
            recipient: transfer.recipient.clone(),
            signatures: signatures.into_iter().map(|s| s.signature).collect(),
        };

        let adapter = destination.adapter.as_ref();
        let chain_id = adapter.chain_id();
        let tx_hash = self
            .retry
            .run("release submission", || self.submit_once(adapter, destination, &call))
            .await?;

        crate::metrics::record_tx_submitted(chain_id);
        info!(
            "Submitted {} for transfer {} on chain {}: {}",
            call.function_signature(),
            transfer.id,
            chain_id,
            tx_hash
        );
        Ok(tx_hash)
    }

    /// Sign one release, persist its hash, then hand the bytes to the node.
    ///
    /// Once the hash is stored the transfer only ever waits on that hash,
    /// so neither a crash nor a lost acknowledgement produces a second
    /// transaction. The stored hash and the nonce are given back only when
    /// the node definitely rejected the bytes.
    async fn submit_once(
        &self,
        adapter: &dyn ChainAdapter,
        destination: &Destination,
        call: &ReleaseCall,
    ) -> RelayerResult<String> {
        let chain_id = adapter.chain_id();
        if adapter.is_transfer_processed(&call.transfer_id).await? {
            return Err(RelayerError::AlreadyProcessed {
                transfer_id: call.transfer_id.clone(),
            });
        }

        let gas_limit = destination.gas.estimate_limit(adapter, call).await?;
        let gas_price = destination.gas.price(adapter).await?;
        let nonce = self.nonces.allocate(adapter).await?;
        debug!(
            "Release {} on chain {}: nonce {}, max cost {} wei",
            call.transfer_id,
            chain_id,
            nonce,
            GasEstimator::calculate_cost(gas_limit, &gas_price)
        );

        let release = match adapter.sign_release(call, nonce, gas_limit, &gas_price).await {
            Ok(release) => release,
            Err(e) => {
                self.nonces.release(chain_id, nonce).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .store
            .set_destination_tx(&call.transfer_id, &release.tx_hash)
            .await
        {
            self.nonces.release(chain_id, nonce).await;
            return Err(e);
        }

        match self.broadcast(adapter, &release).await {
            Ok(()) => {}
            Err(e) if is_delivery_unknown(&e) => {
                warn!(
                    "Delivery of release {} for {} unconfirmed ({}), waiting on its hash",
                    release.tx_hash, call.transfer_id, e
                );
            }
            Err(e) => {
                self.nonces.release(chain_id, nonce).await;
                if matches!(e, RelayerError::Nonce { .. }) {
                    self.nonces.resync(chain_id).await;
                }
                self.store.clear_destination_tx(&call.transfer_id).await?;
                return Err(e);
            }
        }

        self.nonces.mark_pending(chain_id, nonce, &release.tx_hash).await;
        crate::metrics::record_tx_pending(chain_id, self.nonces.pending_count(chain_id).await);
        Ok(release.tx_hash)
    }

    /// Send the same signed bytes until the node gives an answer
    async fn broadcast(&self, adapter: &dyn ChainAdapter, release: &SignedRelease) -> RelayerResult<()> {
        let mut attempt = 0;
        loop {
            match adapter.broadcast_release(release).await {
                Err(e) if is_delivery_unknown(&e) && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.backoff_for_attempt(attempt);
                    attempt += 1;
                    debug!(
                        "Rebroadcasting release {} in {:?} after: {}",
                        release.tx_hash, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn await_finality(
        &self,
        transfer: &Transfer,
        destination: &Destination,
        tx_hash: &str,
    ) -> RelayerResult<ExecutionOutcome> {
        let chain_id = destination.adapter.chain_id();
        let started = Instant::now();

        loop {
            match destination.finality.check(tx_hash).await {
                Ok(FinalityStatus::Final(receipt)) => {
                    self.nonces.confirm_tx(chain_id, tx_hash).await;
                    crate::metrics::record_tx_pending(chain_id, self.nonces.pending_count(chain_id).await);
                    let completed = self
                        .store
                        .mark_transfer_complete(&transfer.id, Some(&receipt.tx_hash))
                        .await?;
                    if completed {
                        crate::metrics::record_transition(TransferStatus::Completed);
                        crate::metrics::record_tx_finalized(chain_id);
                        crate::metrics::record_tx_latency(chain_id, started.elapsed().as_secs_f64());
                        info!("Transfer {} completed in {}", transfer.id, receipt.tx_hash);
                    }
                    return Ok(ExecutionOutcome::Completed {
                        tx_hash: receipt.tx_hash,
                    });
                }
                Ok(status) => {
                    debug!("Release {} for {}: {:?}", tx_hash, transfer.id, status);
                }
                Err(RelayerError::ReorgDetected { block_number, .. }) => {
                    warn!(
                        "Release {} for {} reorged out of block {}, waiting for re-inclusion",
                        tx_hash, transfer.id, block_number
                    );
                }
                Err(e) if e.is_retryable() => {
                    warn!("Finality check for {} failed: {}", tx_hash, e);
                }
                Err(e) => {
                    // our release reverted; another relayer may have won
                    if destination.adapter.is_transfer_processed(&transfer.id).await? {
                        return self.complete_elsewhere(transfer).await;
                    }
                    return Err(e);
                }
            }

            if started.elapsed() >= destination.finality_timeout {
                destination.finality.forget(tx_hash).await;
                if destination.adapter.is_transfer_processed(&transfer.id).await? {
                    return self.complete_elsewhere(transfer).await;
                }
                return Err(RelayerError::Timeout {
                    operation: format!("finality of release {}", tx_hash),
                });
            }
            tokio::time::sleep(destination.poll_interval).await;
        }
    }

    async fn complete_elsewhere(&self, transfer: &Transfer) -> RelayerResult<ExecutionOutcome> {
        info!(
            "Transfer {} already processed on chain {}, treating as success",
            transfer.id, transfer.destination_chain
        );
        if self.store.mark_transfer_complete(&transfer.id, None).await? {
            crate::metrics::record_transition(TransferStatus::Completed);
        }
        Ok(ExecutionOutcome::CompletedElsewhere)
    }

    /// Record the error and move the transfer out of Executing.
    /// Exhausted transient failures go to review; permanent ones fail.
    async fn escalate(
        &self,
        transfer: &Transfer,
        err: RelayerError,
    ) -> RelayerResult<ExecutionOutcome> {
        self.store
            .append_audit(&AuditEntry::error(&transfer.id, &err))
            .await?;
        crate::metrics::record_tx_failed(transfer.destination_chain);

        let target = match &err {
            RelayerError::RetriesExhausted { .. }
            | RelayerError::Timeout { .. }
            | RelayerError::InsufficientSignatures { .. } => TransferStatus::UnderReview,
            e if e.is_retryable() => TransferStatus::UnderReview,
            _ => TransferStatus::Failed,
        };
        let reason = err.to_string();
        let moved = self
            .store
            .transition(&transfer.id, TransferStatus::Executing, target, Some(&reason))
            .await?;
        if moved {
            crate::metrics::record_transition(target);
        }
        error!(
            "Transfer {} moved to {}: {}",
            transfer.id, target, reason
        );
        Ok(ExecutionOutcome::Escalated(target))
    }
}

/// The node may or may not hold the transaction
fn is_delivery_unknown(err: &RelayerError) -> bool {
    matches!(
        err,
        RelayerError::Timeout { .. } | RelayerError::ChainConnection { .. }
    )
}
