//! Chain finality tracking for different L1/L2 networks
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: soft finality from the sequencer, L1 for hard finality
//! - Avalanche: Instant finality (1 block)
//!
//! The tracker gates the executor's own destination submissions: a release is
//! only reported final once its receipt has the configured number of
//! confirmations and still sits in the block it was first seen in.

use super::adapter::{ChainAdapter, ReceiptInfo};
use crate::error::{RelayerError, RelayerResult};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Where a tracked transaction was first seen
#[derive(Debug, Clone)]
struct Inclusion {
    block_number: u64,
    block_hash: String,
}

/// Finality of one tracked transaction
#[derive(Debug, Clone, PartialEq)]
pub enum FinalityStatus {
    /// Not mined yet
    Pending,
    /// Mined with fewer than the required confirmations
    Confirming { confirmations: u64 },
    Final(ReceiptInfo),
}

/// Tracks finality for transactions on a specific chain
pub struct FinalityTracker {
    chain_id: u64,
    confirmation_blocks: u64,
    adapter: Arc<dyn ChainAdapter>,
    /// tx_hash -> first observed inclusion
    pending: RwLock<HashMap<String, Inclusion>>,
}

impl FinalityTracker {
    pub fn new(chain_id: u64, confirmation_blocks: u64, adapter: Arc<dyn ChainAdapter>) -> Self {
        Self {
            chain_id,
            confirmation_blocks,
            adapter,
            pending: RwLock::new(HashMap::new()),
        }
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
    }

    /// Check a transaction's progress towards finality.
    ///
    /// A receipt that disappears or moves to another block after being seen is
    /// reported as [`RelayerError::ReorgDetected`].
    pub async fn check(&self, tx_hash: &str) -> RelayerResult<FinalityStatus> {
        let receipt = self.adapter.transaction_receipt(tx_hash).await?;
        let seen = self.pending.read().await.get(tx_hash).cloned();

        let receipt = match (receipt, seen) {
            (None, None) => return Ok(FinalityStatus::Pending),
            (None, Some(inclusion)) => {
                warn!(
                    "Reorg detected: tx {} no longer included on chain {}",
                    tx_hash, self.chain_id
                );
                self.pending.write().await.remove(tx_hash);
                return Err(RelayerError::ReorgDetected {
                    chain_id: self.chain_id,
                    block_number: inclusion.block_number,
                });
            }
            (Some(receipt), Some(inclusion)) if receipt.block_hash != inclusion.block_hash => {
                warn!(
                    "Reorg detected: tx {} moved from block {} to {} on chain {}",
                    tx_hash, inclusion.block_number, receipt.block_number, self.chain_id
                );
                self.pending.write().await.insert(
                    tx_hash.to_string(),
                    Inclusion {
                        block_number: receipt.block_number,
                        block_hash: receipt.block_hash.clone(),
                    },
                );
                return Err(RelayerError::ReorgDetected {
                    chain_id: self.chain_id,
                    block_number: inclusion.block_number,
                });
            }
            (Some(receipt), seen) => {
                if seen.is_none() {
                    self.track(tx_hash, &receipt).await;
                }
                receipt
            }
        };

        if !receipt.success {
            self.pending.write().await.remove(tx_hash);
            return Err(RelayerError::transaction(
                format!("transaction {} reverted on chain {}", tx_hash, self.chain_id),
                false,
            ));
        }

        let head = self.adapter.block_number().await?;
        let confirmations = head.saturating_sub(receipt.block_number);

        if confirmations >= self.confirmation_blocks {
            self.pending.write().await.remove(tx_hash);
            info!(
                "Transaction {} finalized on chain {} ({} confirmations)",
                tx_hash, self.chain_id, confirmations
            );
            return Ok(FinalityStatus::Final(receipt));
        }

        debug!(
            "Transaction {} has {} / {} confirmations on chain {}",
            tx_hash, confirmations, self.confirmation_blocks, self.chain_id
        );
        Ok(FinalityStatus::Confirming { confirmations })
    }

    async fn track(&self, tx_hash: &str, receipt: &ReceiptInfo) {
        self.pending.write().await.insert(
            tx_hash.to_string(),
            Inclusion {
                block_number: receipt.block_number,
                block_hash: receipt.block_hash.clone(),
            },
        );
        debug!(
            "Tracking tx {} for finality on chain {} (block {})",
            tx_hash, self.chain_id, receipt.block_number
        );
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn forget(&self, tx_hash: &str) {
        self.pending.write().await.remove(tx_hash);
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80001 | 80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}
