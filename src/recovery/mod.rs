//! Reorg recovery
//!
//! Reacts to watcher reorg signals. Every non-terminal transfer whose source
//! event sat in the replaced range is re-validated against the new canonical
//! chain; vanished or mutated events put the transfer in UnderReview. A
//! Completed transfer cannot be undone: it is re-validated too, and flagged
//! for an operator only when its source event did not survive.

use crate::chain::watcher::ReorgSignal;
use crate::error::{RelayerError, RelayerResult};
use crate::state::TransferStore;
use crate::types::{AuditEntry, Transfer, TransferStatus};
use crate::validation::{EventValidator, Revalidation};

use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Attempts to win the status compare-and-swap against concurrent writers
const CAS_ATTEMPTS: usize = 3;

/// What recovery did for one reorg signal
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub examined: usize,
    pub unchanged: usize,
    pub flagged_for_review: Vec<String>,
    pub critical: Vec<String>,
}

pub struct ReorgRecoveryManager {
    store: Arc<dyn TransferStore>,
    validator: Arc<EventValidator>,
}

impl ReorgRecoveryManager {
    pub fn new(store: Arc<dyn TransferStore>, validator: Arc<EventValidator>) -> Self {
        Self { store, validator }
    }

    pub async fn handle(&self, signal: &ReorgSignal) -> RelayerResult<RecoveryReport> {
        let affected = self
            .store
            .get_transfers_in_block_range(signal.chain_id, signal.from_block, signal.to_block)
            .await?;
        info!(
            chain_id = signal.chain_id,
            from_block = signal.from_block,
            to_block = signal.to_block,
            depth = signal.depth,
            affected = affected.len(),
            "Recovering from reorg"
        );

        let mut report = RecoveryReport::default();
        for transfer in affected {
            report.examined += 1;
            match transfer.status {
                TransferStatus::Failed | TransferStatus::UnderReview => {
                    debug!("Transfer {} already {}, skipping", transfer.id, transfer.status);
                }
                TransferStatus::Completed => {
                    let outcome = self.validator.revalidate(&transfer).await?;
                    if outcome.is_unchanged() {
                        debug!("Completed transfer {} unaffected by reorg", transfer.id);
                        report.unchanged += 1;
                    } else {
                        self.flag_critical(&transfer, signal, &outcome).await?;
                        report.critical.push(transfer.id.clone());
                    }
                }
                _ => match self.validator.revalidate(&transfer).await? {
                    Revalidation::Unchanged => {
                        debug!("Transfer {} unaffected by reorg", transfer.id);
                        report.unchanged += 1;
                    }
                    outcome => {
                        let reason = format!(
                            "reorg on chain {} from block {} (depth {}): {}",
                            signal.chain_id,
                            signal.from_block,
                            signal.depth,
                            outcome.reason().unwrap_or("source event changed")
                        );
                        if self.move_to_review(&transfer.id, &reason).await? {
                            report.flagged_for_review.push(transfer.id.clone());
                        }
                    }
                },
            }
        }
        Ok(report)
    }

    async fn flag_critical(
        &self,
        transfer: &Transfer,
        signal: &ReorgSignal,
        outcome: &Revalidation,
    ) -> RelayerResult<()> {
        let reason = format!(
            "completed transfer's source block {} was replaced by a reorg on chain {}: {}",
            transfer.block_number,
            signal.chain_id,
            outcome.reason().unwrap_or("source event changed")
        );
        error!(
            severity = "CRITICAL",
            transfer_id = %transfer.id,
            chain_id = signal.chain_id,
            block_number = transfer.block_number,
            destination_tx = ?transfer.destination_tx_hash,
            "Completed transfer affected by reorg, operator intervention required"
        );
        crate::metrics::record_critical("completed_before_reorg");
        self.store
            .append_audit(&AuditEntry::note(&transfer.id, "critical", reason))
            .await
    }

    /// CAS the transfer's current status to UnderReview, re-reading on a lost race
    async fn move_to_review(&self, id: &str, reason: &str) -> RelayerResult<bool> {
        for _ in 0..CAS_ATTEMPTS {
            let current = match self.store.get_transfer(id).await? {
                Some(transfer) => transfer.status,
                None => {
                    return Err(RelayerError::TransferNotFound {
                        transfer_id: id.to_string(),
                    })
                }
            };
            if !current.can_transition_to(TransferStatus::UnderReview) {
                debug!("Transfer {} is {}, leaving it", id, current);
                return Ok(false);
            }
            if self
                .store
                .transition(id, current, TransferStatus::UnderReview, Some(reason))
                .await?
            {
                warn!("Transfer {} moved to review: {}", id, reason);
                crate::metrics::record_transition(TransferStatus::UnderReview);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Operator path: re-check an UnderReview transfer. An unchanged source
    /// event resumes collection; anything else fails the transfer.
    pub async fn revalidate_under_review(&self, id: &str) -> RelayerResult<TransferStatus> {
        let transfer = self
            .store
            .get_transfer(id)
            .await?
            .ok_or_else(|| RelayerError::TransferNotFound {
                transfer_id: id.to_string(),
            })?;
        if transfer.status != TransferStatus::UnderReview {
            return Err(RelayerError::InvalidStateTransition {
                transfer_id: id.to_string(),
                from: transfer.status.to_string(),
                to: TransferStatus::Confirming.to_string(),
            });
        }

        let outcome = self.validator.revalidate(&transfer).await?;
        if outcome.is_unchanged() {
            self.forget_release(&transfer).await?;
        }
        let (target, reason) = match outcome {
            Revalidation::Unchanged => (
                TransferStatus::Confirming,
                "operator revalidation: source event unchanged".to_string(),
            ),
            outcome => (
                TransferStatus::Failed,
                format!(
                    "operator revalidation: {}",
                    outcome.reason().unwrap_or("source event changed")
                ),
            ),
        };

        if !self
            .store
            .transition(id, TransferStatus::UnderReview, target, Some(&reason))
            .await?
        {
            let now = self
                .store
                .get_transfer(id)
                .await?
                .map(|t| t.status)
                .unwrap_or(TransferStatus::UnderReview);
            return Ok(now);
        }
        crate::metrics::record_transition(target);
        info!("Transfer {} revalidated: {}", id, target);
        Ok(target)
    }

    /// A transfer sent back to collection must not wait on the release
    /// hash from its previous execution
    async fn forget_release(&self, transfer: &Transfer) -> RelayerResult<()> {
        let Some(tx_hash) = &transfer.destination_tx_hash else {
            return Ok(());
        };
        if self.store.clear_destination_tx(&transfer.id).await? {
            info!("Cleared release {} of {} before resubmission", tx_hash, transfer.id);
            self.store
                .append_audit(&AuditEntry::note(
                    &transfer.id,
                    "release_cleared",
                    format!("release {} dropped by operator revalidation", tx_hash),
                ))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::test_utils::{lock_event, FakeChain};

    struct Harness {
        store: Arc<MemoryStore>,
        chain: Arc<FakeChain>,
        recovery: ReorgRecoveryManager,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(FakeChain::new(1, 12));
        chain.mine_to(130);
        let validator = Arc::new(EventValidator::new(store.clone()).with_chain(chain.clone()));
        Harness {
            recovery: ReorgRecoveryManager::new(store.clone(), validator),
            store,
            chain,
        }
    }

    async fn record(h: &Harness, nonce: u64, block: u64, status: TransferStatus) -> Transfer {
        let event = h.chain.add_event(lock_event(1, 137, nonce, 1_000, block));
        let transfer = Transfer::from_event(&event, 12);
        h.store.record_transfer(&transfer).await.unwrap();
        let path = [
            TransferStatus::Confirming,
            TransferStatus::Signed,
            TransferStatus::Executing,
            TransferStatus::Completed,
        ];
        let mut current = TransferStatus::Pending;
        for next in path {
            if current == status {
                break;
            }
            h.store.transition(&transfer.id, current, next, None).await.unwrap();
            current = next;
        }
        transfer
    }

    fn signal(from_block: u64, to_block: u64) -> ReorgSignal {
        ReorgSignal {
            chain_id: 1,
            common_ancestor: from_block - 1,
            ancestor_hash: String::new(),
            depth: 130 - (from_block - 1),
            from_block,
            to_block,
        }
    }

    async fn status(h: &Harness, id: &str) -> TransferStatus {
        h.store.get_transfer(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_vanished_event_goes_to_review() {
        let h = harness();
        let t = record(&h, 1, 100, TransferStatus::Confirming).await;
        h.chain.reorg_from(100);

        let report = h.recovery.handle(&signal(95, 118)).await.unwrap();
        assert_eq!(report.flagged_for_review, vec![t.id.clone()]);

        let stored = h.store.get_transfer(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::UnderReview);
        assert!(stored.status_reason.unwrap().contains("reorg"));
    }

    #[tokio::test]
    async fn test_changed_block_hash_goes_to_review() {
        let h = harness();
        let t = record(&h, 2, 100, TransferStatus::Signed).await;
        h.chain.reorg_from(100);
        // same transaction re-included on the new branch
        h.chain.add_event(lock_event(1, 137, 2, 1_000, 100));

        h.recovery.handle(&signal(99, 118)).await.unwrap();
        assert_eq!(status(&h, &t.id).await, TransferStatus::UnderReview);
    }

    #[tokio::test]
    async fn test_unaffected_transfer_is_left_alone() {
        let h = harness();
        let t = record(&h, 3, 100, TransferStatus::Confirming).await;
        h.chain.reorg_from(110);

        let report = h.recovery.handle(&signal(110, 118)).await.unwrap();
        assert_eq!(report.examined, 0);

        let report = h.recovery.handle(&signal(95, 118)).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(status(&h, &t.id).await, TransferStatus::Confirming);
    }

    #[tokio::test]
    async fn test_completed_transfer_is_flagged_not_reverted() {
        let h = harness();
        let t = record(&h, 4, 100, TransferStatus::Completed).await;
        h.chain.reorg_from(100);

        let report = h.recovery.handle(&signal(95, 118)).await.unwrap();
        assert_eq!(report.critical, vec![t.id.clone()]);
        assert_eq!(status(&h, &t.id).await, TransferStatus::Completed);

        let trail = h.store.get_audit_trail(&t.id).await.unwrap();
        assert!(trail.iter().any(|e| e.error_kind.as_deref() == Some("critical")));
    }

    #[tokio::test]
    async fn test_completed_transfer_surviving_reorg_is_not_flagged() {
        let h = harness();
        let t = record(&h, 7, 100, TransferStatus::Completed).await;
        h.chain.reorg_from(110);

        let report = h.recovery.handle(&signal(95, 118)).await.unwrap();
        assert!(report.critical.is_empty());
        assert_eq!(report.unchanged, 1);
        let trail = h.store.get_audit_trail(&t.id).await.unwrap();
        assert!(!trail.iter().any(|e| e.error_kind.as_deref() == Some("critical")));
    }

    #[tokio::test]
    async fn test_revalidation_drops_stale_release_hash() {
        let h = harness();
        let t = record(&h, 8, 100, TransferStatus::Executing).await;
        h.store.set_destination_tx(&t.id, "0xstale").await.unwrap();
        h.store
            .transition(&t.id, TransferStatus::Executing, TransferStatus::UnderReview, Some("finality timeout"))
            .await
            .unwrap();

        assert_eq!(
            h.recovery.revalidate_under_review(&t.id).await.unwrap(),
            TransferStatus::Confirming
        );
        let stored = h.store.get_transfer(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.destination_tx_hash, None);
        let trail = h.store.get_audit_trail(&t.id).await.unwrap();
        assert!(trail
            .iter()
            .any(|e| e.error_kind.as_deref() == Some("release_cleared") && e.reason.contains("0xstale")));
    }

    #[tokio::test]
    async fn test_operator_revalidation() {
        let h = harness();
        let kept = record(&h, 5, 100, TransferStatus::Confirming).await;
        let lost = record(&h, 6, 105, TransferStatus::Confirming).await;
        for id in [&kept.id, &lost.id] {
            h.store
                .transition(id, TransferStatus::Confirming, TransferStatus::UnderReview, Some("signature timeout"))
                .await
                .unwrap();
        }
        h.chain.reorg_from(105);

        assert_eq!(
            h.recovery.revalidate_under_review(&kept.id).await.unwrap(),
            TransferStatus::Confirming
        );
        assert_eq!(
            h.recovery.revalidate_under_review(&lost.id).await.unwrap(),
            TransferStatus::Failed
        );
        assert!(matches!(
            h.recovery.revalidate_under_review(&kept.id).await,
            Err(RelayerError::InvalidStateTransition { .. })
        ));
    }
}
