//! Main coordination engine for the transfer pipeline
//!
//! Watcher signals arrive on one channel per chain. Event batches are
//! validated, recorded and pushed through signing; the batch checkpoint is
//! persisted only after every event in it was handled. Reorg signals go to
//! recovery. A periodic tick replays durable state so that work interrupted
//! by a restart or a lost race resumes from the store.

use crate::chain::watcher::{EventBatch, WatcherSignal};
use crate::consensus::{Acceptance, SignatureCoordinator, SignatureMessage};
use crate::error::{RelayerError, RelayerResult};
use crate::recovery::ReorgRecoveryManager;
use crate::retry::RetryPolicy;
use crate::state::TransferStore;
use crate::tx::TransactionExecutor;
use crate::types::{BridgeEvent, Transfer, TransferStatus};
use crate::validation::EventValidator;

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Transfers replayed per status on each tick
const TICK_BATCH: usize = 200;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_transfers: usize,
    pub tick_interval: Duration,
    pub rebroadcast_interval: Duration,
    /// An Executing transfer untouched this long with no local task is resumed
    pub stale_execution_after: Duration,
}

/// Orchestrates validation, consensus, execution and recovery
pub struct CoordinationEngine {
    store: Arc<dyn TransferStore>,
    validator: Arc<EventValidator>,
    coordinator: Arc<SignatureCoordinator>,
    executor: Arc<TransactionExecutor>,
    recovery: Arc<ReorgRecoveryManager>,
    /// source chain id -> required confirmations
    confirmations: HashMap<u64, u64>,
    retry: RetryPolicy,
    config: EngineConfig,
    /// Serializes work on one transfer id within this process
    locks: DashMap<String, Arc<Mutex<()>>>,
    in_flight: DashMap<String, ()>,
    permits: Arc<Semaphore>,
}

impl CoordinationEngine {
    pub fn new(
        store: Arc<dyn TransferStore>,
        validator: Arc<EventValidator>,
        coordinator: Arc<SignatureCoordinator>,
        executor: Arc<TransactionExecutor>,
        recovery: Arc<ReorgRecoveryManager>,
        retry: RetryPolicy,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            validator,
            coordinator,
            executor,
            recovery,
            confirmations: HashMap::new(),
            retry,
            permits: Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1))),
            config,
            locks: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    pub fn with_source_chain(mut self, chain_id: u64, required_confirmations: u64) -> Self {
        self.confirmations.insert(chain_id, required_confirmations);
        self
    }

    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    fn unlock(&self, id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Consume watcher signals from every chain until shutdown
    pub async fn run(
        self: Arc<Self>,
        receivers: Vec<mpsc::Receiver<WatcherSignal>>,
        shutdown: watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        let mut tasks = JoinSet::new();

        for mut signals in receivers {
            let engine = self.clone();
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        signal = signals.recv() => {
                            let Some(signal) = signal else { break };
                            if let Err(e) = engine.handle_signal(signal).await {
                                // the checkpoint was not advanced; a restart resumes from it
                                error!("Chain ingest stopped: {}", e);
                                return Err(e);
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                Ok(())
            });
        }

        let engine = self.clone();
        let mut shutdown_tick = shutdown.clone();
        tasks.spawn(async move {
            let mut tick = interval(engine.config.tick_interval);
            let mut rebroadcast = interval(engine.config.rebroadcast_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = engine.tick().await {
                            error!("Engine tick failed: {}", e);
                        }
                    }
                    _ = rebroadcast.tick() => {
                        match engine.coordinator.rebroadcast().await {
                            Ok(n) if n > 0 => debug!("Rebroadcast {} signatures", n),
                            Ok(_) => {}
                            Err(e) => warn!("Signature rebroadcast failed: {}", e),
                        }
                    }
                    _ = shutdown_tick.changed() => break,
                }
            }
            Ok(())
        });

        info!("Coordination engine started");
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => error!("Engine task panicked: {}", e),
            }
        }
        info!("Coordination engine stopped");
        first_error.map_or(Ok(()), Err)
    }

    pub async fn handle_signal(self: &Arc<Self>, signal: WatcherSignal) -> RelayerResult<()> {
        match signal {
            WatcherSignal::Events(batch) => self.handle_batch(batch).await,
            WatcherSignal::Reorg(reorg) => {
                let report = self.recovery.handle(&reorg).await?;
                if !report.critical.is_empty() {
                    error!(
                        severity = "CRITICAL",
                        chain_id = reorg.chain_id,
                        transfers = ?report.critical,
                        "Reorg replaced blocks of completed transfers"
                    );
                }
                self.store.save_checkpoint(&reorg.checkpoint()).await
            }
        }
    }

    async fn handle_batch(self: &Arc<Self>, batch: EventBatch) -> RelayerResult<()> {
        if let Some(checkpoint) = self.store.get_checkpoint(batch.chain_id).await? {
            if batch.from_block != checkpoint.block_number + 1 {
                return Err(RelayerError::CoverageGap {
                    chain_id: batch.chain_id,
                    expected: checkpoint.block_number + 1,
                    got: batch.from_block,
                });
            }
        }

        for event in &batch.events {
            self.ingest_event(event, batch.confirmations(event)).await?;
        }
        self.refresh_confirmations(batch.chain_id, batch.head).await?;

        self.store.save_checkpoint(&batch.checkpoint()).await
    }

    /// Bring the stored confirmation count of Pending transfers from
    /// `chain_id` up to the watcher's head and re-run their gate
    async fn refresh_confirmations(self: &Arc<Self>, chain_id: u64, head: u64) -> RelayerResult<()> {
        for transfer in self
            .store
            .get_transfers_by_status(TransferStatus::Pending, TICK_BATCH)
            .await?
        {
            if transfer.source_chain != chain_id {
                continue;
            }
            let confirmations = head.saturating_sub(transfer.block_number);
            if confirmations <= transfer.confirmations {
                continue;
            }
            self.store
                .update_confirmations(&transfer.id, confirmations)
                .await?;
            self.advance(&transfer.id).await?;
        }
        Ok(())
    }

    /// Handle one confirmed bridge event. Rejected and duplicate events are
    /// dropped; only transient failures are returned.
    pub async fn ingest_event(
        self: &Arc<Self>,
        event: &BridgeEvent,
        confirmations: u64,
    ) -> RelayerResult<()> {
        crate::metrics::record_event(event.chain_id, event.kind);

        if !event.kind.is_source_event() {
            return self.observe_release(event).await;
        }

        let validated = self
            .retry
            .run("event validation", || self.validator.validate_event(event))
            .await;
        match validated {
            Ok(()) => {}
            Err(e) if e.is_duplicate_delivery() => {
                debug!("Dropping event for {}: {}", event.transfer_id, e);
                return Ok(());
            }
            Err(e @ RelayerError::RetriesExhausted { .. }) => return Err(e),
            Err(e) => {
                warn!(
                    chain_id = event.chain_id,
                    tx_hash = %event.tx_hash,
                    error_kind = %e.kind(),
                    "Rejected bridge event: {}",
                    e
                );
                crate::metrics::record_event_rejected(event.chain_id, &e);
                return Ok(());
            }
        }

        let transfer = Transfer::from_event(event, confirmations);
        match self.store.record_transfer(&transfer).await {
            Ok(()) => {
                crate::metrics::record_transition(TransferStatus::Pending);
                info!(
                    "Recorded transfer {}: {} from chain {} to {}",
                    transfer.id, transfer.amount, transfer.source_chain, transfer.destination_chain
                );
            }
            Err(RelayerError::DuplicateTransfer { transfer_id }) => {
                debug!("Transfer {} already recorded, duplicate delivery", transfer_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.advance(&transfer.id).await
    }

    /// A Mint/Unlock on a destination chain completes a transfer released by
    /// any relayer
    async fn observe_release(&self, event: &BridgeEvent) -> RelayerResult<()> {
        let guard = self.lock(&event.transfer_id).await;
        let result = self.complete_from_release(event).await;
        self.unlock(&event.transfer_id, guard);
        result
    }

    async fn complete_from_release(&self, event: &BridgeEvent) -> RelayerResult<()> {
        let Some(transfer) = self.store.get_transfer(&event.transfer_id).await? else {
            debug!("Release {} for unknown transfer {}", event.tx_hash, event.transfer_id);
            return Ok(());
        };

        match transfer.status {
            TransferStatus::Signed => {
                self.store
                    .transition(
                        &transfer.id,
                        TransferStatus::Signed,
                        TransferStatus::Executing,
                        Some("release observed on destination"),
                    )
                    .await?;
            }
            TransferStatus::Executing => {}
            status => {
                if !status.is_terminal() {
                    warn!(
                        "Release {} observed for transfer {} in {}",
                        event.tx_hash, transfer.id, status
                    );
                }
                return Ok(());
            }
        }

        if self
            .store
            .mark_transfer_complete(&transfer.id, Some(&event.tx_hash))
            .await?
        {
            crate::metrics::record_transition(TransferStatus::Completed);
            info!(
                "Transfer {} completed by release {} on chain {}",
                transfer.id, event.tx_hash, event.chain_id
            );
        }
        Ok(())
    }

    /// Move a transfer as far as local state allows: confirmation gate,
    /// own signature, threshold check, then hand-off to execution
    pub async fn advance(self: &Arc<Self>, id: &str) -> RelayerResult<()> {
        let guard = self.lock(id).await;
        let result = self.advance_locked(id).await;
        self.unlock(id, guard);

        match result? {
            Some(transfer) => {
                self.spawn_execution(transfer);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Returns the transfer when it is ready for submission
    async fn advance_locked(&self, id: &str) -> RelayerResult<Option<Transfer>> {
        let Some(mut transfer) = self.store.get_transfer(id).await? else {
            return Err(RelayerError::TransferNotFound {
                transfer_id: id.to_string(),
            });
        };

        if transfer.status == TransferStatus::Pending {
            let required = self
                .confirmations
                .get(&transfer.source_chain)
                .copied()
                .unwrap_or(0);
            if transfer.confirmations < required {
                debug!(
                    "Transfer {} has {}/{} confirmations",
                    id, transfer.confirmations, required
                );
                return Ok(None);
            }
            let reason = format!("{} confirmations", transfer.confirmations);
            if self
                .store
                .transition(id, TransferStatus::Pending, TransferStatus::Confirming, Some(&reason))
                .await?
            {
                crate::metrics::record_transition(TransferStatus::Confirming);
            }
            transfer = self.refresh(id).await?;
        }

        if transfer.status == TransferStatus::Confirming {
            match self.coordinator.sign_local(&transfer).await {
                Ok(_) => {}
                Err(e @ RelayerError::Validation(_)) => {
                    // the canonical message cannot be built for this transfer
                    self.store
                        .append_audit(&crate::types::AuditEntry::error(id, &e))
                        .await?;
                    self.store
                        .transition(id, TransferStatus::Confirming, TransferStatus::Failed, Some(&e.to_string()))
                        .await?;
                    crate::metrics::record_transition(TransferStatus::Failed);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
            if self.coordinator.try_finalize(&transfer).await? {
                transfer = self.refresh(id).await?;
            }
        }

        Ok((transfer.status == TransferStatus::Signed).then_some(transfer))
    }

    async fn refresh(&self, id: &str) -> RelayerResult<Transfer> {
        self.store
            .get_transfer(id)
            .await?
            .ok_or_else(|| RelayerError::TransferNotFound {
                transfer_id: id.to_string(),
            })
    }

    /// Run the executor for `transfer` unless a local task already owns it
    fn spawn_execution(self: &Arc<Self>, transfer: Transfer) {
        if self.in_flight.insert(transfer.id.clone(), ()).is_some() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            let id = transfer.id.clone();
            let outcome = match engine.permits.clone().acquire_owned().await {
                Ok(_permit) => {
                    let guard = engine.lock(&id).await;
                    let outcome = match transfer.status {
                        TransferStatus::Executing => engine.executor.resume(&transfer).await,
                        _ => engine.executor.execute(&transfer).await,
                    };
                    engine.unlock(&id, guard);
                    outcome
                }
                Err(e) => Err(RelayerError::Internal(format!("execution permits closed: {}", e))),
            };
            engine.in_flight.remove(&id);

            match outcome {
                Ok(outcome) => debug!("Execution of {} finished: {:?}", id, outcome),
                Err(e) => error!("Execution of {} failed: {}", id, e),
            }
        });
    }

    /// Accept a peer's signature and try to advance the transfer
    pub async fn accept_signature(
        self: &Arc<Self>,
        message: &SignatureMessage,
    ) -> RelayerResult<Acceptance> {
        let bytes = message.signature_bytes()?;
        let acceptance = self
            .coordinator
            .accept_signature(&message.transfer_id, Some(&message.signer), &bytes)
            .await?;
        if acceptance == Acceptance::Accepted {
            self.advance(&message.transfer_id).await?;
        }
        Ok(acceptance)
    }

    /// Replay durable state: finish interrupted signing, pick up Signed
    /// transfers, resume stale executions, escalate signature timeouts
    pub async fn tick(self: &Arc<Self>) -> RelayerResult<()> {
        for status in [TransferStatus::Pending, TransferStatus::Confirming] {
            for transfer in self.store.get_transfers_by_status(status, TICK_BATCH).await? {
                if let Err(e) = self.advance(&transfer.id).await {
                    warn!("Could not advance {}: {}", transfer.id, e);
                }
            }
        }

        for transfer in self
            .store
            .get_transfers_by_status(TransferStatus::Signed, TICK_BATCH)
            .await?
        {
            self.spawn_execution(transfer);
        }

        let stale = chrono::Duration::from_std(self.config.stale_execution_after)
            .map_err(|e| RelayerError::Config(format!("stale execution window: {}", e)))?;
        let now = Utc::now();
        for transfer in self
            .store
            .get_transfers_by_status(TransferStatus::Executing, TICK_BATCH)
            .await?
        {
            if now - transfer.status_changed_at >= stale && !self.in_flight.contains_key(&transfer.id) {
                info!("Resuming stale execution of {}", transfer.id);
                self.spawn_execution(transfer);
            }
        }

        let escalated = self.coordinator.sweep_timeouts().await?;
        if escalated > 0 {
            warn!("{} transfers escalated after signature timeout", escalated);
        }

        let stats = self.store.get_stats().await?;
        for status in TransferStatus::ALL {
            crate::metrics::record_transfer_count(status, stats.count(status));
        }
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::watcher::ReorgSignal;
    use crate::test_utils::{lock_event, TestRelayer, BRIDGE};
    use crate::types::{Amount, EventKind};

    const ONE_TOKEN: u128 = 1_000_000_000_000_000_000;

    fn batch(h: &TestRelayer, from_block: u64, to_block: u64, events: Vec<BridgeEvent>) -> WatcherSignal {
        WatcherSignal::Events(EventBatch {
            chain_id: 1,
            from_block,
            to_block,
            to_hash: h.source.canonical_hash(to_block),
            head: 200,
            events,
        })
    }

    async fn wait_for(h: &TestRelayer, id: &str, status: TransferStatus) {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let current = h.store.get_transfer(id).await.unwrap().unwrap().status;
                if current == status {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "transfer {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_threshold_signed_transfer_completes_once() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let event = h.source.add_event(lock_event(1, 137, 1, ONE_TOKEN, 100));
        h.engine.handle_signal(batch(&h, 100, 188, vec![event.clone()])).await.unwrap();

        let stored = h.store.get_transfer(&event.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Confirming);
        assert_eq!(h.store.signature_count(&event.transfer_id).await.unwrap(), 1);

        // B's signature, delivered twice concurrently
        let message = h.peer_signature(&event.transfer_id, 2).await;
        let (first, second) = tokio::join!(
            h.engine.accept_signature(&message),
            h.engine.accept_signature(&message)
        );
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|a| *a == Acceptance::Duplicate);
        assert_eq!(outcomes, vec![Acceptance::Accepted, Acceptance::Duplicate]);

        wait_for(&h, &event.transfer_id, TransferStatus::Completed).await;
        h.engine.tick().await.unwrap();
        assert_eq!(h.dest.submissions().len(), 1);

        let path: Vec<TransferStatus> = h
            .store
            .get_audit_trail(&event.transfer_id)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| e.to_status)
            .collect();
        assert_eq!(
            path,
            vec![
                TransferStatus::Pending,
                TransferStatus::Confirming,
                TransferStatus::Signed,
                TransferStatus::Executing,
                TransferStatus::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_event_delivery_records_once() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let event = h.source.add_event(lock_event(1, 137, 2, ONE_TOKEN, 100));
        h.engine.ingest_event(&event, 100).await.unwrap();
        h.engine.ingest_event(&event, 101).await.unwrap();

        let transfers = h.store.list_transfers(0, 10).await.unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(h.store.signature_count(&event.transfer_id).await.unwrap(), 1);
        assert!(matches!(
            h.store.record_transfer(&transfers[0]).await,
            Err(RelayerError::DuplicateTransfer { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_signatures_time_out_to_review() {
        let h = TestRelayer::new(Duration::ZERO).await;
        let event = h.source.add_event(lock_event(1, 137, 3, ONE_TOKEN, 100));
        h.engine.ingest_event(&event, 100).await.unwrap();

        h.engine.tick().await.unwrap();

        let stored = h.store.get_transfer(&event.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::UnderReview);
        assert_eq!(stored.status_reason.as_deref(), Some("signature timeout"));
        assert!(h.dest.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_non_relayer_signature_never_counts() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let event = h.source.add_event(lock_event(1, 137, 4, ONE_TOKEN, 100));
        h.engine.ingest_event(&event, 100).await.unwrap();

        let forged = h.peer_signature(&event.transfer_id, 9).await;
        assert!(matches!(
            h.engine.accept_signature(&forged).await,
            Err(RelayerError::UnauthorizedSigner { .. })
        ));

        let stored = h.store.get_transfer(&event.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Confirming);
        assert_eq!(h.store.signature_count(&event.transfer_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reorg_of_source_block_moves_transfer_to_review() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let event = h.source.add_event(lock_event(1, 137, 5, ONE_TOKEN, 100));
        h.engine.handle_signal(batch(&h, 100, 188, vec![event.clone()])).await.unwrap();

        h.source.reorg_from(100);
        h.source.add_event(lock_event(1, 137, 5, ONE_TOKEN, 100));
        let reorg = ReorgSignal {
            chain_id: 1,
            common_ancestor: 99,
            ancestor_hash: h.source.canonical_hash(99),
            depth: 101,
            from_block: 100,
            to_block: 188,
        };
        h.engine.handle_signal(WatcherSignal::Reorg(reorg)).await.unwrap();

        let stored = h.store.get_transfer(&event.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::UnderReview);
        assert!(stored.status_reason.unwrap().contains("reorg"));
        assert_eq!(h.store.get_checkpoint(1).await.unwrap().unwrap().block_number, 99);
    }

    #[tokio::test]
    async fn test_zero_amount_is_rejected_before_recording() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let mut event = lock_event(1, 137, 6, 0, 100);
        event.amount = Amount::zero();
        let event = h.source.add_event(event);
        h.engine.ingest_event(&event, 100).await.unwrap();

        assert!(h.store.get_transfer(&event.transfer_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_transfer_confirms_as_head_advances() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let event = h.source.add_event(lock_event(1, 137, 8, ONE_TOKEN, 195));
        h.engine.ingest_event(&event, 5).await.unwrap();

        let stored = h.store.get_transfer(&event.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Pending);
        assert_eq!(stored.confirmations, 5);

        // head 200: 195 is now 5 deep, still short of 12
        h.engine.handle_signal(batch(&h, 100, 150, Vec::new())).await.unwrap();
        let stored = h.store.get_transfer(&event.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Pending);

        h.engine
            .handle_signal(WatcherSignal::Events(EventBatch {
                chain_id: 1,
                from_block: 151,
                to_block: 160,
                to_hash: h.source.canonical_hash(160),
                head: 210,
                events: Vec::new(),
            }))
            .await
            .unwrap();
        let stored = h.store.get_transfer(&event.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.confirmations, 15);
        assert_eq!(stored.status, TransferStatus::Confirming);
        assert_eq!(h.store.signature_count(&event.transfer_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_gap_in_batches_is_fatal() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        h.engine.handle_signal(batch(&h, 100, 150, Vec::new())).await.unwrap();
        assert!(matches!(
            h.engine.handle_signal(batch(&h, 160, 170, Vec::new())).await,
            Err(RelayerError::CoverageGap { expected: 151, got: 160, .. })
        ));
        assert_eq!(h.store.get_checkpoint(1).await.unwrap().unwrap().block_number, 150);
    }

    #[tokio::test]
    async fn test_observed_release_completes_signed_transfer() {
        let h = TestRelayer::new(Duration::from_secs(600)).await;
        let transfer = Transfer::from_event(&lock_event(1, 137, 7, ONE_TOKEN, 100), 12);
        h.store.record_transfer(&transfer).await.unwrap();
        for (from, to) in [
            (TransferStatus::Pending, TransferStatus::Confirming),
            (TransferStatus::Confirming, TransferStatus::Signed),
        ] {
            h.store.transition(&transfer.id, from, to, None).await.unwrap();
        }

        let mut release = lock_event(137, 1, 0, ONE_TOKEN, 4_000);
        release.kind = EventKind::Mint;
        release.transfer_id = transfer.id.clone();
        release.emitter = BRIDGE.to_string();
        h.engine.ingest_event(&release, 2).await.unwrap();

        let stored = h.store.get_transfer(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Completed);
        assert_eq!(stored.destination_tx_hash, Some(release.tx_hash));
        assert!(h.dest.submissions().is_empty());
    }
}
