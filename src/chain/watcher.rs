//! Per-chain watcher: polls confirmed blocks for bridge events and detects reorgs
//!
//! Each poll scans `[last_processed + 1, head - required_confirmations]`, so
//! every surfaced event already has the chain's configured confirmations.
//! Before scanning, the hash of `last_processed` is re-checked against what
//! was recorded; a mismatch walks back through recently recorded hashes to
//! the common ancestor and yields a [`ReorgSignal`] instead of events.

use super::adapter::ChainAdapter;
use crate::error::{RelayerError, RelayerResult};
use crate::retry::RetryPolicy;
use crate::types::{BridgeEvent, Checkpoint};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Upper bound on blocks fetched per poll
const MAX_BLOCK_RANGE: u64 = 1000;

/// Minimum number of recent block hashes kept for ancestor search
const MIN_HASH_HISTORY: usize = 256;

/// Confirmed events from one contiguous block range
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: u64,
    /// Hash of `to_block`, persisted as the checkpoint once the batch is handled
    pub to_hash: String,
    pub head: u64,
    pub events: Vec<BridgeEvent>,
}

impl EventBatch {
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            chain_id: self.chain_id,
            block_number: self.to_block,
            block_hash: self.to_hash.clone(),
        }
    }

    pub fn confirmations(&self, event: &BridgeEvent) -> u64 {
        self.head.saturating_sub(event.block_number)
    }
}

/// Previously processed blocks were replaced by another branch
#[derive(Debug, Clone, PartialEq)]
pub struct ReorgSignal {
    pub chain_id: u64,
    pub common_ancestor: u64,
    /// Hash of the common ancestor on the new canonical branch
    pub ancestor_hash: String,
    /// head - common_ancestor
    pub depth: u64,
    /// First block whose observations are invalidated
    pub from_block: u64,
    /// Last block the watcher had processed before the reorg
    pub to_block: u64,
}

impl ReorgSignal {
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            chain_id: self.chain_id,
            block_number: self.common_ancestor,
            block_hash: self.ancestor_hash.clone(),
        }
    }
}

/// Output of a watcher, delivered separately from events
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherSignal {
    Events(EventBatch),
    Reorg(ReorgSignal),
}

/// Watches one chain's bridge contract
pub struct ChainWatcher {
    chain_id: u64,
    adapter: Arc<dyn ChainAdapter>,
    required_confirmations: u64,
    poll_interval: Duration,
    last_processed: Option<u64>,
    /// (block number, hash) of recently processed blocks, ascending
    recent: VecDeque<(u64, String)>,
    history: usize,
    retry: RetryPolicy,
}

impl ChainWatcher {
    pub fn new(adapter: Arc<dyn ChainAdapter>, poll_interval: Duration, retry: RetryPolicy) -> Self {
        let required_confirmations = adapter.required_confirmations();
        Self {
            chain_id: adapter.chain_id(),
            adapter,
            required_confirmations,
            poll_interval,
            last_processed: None,
            recent: VecDeque::new(),
            history: MIN_HASH_HISTORY.max(2 * required_confirmations as usize),
            retry,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn last_processed(&self) -> Option<u64> {
        self.last_processed
    }

    /// Resume from a persisted checkpoint. The first poll re-checks its hash,
    /// which catches reorgs that happened while the relayer was down.
    pub fn resume(&mut self, checkpoint: Option<Checkpoint>) {
        if let Some(cp) = checkpoint {
            info!(
                "Chain {} watcher resuming from block {}",
                self.chain_id, cp.block_number
            );
            self.last_processed = Some(cp.block_number);
            self.recent.clear();
            self.remember(cp.block_number, cp.block_hash);
        }
    }

    /// Verify the chain id and, without a checkpoint, start at the current
    /// confirmed head
    pub async fn connect(&mut self) -> RelayerResult<u64> {
        let head = self.adapter.connect().await?;
        if self.last_processed.is_none() {
            let start = head.saturating_sub(self.required_confirmations);
            let hash = self.adapter.block_hash(start).await?.ok_or_else(|| {
                RelayerError::ChainConnection {
                    chain_id: self.chain_id,
                    message: format!("starting block {} not available", start),
                }
            })?;
            self.last_processed = Some(start);
            self.remember(start, hash);
            info!(
                "Chain {} watcher starting at block {} (head {})",
                self.chain_id, start, head
            );
        }
        Ok(head)
    }

    fn remember(&mut self, number: u64, hash: String) {
        while matches!(self.recent.back(), Some((n, _)) if *n >= number) {
            self.recent.pop_back();
        }
        self.recent.push_back((number, hash));
        while self.recent.len() > self.history {
            self.recent.pop_front();
        }
    }

    fn recorded_hash(&self, number: u64) -> Option<&str> {
        self.recent
            .iter()
            .rev()
            .find(|(n, _)| *n == number)
            .map(|(_, h)| h.as_str())
    }

    /// Run one poll cycle. Returns at most one reorg signal or one event batch.
    pub async fn poll(&mut self) -> RelayerResult<Vec<WatcherSignal>> {
        let last = match self.last_processed {
            Some(last) => last,
            None => {
                self.connect().await?;
                return Ok(Vec::new());
            }
        };

        let head = self.adapter.block_number().await?;

        if let Some(expected) = self.recorded_hash(last).map(str::to_string) {
            let current = self.adapter.block_hash(last).await?;
            if current.as_deref() != Some(expected.as_str()) {
                let signal = self.handle_reorg(last, head).await?;
                return Ok(vec![WatcherSignal::Reorg(signal)]);
            }
        }

        let safe_head = head.saturating_sub(self.required_confirmations);
        if safe_head <= last {
            return Ok(Vec::new());
        }

        let from_block = last + 1;
        let to_block = safe_head.min(from_block + MAX_BLOCK_RANGE - 1);

        debug!(
            "Chain {}: processing blocks {} to {}",
            self.chain_id, from_block, to_block
        );

        let events = self.adapter.bridge_events(from_block, to_block).await?;
        let mut previous = (from_block, 0u64);
        for event in &events {
            if event.block_number < from_block || event.block_number > to_block {
                return Err(RelayerError::CoverageGap {
                    chain_id: self.chain_id,
                    expected: from_block,
                    got: event.block_number,
                });
            }
            if (event.block_number, event.log_index) < previous {
                return Err(RelayerError::CoverageGap {
                    chain_id: self.chain_id,
                    expected: previous.0,
                    got: event.block_number,
                });
            }
            previous = (event.block_number, event.log_index);
        }

        let to_hash = self.adapter.block_hash(to_block).await?.ok_or_else(|| {
            RelayerError::ChainConnection {
                chain_id: self.chain_id,
                message: format!("block {} not available", to_block),
            }
        })?;

        for event in &events {
            self.remember(event.block_number, event.block_hash.clone());
        }
        self.remember(to_block, to_hash.clone());
        self.last_processed = Some(to_block);

        crate::metrics::record_blocks_processed(self.chain_id, to_block);

        Ok(vec![WatcherSignal::Events(EventBatch {
            chain_id: self.chain_id,
            from_block,
            to_block,
            to_hash,
            head,
            events,
        })])
    }

    /// Walk back through recorded hashes to the newest block still canonical
    async fn handle_reorg(&mut self, last: u64, head: u64) -> RelayerResult<ReorgSignal> {
        let candidates: Vec<(u64, String)> = self
            .recent
            .iter()
            .rev()
            .filter(|(n, _)| *n < last)
            .cloned()
            .collect();

        let mut ancestor = None;
        for (number, hash) in candidates {
            if self.adapter.block_hash(number).await?.as_deref() == Some(hash.as_str()) {
                ancestor = Some((number, hash));
                break;
            }
        }

        let (common_ancestor, ancestor_hash) = match ancestor {
            Some(found) => found,
            None => {
                let oldest = self.recent.front().map(|(n, _)| *n).unwrap_or(last);
                let fallback = oldest.saturating_sub(1);
                warn!(
                    "Chain {}: reorg deeper than recorded history, rewinding to block {}",
                    self.chain_id, fallback
                );
                let hash = self.adapter.block_hash(fallback).await?.ok_or_else(|| {
                    RelayerError::ChainConnection {
                        chain_id: self.chain_id,
                        message: format!("rewind target block {} not available", fallback),
                    }
                })?;
                (fallback, hash)
            }
        };

        while matches!(self.recent.back(), Some((n, _)) if *n > common_ancestor) {
            self.recent.pop_back();
        }
        self.remember(common_ancestor, ancestor_hash.clone());
        self.last_processed = Some(common_ancestor);

        let signal = ReorgSignal {
            chain_id: self.chain_id,
            common_ancestor,
            ancestor_hash,
            depth: head.saturating_sub(common_ancestor),
            from_block: common_ancestor + 1,
            to_block: last,
        };

        warn!(
            chain_id = self.chain_id,
            common_ancestor,
            depth = signal.depth,
            "Reorg detected, rewinding watcher"
        );
        crate::metrics::record_reorg(self.chain_id);
        Ok(signal)
    }

    /// Poll until shutdown, forwarding signals to the engine.
    ///
    /// Transient RPC failures back off and retry; a coverage gap stops the
    /// watcher.
    pub async fn run(
        mut self,
        signals: mpsc::Sender<WatcherSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.poll().await {
                Ok(batch) => {
                    failures = 0;
                    for signal in batch {
                        if signals.send(signal).await.is_err() {
                            info!("Chain {} watcher: receiver closed", self.chain_id);
                            return Ok(());
                        }
                    }
                    self.poll_interval
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures == self.retry.max_attempts {
                        error!(
                            "Chain {} watcher failing repeatedly ({} attempts): {}",
                            self.chain_id, failures, e
                        );
                        crate::metrics::record_chain_health(self.chain_id, false);
                    } else {
                        warn!("Chain {} watcher poll failed: {}", self.chain_id, e);
                    }
                    self.retry.backoff_for_attempt(failures.saturating_sub(1))
                }
                Err(e) => {
                    error!("Chain {} watcher stopped: {}", self.chain_id, e);
                    return Err(e);
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Chain {} watcher stopped", self.chain_id);
        Ok(())
    }
}
