//! Chain module - handles multi-chain connections and event watching
//!
//! This module provides:
//! - One adapter per configured chain, EVM or Cosmos family
//! - Polling watchers with confirmation gating and reorg detection
//! - Finality tracking for the relayer's own destination submissions
//! - Health monitoring across all chains

pub mod adapter;
pub mod cosmos;
pub mod evm;
pub mod finality;
pub mod watcher;

pub use adapter::{ChainAdapter, GasPrice, ReceiptInfo, ReleaseCall, SignedRelease};
pub use finality::FinalityTracker;
pub use watcher::{ChainWatcher, EventBatch, ReorgSignal, WatcherSignal};

use crate::config::{ChainConfig, Settings};
use crate::error::{RelayerError, RelayerResult};
use crate::retry::RetryPolicy;
use crate::tx::{Destination, GasEstimator};
use crate::types::ChainFamily;

use cosmos::CosmosAdapter;
use dashmap::DashMap;
use ethers::signers::LocalWallet;
use evm::EvmAdapter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Finality waits give up after this many block times past the required confirmations
const FINALITY_SLACK_BLOCKS: u64 = 20;

/// Manages adapters for all configured chains
#[derive(Default)]
pub struct ChainManager {
    /// Chain adapters indexed by chain ID
    adapters: DashMap<u64, Arc<dyn ChainAdapter>>,
    /// Finality trackers indexed by chain ID
    finality_trackers: DashMap<u64, Arc<FinalityTracker>>,
    configs: DashMap<u64, ChainConfig>,
}

impl ChainManager {
    /// Build adapters for every enabled chain. The wallet is only handed to
    /// EVM adapters; Cosmos chains are observed, never written to.
    pub fn new(settings: &Settings, wallet: Option<LocalWallet>) -> RelayerResult<Self> {
        let manager = Self::default();
        let timeout = settings.rpc.request_timeout();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {}, {:?})",
                name, chain_config.chain_id, chain_config.family
            );

            let adapter: Arc<dyn ChainAdapter> = match chain_config.family {
                ChainFamily::Evm => Arc::new(EvmAdapter::new(
                    chain_config.clone(),
                    wallet.clone(),
                    timeout,
                )?),
                ChainFamily::Cosmos => Arc::new(CosmosAdapter::new(chain_config.clone(), timeout)?),
            };
            manager.insert(adapter, chain_config.clone());
        }

        Ok(manager)
    }

    pub fn insert(&self, adapter: Arc<dyn ChainAdapter>, config: ChainConfig) {
        let chain_id = config.chain_id;
        let finality = FinalityTracker::new(chain_id, config.required_confirmations, adapter.clone());
        self.finality_trackers.insert(chain_id, Arc::new(finality));
        self.adapters.insert(chain_id, adapter);
        self.configs.insert(chain_id, config);
    }

    /// Verify every chain answers with the configured identity
    pub async fn connect_all(&self) -> RelayerResult<()> {
        for adapter in self.adapters() {
            let head = adapter.connect().await?;
            crate::metrics::record_chain_health(adapter.chain_id(), true);
            info!("Chain {} connected at block {}", adapter.chain_id(), head);
        }
        Ok(())
    }

    /// Get adapter for a specific chain
    pub fn adapter(&self, chain_id: u64) -> RelayerResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(&chain_id)
            .map(|a| a.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    pub fn adapters(&self) -> Vec<Arc<dyn ChainAdapter>> {
        self.adapters.iter().map(|e| e.value().clone()).collect()
    }

    /// Get finality tracker for a specific chain
    pub fn finality_tracker(&self, chain_id: u64) -> RelayerResult<Arc<FinalityTracker>> {
        self.finality_trackers
            .get(&chain_id)
            .map(|f| f.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    pub fn config(&self, chain_id: u64) -> RelayerResult<ChainConfig> {
        self.configs
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// Watcher for one chain, polling at its configured cadence
    pub fn watcher(&self, chain_id: u64, retry: RetryPolicy) -> RelayerResult<ChainWatcher> {
        let config = self.config(chain_id)?;
        Ok(ChainWatcher::new(
            self.adapter(chain_id)?,
            config.poll_interval(),
            retry,
        ))
    }

    /// Everything the executor needs to release on `chain_id`
    pub fn destination(&self, chain_id: u64) -> RelayerResult<Destination> {
        let config = self.config(chain_id)?;
        if config.family == ChainFamily::Cosmos {
            warn!(
                "Chain {} is Cosmos; releases there are rejected and left to IBC",
                chain_id
            );
        }
        let block_time = Duration::from_millis(config.block_time_ms);
        Ok(Destination {
            adapter: self.adapter(chain_id)?,
            finality: self.finality_tracker(chain_id)?,
            gas: GasEstimator::new(&config.gas),
            poll_interval: config.poll_interval(),
            finality_timeout: block_time
                * (config.required_confirmations + FINALITY_SLACK_BLOCKS) as u32,
        })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let mut results = Vec::new();

        for adapter in self.adapters() {
            let chain_id = adapter.chain_id();
            let healthy = adapter.health_check().await;
            results.push((chain_id, healthy));

            crate::metrics::record_chain_health(chain_id, healthy);
        }

        results.sort_unstable_by_key(|(chain_id, _)| *chain_id);
        results
    }

    /// Get all configured chain IDs
    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.adapters.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}
