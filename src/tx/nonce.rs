//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent releases never share a nonce
//! - Reuse of a released nonce when it was the last one handed out
//! - Resync from the chain after gaps or "nonce too low" rejections

use crate::chain::adapter::ChainAdapter;
use crate::error::RelayerResult;

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-chain nonce state
#[derive(Default)]
struct ChainNonceState {
    /// Next nonce to hand out; `None` until fetched or after a forced resync
    next: Option<u64>,
    /// Submitted, unconfirmed: nonce -> tx_hash
    pending: BTreeMap<u64, String>,
}

/// Manages the submitting account's nonces across chains
#[derive(Default)]
pub struct NonceManager {
    chains: DashMap<u64, Arc<Mutex<ChainNonceState>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, chain_id: u64) -> Arc<Mutex<ChainNonceState>> {
        self.chains.entry(chain_id).or_default().clone()
    }

    /// Allocate the next nonce for `adapter`'s chain
    pub async fn allocate(&self, adapter: &dyn ChainAdapter) -> RelayerResult<u64> {
        let chain_id = adapter.chain_id();
        let state = self.state(chain_id);
        let mut state = state.lock().await;

        let nonce = match state.next {
            Some(next) => next,
            None => {
                let on_chain = adapter.pending_nonce().await?;
                debug!("Fetched nonce for chain {}: {}", chain_id, on_chain);
                on_chain
            }
        };
        state.next = Some(nonce + 1);

        debug!("Allocated nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    /// Mark a nonce as pending with transaction hash
    pub async fn mark_pending(&self, chain_id: u64, nonce: u64, tx_hash: &str) {
        let state = self.state(chain_id);
        state.lock().await.pending.insert(nonce, tx_hash.to_string());
    }

    /// Confirm the nonce that carried `tx_hash`, if it is still tracked
    pub async fn confirm_tx(&self, chain_id: u64, tx_hash: &str) {
        let state = self.state(chain_id);
        let mut state = state.lock().await;
        let nonce = state
            .pending
            .iter()
            .find(|(_, hash)| hash.as_str() == tx_hash)
            .map(|(nonce, _)| *nonce);
        if let Some(nonce) = nonce {
            state.pending.retain(|n, _| *n > nonce);
        }
    }

    /// Release a nonce whose transaction was never broadcast
    pub async fn release(&self, chain_id: u64, nonce: u64) {
        let state = self.state(chain_id);
        let mut state = state.lock().await;
        state.pending.remove(&nonce);

        if state.next == Some(nonce + 1) {
            state.next = Some(nonce);
        } else {
            // a later nonce is already out; refetch so the gap gets filled
            warn!(
                "Nonce {} released out of order on chain {}, resyncing",
                nonce, chain_id
            );
            state.next = None;
        }
    }

    /// Forget the local view; the next allocation reads the chain
    pub async fn resync(&self, chain_id: u64) {
        let state = self.state(chain_id);
        let mut state = state.lock().await;
        state.next = None;
        debug!("Nonce state for chain {} reset", chain_id);
    }

    /// Broadcast transactions not yet confirmed on a chain
    pub async fn pending_count(&self, chain_id: u64) -> usize {
        let state = self.state(chain_id);
        let count = state.lock().await.pending.len();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::adapter::MockChainAdapter;

    fn adapter(on_chain: u64) -> MockChainAdapter {
        let mut mock = MockChainAdapter::new();
        mock.expect_chain_id().return_const(137u64);
        mock.expect_pending_nonce().returning(move || Ok(on_chain));
        mock
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let manager = Arc::new(NonceManager::new());
        let adapter = Arc::new(adapter(5));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            let adapter = adapter.clone();
            handles.push(tokio::spawn(async move {
                manager.allocate(adapter.as_ref()).await.unwrap()
            }));
        }
        let mut nonces: Vec<u64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        nonces.sort_unstable();
        assert_eq!(nonces, (5..15).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_release_of_last_nonce_is_reused() {
        let manager = NonceManager::new();
        let adapter = adapter(7);
        let first = manager.allocate(&adapter).await.unwrap();
        manager.release(137, first).await;
        assert_eq!(manager.allocate(&adapter).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_out_of_order_release_resyncs() {
        let manager = NonceManager::new();
        let adapter = adapter(3);
        let a = manager.allocate(&adapter).await.unwrap();
        let _b = manager.allocate(&adapter).await.unwrap();
        manager.release(137, a).await;
        // the chain still reports 3 as the next usable nonce
        assert_eq!(manager.allocate(&adapter).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_pending_tracking() {
        let manager = NonceManager::new();
        manager.mark_pending(1, 4, "0x04").await;
        manager.mark_pending(1, 5, "0x05").await;
        manager.mark_pending(1, 6, "0x06").await;
        assert_eq!(manager.pending_count(1).await, 3);
        // mined in order, so confirming 5 settles 4 as well
        manager.confirm_tx(1, "0x05").await;
        assert_eq!(manager.pending_count(1).await, 1);
        manager.confirm_tx(1, "0xunknown").await;
        assert_eq!(manager.pending_count(1).await, 1);
    }
}
