//! Shared fixtures: a scripted in-process chain and sample bridge events

use crate::chain::adapter::{ChainAdapter, GasPrice, ReceiptInfo, ReleaseCall, SignedRelease};
use crate::chain::{ChainManager, FinalityTracker};
use crate::config::{ChainConfig, GasConfig};
use crate::consensus::{SignatureCoordinator, SignatureMessage};
use crate::coordination::{CoordinationEngine, EngineConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::events::format_address;
use crate::recovery::ReorgRecoveryManager;
use crate::retry::RetryPolicy;
use crate::state::{MemoryStore, TransferStore};
use crate::tx::{Destination, GasEstimator, TransactionExecutor};
use crate::types::{
    compute_transfer_id, keccak256, Amount, BridgeEvent, ChainFamily, EventKind, SupportedToken,
    Transfer, ValidatorSet,
};
use crate::validation::EventValidator;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::U256;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BRIDGE: &str = "0x00000000000000000000000000000000000000aa";
pub const SENDER: &str = "0x00000000000000000000000000000000000000a1";
pub const RECIPIENT: &str = "0x00000000000000000000000000000000000000b2";
pub const TOKEN: &str = "0x00000000000000000000000000000000000000cc";

/// Source-side Lock event with a correctly derived transfer id
pub fn lock_event(source: u64, dest: u64, nonce: u64, amount: u128, block: u64) -> BridgeEvent {
    BridgeEvent {
        kind: EventKind::Lock,
        chain_id: source,
        transfer_id: compute_transfer_id(source, SENDER, nonce),
        sender: SENDER.to_string(),
        token: TOKEN.to_string(),
        amount: Amount::from(amount),
        destination_chain: dest,
        recipient: RECIPIENT.to_string(),
        nonce,
        fee: Amount::zero(),
        emitter: BRIDGE.to_string(),
        tx_hash: format!("0x{:064x}", source * 1_000_000 + nonce),
        block_number: block,
        block_hash: format!("0xblock{}", block),
        log_index: 0,
    }
}

pub fn sample_transfer(nonce: u64) -> Transfer {
    Transfer::from_event(
        &lock_event(1, 137, nonce, 1_000_000_000_000_000_000, 100 + nonce),
        12,
    )
}

pub fn sample_token(chain_id: u64) -> SupportedToken {
    SupportedToken {
        chain_id,
        token_address: TOKEN.to_string(),
        name: "Test Token".to_string(),
        symbol: "TT".to_string(),
        decimals: 18,
        is_native: false,
        enabled: true,
        min_amount: None,
        max_amount: None,
    }
}

/// Deterministic relayer key `n` (1-based)
pub fn test_wallet(n: u64) -> LocalWallet {
    format!("{:064x}", n)
        .parse()
        .unwrap_or_else(|e| panic!("test key {}: {}", n, e))
}

/// A release transaction the fake node accepted into its pool
#[derive(Debug, Clone)]
pub struct Submission {
    pub call: ReleaseCall,
    pub nonce: u64,
    pub tx_hash: String,
}

/// A release included in a block
#[derive(Debug, Clone)]
struct MinedRelease {
    block: u64,
    success: bool,
    events: Vec<BridgeEvent>,
}

#[derive(Default)]
struct ChainState {
    head: u64,
    /// Blocks at which the canonical branch was replaced
    reorgs: Vec<u64>,
    events: Vec<BridgeEvent>,
    stray: Vec<BridgeEvent>,
    /// Every release signed against this chain: hash -> call
    signed: HashMap<String, ReleaseCall>,
    /// Accepted, not yet mined, in arrival order
    mempool: Vec<String>,
    releases: HashMap<String, MinedRelease>,
    /// Replay guard; set only when a release is mined
    processed: HashSet<String>,
    submissions: Vec<Submission>,
    broadcast_calls: usize,
    /// Next nonce of the submitting account, counting the pool
    nonce: u64,
    auto_mine: u64,
    /// Broadcasts to accept but answer with a timeout
    lost_acks: usize,
    failures: HashMap<&'static str, VecDeque<RelayerError>>,
}

impl ChainState {
    fn hash_of(&self, chain_id: u64, number: u64) -> String {
        let branch = self.reorgs.iter().filter(|b| **b <= number).count();
        let seed = format!("{}:{}:{}", chain_id, number, branch);
        format!("0x{}", hex::encode(keccak256(seed.as_bytes())))
    }

    /// Advance the head, including the whole pool in the first new block
    fn advance(&mut self, chain_id: u64, head: u64) {
        if head <= self.head {
            return;
        }
        let block = self.head + 1;
        self.head = head;

        for tx_hash in std::mem::take(&mut self.mempool) {
            let Some(call) = self.signed.get(&tx_hash).cloned() else {
                continue;
            };
            let success = self.processed.insert(call.transfer_id.clone());
            let events = if success {
                vec![release_event(chain_id, &call, &tx_hash, block, self.hash_of(chain_id, block))]
            } else {
                Vec::new()
            };
            self.releases.insert(
                tx_hash,
                MinedRelease {
                    block,
                    success,
                    events,
                },
            );
        }
    }

    fn auto_mine(&mut self, chain_id: u64) {
        let head = self.head + self.auto_mine;
        self.advance(chain_id, head);
    }
}

/// Destination-side Mint or Unlock emitted by a mined release
fn release_event(
    chain_id: u64,
    call: &ReleaseCall,
    tx_hash: &str,
    block: u64,
    block_hash: String,
) -> BridgeEvent {
    BridgeEvent {
        kind: match call.source_kind {
            EventKind::Burn => EventKind::Unlock,
            _ => EventKind::Mint,
        },
        chain_id,
        transfer_id: call.transfer_id.clone(),
        sender: String::new(),
        token: call.token.clone(),
        amount: call.amount,
        destination_chain: chain_id,
        recipient: call.recipient.clone(),
        nonce: 0,
        fee: Amount::zero(),
        emitter: BRIDGE.to_string(),
        tx_hash: tx_hash.to_string(),
        block_number: block,
        block_hash,
        log_index: 0,
    }
}

/// In-process chain with scriptable blocks, reorgs, events and faults.
///
/// Releases go through a pool: a broadcast is only visible to the replay
/// guard once a later block includes it.
pub struct FakeChain {
    chain_id: u64,
    confirmations: u64,
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(chain_id: u64, confirmations: u64) -> Self {
        Self {
            chain_id,
            confirmations,
            state: Mutex::new(ChainState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mine_to(&self, head: u64) {
        self.state().advance(self.chain_id, head);
    }

    pub fn head(&self) -> u64 {
        self.state().head
    }

    /// Every `block_number` and `transaction_receipt` call mines this many blocks first
    pub fn set_auto_mine(&self, blocks: u64) {
        self.state().auto_mine = blocks;
    }

    pub fn canonical_hash(&self, number: u64) -> String {
        self.state().hash_of(self.chain_id, number)
    }

    /// Replace every block from `block` upward. Events there vanish; releases
    /// there return to the pool.
    pub fn reorg_from(&self, block: u64) {
        let mut state = self.state();
        state.reorgs.push(block);
        state.events.retain(|e| e.block_number < block);

        let orphaned: Vec<String> = state
            .releases
            .iter()
            .filter(|(_, mined)| mined.block >= block)
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in orphaned {
            if let Some(mined) = state.releases.remove(&hash) {
                if mined.success {
                    if let Some(call) = state.signed.get(&hash).cloned() {
                        state.processed.remove(&call.transfer_id);
                    }
                }
            }
            state.mempool.push(hash);
        }
    }

    /// Include `event` in its block on the current branch
    pub fn add_event(&self, mut event: BridgeEvent) -> BridgeEvent {
        let mut state = self.state();
        event.block_hash = state.hash_of(self.chain_id, event.block_number);
        event.emitter = BRIDGE.to_string();
        state.events.retain(|e| e.tx_hash != event.tx_hash);
        state.events.push(event.clone());
        event
    }

    /// Returned by every `bridge_events` call regardless of range
    pub fn inject_stray_event(&self, event: BridgeEvent) {
        self.state().stray.push(event);
    }

    pub fn mark_processed(&self, transfer_id: &str) {
        self.state().processed.insert(transfer_id.to_string());
    }

    /// Distinct release transactions the node accepted
    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    /// Every `broadcast_release` call, repeats and failures included
    pub fn broadcast_calls(&self) -> usize {
        self.state().broadcast_calls
    }

    pub fn mempool_len(&self) -> usize {
        self.state().mempool.len()
    }

    /// Accept the next `count` broadcasts but answer them with a timeout
    pub fn lose_broadcast_acks(&self, count: usize) {
        self.state().lost_acks += count;
    }

    /// Make the next call of `operation` fail with `err`
    pub fn fail_next(&self, operation: &'static str, err: RelayerError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    fn check(&self, operation: &'static str) -> RelayerResult<()> {
        match self
            .state()
            .failures
            .get_mut(operation)
            .and_then(|q| q.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChainAdapter for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn bridge_contract(&self) -> String {
        BRIDGE.to_string()
    }

    fn required_confirmations(&self) -> u64 {
        self.confirmations
    }

    async fn connect(&self) -> RelayerResult<u64> {
        self.check("connect")?;
        Ok(self.state().head)
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        self.check("block_number")?;
        let mut state = self.state();
        state.auto_mine(self.chain_id);
        Ok(state.head)
    }

    async fn block_hash(&self, number: u64) -> RelayerResult<Option<String>> {
        self.check("block_hash")?;
        let state = self.state();
        if number > state.head {
            return Ok(None);
        }
        Ok(Some(state.hash_of(self.chain_id, number)))
    }

    async fn bridge_events(&self, from_block: u64, to_block: u64) -> RelayerResult<Vec<BridgeEvent>> {
        self.check("bridge_events")?;
        let state = self.state();
        let mut events: Vec<BridgeEvent> = state.stray.clone();
        let mut in_range: Vec<BridgeEvent> = state
            .events
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect();
        in_range.sort_by_key(|e| (e.block_number, e.log_index));
        events.extend(in_range);
        Ok(events)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> RelayerResult<Option<ReceiptInfo>> {
        self.check("transaction_receipt")?;
        let mut state = self.state();
        state.auto_mine(self.chain_id);

        if let Some(mined) = state.releases.get(tx_hash) {
            return Ok(Some(ReceiptInfo {
                tx_hash: tx_hash.to_string(),
                block_number: mined.block,
                block_hash: state.hash_of(self.chain_id, mined.block),
                success: mined.success,
                events: mined.events.clone(),
            }));
        }

        let events: Vec<BridgeEvent> = state
            .events
            .iter()
            .filter(|e| e.tx_hash == tx_hash && e.block_number <= state.head)
            .cloned()
            .collect();
        Ok(events.first().map(|first| ReceiptInfo {
            tx_hash: tx_hash.to_string(),
            block_number: first.block_number,
            block_hash: first.block_hash.clone(),
            success: true,
            events: events.clone(),
        }))
    }

    async fn is_transfer_processed(&self, transfer_id: &str) -> RelayerResult<bool> {
        self.check("is_transfer_processed")?;
        Ok(self.state().processed.contains(transfer_id))
    }

    async fn pending_nonce(&self) -> RelayerResult<u64> {
        self.check("pending_nonce")?;
        Ok(self.state().nonce)
    }

    async fn estimate_release_gas(&self, call: &ReleaseCall) -> RelayerResult<U256> {
        self.check("estimate_release_gas")?;
        if self.state().processed.contains(&call.transfer_id) {
            return Err(RelayerError::AlreadyProcessed {
                transfer_id: call.transfer_id.clone(),
            });
        }
        Ok(U256::from(180_000u64))
    }

    async fn gas_price(&self) -> RelayerResult<GasPrice> {
        self.check("gas_price")?;
        Ok(GasPrice::Legacy(U256::from(20_000_000_000u64)))
    }

    async fn sign_release(
        &self,
        call: &ReleaseCall,
        nonce: u64,
        _gas_limit: U256,
        _gas_price: &GasPrice,
    ) -> RelayerResult<SignedRelease> {
        self.check("sign_release")?;
        let raw = format!("release:{}:{}:{}", self.chain_id, nonce, call.transfer_id).into_bytes();
        let tx_hash = format!("0x{}", hex::encode(keccak256(&raw)));
        self.state().signed.insert(tx_hash.clone(), call.clone());
        Ok(SignedRelease {
            transfer_id: call.transfer_id.clone(),
            nonce,
            tx_hash,
            raw,
        })
    }

    async fn broadcast_release(&self, release: &SignedRelease) -> RelayerResult<()> {
        self.state().broadcast_calls += 1;
        self.check("broadcast_release")?;
        let mut state = self.state();

        // already known
        if state.mempool.contains(&release.tx_hash) || state.releases.contains_key(&release.tx_hash) {
            return Ok(());
        }
        let Some(call) = state.signed.get(&release.tx_hash).cloned() else {
            return Err(RelayerError::transaction("rlp: undecodable transaction", false));
        };
        if release.nonce < state.nonce {
            return Err(RelayerError::Nonce {
                chain_id: self.chain_id,
                message: format!("nonce too low: {} < {}", release.nonce, state.nonce),
            });
        }

        state.nonce = release.nonce + 1;
        state.mempool.push(release.tx_hash.clone());
        state.submissions.push(Submission {
            call,
            nonce: release.nonce,
            tx_hash: release.tx_hash.clone(),
        });

        if state.lost_acks > 0 {
            state.lost_acks -= 1;
            return Err(RelayerError::Timeout {
                operation: format!("broadcast release on chain {}", self.chain_id),
            });
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub fn test_chain_config(chain_id: u64, confirmations: u64) -> ChainConfig {
    ChainConfig {
        chain_id,
        name: format!("chain-{}", chain_id),
        family: ChainFamily::Evm,
        rpc_urls: vec!["http://localhost:8545".to_string()],
        network: None,
        bridge_contract: BRIDGE.to_string(),
        required_confirmations: confirmations,
        block_time_ms: 2_000,
        gas: GasConfig::default(),
        enabled: true,
    }
}

/// Relayer 1 of a 2-of-3 set bridging chain 1 -> 137, wired end to end
/// over fake chains and the in-memory store
pub struct TestRelayer {
    pub store: Arc<MemoryStore>,
    pub source: Arc<FakeChain>,
    pub dest: Arc<FakeChain>,
    pub chains: Arc<ChainManager>,
    pub recovery: Arc<ReorgRecoveryManager>,
    pub engine: Arc<CoordinationEngine>,
}

impl TestRelayer {
    pub async fn new(signature_timeout: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_token(&sample_token(1))
            .await
            .unwrap_or_else(|e| panic!("seed token: {}", e));

        let source = Arc::new(FakeChain::new(1, 12));
        source.mine_to(200);
        let dest = Arc::new(FakeChain::new(137, 2));
        dest.mine_to(5_000);
        dest.set_auto_mine(1);

        let chains = Arc::new(ChainManager::default());
        chains.insert(source.clone(), test_chain_config(1, 12));
        chains.insert(dest.clone(), test_chain_config(137, 2));

        let relayers = (1..=3)
            .map(|n| format_address(&test_wallet(n).address()))
            .collect();
        let coordinator = Arc::new(SignatureCoordinator::new(
            store.clone(),
            ValidatorSet::new(relayers, 2, 1),
            test_wallet(1),
            signature_timeout,
        ));
        let validator = Arc::new(
            EventValidator::new(store.clone())
                .with_chain(source.clone())
                .with_chain(dest.clone()),
        );
        let executor = Arc::new(
            TransactionExecutor::new(store.clone(), coordinator.clone(), RetryPolicy::immediate(3))
                .with_destination(Destination {
                    adapter: dest.clone(),
                    finality: Arc::new(FinalityTracker::new(137, 2, dest.clone())),
                    gas: GasEstimator::new(&GasConfig::default()),
                    poll_interval: Duration::from_millis(1),
                    finality_timeout: Duration::from_secs(5),
                }),
        );
        let recovery = Arc::new(ReorgRecoveryManager::new(store.clone(), validator.clone()));

        let engine = CoordinationEngine::new(
            store.clone(),
            validator,
            coordinator,
            executor,
            recovery.clone(),
            RetryPolicy::immediate(3),
            EngineConfig {
                max_concurrent_transfers: 4,
                tick_interval: Duration::from_millis(10),
                rebroadcast_interval: Duration::from_secs(30),
                stale_execution_after: Duration::from_secs(600),
            },
        )
        .with_source_chain(1, 12);

        Self {
            store,
            source,
            dest,
            chains,
            recovery,
            engine: Arc::new(engine),
        }
    }

    /// Signature by test relayer `signer` over the recorded transfer
    pub async fn peer_signature(&self, id: &str, signer: u64) -> SignatureMessage {
        let transfer = self
            .store
            .get_transfer(id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("transfer {} not recorded", id));
        let wallet = test_wallet(signer);
        let bytes = crate::consensus::message::sign(&wallet, &transfer)
            .await
            .unwrap_or_else(|e| panic!("sign: {}", e));
        SignatureMessage {
            transfer_id: id.to_string(),
            signer: format_address(&wallet.address()),
            signature: format!("0x{}", hex::encode(bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release_call(transfer_id: &str) -> ReleaseCall {
        ReleaseCall {
            transfer_id: transfer_id.to_string(),
            source_kind: EventKind::Lock,
            token: TOKEN.to_string(),
            amount: Amount::from(5u128),
            recipient: RECIPIENT.to_string(),
            signatures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_release_processed_only_once_mined() {
        let chain = FakeChain::new(137, 2);
        chain.mine_to(10);
        let call = release_call("0x01");
        let price = GasPrice::Legacy(U256::one());
        let release = chain.sign_release(&call, 0, U256::one(), &price).await.unwrap();

        chain.broadcast_release(&release).await.unwrap();
        assert!(!chain.is_transfer_processed("0x01").await.unwrap());
        assert_eq!(chain.pending_nonce().await.unwrap(), 1);
        assert!(chain.transaction_receipt(&release.tx_hash).await.unwrap().is_none());

        chain.mine_to(11);
        assert!(chain.is_transfer_processed("0x01").await.unwrap());
        let receipt = chain.transaction_receipt(&release.tx_hash).await.unwrap().unwrap();
        assert_eq!(receipt.block_number, 11);
        assert!(receipt.success);
    }

    #[tokio::test]
    async fn test_repeated_bytes_are_already_known() {
        let chain = FakeChain::new(137, 2);
        let price = GasPrice::Legacy(U256::one());
        let release = chain
            .sign_release(&release_call("0x02"), 0, U256::one(), &price)
            .await
            .unwrap();
        chain.broadcast_release(&release).await.unwrap();
        chain.broadcast_release(&release).await.unwrap();
        assert_eq!(chain.submissions().len(), 1);
        assert_eq!(chain.mempool_len(), 1);

        let conflicting = chain
            .sign_release(&release_call("0x03"), 0, U256::one(), &price)
            .await
            .unwrap();
        assert!(matches!(
            chain.broadcast_release(&conflicting).await,
            Err(RelayerError::Nonce { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_release_for_a_transfer_reverts() {
        let chain = FakeChain::new(137, 2);
        let price = GasPrice::Legacy(U256::one());
        let first = chain
            .sign_release(&release_call("0x04"), 0, U256::one(), &price)
            .await
            .unwrap();
        let second = chain
            .sign_release(&release_call("0x04"), 1, U256::one(), &price)
            .await
            .unwrap();
        chain.broadcast_release(&first).await.unwrap();
        chain.broadcast_release(&second).await.unwrap();
        chain.mine_to(1);

        let first = chain.transaction_receipt(&first.tx_hash).await.unwrap().unwrap();
        let second = chain.transaction_receipt(&second.tx_hash).await.unwrap().unwrap();
        assert!(first.success);
        assert!(!second.success);
        assert!(second.events.is_empty());
    }
}
