//! Chain family abstraction shared by the EVM and Cosmos adapters

use crate::error::RelayerResult;
use crate::types::{Amount, BridgeEvent, ChainFamily, EventKind};

use async_trait::async_trait;
use ethers::types::U256;

/// Transaction receipt as seen by the relayer
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptInfo {
    pub tx_hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub success: bool,
    /// Bridge events decoded from the receipt logs, whatever contract emitted them
    pub events: Vec<BridgeEvent>,
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

/// Destination-side call releasing funds for a signed transfer
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseCall {
    pub transfer_id: String,
    /// Source event kind: Lock releases by mint, Burn releases by unlock
    pub source_kind: EventKind,
    pub token: String,
    pub amount: Amount,
    pub recipient: String,
    /// Signatures ordered by ascending signer address
    pub signatures: Vec<Vec<u8>>,
}

impl ReleaseCall {
    pub fn function_signature(&self) -> &'static str {
        match self.source_kind {
            EventKind::Burn | EventKind::Unlock => "unlock(bytes32,address,uint256,address,bytes[])",
            EventKind::Lock | EventKind::Mint => "mint(bytes32,address,uint256,address,bytes[])",
        }
    }
}

/// Release transaction signed locally. The hash is fixed before any node sees
/// the bytes, so it can be persisted ahead of the broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedRelease {
    pub transfer_id: String,
    pub nonce: u64,
    pub tx_hash: String,
    pub raw: Vec<u8>,
}

/// One connected chain. Implemented per chain family rather than per network;
/// network differences live in configuration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> u64;

    fn family(&self) -> ChainFamily;

    fn bridge_contract(&self) -> String;

    fn required_confirmations(&self) -> u64;

    /// Verify the node serves the configured chain and return the current head
    async fn connect(&self) -> RelayerResult<u64>;

    async fn block_number(&self) -> RelayerResult<u64>;

    /// Hash of a block, `None` if the node no longer has it
    async fn block_hash(&self, number: u64) -> RelayerResult<Option<String>>;

    /// Bridge events emitted by the configured contract in `[from_block, to_block]`
    async fn bridge_events(&self, from_block: u64, to_block: u64) -> RelayerResult<Vec<BridgeEvent>>;

    async fn transaction_receipt(&self, tx_hash: &str) -> RelayerResult<Option<ReceiptInfo>>;

    /// Query the bridge contract's replay guard
    async fn is_transfer_processed(&self, transfer_id: &str) -> RelayerResult<bool>;

    /// Next nonce of this relayer's submitting account, including pending transactions
    async fn pending_nonce(&self) -> RelayerResult<u64>;

    async fn estimate_release_gas(&self, call: &ReleaseCall) -> RelayerResult<U256>;

    async fn gas_price(&self) -> RelayerResult<GasPrice>;

    /// Sign a release call without sending it
    async fn sign_release(
        &self,
        call: &ReleaseCall,
        nonce: u64,
        gas_limit: U256,
        gas_price: &GasPrice,
    ) -> RelayerResult<SignedRelease>;

    /// Send signed bytes to the node. Resending identical bytes is safe: a
    /// node that already holds the transaction answers with success.
    async fn broadcast_release(&self, release: &SignedRelease) -> RelayerResult<()>;

    async fn health_check(&self) -> bool;
}
