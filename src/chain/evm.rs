//! EVM chain adapter with multi-RPC support and automatic failover
//!
//! One adapter serves every EVM network. Network differences (confirmations,
//! block time, fee model) come from the chain's configuration.

use super::adapter::{ChainAdapter, GasPrice, ReceiptInfo, ReleaseCall, SignedRelease};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{self, format_address, format_hash, parse_address, parse_hash, EventParser};
use crate::types::{transfer_id_bytes, BridgeEvent, ChainFamily};

use async_trait::async_trait;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::prelude::*;
use ethers::providers::ProviderError;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Multi-provider EVM adapter with automatic failover
pub struct EvmAdapter {
    config: ChainConfig,
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
    bridge: Address,
    /// Submitting account; absent for watch-only deployments
    wallet: Option<LocalWallet>,
    parser: EventParser,
    request_timeout: Duration,
}

impl EvmAdapter {
    pub fn new(
        config: ChainConfig,
        wallet: Option<LocalWallet>,
        request_timeout: Duration,
    ) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let bridge = parse_address(&config.bridge_contract)
            .map_err(|e| RelayerError::Config(format!("Invalid bridge contract: {}", e)))?;
        let wallet = wallet.map(|w| w.with_chain_id(config.chain_id));
        let parser = EventParser::new(config.chain_id);

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            bridge,
            wallet,
            parser,
            request_timeout,
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Run a read against the active provider, failing over on transient errors.
    /// Each attempt is bounded by the RPC request timeout.
    async fn read<T, F, Fut>(&self, operation: &str, f: F) -> RelayerResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            let err = match timeout(self.request_timeout, f(self.http().clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => classify_rpc_error(self.config.chain_id, &e.to_string()),
                Err(_) => RelayerError::Timeout {
                    operation: format!("{} on chain {}", operation, self.config.chain_id),
                },
            };

            if !err.is_retryable() {
                return Err(err);
            }
            warn!(
                "{} failed on chain {}: {}",
                operation, self.config.chain_id, err
            );
            last_error = Some(err);
            self.failover();
        }

        Err(last_error.unwrap_or(RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: "All providers failed".to_string(),
        }))
    }

    fn wallet(&self) -> RelayerResult<&LocalWallet> {
        self.wallet.as_ref().ok_or_else(|| {
            RelayerError::Wallet(format!(
                "no submitting wallet configured for chain {}",
                self.config.chain_id
            ))
        })
    }

    fn release_request(&self, call: &ReleaseCall) -> RelayerResult<TypedTransaction> {
        let data = encode_release_call(call)?;
        let mut tx = Eip1559TransactionRequest::new().to(self.bridge).data(data);
        if let Some(wallet) = &self.wallet {
            tx = tx.from(wallet.address());
        }
        Ok(TypedTransaction::Eip1559(tx))
    }

    /// Estimate EIP-1559 fees from the latest base fee
    async fn estimate_eip1559_fees(&self) -> RelayerResult<(U256, U256)> {
        let block = self
            .read("eth_getBlockByNumber", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?
            .ok_or_else(|| RelayerError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| RelayerError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(2_000_000_000u64);
        let max_fee = base_fee * 2 + priority_fee;

        Ok((max_fee, priority_fee))
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn bridge_contract(&self) -> String {
        format_address(&self.bridge)
    }

    fn required_confirmations(&self) -> u64 {
        self.config.required_confirmations
    }

    async fn connect(&self) -> RelayerResult<u64> {
        let reported = self
            .read("eth_chainId", |p| async move { p.get_chainid().await })
            .await?;

        if reported != U256::from(self.config.chain_id) {
            return Err(RelayerError::ChainIdMismatch {
                expected: self.config.chain_id.to_string(),
                actual: reported.to_string(),
            });
        }

        let head = self.block_number().await?;
        info!(
            "Connected to {} (chain {}) at block {}",
            self.config.name, self.config.chain_id, head
        );
        Ok(head)
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        self.read("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await
            .map(|b| b.as_u64())
    }

    async fn block_hash(&self, number: u64) -> RelayerResult<Option<String>> {
        let block = self
            .read("eth_getBlockByNumber", |p| async move { p.get_block(number).await })
            .await?;
        Ok(block.and_then(|b| b.hash).map(|h| format_hash(&h)))
    }

    async fn bridge_events(&self, from_block: u64, to_block: u64) -> RelayerResult<Vec<BridgeEvent>> {
        let filter = Filter::new()
            .address(self.bridge)
            .events(vec![
                events::topics::TOKENS_LOCKED_SIG,
                events::topics::TOKENS_BURNED_SIG,
                events::topics::TOKENS_MINTED_SIG,
                events::topics::TOKENS_UNLOCKED_SIG,
            ])
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .read("eth_getLogs", |p| {
                let filter = filter.clone();
                async move { p.get_logs(&filter).await }
            })
            .await?;

        let mut parsed = Vec::with_capacity(logs.len());
        for log in &logs {
            if let Some(event) = self.parser.parse_log(log)? {
                parsed.push(event);
            }
        }
        parsed.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(parsed)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> RelayerResult<Option<ReceiptInfo>> {
        let hash = parse_hash(tx_hash)?;
        let receipt = self
            .read("eth_getTransactionReceipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;

        let receipt = match receipt {
            Some(r) => r,
            None => return Ok(None),
        };
        let (block_number, block_hash) = match (receipt.block_number, receipt.block_hash) {
            (Some(n), Some(h)) => (n.as_u64(), format_hash(&h)),
            _ => return Ok(None),
        };

        let mut decoded = Vec::new();
        for log in &receipt.logs {
            match self.parser.parse_log(log) {
                Ok(Some(event)) => decoded.push(event),
                Ok(None) => {}
                Err(e) => debug!("Skipping undecodable log in {}: {}", tx_hash, e),
            }
        }

        Ok(Some(ReceiptInfo {
            tx_hash: format_hash(&receipt.transaction_hash),
            block_number,
            block_hash,
            success: receipt.status == Some(1u64.into()),
            events: decoded,
        }))
    }

    async fn is_transfer_processed(&self, transfer_id: &str) -> RelayerResult<bool> {
        let mut data = ethers::utils::id("processedTransfers(bytes32)").to_vec();
        data.extend(encode(&[Token::FixedBytes(
            transfer_id_bytes(transfer_id)?.to_vec(),
        )]));
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .to(self.bridge)
            .data(data)
            .into();

        let output = self
            .read("eth_call", |p| {
                let tx = tx.clone();
                async move { p.call(&tx, None).await }
            })
            .await?;

        match decode(&[ParamType::Bool], &output) {
            Ok(values) => Ok(matches!(values.first(), Some(Token::Bool(true)))),
            Err(e) => Err(RelayerError::ChainConnection {
                chain_id: self.config.chain_id,
                message: format!("processedTransfers returned malformed data: {}", e),
            }),
        }
    }

    async fn pending_nonce(&self) -> RelayerResult<u64> {
        let address = self.wallet()?.address();
        let chain_id = self.config.chain_id;
        self.read("eth_getTransactionCount", |p| async move {
            p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
        })
        .await
        .map(|n| n.as_u64())
        .map_err(|e| match e {
            RelayerError::ChainConnection { message, .. } => RelayerError::Nonce { chain_id, message },
            other => other,
        })
    }

    async fn estimate_release_gas(&self, call: &ReleaseCall) -> RelayerResult<U256> {
        let tx = self.release_request(call)?;
        let result = self
            .read("eth_estimateGas", |p| {
                let tx = tx.clone();
                async move { p.estimate_gas(&tx, None).await }
            })
            .await;

        match result {
            Ok(gas) => Ok(gas),
            Err(RelayerError::Transaction { message, .. }) if is_already_processed(&message) => {
                Err(RelayerError::AlreadyProcessed {
                    transfer_id: call.transfer_id.clone(),
                })
            }
            Err(RelayerError::ChainConnection { message, .. }) => {
                Err(RelayerError::GasEstimation(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn gas_price(&self) -> RelayerResult<GasPrice> {
        match self.config.gas.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .read("eth_gasPrice", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn sign_release(
        &self,
        call: &ReleaseCall,
        nonce: u64,
        gas_limit: U256,
        gas_price: &GasPrice,
    ) -> RelayerResult<SignedRelease> {
        let wallet = self.wallet()?;
        let data = encode_release_call(call)?;

        let tx: TypedTransaction = match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(wallet.address())
                .to(self.bridge)
                .data(data)
                .nonce(nonce)
                .gas(gas_limit)
                .gas_price(*price)
                .chain_id(self.config.chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(wallet.address())
                .to(self.bridge)
                .data(data)
                .nonce(nonce)
                .gas(gas_limit)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(self.config.chain_id)
                .into(),
        };

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let tx_hash = H256::from(ethers::utils::keccak256(&raw));

        debug!(
            "Signed release for {} on chain {}: {:#x} (nonce {})",
            call.transfer_id, self.config.chain_id, tx_hash, nonce
        );
        Ok(SignedRelease {
            transfer_id: call.transfer_id.clone(),
            nonce,
            tx_hash: format_hash(&tx_hash),
            raw: raw.to_vec(),
        })
    }

    async fn broadcast_release(&self, release: &SignedRelease) -> RelayerResult<()> {
        let provider = self.http().clone();
        let raw = Bytes::from(release.raw.clone());
        let sent = timeout(self.request_timeout, async {
            provider.send_raw_transaction(raw).await.map(|_| ())
        })
        .await;

        match sent {
            Ok(Ok(())) => {
                info!(
                    "Release for {} broadcast on chain {}: {} (nonce {})",
                    release.transfer_id, self.config.chain_id, release.tx_hash, release.nonce
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if is_already_known(&message) {
                    debug!(
                        "Node already holds release {} on chain {}",
                        release.tx_hash, self.config.chain_id
                    );
                    return Ok(());
                }
                if is_already_processed(&message) {
                    return Err(RelayerError::AlreadyProcessed {
                        transfer_id: release.transfer_id.clone(),
                    });
                }
                Err(classify_rpc_error(self.config.chain_id, &message))
            }
            Err(_) => Err(RelayerError::Timeout {
                operation: format!("broadcast release on chain {}", self.config.chain_id),
            }),
        }
    }

    async fn health_check(&self) -> bool {
        match self.block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

/// ABI-encode `mint`/`unlock(bytes32,address,uint256,address,bytes[])`
pub fn encode_release_call(call: &ReleaseCall) -> RelayerResult<Bytes> {
    let mut data = ethers::utils::id(call.function_signature()).to_vec();
    data.extend(encode(&[
        Token::FixedBytes(transfer_id_bytes(&call.transfer_id)?.to_vec()),
        Token::Address(parse_address(&call.token)?),
        Token::Uint(call.amount.as_u256()),
        Token::Address(parse_address(&call.recipient)?),
        Token::Array(
            call.signatures
                .iter()
                .map(|s| Token::Bytes(s.clone()))
                .collect(),
        ),
    ]));
    Ok(Bytes::from(data))
}

/// The destination contract's replay guard rejected the call
pub fn is_already_processed(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("already processed") || lower.contains("transfer processed")
}

/// The node already holds these exact bytes in its pool
pub fn is_already_known(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("already known") || lower.contains("known transaction")
}

/// Map a node error message onto the relayer error taxonomy
pub fn classify_rpc_error(chain_id: u64, message: &str) -> RelayerError {
    let lower = message.to_lowercase();

    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
        return RelayerError::RateLimited { chain_id };
    }
    if lower.contains("nonce too low") || lower.contains("nonce too high") {
        return RelayerError::Nonce {
            chain_id,
            message: message.to_string(),
        };
    }
    if lower.contains("insufficient funds") {
        return RelayerError::InsufficientBalance {
            chain_id,
            have: "unknown".to_string(),
            need: "unknown".to_string(),
        };
    }
    if lower.contains("underpriced") || lower.contains("replacement transaction") {
        return RelayerError::transaction(message, true);
    }
    if lower.contains("revert") || lower.contains("invalid signature") || lower.contains("out of gas") {
        return RelayerError::transaction(message, false);
    }

    RelayerError::ChainConnection {
        chain_id,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GasConfig;
    use crate::types::{Amount, EventKind};

    fn chain_config(rpc_urls: Vec<String>) -> ChainConfig {
        ChainConfig {
            chain_id: 137,
            name: "Polygon".to_string(),
            family: ChainFamily::Evm,
            rpc_urls,
            network: None,
            bridge_contract: "0x00000000000000000000000000000000000000bb".to_string(),
            required_confirmations: 128,
            block_time_ms: 2000,
            gas: GasConfig::default(),
            enabled: true,
        }
    }

    fn release_call(kind: EventKind) -> ReleaseCall {
        ReleaseCall {
            transfer_id: format!("0x{}", "11".repeat(32)),
            source_kind: kind,
            token: "0x00000000000000000000000000000000000000cc".to_string(),
            amount: Amount::from(1_000_000_000_000_000_000u128),
            recipient: "0x00000000000000000000000000000000000000b2".to_string(),
            signatures: vec![vec![1u8; 65], vec![2u8; 65]],
        }
    }

    #[test]
    fn test_release_call_selector_follows_source_kind() {
        let mint = encode_release_call(&release_call(EventKind::Lock)).unwrap();
        let unlock = encode_release_call(&release_call(EventKind::Burn)).unwrap();
        assert_eq!(
            &mint[..4],
            &ethers::utils::id("mint(bytes32,address,uint256,address,bytes[])")[..]
        );
        assert_eq!(
            &unlock[..4],
            &ethers::utils::id("unlock(bytes32,address,uint256,address,bytes[])")[..]
        );
    }

    #[test]
    fn test_release_call_rejects_non_evm_recipient() {
        let mut call = release_call(EventKind::Lock);
        call.recipient = "cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu".to_string();
        assert!(matches!(
            encode_release_call(&call),
            Err(RelayerError::Validation(_))
        ));
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify_rpc_error(1, "nonce too low"),
            RelayerError::Nonce { .. }
        ));
        assert!(classify_rpc_error(1, "connection reset by peer").is_retryable());
        assert!(classify_rpc_error(1, "429 Too Many Requests").is_retryable());
        assert!(!classify_rpc_error(1, "execution reverted: bad signer").is_retryable());
        assert!(classify_rpc_error(1, "replacement transaction underpriced").is_retryable());
        assert!(is_already_processed("execution reverted: Transfer already processed"));
    }

    #[test]
    fn test_already_known_is_not_a_nonce_conflict() {
        assert!(is_already_known("already known"));
        assert!(is_already_known("known transaction: 0xabc"));
        assert!(!is_already_known("nonce too low"));
        assert!(matches!(
            classify_rpc_error(1, "already known"),
            RelayerError::ChainConnection { .. }
        ));
    }

    #[test]
    fn test_adapter_requires_a_valid_endpoint() {
        let result = EvmAdapter::new(
            chain_config(vec!["not a url".to_string()]),
            None,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(RelayerError::ChainConnection { .. })));
    }

    #[test]
    fn test_adapter_reports_configuration() {
        let adapter = EvmAdapter::new(
            chain_config(vec!["http://localhost:8546".to_string()]),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(adapter.chain_id(), 137);
        assert_eq!(adapter.required_confirmations(), 128);
        assert_eq!(adapter.bridge_contract(), "0x00000000000000000000000000000000000000bb");
        assert!(matches!(adapter.wallet(), Err(RelayerError::Wallet(_))));
    }
}
