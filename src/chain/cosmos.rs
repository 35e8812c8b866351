//! Cosmos chain adapter over the LCD REST API
//!
//! Cosmos chains are observed as transfer sources only. The bridge is a
//! CosmWasm contract whose `wasm` events carry the transfer fields as
//! attributes. Delivery to a Cosmos destination belongs to the IBC transport,
//! so the submission half of [`ChainAdapter`] rejects every call.

use super::adapter::{ChainAdapter, GasPrice, ReceiptInfo, ReleaseCall, SignedRelease};
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::types::{normalize_address, Amount, BridgeEvent, ChainFamily, EventKind};

use async_trait::async_trait;
use ethers::types::U256;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct NodeInfoResponse {
    default_node_info: NodeInfo,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    network: String,
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    block_id: BlockId,
    block: Block,
}

#[derive(Debug, Deserialize)]
struct BlockId {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct Block {
    header: Header,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(deserialize_with = "string_to_u64")]
    height: u64,
}

#[derive(Debug, Deserialize)]
struct TxSearchResponse {
    #[serde(default)]
    tx_responses: Vec<TxResponse>,
}

#[derive(Debug, Deserialize)]
struct TxLookupResponse {
    tx_response: TxResponse,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    txhash: String,
    #[serde(deserialize_with = "string_to_u64")]
    height: u64,
    #[serde(default)]
    code: u32,
    #[serde(default)]
    events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    type_str: String,
    #[serde(default)]
    attributes: Vec<Attribute>,
}

#[derive(Debug, Deserialize)]
struct Attribute {
    key: String,
    value: String,
}

fn string_to_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// LCD-backed adapter for a CosmWasm bridge deployment
pub struct CosmosAdapter {
    config: ChainConfig,
    client: reqwest::Client,
    current_url: AtomicUsize,
}

impl CosmosAdapter {
    pub fn new(config: ChainConfig, request_timeout: Duration) -> RelayerResult<Self> {
        if config.rpc_urls.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No LCD endpoints configured".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayerError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            current_url: AtomicUsize::new(0),
        })
    }

    fn lcd_url(&self) -> &str {
        let idx = self.current_url.load(Ordering::Relaxed);
        self.config.rpc_urls[idx % self.config.rpc_urls.len()].trim_end_matches('/')
    }

    fn failover(&self) {
        let next = (self.current_url.load(Ordering::Relaxed) + 1) % self.config.rpc_urls.len();
        self.current_url.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to LCD endpoint {}", self.config.chain_id, next);
    }

    /// GET a JSON document, `None` on 404. Transient failures fail over to the next endpoint.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> RelayerResult<Option<T>> {
        let mut last_error = None;

        for _ in 0..self.config.rpc_urls.len() {
            let url = format!("{}{}", self.lcd_url(), path);
            let err = match self.client.get(&url).send().await {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    RelayerError::RateLimited {
                        chain_id: self.config.chain_id,
                    }
                }
                Ok(resp) if resp.status().is_success() => {
                    return resp.json::<T>().await.map(Some).map_err(|e| {
                        RelayerError::EventParsing(format!("LCD response for {}: {}", path, e))
                    })
                }
                Ok(resp) => RelayerError::ChainConnection {
                    chain_id: self.config.chain_id,
                    message: format!("LCD {} returned {}", path, resp.status()),
                },
                Err(e) if e.is_timeout() => RelayerError::Timeout {
                    operation: format!("LCD {} on chain {}", path, self.config.chain_id),
                },
                Err(e) => RelayerError::ChainConnection {
                    chain_id: self.config.chain_id,
                    message: e.to_string(),
                },
            };
            warn!("LCD request {} failed: {}", path, err);
            last_error = Some(err);
            self.failover();
        }

        Err(last_error.unwrap_or(RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: "All LCD endpoints failed".to_string(),
        }))
    }

    async fn block(&self, path: &str) -> RelayerResult<Option<BlockResponse>> {
        self.get_json::<BlockResponse>(path).await
    }

    fn destination_unsupported(&self, operation: &str) -> RelayerError {
        RelayerError::transaction(
            format!(
                "{} is not supported on Cosmos chain {}; delivery goes through IBC",
                operation, self.config.chain_id
            ),
            false,
        )
    }

    /// Decode the bridge's `wasm` events in one transaction
    fn parse_tx_events(&self, tx: &TxResponse, block_hash: &str) -> RelayerResult<Vec<BridgeEvent>> {
        parse_wasm_events(self.config.chain_id, tx, block_hash)
    }
}

fn attr<'a>(event: &'a Event, key: &str) -> Option<&'a str> {
    event
        .attributes
        .iter()
        .find(|a| a.key == key)
        .map(|a| a.value.as_str())
}

fn required<'a>(event: &'a Event, key: &str) -> RelayerResult<&'a str> {
    attr(event, key).ok_or_else(|| RelayerError::EventParsing(format!("missing attribute {}", key)))
}

fn parse_u64(event: &Event, key: &str) -> RelayerResult<u64> {
    required(event, key)?
        .parse()
        .map_err(|e| RelayerError::EventParsing(format!("attribute {}: {}", key, e)))
}

fn parse_amount(event: &Event, key: &str) -> RelayerResult<Amount> {
    required(event, key)?
        .parse()
        .map_err(|e| RelayerError::EventParsing(format!("attribute {}: {}", key, e)))
}

fn parse_wasm_events(chain_id: u64, tx: &TxResponse, block_hash: &str) -> RelayerResult<Vec<BridgeEvent>> {
    let mut events = Vec::new();

    for (index, event) in tx.events.iter().enumerate() {
        if event.type_str != "wasm" {
            continue;
        }
        let kind = match attr(event, "action").map(str::parse::<EventKind>) {
            Some(Ok(kind)) => kind,
            _ => continue,
        };
        let emitter = required(event, "_contract_address")?.to_string();

        let mut parsed = BridgeEvent {
            kind,
            chain_id,
            transfer_id: required(event, "transfer_id")?.to_lowercase(),
            sender: String::new(),
            token: normalize_address(required(event, "token")?),
            amount: parse_amount(event, "amount")?,
            destination_chain: 0,
            recipient: normalize_address(required(event, "recipient")?),
            nonce: 0,
            fee: Amount::zero(),
            emitter,
            tx_hash: tx.txhash.to_lowercase(),
            block_number: tx.height,
            block_hash: block_hash.to_string(),
            log_index: index as u64,
        };

        if kind.is_source_event() {
            parsed.sender = required(event, "sender")?.to_string();
            parsed.destination_chain = parse_u64(event, "dest_chain_id")?;
            parsed.nonce = parse_u64(event, "nonce")?;
            if attr(event, "fee").is_some() {
                parsed.fee = parse_amount(event, "fee")?;
            }
        }

        events.push(parsed);
    }

    Ok(events)
}

#[async_trait]
impl ChainAdapter for CosmosAdapter {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Cosmos
    }

    fn bridge_contract(&self) -> String {
        self.config.bridge_contract.clone()
    }

    fn required_confirmations(&self) -> u64 {
        self.config.required_confirmations
    }

    async fn connect(&self) -> RelayerResult<u64> {
        let info = self
            .get_json::<NodeInfoResponse>("/cosmos/base/tendermint/v1beta1/node_info")
            .await?
            .ok_or_else(|| RelayerError::ChainConnection {
                chain_id: self.config.chain_id,
                message: "node_info not available".to_string(),
            })?;

        let expected = self.config.network.clone().unwrap_or_default();
        if info.default_node_info.network != expected {
            return Err(RelayerError::ChainIdMismatch {
                expected,
                actual: info.default_node_info.network,
            });
        }

        let head = self.block_number().await?;
        info!(
            "Connected to {} ({}) at height {}",
            self.config.name, expected, head
        );
        Ok(head)
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        self.block("/cosmos/base/tendermint/v1beta1/blocks/latest")
            .await?
            .map(|b| b.block.header.height)
            .ok_or_else(|| RelayerError::ChainConnection {
                chain_id: self.config.chain_id,
                message: "latest block not available".to_string(),
            })
    }

    async fn block_hash(&self, number: u64) -> RelayerResult<Option<String>> {
        let path = format!("/cosmos/base/tendermint/v1beta1/blocks/{}", number);
        Ok(self.block(&path).await?.map(|b| b.block_id.hash))
    }

    async fn bridge_events(&self, from_block: u64, to_block: u64) -> RelayerResult<Vec<BridgeEvent>> {
        let mut events = Vec::new();

        for height in from_block..=to_block {
            let path = format!(
                "/cosmos/tx/v1beta1/txs?events=wasm._contract_address='{}'&events=tx.height={}",
                self.config.bridge_contract, height
            );
            let response = self
                .get_json::<TxSearchResponse>(&path)
                .await?
                .unwrap_or(TxSearchResponse {
                    tx_responses: Vec::new(),
                });
            if response.tx_responses.is_empty() {
                continue;
            }

            let block_hash = self.block_hash(height).await?.unwrap_or_default();
            for tx in response.tx_responses.iter().filter(|tx| tx.code == 0) {
                events.extend(
                    self.parse_tx_events(tx, &block_hash)?
                        .into_iter()
                        .filter(|e| e.emitter == self.config.bridge_contract),
                );
            }
            debug!(
                "Chain {} height {}: {} bridge events so far",
                self.config.chain_id,
                height,
                events.len()
            );
        }

        Ok(events)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> RelayerResult<Option<ReceiptInfo>> {
        let path = format!("/cosmos/tx/v1beta1/txs/{}", tx_hash.trim_start_matches("0x").to_uppercase());
        let tx = match self.get_json::<TxLookupResponse>(&path).await? {
            Some(found) => found.tx_response,
            None => return Ok(None),
        };

        let block_hash = self.block_hash(tx.height).await?.unwrap_or_default();
        let events = self.parse_tx_events(&tx, &block_hash)?;

        Ok(Some(ReceiptInfo {
            tx_hash: tx.txhash.to_lowercase(),
            block_number: tx.height,
            block_hash,
            success: tx.code == 0,
            events,
        }))
    }

    async fn is_transfer_processed(&self, _transfer_id: &str) -> RelayerResult<bool> {
        Err(self.destination_unsupported("replay guard query"))
    }

    async fn pending_nonce(&self) -> RelayerResult<u64> {
        Err(self.destination_unsupported("nonce query"))
    }

    async fn estimate_release_gas(&self, _call: &ReleaseCall) -> RelayerResult<U256> {
        Err(self.destination_unsupported("gas estimation"))
    }

    async fn gas_price(&self) -> RelayerResult<GasPrice> {
        Err(self.destination_unsupported("gas price query"))
    }

    async fn sign_release(
        &self,
        _call: &ReleaseCall,
        _nonce: u64,
        _gas_limit: U256,
        _gas_price: &GasPrice,
    ) -> RelayerResult<SignedRelease> {
        Err(self.destination_unsupported("release signing"))
    }

    async fn broadcast_release(&self, _release: &SignedRelease) -> RelayerResult<()> {
        Err(self.destination_unsupported("release broadcast"))
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
