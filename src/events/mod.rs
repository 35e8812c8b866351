//! Bridge contract event signatures and log decoding
//!
//! The bridge contract emits:
//! - `TokensLocked` / `TokensBurned` on the source chain, which start a transfer
//! - `TokensMinted` / `TokensUnlocked` on the destination chain, which complete one

use crate::error::{RelayerError, RelayerResult};
use crate::types::{keccak256, Amount, BridgeEvent, EventKind};

use ethers::abi::{decode, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};
use std::str::FromStr;

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use crate::types::keccak256;
    use ethers::types::H256;
    use lazy_static::lazy_static;

    pub const TOKENS_LOCKED_SIG: &str =
        "TokensLocked(bytes32,address,address,uint256,uint256,address,uint256,uint256)";
    pub const TOKENS_BURNED_SIG: &str =
        "TokensBurned(bytes32,address,address,uint256,uint256,address,uint256,uint256)";
    pub const TOKENS_MINTED_SIG: &str = "TokensMinted(bytes32,address,address,uint256)";
    pub const TOKENS_UNLOCKED_SIG: &str = "TokensUnlocked(bytes32,address,address,uint256)";

    lazy_static! {
        pub static ref TOKENS_LOCKED: H256 = H256::from(keccak256(TOKENS_LOCKED_SIG.as_bytes()));
        pub static ref TOKENS_BURNED: H256 = H256::from(keccak256(TOKENS_BURNED_SIG.as_bytes()));
        pub static ref TOKENS_MINTED: H256 = H256::from(keccak256(TOKENS_MINTED_SIG.as_bytes()));
        pub static ref TOKENS_UNLOCKED: H256 =
            H256::from(keccak256(TOKENS_UNLOCKED_SIG.as_bytes()));
    }

    /// All topics the watcher filters for
    pub fn all() -> Vec<H256> {
        vec![*TOKENS_LOCKED, *TOKENS_BURNED, *TOKENS_MINTED, *TOKENS_UNLOCKED]
    }
}

/// Map a log's first topic to the bridge event it encodes
pub fn kind_for_topic(topic: &H256) -> Option<EventKind> {
    if topic == &*topics::TOKENS_LOCKED {
        Some(EventKind::Lock)
    } else if topic == &*topics::TOKENS_BURNED {
        Some(EventKind::Burn)
    } else if topic == &*topics::TOKENS_MINTED {
        Some(EventKind::Mint)
    } else if topic == &*topics::TOKENS_UNLOCKED {
        Some(EventKind::Unlock)
    } else {
        None
    }
}

/// Lowercase 0x-prefixed form used for every address and hash the relayer stores
pub fn format_address(address: &Address) -> String {
    format!("{:#x}", address)
}

pub fn format_hash(hash: &H256) -> String {
    format!("{:#x}", hash)
}

pub fn parse_address(value: &str) -> RelayerResult<Address> {
    Address::from_str(value)
        .map_err(|e| RelayerError::Validation(format!("invalid EVM address {}: {}", value, e)))
}

pub fn parse_hash(value: &str) -> RelayerResult<H256> {
    H256::from_str(value).map_err(|e| RelayerError::Validation(format!("invalid hash {}: {}", value, e)))
}

/// Decodes bridge logs for one chain
pub struct EventParser {
    chain_id: u64,
}

impl EventParser {
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }

    /// Parse a log entry. Returns `Ok(None)` for logs that are not bridge events.
    pub fn parse_log(&self, log: &Log) -> RelayerResult<Option<BridgeEvent>> {
        let topic = match log.topics.first() {
            Some(topic) => topic,
            None => return Ok(None),
        };
        let kind = match kind_for_topic(topic) {
            Some(kind) => kind,
            None => return Ok(None),
        };

        if log.removed == Some(true) {
            return Err(RelayerError::EventParsing(format!(
                "log {:?} was removed by a reorg",
                log.transaction_hash
            )));
        }
        if log.topics.len() < 4 {
            return Err(RelayerError::EventParsing(format!(
                "{} log has {} topics, expected 4",
                kind.as_str(),
                log.topics.len()
            )));
        }

        let block_number = log
            .block_number
            .map(|b| b.as_u64())
            .ok_or_else(|| RelayerError::EventParsing("log without block number".into()))?;
        let block_hash = log
            .block_hash
            .ok_or_else(|| RelayerError::EventParsing("log without block hash".into()))?;
        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| RelayerError::EventParsing("log without transaction hash".into()))?;

        let transfer_id = format_hash(&log.topics[1]);
        let party = format_address(&Address::from_slice(&log.topics[2].0[12..32]));
        let token = format_address(&Address::from_slice(&log.topics[3].0[12..32]));

        let mut event = BridgeEvent {
            kind,
            chain_id: self.chain_id,
            transfer_id,
            sender: String::new(),
            token,
            amount: Amount::zero(),
            destination_chain: 0,
            recipient: String::new(),
            nonce: 0,
            fee: Amount::zero(),
            emitter: format_address(&log.address),
            tx_hash: format_hash(&tx_hash),
            block_number,
            block_hash: format_hash(&block_hash),
            log_index: log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
        };

        if kind.is_source_event() {
            let values = decode(
                &[
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                ],
                &log.data,
            )
            .map_err(|e| RelayerError::EventParsing(format!("{} data: {}", kind.as_str(), e)))?;

            event.sender = party;
            event.amount = Amount(uint(&values[0])?);
            event.destination_chain = small_uint(&values[1], "destinationChain")?;
            event.recipient = match &values[2] {
                Token::Address(a) => format_address(a),
                other => {
                    return Err(RelayerError::EventParsing(format!(
                        "recipient is not an address: {:?}",
                        other
                    )))
                }
            };
            event.nonce = small_uint(&values[3], "nonce")?;
            event.fee = Amount(uint(&values[4])?);
        } else {
            let values = decode(&[ParamType::Uint(256)], &log.data)
                .map_err(|e| RelayerError::EventParsing(format!("{} data: {}", kind.as_str(), e)))?;
            event.recipient = party;
            event.amount = Amount(uint(&values[0])?);
        }

        Ok(Some(event))
    }
}

fn uint(token: &Token) -> RelayerResult<U256> {
    match token {
        Token::Uint(v) => Ok(*v),
        other => Err(RelayerError::EventParsing(format!("expected uint, got {:?}", other))),
    }
}

fn small_uint(token: &Token, field: &str) -> RelayerResult<u64> {
    let value = uint(token)?;
    if value > U256::from(u64::MAX) {
        return Err(RelayerError::EventParsing(format!("{} does not fit in u64", field)));
    }
    Ok(value.as_u64())
}

/// Topic of an address-typed indexed parameter
pub fn address_topic(address: &Address) -> H256 {
    H256::from(*address)
}

/// Hash of an event signature, used by tests that build logs by hand
pub fn signature_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}
