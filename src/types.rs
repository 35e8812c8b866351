//! Core data model: transfers, signatures, tokens and the validator set

use crate::error::{RelayerError, RelayerResult};

use chrono::{DateTime, Utc};
use ethers::abi::{encode, Token};
use ethers::types::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Chain family served by a [`crate::chain::ChainAdapter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    #[default]
    Evm,
    Cosmos,
}

/// Lifecycle of a cross-chain transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Confirming,
    Signed,
    Executing,
    Completed,
    Failed,
    UnderReview,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 7] = [
        TransferStatus::Pending,
        TransferStatus::Confirming,
        TransferStatus::Signed,
        TransferStatus::Executing,
        TransferStatus::Completed,
        TransferStatus::Failed,
        TransferStatus::UnderReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Confirming => "confirming",
            TransferStatus::Signed => "signed",
            TransferStatus::Executing => "executing",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::UnderReview => "under_review",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    /// Whether `self -> next` is a legal edge of the transfer state machine
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Pending, Confirming) | (Confirming, Signed) | (Signed, Executing) => true,
            (Executing, Completed) => true,
            (Pending | Confirming | Signed | Executing, UnderReview) => true,
            (Pending | Confirming | Signed | Executing | UnderReview, Failed) => true,
            (UnderReview, Confirming) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| RelayerError::Internal(format!("unknown transfer status: {}", s)))
    }
}

/// Bridge contract event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Lock,
    Burn,
    Mint,
    Unlock,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Lock => "lock",
            EventKind::Burn => "burn",
            EventKind::Mint => "mint",
            EventKind::Unlock => "unlock",
        }
    }

    /// Source-side custody events start a transfer
    pub fn is_source_event(&self) -> bool {
        matches!(self, EventKind::Lock | EventKind::Burn)
    }
}

impl FromStr for EventKind {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lock" => Ok(EventKind::Lock),
            "burn" => Ok(EventKind::Burn),
            "mint" => Ok(EventKind::Mint),
            "unlock" => Ok(EventKind::Unlock),
            other => Err(RelayerError::EventParsing(format!("unknown event kind: {}", other))),
        }
    }
}

/// Unsigned 256-bit token amount, serialized as a decimal string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(pub U256);

impl Amount {
    pub fn zero() -> Self {
        Amount(U256::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }
}

impl From<U256> for Amount {
    fn from(value: U256) -> Self {
        Amount(value)
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Amount(U256::from(value))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RelayerError::Validation(format!("invalid amount: {:?}", s)));
        }
        U256::from_dec_str(trimmed)
            .map(Amount)
            .map_err(|e| RelayerError::Validation(format!("invalid amount {}: {}", s, e)))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A cross-chain transfer as recorded by this relayer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    pub kind: EventKind,
    pub source_chain: u64,
    pub destination_chain: u64,
    pub token: String,
    pub amount: Amount,
    pub sender: String,
    pub recipient: String,
    pub nonce: u64,
    pub status: TransferStatus,
    pub status_reason: Option<String>,
    pub source_tx_hash: String,
    pub destination_tx_hash: Option<String>,
    pub block_number: u64,
    pub block_hash: String,
    pub confirmations: u64,
    pub fee: Amount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
}

impl Transfer {
    /// Build a Pending transfer from a source-side bridge event
    pub fn from_event(event: &BridgeEvent, confirmations: u64) -> Self {
        let now = Utc::now();
        Self {
            id: event.transfer_id.clone(),
            kind: event.kind,
            source_chain: event.chain_id,
            destination_chain: event.destination_chain,
            token: event.token.clone(),
            amount: event.amount,
            sender: event.sender.clone(),
            recipient: event.recipient.clone(),
            nonce: event.nonce,
            status: TransferStatus::Pending,
            status_reason: None,
            source_tx_hash: event.tx_hash.clone(),
            destination_tx_hash: None,
            block_number: event.block_number,
            block_hash: event.block_hash.clone(),
            confirmations,
            fee: event.fee,
            created_at: now,
            updated_at: now,
            status_changed_at: now,
        }
    }

    /// Check record-level invariants
    pub fn validate(&self) -> RelayerResult<()> {
        if self.id.is_empty() {
            return Err(RelayerError::Validation("transfer id is required".into()));
        }
        if self.source_chain == self.destination_chain {
            return Err(RelayerError::Validation(
                "source and destination chains must be different".into(),
            ));
        }
        if self.amount.is_zero() {
            return Err(RelayerError::Validation("amount must be positive".into()));
        }
        if self.token.is_empty() {
            return Err(RelayerError::Validation("token address is required".into()));
        }
        if self.sender.is_empty() {
            return Err(RelayerError::Validation("sender address is required".into()));
        }
        if self.recipient.is_empty() {
            return Err(RelayerError::Validation("recipient address is required".into()));
        }
        Ok(())
    }
}

/// An attestation by one relayer over a transfer's canonical message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub transfer_id: String,
    pub relayer_address: String,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Signature {
    pub fn new(transfer_id: &str, relayer_address: &str, signature: Vec<u8>) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            relayer_address: normalize_address(relayer_address),
            signature,
            created_at: Utc::now(),
        }
    }
}

/// Token supported by the bridge on a given chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedToken {
    pub chain_id: u64,
    pub token_address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub is_native: bool,
    pub enabled: bool,
    pub min_amount: Option<Amount>,
    pub max_amount: Option<Amount>,
}

impl SupportedToken {
    pub fn validate(&self) -> RelayerResult<()> {
        if self.chain_id == 0 {
            return Err(RelayerError::Validation("chain ID is required".into()));
        }
        if self.token_address.is_empty() {
            return Err(RelayerError::Validation("token address is required".into()));
        }
        if self.name.is_empty() || self.symbol.is_empty() {
            return Err(RelayerError::Validation("token name and symbol are required".into()));
        }
        if self.decimals > 18 {
            return Err(RelayerError::Validation("decimals cannot exceed 18".into()));
        }
        Ok(())
    }

    /// Check that an amount is within the configured per-token bounds
    pub fn check_amount(&self, amount: &Amount) -> RelayerResult<()> {
        if let Some(min) = &self.min_amount {
            if amount < min {
                return Err(RelayerError::Validation(format!(
                    "amount {} below minimum {} for {}",
                    amount, min, self.symbol
                )));
            }
        }
        if let Some(max) = &self.max_amount {
            if amount > max {
                return Err(RelayerError::Validation(format!(
                    "amount {} above maximum {} for {}",
                    amount, max, self.symbol
                )));
            }
        }
        Ok(())
    }
}

/// Authorized relayer set and signature threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub relayers: BTreeSet<String>,
    pub threshold: usize,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ValidatorSet {
    pub fn new(relayers: Vec<String>, threshold: usize, version: u64) -> Self {
        Self {
            relayers: relayers.iter().map(|r| normalize_address(r)).collect(),
            threshold,
            version,
            updated_at: Utc::now(),
        }
    }

    pub fn is_authorized(&self, address: &str) -> bool {
        self.relayers.contains(&normalize_address(address))
    }

    pub fn validate(&self) -> RelayerResult<()> {
        if self.threshold == 0 || self.threshold > self.relayers.len() {
            return Err(RelayerError::Validation(format!(
                "threshold {} invalid for {} relayers",
                self.threshold,
                self.relayers.len()
            )));
        }
        Ok(())
    }
}

/// A bridge event extracted from chain logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub kind: EventKind,
    pub chain_id: u64,
    pub transfer_id: String,
    pub sender: String,
    pub token: String,
    pub amount: Amount,
    pub destination_chain: u64,
    pub recipient: String,
    pub nonce: u64,
    pub fee: Amount,
    /// Contract that emitted the event
    pub emitter: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub log_index: u64,
}

impl BridgeEvent {
    /// Fields that must not change between the observed event and the chain's
    /// current view of it
    pub fn same_payload(&self, other: &BridgeEvent) -> bool {
        self.kind == other.kind
            && self.chain_id == other.chain_id
            && self.transfer_id == other.transfer_id
            && self.sender == other.sender
            && self.token == other.token
            && self.amount == other.amount
            && self.destination_chain == other.destination_chain
            && self.recipient == other.recipient
            && self.nonce == other.nonce
    }
}

/// One row of a transfer's durable audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub transfer_id: String,
    pub from_status: Option<TransferStatus>,
    pub to_status: Option<TransferStatus>,
    pub error_kind: Option<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn transition(
        transfer_id: &str,
        from: Option<TransferStatus>,
        to: TransferStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            from_status: from,
            to_status: Some(to),
            error_kind: None,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }

    pub fn error(transfer_id: &str, err: &RelayerError) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            from_status: None,
            to_status: None,
            error_kind: Some(err.kind().as_str().to_string()),
            reason: err.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn note(transfer_id: &str, kind: &str, reason: impl Into<String>) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            from_status: None,
            to_status: None,
            error_kind: Some(kind.to_string()),
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

/// Last block a watcher fully processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub chain_id: u64,
    pub block_number: u64,
    pub block_hash: String,
}

/// Transfer counts per status
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferStats {
    pub pending: u64,
    pub confirming: u64,
    pub signed: u64,
    pub executing: u64,
    pub completed: u64,
    pub failed: u64,
    pub under_review: u64,
}

impl TransferStats {
    pub fn add(&mut self, status: TransferStatus, count: u64) {
        match status {
            TransferStatus::Pending => self.pending += count,
            TransferStatus::Confirming => self.confirming += count,
            TransferStatus::Signed => self.signed += count,
            TransferStatus::Executing => self.executing += count,
            TransferStatus::Completed => self.completed += count,
            TransferStatus::Failed => self.failed += count,
            TransferStatus::UnderReview => self.under_review += count,
        }
    }

    pub fn count(&self, status: TransferStatus) -> u64 {
        match status {
            TransferStatus::Pending => self.pending,
            TransferStatus::Confirming => self.confirming,
            TransferStatus::Signed => self.signed,
            TransferStatus::Executing => self.executing,
            TransferStatus::Completed => self.completed,
            TransferStatus::Failed => self.failed,
            TransferStatus::UnderReview => self.under_review,
        }
    }

    pub fn total(&self) -> u64 {
        TransferStatus::ALL.iter().map(|s| self.count(*s)).sum()
    }
}

/// Lowercase an address so set membership and uniqueness are case-insensitive
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Raw bytes identifying a sender inside the transfer id preimage
fn sender_bytes(sender: &str) -> Vec<u8> {
    match Address::from_str(sender) {
        Ok(address) => address.as_bytes().to_vec(),
        Err(_) => sender.as_bytes().to_vec(),
    }
}

/// Deterministic transfer id:
/// `keccak256(abi.encode(uint256 sourceChain, bytes sender, uint256 nonce))`
pub fn compute_transfer_id(source_chain: u64, sender: &str, nonce: u64) -> String {
    let encoded = encode(&[
        Token::Uint(U256::from(source_chain)),
        Token::Bytes(sender_bytes(sender)),
        Token::Uint(U256::from(nonce)),
    ]);
    format!("0x{}", hex::encode(keccak256(&encoded)))
}

/// Parse a 0x-prefixed 32-byte transfer id
pub fn transfer_id_bytes(id: &str) -> RelayerResult<[u8; 32]> {
    let raw = hex::decode(id.trim_start_matches("0x"))
        .map_err(|e| RelayerError::Validation(format!("invalid transfer id {}: {}", id, e)))?;
    raw.try_into()
        .map_err(|_| RelayerError::Validation(format!("transfer id {} is not 32 bytes", id)))
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
