//! Error types for the Nexus Relayer

use thiserror::Error;

/// Error taxonomy used to decide retry, escalation and audit handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authenticity,
    Network,
    Consensus,
    Execution,
    State,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authenticity => "authenticity",
            ErrorKind::Network => "network",
            ErrorKind::Consensus => "consensus",
            ErrorKind::Execution => "execution",
            ErrorKind::State => "state",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authenticity error on chain {chain_id} (tx {tx_hash}): {reason}")]
    Authenticity {
        chain_id: u64,
        tx_hash: String,
        reason: String,
    },

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Chain id mismatch: configured {expected}, node reports {actual}")]
    ChainIdMismatch { expected: String, actual: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Rate limited on chain {chain_id}")]
    RateLimited { chain_id: u64 },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Insufficient signatures for transfer {transfer_id}: have {have}, need {need}")]
    InsufficientSignatures {
        transfer_id: String,
        have: usize,
        need: usize,
    },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Signer {signer} is not an authorized relayer")]
    UnauthorizedSigner { signer: String },

    #[error("Signature collection for transfer {transfer_id} timed out")]
    SignatureTimeout { transfer_id: String },

    #[error("Transaction error: {message}")]
    Transaction { message: String, retryable: bool },

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Duplicate transfer {transfer_id}")]
    DuplicateTransfer { transfer_id: String },

    #[error("Transfer {transfer_id} already processed")]
    AlreadyProcessed { transfer_id: String },

    #[error("Invalid state transition for transfer {transfer_id} from {from} to {to}")]
    InvalidStateTransition {
        transfer_id: String,
        from: String,
        to: String,
    },

    #[error("Transfer {transfer_id} not found")]
    TransferNotFound { transfer_id: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Block coverage gap on chain {chain_id}: expected block {expected}, got {got}")]
    CoverageGap { chain_id: u64, expected: u64, got: u64 },

    #[error("Reorg detected on chain {chain_id} at block {block_number}")]
    ReorgDetected { chain_id: u64, block_number: u64 },

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<RelayerError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Classify the error into the relayer's taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayerError::Config(_) | RelayerError::ChainIdMismatch { .. } => ErrorKind::Config,
            RelayerError::Validation(_) | RelayerError::EventParsing(_) => ErrorKind::Validation,
            RelayerError::Authenticity { .. }
            | RelayerError::InvalidSignature(_)
            | RelayerError::UnauthorizedSigner { .. } => ErrorKind::Authenticity,
            RelayerError::Database(_)
            | RelayerError::ChainConnection { .. }
            | RelayerError::Timeout { .. }
            | RelayerError::RateLimited { .. }
            | RelayerError::GasEstimation(_) => ErrorKind::Network,
            RelayerError::InsufficientSignatures { .. } | RelayerError::SignatureTimeout { .. } => {
                ErrorKind::Consensus
            }
            RelayerError::Transaction { .. }
            | RelayerError::Nonce { .. }
            | RelayerError::InsufficientBalance { .. }
            | RelayerError::Wallet(_) => ErrorKind::Execution,
            RelayerError::DuplicateTransfer { .. }
            | RelayerError::AlreadyProcessed { .. }
            | RelayerError::InvalidStateTransition { .. }
            | RelayerError::TransferNotFound { .. }
            | RelayerError::CoverageGap { .. }
            | RelayerError::ReorgDetected { .. } => ErrorKind::State,
            RelayerError::RetriesExhausted { last, .. } => last.kind(),
            RelayerError::ChainNotFound { .. } | RelayerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayerError::Database(e) => !matches!(e, sqlx::Error::Database(_)),
            RelayerError::ChainConnection { .. }
            | RelayerError::Timeout { .. }
            | RelayerError::RateLimited { .. }
            | RelayerError::GasEstimation(_)
            | RelayerError::Nonce { .. } => true,
            RelayerError::Transaction { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::Authenticity { .. }
                | RelayerError::UnauthorizedSigner { .. }
                | RelayerError::InsufficientBalance { .. }
                | RelayerError::ReorgDetected { .. }
                | RelayerError::CoverageGap { .. }
                | RelayerError::InvalidStateTransition { .. }
                | RelayerError::RetriesExhausted { .. }
                | RelayerError::Wallet(_)
        )
    }

    /// Duplicate deliveries are dropped quietly rather than escalated
    pub fn is_duplicate_delivery(&self) -> bool {
        matches!(
            self,
            RelayerError::DuplicateTransfer { .. } | RelayerError::AlreadyProcessed { .. }
        )
    }

    pub fn authenticity(chain_id: u64, tx_hash: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayerError::Authenticity {
            chain_id,
            tx_hash: tx_hash.into(),
            reason: reason.into(),
        }
    }

    pub fn transaction(message: impl Into<String>, retryable: bool) -> Self {
        RelayerError::Transaction {
            message: message.into(),
            retryable,
        }
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
