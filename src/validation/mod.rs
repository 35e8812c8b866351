//! Event validation: authenticity against the source chain and idempotency
//! against the store
//!
//! An event only becomes a transfer after its receipt has been re-fetched and
//! matched field by field, its id recomputed, its token checked against the
//! registry and the store confirms it was never processed.

use crate::chain::adapter::{ChainAdapter, ReceiptInfo};
use crate::error::{RelayerError, RelayerResult};
use crate::state::TransferStore;
use crate::types::{compute_transfer_id, normalize_address, BridgeEvent, Transfer};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of re-checking a recorded transfer against the current chain state
#[derive(Debug, Clone, PartialEq)]
pub enum Revalidation {
    Unchanged,
    /// The source transaction or its event is no longer on the canonical chain
    Vanished(String),
    /// The source event is present but differs from what was recorded
    Mutated(String),
}

impl Revalidation {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Revalidation::Unchanged)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Revalidation::Unchanged => None,
            Revalidation::Vanished(reason) | Revalidation::Mutated(reason) => Some(reason),
        }
    }
}

pub struct EventValidator {
    adapters: HashMap<u64, Arc<dyn ChainAdapter>>,
    store: Arc<dyn TransferStore>,
}

impl EventValidator {
    pub fn new(store: Arc<dyn TransferStore>) -> Self {
        Self {
            adapters: HashMap::new(),
            store,
        }
    }

    pub fn with_chain(mut self, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.adapters.insert(adapter.chain_id(), adapter);
        self
    }

    fn adapter(&self, chain_id: u64) -> RelayerResult<&Arc<dyn ChainAdapter>> {
        self.adapters
            .get(&chain_id)
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// Validate a source-side event before it is recorded.
    ///
    /// Fails with `Validation` for malformed or unsupported transfers,
    /// `Authenticity` when the chain disagrees with the event, and
    /// `AlreadyProcessed` when the transfer reached a terminal state before.
    pub async fn validate_event(&self, event: &BridgeEvent) -> RelayerResult<()> {
        self.check_shape(event)?;

        let adapter = self.adapter(event.chain_id)?;
        if let Err(e) = self.check_authenticity(adapter.as_ref(), event).await {
            if matches!(e, RelayerError::Authenticity { .. }) {
                warn!(
                    potential_attack = true,
                    chain_id = event.chain_id,
                    tx_hash = %event.tx_hash,
                    transfer_id = %event.transfer_id,
                    "Rejected bridge event: {}",
                    e
                );
            }
            return Err(e);
        }

        self.check_token(event).await?;

        if self.store.is_transfer_processed(&event.transfer_id).await? {
            debug!("Transfer {} already processed, dropping event", event.transfer_id);
            return Err(RelayerError::AlreadyProcessed {
                transfer_id: event.transfer_id.clone(),
            });
        }

        Ok(())
    }

    /// Checks that need no chain access
    fn check_shape(&self, event: &BridgeEvent) -> RelayerResult<()> {
        if !event.kind.is_source_event() {
            return Err(RelayerError::Validation(format!(
                "{} events do not start transfers",
                event.kind.as_str()
            )));
        }
        if event.amount.is_zero() {
            return Err(RelayerError::Validation("amount must be positive".into()));
        }
        if event.chain_id == event.destination_chain {
            return Err(RelayerError::Validation(
                "source and destination chains must be different".into(),
            ));
        }
        if !self.adapters.contains_key(&event.destination_chain) {
            return Err(RelayerError::Validation(format!(
                "unsupported destination chain {}",
                event.destination_chain
            )));
        }
        if event.recipient.is_empty() || event.sender.is_empty() {
            return Err(RelayerError::Validation(
                "sender and recipient are required".into(),
            ));
        }
        Ok(())
    }

    async fn check_authenticity(
        &self,
        adapter: &dyn ChainAdapter,
        event: &BridgeEvent,
    ) -> RelayerResult<()> {
        let reject = |reason: String| RelayerError::authenticity(event.chain_id, &event.tx_hash, reason);

        let bridge = normalize_address(&adapter.bridge_contract());
        if normalize_address(&event.emitter) != bridge {
            return Err(reject(format!("emitted by {}, not the bridge", event.emitter)));
        }

        let receipt = adapter
            .transaction_receipt(&event.tx_hash)
            .await?
            .ok_or_else(|| reject("transaction receipt not found".to_string()))?;

        if !receipt.success {
            return Err(reject("transaction reverted".to_string()));
        }
        if receipt.block_number != event.block_number {
            return Err(reject(format!(
                "event claims block {}, receipt is in block {}",
                event.block_number, receipt.block_number
            )));
        }

        let on_chain = find_event(&receipt, &event.transfer_id)
            .ok_or_else(|| reject("receipt has no matching bridge event".to_string()))?;
        if normalize_address(&on_chain.emitter) != bridge {
            return Err(reject(format!(
                "receipt event emitted by {}, not the bridge",
                on_chain.emitter
            )));
        }
        if !on_chain.same_payload(event) {
            return Err(reject("event payload differs from the receipt".to_string()));
        }

        let expected = compute_transfer_id(event.chain_id, &event.sender, event.nonce);
        if expected != event.transfer_id.to_lowercase() {
            return Err(reject(format!(
                "transfer id {} does not match derived id {}",
                event.transfer_id, expected
            )));
        }

        Ok(())
    }

    async fn check_token(&self, event: &BridgeEvent) -> RelayerResult<()> {
        let token = self
            .store
            .get_token(event.chain_id, &event.token)
            .await?
            .ok_or_else(|| {
                RelayerError::Validation(format!(
                    "token {} is not supported on chain {}",
                    event.token, event.chain_id
                ))
            })?;
        if !token.enabled {
            return Err(RelayerError::Validation(format!(
                "token {} is disabled on chain {}",
                token.symbol, event.chain_id
            )));
        }
        token.check_amount(&event.amount)
    }

    /// Re-check a recorded transfer against the current canonical chain
    pub async fn revalidate(&self, transfer: &Transfer) -> RelayerResult<Revalidation> {
        let adapter = self.adapter(transfer.source_chain)?;

        let receipt = match adapter.transaction_receipt(&transfer.source_tx_hash).await? {
            Some(receipt) => receipt,
            None => {
                return Ok(Revalidation::Vanished(format!(
                    "source transaction {} no longer on chain",
                    transfer.source_tx_hash
                )))
            }
        };

        if !receipt.success {
            return Ok(Revalidation::Mutated("source transaction reverted".into()));
        }

        let event = match find_event(&receipt, &transfer.id) {
            Some(event) => event,
            None => {
                return Ok(Revalidation::Vanished(
                    "source event missing from receipt".into(),
                ))
            }
        };

        if receipt.block_hash != transfer.block_hash {
            return Ok(Revalidation::Mutated(format!(
                "source block hash changed: block {} is now {} in {}",
                transfer.block_number, receipt.block_number, receipt.block_hash
            )));
        }

        let bridge = normalize_address(&adapter.bridge_contract());
        let matches = normalize_address(&event.emitter) == bridge
            && event.kind == transfer.kind
            && event.amount == transfer.amount
            && event.token == transfer.token
            && event.sender == transfer.sender
            && event.recipient == transfer.recipient
            && event.destination_chain == transfer.destination_chain
            && event.nonce == transfer.nonce;
        if !matches {
            return Ok(Revalidation::Mutated("source event payload changed".into()));
        }

        Ok(Revalidation::Unchanged)
    }
}

fn find_event<'a>(receipt: &'a ReceiptInfo, transfer_id: &str) -> Option<&'a BridgeEvent> {
    receipt
        .events
        .iter()
        .find(|e| e.kind.is_source_event() && e.transfer_id.eq_ignore_ascii_case(transfer_id))
}
