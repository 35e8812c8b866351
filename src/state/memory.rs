//! In-memory store for development deployments and tests

use super::store::TransferStore;
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::types::{
    normalize_address, AuditEntry, Checkpoint, Signature, SupportedToken, Transfer, TransferStats,
    TransferStatus, ValidatorSet,
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    transfers: DashMap<String, Transfer>,
    /// transfer id -> relayer address -> signature
    signatures: DashMap<String, BTreeMap<String, Signature>>,
    audit: DashMap<String, Vec<AuditEntry>>,
    checkpoints: DashMap<u64, Checkpoint>,
    tokens: DashMap<(u64, String), SupportedToken>,
    validator_sets: RwLock<Vec<ValidatorSet>>,
    chains: DashMap<u64, ChainConfig>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_audit(&self, entry: AuditEntry) {
        self.audit
            .entry(entry.transfer_id.clone())
            .or_default()
            .push(entry);
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }

    async fn record_transfer(&self, transfer: &Transfer) -> RelayerResult<()> {
        transfer.validate()?;
        match self.transfers.entry(transfer.id.clone()) {
            Entry::Occupied(_) => Err(RelayerError::DuplicateTransfer {
                transfer_id: transfer.id.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(transfer.clone());
                self.push_audit(AuditEntry::transition(
                    &transfer.id,
                    None,
                    transfer.status,
                    "transfer recorded",
                ));
                Ok(())
            }
        }
    }

    async fn get_transfer(&self, id: &str) -> RelayerResult<Option<Transfer>> {
        Ok(self.transfers.get(id).map(|t| t.clone()))
    }

    async fn transition(
        &self,
        id: &str,
        from: TransferStatus,
        to: TransferStatus,
        reason: Option<&str>,
    ) -> RelayerResult<bool> {
        if !from.can_transition_to(to) {
            return Err(RelayerError::InvalidStateTransition {
                transfer_id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        {
            let mut transfer = self
                .transfers
                .get_mut(id)
                .ok_or_else(|| RelayerError::TransferNotFound {
                    transfer_id: id.to_string(),
                })?;
            if transfer.status != from {
                return Ok(false);
            }
            let now = Utc::now();
            transfer.status = to;
            transfer.status_reason = reason.map(str::to_string);
            transfer.status_changed_at = now;
            transfer.updated_at = now;
        }

        self.push_audit(AuditEntry::transition(
            id,
            Some(from),
            to,
            reason.unwrap_or_default(),
        ));
        Ok(true)
    }

    async fn mark_transfer_complete(
        &self,
        id: &str,
        destination_tx_hash: Option<&str>,
    ) -> RelayerResult<bool> {
        if let Some(hash) = destination_tx_hash {
            if let Some(mut transfer) = self.transfers.get_mut(id) {
                if transfer.status == TransferStatus::Executing {
                    transfer.destination_tx_hash = Some(hash.to_string());
                }
            }
        }
        self.transition(id, TransferStatus::Executing, TransferStatus::Completed, None)
            .await
    }

    async fn set_destination_tx(&self, id: &str, tx_hash: &str) -> RelayerResult<()> {
        let mut transfer = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| RelayerError::TransferNotFound {
                transfer_id: id.to_string(),
            })?;
        transfer.destination_tx_hash = Some(tx_hash.to_string());
        transfer.updated_at = Utc::now();
        Ok(())
    }

    async fn clear_destination_tx(&self, id: &str) -> RelayerResult<bool> {
        let mut transfer = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| RelayerError::TransferNotFound {
                transfer_id: id.to_string(),
            })?;
        if !matches!(
            transfer.status,
            TransferStatus::Executing | TransferStatus::UnderReview
        ) {
            return Ok(false);
        }
        transfer.destination_tx_hash = None;
        transfer.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_confirmations(&self, id: &str, confirmations: u64) -> RelayerResult<()> {
        if let Some(mut transfer) = self.transfers.get_mut(id) {
            transfer.confirmations = confirmations;
            transfer.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn is_transfer_processed(&self, id: &str) -> RelayerResult<bool> {
        Ok(self
            .transfers
            .get(id)
            .map(|t| t.status.is_terminal())
            .unwrap_or(false))
    }

    async fn get_transfers_by_status(
        &self,
        status: TransferStatus,
        limit: usize,
    ) -> RelayerResult<Vec<Transfer>> {
        let mut found: Vec<Transfer> = self
            .transfers
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.clone())
            .collect();
        found.sort_by_key(|t| t.created_at);
        found.truncate(limit);
        Ok(found)
    }

    async fn get_transfers_in_block_range(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<Transfer>> {
        let mut found: Vec<Transfer> = self
            .transfers
            .iter()
            .filter(|t| {
                t.source_chain == chain_id
                    && t.block_number >= from_block
                    && t.block_number <= to_block
            })
            .map(|t| t.clone())
            .collect();
        found.sort_by_key(|t| t.block_number);
        Ok(found)
    }

    async fn list_transfers(&self, offset: usize, limit: usize) -> RelayerResult<Vec<Transfer>> {
        let mut all: Vec<Transfer> = self.transfers.iter().map(|t| t.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_stats(&self) -> RelayerResult<TransferStats> {
        let mut stats = TransferStats::default();
        for transfer in self.transfers.iter() {
            stats.add(transfer.status, 1);
        }
        Ok(stats)
    }

    async fn add_signature(&self, signature: &Signature) -> RelayerResult<bool> {
        if !self.transfers.contains_key(&signature.transfer_id) {
            return Err(RelayerError::TransferNotFound {
                transfer_id: signature.transfer_id.clone(),
            });
        }
        let relayer = normalize_address(&signature.relayer_address);
        let mut by_relayer = self
            .signatures
            .entry(signature.transfer_id.clone())
            .or_default();
        if by_relayer.contains_key(&relayer) {
            return Ok(false);
        }
        let mut stored = signature.clone();
        stored.relayer_address = relayer.clone();
        by_relayer.insert(relayer, stored);
        Ok(true)
    }

    async fn get_signatures(&self, transfer_id: &str) -> RelayerResult<Vec<Signature>> {
        Ok(self
            .signatures
            .get(transfer_id)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn signature_count(&self, transfer_id: &str) -> RelayerResult<usize> {
        Ok(self.signatures.get(transfer_id).map(|s| s.len()).unwrap_or(0))
    }

    async fn has_signed(&self, transfer_id: &str, relayer_address: &str) -> RelayerResult<bool> {
        Ok(self
            .signatures
            .get(transfer_id)
            .map(|s| s.contains_key(&normalize_address(relayer_address)))
            .unwrap_or(false))
    }

    async fn append_audit(&self, entry: &AuditEntry) -> RelayerResult<()> {
        self.push_audit(entry.clone());
        Ok(())
    }

    async fn get_audit_trail(&self, transfer_id: &str) -> RelayerResult<Vec<AuditEntry>> {
        Ok(self
            .audit
            .get(transfer_id)
            .map(|a| a.clone())
            .unwrap_or_default())
    }

    async fn get_checkpoint(&self, chain_id: u64) -> RelayerResult<Option<Checkpoint>> {
        Ok(self.checkpoints.get(&chain_id).map(|c| c.clone()))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> RelayerResult<()> {
        self.checkpoints.insert(checkpoint.chain_id, checkpoint.clone());
        Ok(())
    }

    async fn upsert_token(&self, token: &SupportedToken) -> RelayerResult<()> {
        token.validate()?;
        self.tokens.insert(
            (token.chain_id, normalize_address(&token.token_address)),
            token.clone(),
        );
        Ok(())
    }

    async fn get_token(&self, chain_id: u64, token_address: &str) -> RelayerResult<Option<SupportedToken>> {
        Ok(self
            .tokens
            .get(&(chain_id, normalize_address(token_address)))
            .map(|t| t.clone()))
    }

    async fn list_tokens(&self) -> RelayerResult<Vec<SupportedToken>> {
        Ok(self.tokens.iter().map(|t| t.clone()).collect())
    }

    async fn save_validator_set(&self, set: &ValidatorSet) -> RelayerResult<()> {
        set.validate()?;
        let mut sets = self.validator_sets.write().await;
        if let Some(latest) = sets.last() {
            if set.version <= latest.version {
                return Err(RelayerError::Validation(format!(
                    "validator set version {} is not newer than {}",
                    set.version, latest.version
                )));
            }
        }
        sets.push(set.clone());
        Ok(())
    }

    async fn latest_validator_set(&self) -> RelayerResult<Option<ValidatorSet>> {
        Ok(self.validator_sets.read().await.last().cloned())
    }

    async fn upsert_chain_config(&self, config: &ChainConfig) -> RelayerResult<()> {
        self.chains.insert(config.chain_id, config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_event, sample_transfer};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_record_is_insert_only() {
        let store = MemoryStore::new();
        let transfer = sample_transfer(1);
        store.record_transfer(&transfer).await.unwrap();
        let err = store.record_transfer(&transfer).await.unwrap_err();
        assert!(matches!(err, RelayerError::DuplicateTransfer { .. }));
        assert_eq!(store.get_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_zero_amount_never_stored() {
        let store = MemoryStore::new();
        let mut transfer = Transfer::from_event(&lock_event(1, 137, 9, 0, 10), 0);
        transfer.amount = crate::types::Amount::zero();
        assert!(matches!(
            store.record_transfer(&transfer).await,
            Err(RelayerError::Validation(_))
        ));
        assert!(store.get_transfer(&transfer.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let store = Arc::new(MemoryStore::new());
        let mut transfer = sample_transfer(2);
        store.record_transfer(&transfer).await.unwrap();
        store
            .transition(&transfer.id, TransferStatus::Pending, TransferStatus::Confirming, None)
            .await
            .unwrap();
        store
            .transition(&transfer.id, TransferStatus::Confirming, TransferStatus::Signed, None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = transfer.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition(&id, TransferStatus::Signed, TransferStatus::Executing, None)
                    .await
                    .unwrap()
            }));
        }
        let winners = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);

        transfer = store.get_transfer(&transfer.id).await.unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::Executing);
        // recorded, confirming, signed, executing
        assert_eq!(store.get_audit_trail(&transfer.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_illegal_edges_are_rejected() {
        let store = MemoryStore::new();
        let transfer = sample_transfer(3);
        store.record_transfer(&transfer).await.unwrap();
        let err = store
            .transition(&transfer.id, TransferStatus::Pending, TransferStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayerError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_destination_hash_cleared_only_before_completion() {
        let store = MemoryStore::new();
        let transfer = sample_transfer(11);
        store.record_transfer(&transfer).await.unwrap();
        for (from, to) in [
            (TransferStatus::Pending, TransferStatus::Confirming),
            (TransferStatus::Confirming, TransferStatus::Signed),
            (TransferStatus::Signed, TransferStatus::Executing),
        ] {
            store.transition(&transfer.id, from, to, None).await.unwrap();
        }

        store.set_destination_tx(&transfer.id, "0xabc").await.unwrap();
        assert!(store.clear_destination_tx(&transfer.id).await.unwrap());
        let cleared = store.get_transfer(&transfer.id).await.unwrap().unwrap();
        assert_eq!(cleared.destination_tx_hash, None);

        store.set_destination_tx(&transfer.id, "0xdef").await.unwrap();
        store.mark_transfer_complete(&transfer.id, None).await.unwrap();
        assert!(!store.clear_destination_tx(&transfer.id).await.unwrap());
        let completed = store.get_transfer(&transfer.id).await.unwrap().unwrap();
        assert_eq!(completed.destination_tx_hash.as_deref(), Some("0xdef"));
    }

    #[tokio::test]
    async fn test_signature_per_relayer_is_unique() {
        let store = MemoryStore::new();
        let transfer = sample_transfer(4);
        store.record_transfer(&transfer).await.unwrap();

        let first = Signature::new(&transfer.id, "0xAAAA000000000000000000000000000000000001", vec![1; 65]);
        let again = Signature::new(&transfer.id, "0xaaaa000000000000000000000000000000000001", vec![2; 65]);
        assert!(store.add_signature(&first).await.unwrap());
        assert!(!store.add_signature(&again).await.unwrap());
        assert_eq!(store.signature_count(&transfer.id).await.unwrap(), 1);
        assert_eq!(store.get_signatures(&transfer.id).await.unwrap()[0].signature, vec![1; 65]);
    }

    #[tokio::test]
    async fn test_processed_means_terminal() {
        let store = MemoryStore::new();
        let transfer = sample_transfer(5);
        store.record_transfer(&transfer).await.unwrap();
        assert!(!store.is_transfer_processed(&transfer.id).await.unwrap());
        store
            .transition(&transfer.id, TransferStatus::Pending, TransferStatus::Failed, Some("rejected"))
            .await
            .unwrap();
        assert!(store.is_transfer_processed(&transfer.id).await.unwrap());
        let stored = store.get_transfer(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.status_reason.as_deref(), Some("rejected"));
    }

    #[tokio::test]
    async fn test_block_range_query() {
        let store = MemoryStore::new();
        for (nonce, block) in [(10u64, 90u64), (11, 100), (12, 105), (13, 120)] {
            let transfer = Transfer::from_event(&lock_event(1, 137, nonce, 5, block), 0);
            store.record_transfer(&transfer).await.unwrap();
        }
        let hits = store.get_transfers_in_block_range(1, 100, 110).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(store.get_transfers_in_block_range(137, 0, 1000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validator_set_versions_only_increase() {
        let store = MemoryStore::new();
        let relayers = vec!["0x01".to_string(), "0x02".to_string()];
        store
            .save_validator_set(&ValidatorSet::new(relayers.clone(), 2, 1))
            .await
            .unwrap();
        assert!(store
            .save_validator_set(&ValidatorSet::new(relayers.clone(), 1, 1))
            .await
            .is_err());
        store
            .save_validator_set(&ValidatorSet::new(relayers, 1, 2))
            .await
            .unwrap();
        assert_eq!(store.latest_validator_set().await.unwrap().unwrap().version, 2);
    }
}
