//! Threshold signature collection
//!
//! A transfer moves `Confirming -> Signed` only when this relayer has
//! recorded its own signature and at least `threshold` distinct authorized
//! signers are stored. Peer signatures may arrive before that and are kept.

use super::message::{recover_signer, sign};
use super::transport::{SignatureBroadcast, SignatureMessage};
use crate::error::{RelayerError, RelayerResult};
use crate::events::format_address;
use crate::state::TransferStore;
use crate::types::{normalize_address, AuditEntry, Signature, Transfer, TransferStatus, ValidatorSet};

use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Sweep batch size for timeout and rebroadcast scans
const SCAN_LIMIT: usize = 500;

/// Outcome of an externally delivered signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Accepted,
    /// This signer already has a signature for the transfer
    Duplicate,
    /// The transfer is already Completed or Failed
    Ignored,
}

pub struct SignatureCoordinator {
    store: Arc<dyn TransferStore>,
    validator_set: RwLock<ValidatorSet>,
    wallet: LocalWallet,
    address: String,
    broadcast: Option<Arc<dyn SignatureBroadcast>>,
    timeout: Duration,
}

impl SignatureCoordinator {
    pub fn new(
        store: Arc<dyn TransferStore>,
        validator_set: ValidatorSet,
        wallet: LocalWallet,
        timeout: Duration,
    ) -> Self {
        let address = format_address(&wallet.address());
        if !validator_set.is_authorized(&address) {
            warn!(
                "Relayer {} is not in the authorized set; its signatures will not count",
                address
            );
        }
        Self {
            store,
            validator_set: RwLock::new(validator_set),
            wallet,
            address,
            broadcast: None,
            timeout,
        }
    }

    pub fn with_broadcast(mut self, broadcast: Arc<dyn SignatureBroadcast>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn validator_set(&self) -> ValidatorSet {
        self.validator_set.read().await.clone()
    }

    /// Persist a newer validator set, then make it current
    pub async fn update_validator_set(&self, set: ValidatorSet) -> RelayerResult<()> {
        set.validate()?;
        self.store.save_validator_set(&set).await?;
        info!(
            "Validator set updated to version {} ({} of {})",
            set.version,
            set.threshold,
            set.relayers.len()
        );
        *self.validator_set.write().await = set;
        Ok(())
    }

    /// Make the configured set current when no newer version is stored.
    /// Returns whether the current set changed.
    pub async fn adopt_configured(&self, configured: ValidatorSet) -> RelayerResult<bool> {
        match self.store.latest_validator_set().await? {
            Some(stored) if stored.version >= configured.version => {
                if stored.version > configured.version {
                    warn!(
                        "Configured validator set version {} is older than stored version {}, keeping the stored set",
                        configured.version, stored.version
                    );
                }
                Ok(false)
            }
            _ => {
                self.update_validator_set(configured).await?;
                Ok(true)
            }
        }
    }

    /// Sign a transfer whose confirmation gate this relayer has passed.
    ///
    /// Signing twice returns the stored signature without re-signing.
    pub async fn sign_local(&self, transfer: &Transfer) -> RelayerResult<Signature> {
        if transfer.status != TransferStatus::Confirming {
            return Err(RelayerError::InvalidStateTransition {
                transfer_id: transfer.id.clone(),
                from: transfer.status.to_string(),
                to: TransferStatus::Signed.to_string(),
            });
        }

        if self.store.has_signed(&transfer.id, &self.address).await? {
            let existing = self
                .store
                .get_signatures(&transfer.id)
                .await?
                .into_iter()
                .find(|s| s.relayer_address == self.address);
            if let Some(existing) = existing {
                return Ok(existing);
            }
        }

        let bytes = sign(&self.wallet, transfer).await?;
        let signature = Signature::new(&transfer.id, &self.address, bytes);
        self.store.add_signature(&signature).await?;
        crate::metrics::record_signature("own");
        debug!("Signed transfer {} as {}", transfer.id, self.address);

        self.publish(&signature).await;
        Ok(signature)
    }

    async fn publish(&self, signature: &Signature) {
        if let Some(broadcast) = &self.broadcast {
            broadcast
                .broadcast(&SignatureMessage::from_signature(signature))
                .await;
        }
    }

    /// Verify and store a signature delivered by a peer.
    ///
    /// The signer is recovered from the canonical message of the locally
    /// recorded transfer; a claimed signer that disagrees is `InvalidSignature`.
    pub async fn accept_signature(
        &self,
        transfer_id: &str,
        claimed_signer: Option<&str>,
        bytes: &[u8],
    ) -> RelayerResult<Acceptance> {
        let transfer = self
            .store
            .get_transfer(transfer_id)
            .await?
            .ok_or_else(|| RelayerError::TransferNotFound {
                transfer_id: transfer_id.to_string(),
            })?;
        if transfer.status.is_terminal() {
            return Ok(Acceptance::Ignored);
        }

        let signer = match recover_signer(&transfer, bytes) {
            Ok(signer) => signer,
            Err(e) => {
                crate::metrics::record_signature("invalid");
                return Err(e);
            }
        };
        if let Some(claimed) = claimed_signer {
            if normalize_address(claimed) != signer {
                crate::metrics::record_signature("invalid");
                return Err(RelayerError::InvalidSignature(format!(
                    "signature for {} recovers to {}, not {}",
                    transfer_id, signer, claimed
                )));
            }
        }

        if !self.validator_set.read().await.is_authorized(&signer) {
            warn!(
                potential_attack = true,
                transfer_id,
                signer = %signer,
                "Rejected signature from unauthorized signer"
            );
            crate::metrics::record_signature("unauthorized");
            let err = RelayerError::UnauthorizedSigner { signer };
            self.store
                .append_audit(&AuditEntry::error(transfer_id, &err))
                .await?;
            return Err(err);
        }

        let added = self
            .store
            .add_signature(&Signature::new(transfer_id, &signer, bytes.to_vec()))
            .await?;
        if added {
            crate::metrics::record_signature("accepted");
            debug!("Accepted signature from {} for {}", signer, transfer_id);
            Ok(Acceptance::Accepted)
        } else {
            crate::metrics::record_signature("duplicate");
            Ok(Acceptance::Duplicate)
        }
    }

    /// Signatures of distinct authorized signers, ordered by signer, if at
    /// least `threshold` of them are stored
    pub async fn collected(&self, transfer_id: &str) -> RelayerResult<Vec<Signature>> {
        let set = self.validator_set.read().await.clone();
        let signatures: Vec<Signature> = self
            .store
            .get_signatures(transfer_id)
            .await?
            .into_iter()
            .filter(|s| set.is_authorized(&s.relayer_address))
            .collect();

        if signatures.len() < set.threshold {
            return Err(RelayerError::InsufficientSignatures {
                transfer_id: transfer_id.to_string(),
                have: signatures.len(),
                need: set.threshold,
            });
        }
        Ok(signatures)
    }

    /// Advance `Confirming -> Signed` once the own signature and the threshold
    /// are both in. Returns whether this call made the transition.
    pub async fn try_finalize(&self, transfer: &Transfer) -> RelayerResult<bool> {
        if transfer.status != TransferStatus::Confirming {
            return Ok(false);
        }
        if !self.store.has_signed(&transfer.id, &self.address).await? {
            return Ok(false);
        }
        let signatures = match self.collected(&transfer.id).await {
            Ok(signatures) => signatures,
            Err(RelayerError::InsufficientSignatures { have, need, .. }) => {
                debug!("Transfer {}: {}/{} signatures", transfer.id, have, need);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let reason = format!("{} signatures collected", signatures.len());
        let moved = self
            .store
            .transition(
                &transfer.id,
                TransferStatus::Confirming,
                TransferStatus::Signed,
                Some(&reason),
            )
            .await?;
        if moved {
            crate::metrics::record_transition(TransferStatus::Signed);
            info!("Transfer {} reached signature threshold", transfer.id);
        }
        Ok(moved)
    }

    /// Escalate transfers that stayed in Confirming past the collection window
    pub async fn sweep_timeouts(&self) -> RelayerResult<usize> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.timeout)
            .map_err(|e| RelayerError::Config(format!("signature timeout: {}", e)))?;
        let mut escalated = 0;

        for transfer in self
            .store
            .get_transfers_by_status(TransferStatus::Confirming, SCAN_LIMIT)
            .await?
        {
            if now - transfer.status_changed_at < window {
                continue;
            }
            if self.try_finalize(&transfer).await? {
                continue;
            }

            let moved = self
                .store
                .transition(
                    &transfer.id,
                    TransferStatus::Confirming,
                    TransferStatus::UnderReview,
                    Some("signature timeout"),
                )
                .await?;
            if moved {
                let have = self.store.signature_count(&transfer.id).await?;
                warn!(
                    "Transfer {} moved to review: signature timeout with {} signatures",
                    transfer.id, have
                );
                let err = RelayerError::SignatureTimeout {
                    transfer_id: transfer.id.clone(),
                };
                self.store
                    .append_audit(&AuditEntry::error(&transfer.id, &err))
                    .await?;
                crate::metrics::record_transition(TransferStatus::UnderReview);
                escalated += 1;
            }
        }
        Ok(escalated)
    }

    /// Push own signatures for transfers still collecting
    pub async fn rebroadcast(&self) -> RelayerResult<usize> {
        if self.broadcast.is_none() {
            return Ok(0);
        }
        let mut sent = 0;
        for transfer in self
            .store
            .get_transfers_by_status(TransferStatus::Confirming, SCAN_LIMIT)
            .await?
        {
            let own = self
                .store
                .get_signatures(&transfer.id)
                .await?
                .into_iter()
                .find(|s| s.relayer_address == self.address);
            if let Some(signature) = own {
                self.publish(&signature).await;
                sent += 1;
            }
        }
        Ok(sent)
    }
}
