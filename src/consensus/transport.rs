//! Peer signature exchange over HTTP
//!
//! Each relayer pushes its own signatures to every peer's
//! `POST /v1/signatures`. Receivers recover the signer from the canonical
//! message they compute themselves, so the payload needs no further
//! authentication. Delivery is at-least-once; receivers are idempotent.

use crate::error::{RelayerError, RelayerResult};
use crate::types::Signature;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Wire form of one attestation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureMessage {
    pub transfer_id: String,
    pub signer: String,
    /// 0x-prefixed 65-byte signature
    pub signature: String,
}

impl SignatureMessage {
    pub fn from_signature(signature: &Signature) -> Self {
        Self {
            transfer_id: signature.transfer_id.clone(),
            signer: signature.relayer_address.clone(),
            signature: format!("0x{}", hex::encode(&signature.signature)),
        }
    }

    pub fn signature_bytes(&self) -> RelayerResult<Vec<u8>> {
        hex::decode(self.signature.trim_start_matches("0x"))
            .map_err(|e| RelayerError::InvalidSignature(format!("not hex: {}", e)))
    }
}

/// Outbound side of signature exchange
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignatureBroadcast: Send + Sync {
    /// Push to all peers; returns how many accepted it
    async fn broadcast(&self, message: &SignatureMessage) -> usize;
}

/// Pushes signatures to peer relayers' APIs
pub struct HttpTransport {
    client: reqwest::Client,
    peers: Vec<String>,
}

impl HttpTransport {
    pub fn new(peers: Vec<String>, request_timeout: Duration) -> RelayerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayerError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client, peers })
    }

    async fn push(&self, peer: &str, message: &SignatureMessage) -> RelayerResult<()> {
        let url = format!("{}/v1/signatures", peer.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(message)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayerError::Timeout {
                        operation: format!("signature push to {}", peer),
                    }
                } else {
                    RelayerError::Internal(format!("signature push to {}: {}", peer, e))
                }
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(RelayerError::Internal(format!(
                "peer {} answered {}",
                peer,
                resp.status()
            )))
        }
    }
}

#[async_trait]
impl SignatureBroadcast for HttpTransport {
    async fn broadcast(&self, message: &SignatureMessage) -> usize {
        let pushes = self.peers.iter().map(|peer| async move {
            match self.push(peer, message).await {
                Ok(()) => true,
                Err(e) => {
                    // the periodic rebroadcast retries it
                    warn!("Signature for {} not delivered: {}", message.transfer_id, e);
                    false
                }
            }
        });
        let delivered = futures::future::join_all(pushes)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        debug!(
            "Signature for {} delivered to {}/{} peers",
            message.transfer_id,
            delivered,
            self.peers.len()
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let signature = Signature::new("0x01", "0xABCD", vec![0xde, 0xad]);
        let message = SignatureMessage::from_signature(&signature);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["transferId"], "0x01");
        assert_eq!(json["signer"], "0xabcd");
        assert_eq!(json["signature"], "0xdead");
        assert_eq!(message.signature_bytes().unwrap(), vec![0xde, 0xad]);
    }

    #[tokio::test]
    async fn test_unreachable_peers_count_as_undelivered() {
        let transport = HttpTransport::new(
            vec!["http://127.0.0.1:9".to_string()],
            Duration::from_millis(200),
        )
        .unwrap();
        let message = SignatureMessage {
            transfer_id: "0x01".into(),
            signer: "0x02".into(),
            signature: "0x03".into(),
        };
        assert_eq!(transport.broadcast(&message).await, 0);
    }
}
