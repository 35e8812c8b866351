//! Canonical attestation message
//!
//! Relayers sign `keccak256(abi.encode(bytes32 transferId, address token,
//! uint256 sourceChain, uint256 amount, address recipient, uint256 destChain))`
//! with the EIP-191 personal-message prefix, which is what the bridge
//! contract's `ecrecover` path expects.

use crate::error::{RelayerError, RelayerResult};
use crate::events::{format_address, parse_address};
use crate::types::{keccak256, transfer_id_bytes, Transfer};

use ethers::abi::{encode, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Signature as EcdsaSignature, U256};

/// Length of an `r || s || v` signature
pub const SIGNATURE_LEN: usize = 65;

/// ABI-encoded canonical message for a transfer
pub fn encode_message(transfer: &Transfer) -> RelayerResult<Vec<u8>> {
    let evm_address = |field: &str, value: &str| {
        parse_address(value).map_err(|_| {
            RelayerError::Validation(format!("{} {} is not an EVM address", field, value))
        })
    };

    Ok(encode(&[
        Token::FixedBytes(transfer_id_bytes(&transfer.id)?.to_vec()),
        Token::Address(evm_address("token", &transfer.token)?),
        Token::Uint(U256::from(transfer.source_chain)),
        Token::Uint(transfer.amount.as_u256()),
        Token::Address(evm_address("recipient", &transfer.recipient)?),
        Token::Uint(U256::from(transfer.destination_chain)),
    ]))
}

/// Digest every relayer signs for `transfer`
pub fn message_digest(transfer: &Transfer) -> RelayerResult<[u8; 32]> {
    Ok(keccak256(&encode_message(transfer)?))
}

/// Sign the canonical message, returning the 65-byte signature
pub async fn sign(wallet: &LocalWallet, transfer: &Transfer) -> RelayerResult<Vec<u8>> {
    let digest = message_digest(transfer)?;
    let signature = wallet
        .sign_message(&digest[..])
        .await
        .map_err(|e| RelayerError::Wallet(format!("signing failed: {}", e)))?;
    Ok(signature.to_vec())
}

/// Recover the lowercase signer address of `bytes` over `transfer`'s message
pub fn recover_signer(transfer: &Transfer, bytes: &[u8]) -> RelayerResult<String> {
    if bytes.len() != SIGNATURE_LEN {
        return Err(RelayerError::InvalidSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LEN,
            bytes.len()
        )));
    }
    let signature = EcdsaSignature::try_from(bytes)
        .map_err(|e| RelayerError::InvalidSignature(e.to_string()))?;
    let digest = message_digest(transfer)?;
    let signer = signature
        .recover(&digest[..])
        .map_err(|e| RelayerError::InvalidSignature(e.to_string()))?;
    Ok(format_address(&signer))
}
