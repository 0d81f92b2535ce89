//! Jupiter Swap Types
//!
//! Request and response structures for the Jupiter swap API, plus decoding of the
//! returned transaction.

use base64::Engine;
use serde::{Deserialize, Serialize};
use solana_sdk::transaction::VersionedTransaction;

use crate::ports::ChainError;

/// Priority fee selection sent to `/swap`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityLevelWithMaxLamports {
    /// "medium", "high" or "veryHigh"
    pub priority_level: String,
    pub max_lamports: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrioritizationFee {
    pub priority_level_with_max_lamports: PriorityLevelWithMaxLamports,
}

/// Request parameters for building a swap transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRequest {
    pub user_public_key: String,
    /// The full quote response from `/quote`
    pub quote_response: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prioritization_fee_lamports: Option<PrioritizationFee>,
    pub dynamic_compute_unit_limit: bool,
    /// Wrap and unwrap SOL around the swap
    pub wrap_and_unwrap_sol: bool,
}

impl SwapRequest {
    pub fn new(user_public_key: String, quote_response: serde_json::Value) -> Self {
        Self {
            user_public_key,
            quote_response,
            prioritization_fee_lamports: None,
            dynamic_compute_unit_limit: true,
            wrap_and_unwrap_sol: true,
        }
    }

    /// Cap the priority fee at `max_lamports` for the given level
    pub fn with_priority(mut self, level: &str, max_lamports: u64) -> Self {
        self.prioritization_fee_lamports = Some(PrioritizationFee {
            priority_level_with_max_lamports: PriorityLevelWithMaxLamports {
                priority_level: level.to_string(),
                max_lamports,
            },
        });
        self
    }

    pub fn with_dynamic_compute_limit(mut self, enabled: bool) -> Self {
        self.dynamic_compute_unit_limit = enabled;
        self
    }
}

/// Response from Jupiter swap API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapResponse {
    /// Base64 encoded, bincode serialized, unsigned versioned transaction
    pub swap_transaction: String,
    pub last_valid_block_height: u64,
    #[serde(default)]
    pub prioritization_fee_lamports: u64,
}

impl SwapResponse {
    /// Get the transaction bytes from base64
    pub fn transaction_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.swap_transaction)
    }

    /// Decode the unsigned transaction
    pub fn decode_transaction(&self) -> Result<VersionedTransaction, ChainError> {
        let bytes = self
            .transaction_bytes()
            .map_err(|e| ChainError::Rejected(format!("Invalid base64 swap transaction: {}", e)))?;
        bincode::deserialize(&bytes)
            .map_err(|e| ChainError::Rejected(format!("Invalid swap transaction: {}", e)))
    }

    /// Check if transaction is still valid based on current block height
    pub fn is_valid_at_height(&self, current_height: u64) -> bool {
        current_height <= self.last_valid_block_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::message::{v0, VersionedMessage};
    use solana_sdk::signature::{Keypair, Signer};

    fn encoded_unsigned_tx(payer: &Keypair) -> String {
        let message = v0::Message::try_compile(&payer.pubkey(), &[], &[], Hash::default()).unwrap();
        let tx = VersionedTransaction {
            signatures: vec![Default::default()],
            message: VersionedMessage::V0(message),
        };
        base64::engine::general_purpose::STANDARD.encode(bincode::serialize(&tx).unwrap())
    }

    #[test]
    fn test_swap_request_serialization() {
        let req = SwapRequest::new("wallet123".to_string(), serde_json::json!({"test": "data"}))
            .with_priority("veryHigh", 5_000_000);

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["userPublicKey"], "wallet123");
        assert_eq!(json["dynamicComputeUnitLimit"], true);
        assert_eq!(json["wrapAndUnwrapSol"], true);
        assert_eq!(
            json["prioritizationFeeLamports"]["priorityLevelWithMaxLamports"]["priorityLevel"],
            "veryHigh"
        );
        assert_eq!(
            json["prioritizationFeeLamports"]["priorityLevelWithMaxLamports"]["maxLamports"],
            5_000_000
        );
    }

    #[test]
    fn test_priority_omitted_when_unset() {
        let req = SwapRequest::new("wallet".into(), serde_json::json!({}))
            .with_dynamic_compute_limit(false);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("prioritizationFeeLamports").is_none());
        assert_eq!(json["dynamicComputeUnitLimit"], false);
    }

    #[test]
    fn test_decode_transaction() {
        let payer = Keypair::new();
        let response = SwapResponse {
            swap_transaction: encoded_unsigned_tx(&payer),
            last_valid_block_height: 1000,
            prioritization_fee_lamports: 5000,
        };

        let tx = response.decode_transaction().unwrap();
        assert_eq!(tx.message.static_account_keys()[0], payer.pubkey());
        assert!(response.is_valid_at_height(1000));
        assert!(!response.is_valid_at_height(1001));
    }

    #[test]
    fn test_decode_garbage_is_rejected() {
        let response = SwapResponse {
            swap_transaction: "not base64 !!".to_string(),
            last_valid_block_height: 0,
            prioritization_fee_lamports: 0,
        };
        assert!(matches!(response.decode_transaction(), Err(ChainError::Rejected(_))));
    }
}
