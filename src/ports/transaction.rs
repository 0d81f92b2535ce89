//! Transaction Service Port
//!
//! Signature status lookups. Bounded polling lives with the retry policies in
//! the application layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::chain::ChainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Confirmed,
    Finalized,
    Failed,
    Unknown,
}

impl TransactionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransactionStatus::Confirmed | TransactionStatus::Finalized)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureStatus {
    pub status: TransactionStatus,
    pub slot: Option<u64>,
    pub error: Option<String>,
}

impl SignatureStatus {
    pub fn unknown() -> Self {
        Self {
            status: TransactionStatus::Unknown,
            slot: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub status: TransactionStatus,
    pub slot: Option<u64>,
    pub error: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionService: Send + Sync {
    /// Current status of `signature`. Not yet visible is `Unknown`, not an error.
    async fn get_signature_status(&self, signature: &str) -> Result<SignatureStatus, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_confirmed_and_finalized_succeed() {
        assert!(TransactionStatus::Confirmed.is_success());
        assert!(TransactionStatus::Finalized.is_success());
        assert!(!TransactionStatus::Failed.is_success());
        assert!(!TransactionStatus::Unknown.is_success());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_value(SignatureStatus::unknown()).unwrap();
        assert_eq!(json["status"], "unknown");
        assert!(json["slot"].is_null());
    }
}
