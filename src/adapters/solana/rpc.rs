use async_trait::async_trait;
use solana_client::rpc_client::RpcClient;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::Signature,
    transaction::VersionedTransaction,
};
use solana_transaction_status::{
    TransactionConfirmationStatus, TransactionStatus as RpcTransactionStatus,
};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::ports::{ChainError, SignatureStatus, TransactionService, TransactionStatus};

#[derive(Debug, Error)]
pub enum SolanaClientError {
    #[error("RPC request failed: {0}")]
    RpcError(String),
    #[error("Transaction failed: {0}")]
    TransactionError(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Timeout waiting for confirmation")]
    ConfirmationTimeout,
}

impl From<SolanaClientError> for ChainError {
    fn from(e: SolanaClientError) -> Self {
        match e {
            SolanaClientError::RpcError(msg) => ChainError::Rpc(msg),
            SolanaClientError::TransactionError(msg) => ChainError::TransactionFailed(msg),
            SolanaClientError::InvalidSignature(msg) | SolanaClientError::InvalidPublicKey(msg) => {
                ChainError::Rejected(msg)
            }
            SolanaClientError::ConfirmationTimeout => ChainError::Timeout,
        }
    }
}

fn parse_pubkey(value: &str) -> Result<Pubkey, SolanaClientError> {
    Pubkey::from_str(value).map_err(|e| SolanaClientError::InvalidPublicKey(e.to_string()))
}

fn commitment_from(level: &str) -> CommitmentConfig {
    match level {
        "processed" => CommitmentConfig::processed(),
        "finalized" => CommitmentConfig::finalized(),
        _ => CommitmentConfig::confirmed(),
    }
}

/// Wrapper around Solana RPC client with async-compatible methods
#[derive(Clone)]
pub struct SolanaClient {
    client: Arc<RpcClient>,
}

impl SolanaClient {
    /// Create a new Solana RPC client at `confirmed` commitment
    pub fn new(rpc_url: String) -> Self {
        Self::with_commitment(rpc_url, "confirmed")
    }

    /// Create a client with a commitment level from config ("processed", "confirmed", "finalized")
    pub fn with_commitment(rpc_url: String, commitment: &str) -> Self {
        let client = Arc::new(RpcClient::new_with_commitment(
            rpc_url,
            commitment_from(commitment),
        ));
        Self { client }
    }

    /// Get SOL balance for a public key
    pub async fn get_balance(&self, pubkey: &str) -> Result<u64, SolanaClientError> {
        let pubkey = parse_pubkey(pubkey)?;

        // Spawn blocking to make sync RPC call async-compatible
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            client
                .get_balance(&pubkey)
                .map_err(|e| SolanaClientError::RpcError(e.to_string()))
        })
        .await
        .map_err(|e| SolanaClientError::RpcError(format!("Task join error: {}", e)))?
    }

    /// Raw balance of `mint` across every token account `owner` holds.
    /// Wrapped SOL reads the native lamport balance.
    pub async fn get_token_balance(&self, owner: &str, mint: &str) -> Result<u64, SolanaClientError> {
        let owner = parse_pubkey(owner)?;
        let mint = parse_pubkey(mint)?;

        if mint == spl_token::native_mint::id() {
            return self.get_balance(&owner.to_string()).await;
        }

        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let accounts = client
                .get_token_accounts_by_owner(&owner, TokenAccountsFilter::Mint(mint))
                .map_err(|e| SolanaClientError::RpcError(e.to_string()))?;

            let mut total: u64 = 0;
            for keyed in accounts {
                let account = parse_pubkey(&keyed.pubkey)?;
                let balance = client
                    .get_token_account_balance(&account)
                    .map_err(|e| SolanaClientError::RpcError(e.to_string()))?;
                let amount = balance
                    .amount
                    .parse::<u64>()
                    .map_err(|e| SolanaClientError::RpcError(format!("Parse error: {}", e)))?;
                total = total.saturating_add(amount);
            }
            Ok(total)
        })
        .await
        .map_err(|e| SolanaClientError::RpcError(format!("Task join error: {}", e)))?
    }

    /// Send a signed versioned transaction to the network
    pub async fn send_versioned_transaction(
        &self,
        transaction: VersionedTransaction,
    ) -> Result<String, SolanaClientError> {
        let client = Arc::clone(&self.client);

        tokio::task::spawn_blocking(move || {
            client
                .send_transaction(&transaction)
                .map(|sig| sig.to_string())
                .map_err(|e| SolanaClientError::TransactionError(e.to_string()))
        })
        .await
        .map_err(|e| SolanaClientError::RpcError(format!("Task join error: {}", e)))?
    }

    /// Get recent blockhash (needed for transaction building)
    pub async fn get_latest_blockhash(&self) -> Result<solana_sdk::hash::Hash, SolanaClientError> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            client
                .get_latest_blockhash()
                .map_err(|e| SolanaClientError::RpcError(e.to_string()))
        })
        .await
        .map_err(|e| SolanaClientError::RpcError(format!("Task join error: {}", e)))?
    }

    /// Look up one signature, searching transaction history as well as the recent cache
    pub async fn get_signature_status(
        &self,
        signature_str: &str,
    ) -> Result<Option<RpcTransactionStatus>, SolanaClientError> {
        let signature = Signature::from_str(signature_str)
            .map_err(|e| SolanaClientError::InvalidSignature(e.to_string()))?;

        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            client
                .get_signature_statuses_with_history(&[signature])
                .map(|response| response.value.into_iter().next().flatten())
                .map_err(|e| SolanaClientError::RpcError(e.to_string()))
        })
        .await
        .map_err(|e| SolanaClientError::RpcError(format!("Task join error: {}", e)))?
    }
}

/// Map an RPC signature status onto the engine's status model.
/// Processed-only signatures are not yet confirmed and read as `Unknown`.
pub fn classify_status(status: Option<RpcTransactionStatus>) -> SignatureStatus {
    let Some(status) = status else {
        return SignatureStatus::unknown();
    };

    if let Some(err) = status.err {
        return SignatureStatus {
            status: TransactionStatus::Failed,
            slot: Some(status.slot),
            error: Some(err.to_string()),
        };
    }

    let resolved = match status.confirmation_status {
        Some(TransactionConfirmationStatus::Finalized) => TransactionStatus::Finalized,
        Some(TransactionConfirmationStatus::Confirmed) => TransactionStatus::Confirmed,
        Some(TransactionConfirmationStatus::Processed) => TransactionStatus::Unknown,
        // Older nodes omit confirmation_status; no confirmation count means rooted
        None if status.confirmations.is_none() => TransactionStatus::Finalized,
        None => TransactionStatus::Confirmed,
    };

    SignatureStatus {
        status: resolved,
        slot: Some(status.slot),
        error: None,
    }
}

/// `TransactionService` backed by `getSignatureStatuses`
#[derive(Clone)]
pub struct SolanaTransactionService {
    client: SolanaClient,
}

impl SolanaTransactionService {
    pub fn new(client: SolanaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransactionService for SolanaTransactionService {
    async fn get_signature_status(&self, signature: &str) -> Result<SignatureStatus, ChainError> {
        let status = self.client.get_signature_status(signature).await?;
        let classified = classify_status(status);
        debug!(signature, status = ?classified.status, "Signature status");
        Ok(classified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::instruction::InstructionError;
    use solana_sdk::transaction::TransactionError;

    fn rpc_status(
        confirmations: Option<usize>,
        confirmation_status: Option<TransactionConfirmationStatus>,
        err: Option<TransactionError>,
    ) -> RpcTransactionStatus {
        RpcTransactionStatus {
            slot: 1234,
            confirmations,
            status: match &err {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            },
            err,
            confirmation_status,
        }
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = SolanaClient::with_commitment("https://api.devnet.solana.com".to_string(), "finalized");
        assert!(std::mem::size_of_val(&client) > 0);
    }

    #[test]
    fn test_error_display() {
        let err = SolanaClientError::RpcError("test".to_string());
        assert!(err.to_string().contains("RPC request failed"));

        let err = SolanaClientError::ConfirmationTimeout;
        assert!(err.to_string().contains("Timeout"));
    }

    #[test]
    fn test_error_maps_to_chain_error() {
        assert!(ChainError::from(SolanaClientError::RpcError("503".into())).is_retryable());
        assert!(ChainError::from(SolanaClientError::ConfirmationTimeout).is_retryable());
        assert!(!ChainError::from(SolanaClientError::InvalidSignature("bad".into())).is_retryable());
        assert!(matches!(
            ChainError::from(SolanaClientError::TransactionError("x".into())),
            ChainError::TransactionFailed(_)
        ));
    }

    #[test]
    fn test_classify_missing_is_unknown() {
        assert_eq!(classify_status(None).status, TransactionStatus::Unknown);
    }

    #[test]
    fn test_classify_confirmation_levels() {
        let finalized = classify_status(Some(rpc_status(
            None,
            Some(TransactionConfirmationStatus::Finalized),
            None,
        )));
        assert_eq!(finalized.status, TransactionStatus::Finalized);
        assert_eq!(finalized.slot, Some(1234));

        let confirmed = classify_status(Some(rpc_status(
            Some(5),
            Some(TransactionConfirmationStatus::Confirmed),
            None,
        )));
        assert_eq!(confirmed.status, TransactionStatus::Confirmed);

        let processed = classify_status(Some(rpc_status(
            Some(0),
            Some(TransactionConfirmationStatus::Processed),
            None,
        )));
        assert_eq!(processed.status, TransactionStatus::Unknown);

        let legacy_rooted = classify_status(Some(rpc_status(None, None, None)));
        assert_eq!(legacy_rooted.status, TransactionStatus::Finalized);
    }

    #[test]
    fn test_classify_error_is_failed() {
        let failed = classify_status(Some(rpc_status(
            Some(1),
            Some(TransactionConfirmationStatus::Confirmed),
            Some(TransactionError::InstructionError(0, InstructionError::Custom(6001))),
        )));
        assert_eq!(failed.status, TransactionStatus::Failed);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_invalid_signature_is_rejected() {
        let service = SolanaTransactionService::new(SolanaClient::new("http://127.0.0.1:1".to_string()));
        let err = service.get_signature_status("not-a-signature").await.unwrap_err();
        assert!(matches!(err, ChainError::Rejected(_)));
    }
}
