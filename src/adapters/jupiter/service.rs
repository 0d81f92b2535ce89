//! Jupiter-backed `SwapService`
//!
//! Quote, build, sign with the wallet keypair, then submit through the Solana RPC
//! client.

use std::sync::Arc;

use async_trait::async_trait;
use solana_sdk::signer::Signer;
use solana_sdk::transaction::VersionedTransaction;
use tracing::{debug, info};

use super::client::JupiterClient;
use super::quote::QuoteRequest;
use super::swap::SwapRequest;
use crate::adapters::solana::SolanaClient;
use crate::config::JupiterSection;
use crate::ports::{ChainError, SwapOutcome, SwapParams, SwapService, WalletService};

pub struct JupiterSwapService {
    client: JupiterClient,
    solana: SolanaClient,
    wallet: Arc<dyn WalletService>,
    settings: JupiterSection,
}

impl JupiterSwapService {
    pub fn new(
        client: JupiterClient,
        solana: SolanaClient,
        wallet: Arc<dyn WalletService>,
        settings: JupiterSection,
    ) -> Self {
        Self {
            client,
            solana,
            wallet,
            settings,
        }
    }
}

#[async_trait]
impl SwapService for JupiterSwapService {
    async fn execute_swap(&self, params: SwapParams) -> Result<SwapOutcome, ChainError> {
        let keypair = self
            .wallet
            .get_current_keypair()
            .ok_or_else(|| ChainError::Rejected("Wallet is locked".into()))?;
        if keypair.pubkey().to_string() != params.user_public_key {
            return Err(ChainError::Rejected(format!(
                "Swap owner {} does not match the unlocked wallet",
                params.user_public_key
            )));
        }

        let quote_request = QuoteRequest::new(
            params.input_mint.clone(),
            params.output_mint.clone(),
            params.amount,
            params.slippage_bps,
        )
        .with_restricted_intermediates(self.settings.restrict_intermediate_tokens);
        let quote = self.client.get_quote(&quote_request).await?;

        debug!(
            input_mint = %params.input_mint,
            output_mint = %params.output_mint,
            amount = params.amount,
            out_amount = quote.output_amount(),
            price_impact = quote.price_impact(),
            route = ?quote.route_labels(),
            "Jupiter quote"
        );

        let quote_value = serde_json::to_value(&quote)
            .map_err(|e| ChainError::Rejected(format!("Failed to encode quote: {}", e)))?;
        let swap_request = SwapRequest::new(params.user_public_key.clone(), quote_value)
            .with_priority(
                &self.settings.priority_level,
                self.settings.max_priority_fee_lamports,
            )
            .with_dynamic_compute_limit(self.settings.dynamic_compute_units);
        let swap = self.client.get_swap_transaction(&swap_request).await?;

        let unsigned = swap.decode_transaction()?;
        let signed = VersionedTransaction::try_new(unsigned.message, &[keypair.as_ref()])
            .map_err(|e| ChainError::Rejected(format!("Failed to sign swap: {}", e)))?;

        let signature = self.solana.send_versioned_transaction(signed).await?;

        info!(
            %signature,
            input_mint = %params.input_mint,
            output_mint = %params.output_mint,
            amount = params.amount,
            expected_out = quote.output_amount(),
            "Swap submitted"
        );

        Ok(SwapOutcome {
            output_amount: quote.output_amount(),
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::jupiter::JupiterConfig;
    use crate::adapters::solana::KeypairWallet;
    use crate::ports::mocks::FakeWallet;
    use solana_sdk::signature::Keypair;

    fn service(wallet: Arc<dyn WalletService>) -> JupiterSwapService {
        JupiterSwapService::new(
            JupiterClient::with_config(JupiterConfig {
                api_base_url: "http://127.0.0.1:1".to_string(),
                ..JupiterConfig::default()
            })
            .unwrap(),
            SolanaClient::new("http://127.0.0.1:1".to_string()),
            wallet,
            JupiterSection::default(),
        )
    }

    fn params(owner: &str) -> SwapParams {
        SwapParams {
            input_mint: "X".into(),
            output_mint: "Y".into(),
            amount: 1_000,
            slippage_bps: 100,
            user_public_key: owner.to_string(),
        }
    }

    #[tokio::test]
    async fn test_locked_wallet_rejected() {
        let svc = service(Arc::new(FakeWallet::locked("pw")));
        let err = svc.execute_swap(params("anyone")).await.unwrap_err();
        assert_eq!(err, ChainError::Rejected("Wallet is locked".into()));
    }

    #[tokio::test]
    async fn test_owner_mismatch_rejected() {
        let svc = service(Arc::new(KeypairWallet::ephemeral(Keypair::new())));
        let other = Keypair::new().pubkey().to_string();
        let err = svc.execute_swap(params(&other)).await.unwrap_err();
        assert!(matches!(err, ChainError::Rejected(_)));
    }
}
