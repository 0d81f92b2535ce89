//! Swap Service Port

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::chain::ChainError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapParams {
    pub input_mint: String,
    pub output_mint: String,
    /// Raw base units of the input token
    pub amount: u64,
    pub slippage_bps: u16, // basis points (1 = 0.01%)
    pub user_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapOutcome {
    pub output_amount: u64,
    pub signature: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapService: Send + Sync {
    async fn execute_swap(&self, params: SwapParams) -> Result<SwapOutcome, ChainError>;
}
