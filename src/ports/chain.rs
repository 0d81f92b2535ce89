//! Chain Position Port
//!
//! Interface to DLMM pools and positions, plus the fee harvester. Amounts on
//! positions are UI amounts (decimals applied); balances and harvest results
//! are raw base units.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ChainError {
    /// Transport-level failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChainError::Rpc(_) | ChainError::Timeout | ChainError::Unavailable(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub token_x: String,
    pub token_y: String,
    /// Price of X denominated in Y
    pub active_price: f64,
    pub bin_step: u16,
    pub token_x_decimals: u8,
    pub token_y_decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionOnChainInfo {
    pub total_x_amount: Decimal,
    pub total_y_amount: Decimal,
    /// Unclaimed fees
    pub fee_x: Decimal,
    pub fee_y: Decimal,
    pub pool_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePositionRequest {
    pub pool_address: String,
    pub owner: String,
    pub lower_bin: i32,
    pub upper_bin: i32,
    /// Base (Y) asset deposited, UI amount
    pub amount_y: Decimal,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionOpResult {
    pub success: bool,
    pub address: Option<String>,
    pub signature: Option<String>,
    pub error: Option<String>,
}

impl PositionOpResult {
    pub fn ok(address: &str, signature: &str) -> Self {
        Self {
            success: true,
            address: Some(address.to_string()),
            signature: Some(signature.to_string()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HarvestResult {
    pub signature: Option<String>,
    /// Raw base units of token X claimed
    pub harvested_x: u64,
    /// Raw base units of token Y claimed
    pub harvested_y: u64,
    pub fee_lamports: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainPositionProvider: Send + Sync {
    async fn get_active_bin(&self, pool: &str) -> Result<i32, ChainError>;

    async fn get_pool_info(&self, pool: &str) -> Result<PoolInfo, ChainError>;

    async fn get_position_on_chain_info(&self, address: &str) -> Result<PositionOnChainInfo, ChainError>;

    async fn create_position(&self, request: CreatePositionRequest) -> Result<PositionOpResult, ChainError>;

    async fn close_position(&self, address: &str) -> Result<PositionOpResult, ChainError>;

    /// Raw balance of `mint` held by `owner`
    async fn get_token_balance(&self, owner: &str, mint: &str) -> Result<u64, ChainError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait YieldHarvester: Send + Sync {
    /// Claim fees of `positions` in `pool` in a single transaction.
    async fn harvest(&self, pool: &str, positions: &[String]) -> Result<HarvestResult, ChainError>;
}

/// Convert raw base units to a UI amount.
pub fn to_ui_amount(raw: u64, decimals: u8) -> Decimal {
    Decimal::from_i128_with_scale(raw as i128, decimals as u32)
}
