//! Jupiter API Client
//!
//! HTTP client for the Jupiter swap API. Transport and rate-limit failures map to
//! retryable `ChainError`s; the caller's retry policy decides how often to try again.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::quote::{QuoteRequest, QuoteResponse};
use super::swap::{SwapRequest, SwapResponse};
use crate::config::JupiterSection;
use crate::ports::ChainError;

/// Jupiter API client configuration
#[derive(Debug, Clone)]
pub struct JupiterConfig {
    pub api_base_url: String,
    /// Optional API key for higher rate limits
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for JupiterConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://lite-api.jup.ag/swap/v1".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl JupiterConfig {
    pub fn from_section(section: &JupiterSection) -> Self {
        Self {
            api_base_url: section.api_url.trim_end_matches('/').to_string(),
            api_key: section.get_api_key(),
            ..Self::default()
        }
    }
}

fn transport_error(e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout
    } else {
        ChainError::Rpc(e.to_string())
    }
}

/// Classify a non-success HTTP status. 429 and 5xx are worth retrying.
pub(crate) fn status_error(status: StatusCode, body: &str) -> ChainError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ChainError::Unavailable("Rate limit exceeded".into());
    }
    if status.is_server_error() {
        return ChainError::Unavailable(format!("Server error {}: {}", status, body));
    }
    if body.contains("SlippageToleranceExceeded") || body.contains("6001") {
        return ChainError::Rejected("Slippage tolerance exceeded".into());
    }
    ChainError::Rejected(format!("API error {}: {}", status, body))
}

#[derive(Debug, Clone)]
pub struct JupiterClient {
    config: JupiterConfig,
    http: Client,
}

impl JupiterClient {
    pub fn with_config(config: JupiterConfig) -> Result<Self, ChainError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ChainError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, http })
    }

    /// Get a quote for a token swap
    pub async fn get_quote(&self, request: &QuoteRequest) -> Result<QuoteResponse, ChainError> {
        let url = format!("{}/quote", self.config.api_base_url);

        let mut req = self.http.get(&url).query(&request.query_pairs());
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("x-api-key", api_key);
        }

        let response = req.send().await.map_err(transport_error)?;
        self.handle_response(response).await
    }

    /// Build the unsigned swap transaction for a quote
    pub async fn get_swap_transaction(&self, request: &SwapRequest) -> Result<SwapResponse, ChainError> {
        let url = format!("{}/swap", self.config.api_base_url);

        let mut req = self.http.post(&url).json(request);
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("x-api-key", api_key);
        }

        let response = req.send().await.map_err(transport_error)?;
        self.handle_response(response).await
    }

    async fn handle_response<T: for<'de> Deserialize<'de>>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ChainError> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ChainError::Rejected(format!("Failed to parse response: {}", e)))
    }

    pub fn api_base_url(&self) -> &str {
        &self.config.api_base_url
    }
}
