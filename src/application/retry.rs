//! Retry Executor
//!
//! Runs an operation under a named retry policy with an optional result
//! validator. Retryable errors are retried with back-off, fatal errors return
//! immediately, and a result the validator refuses counts as a failed attempt.
//!
//! Signature verification polls under the `verification` policy: `failed` is
//! terminal, `unknown` is polled again.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::EngineError;
use crate::ports::{
    ChainError, SignatureStatus, TransactionService, TransactionStatus, VerificationResult,
};

pub const CHAIN_READ: &str = "chain_read";
pub const TRANSACTION_SUBMIT: &str = "transaction_submit";
pub const VERIFICATION: &str = "verification";
pub const CLEANUP: &str = "cleanup";
pub const SWAP: &str = "swap";

/// Signature polls per verification
pub const VERIFICATION_ATTEMPTS: u32 = 4;

/// Errors that know whether another attempt may succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ChainError {
    fn is_retryable(&self) -> bool {
        ChainError::is_retryable(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// base, 2·base, 3·base, ...
    Linear,
    /// base, 2·base, 4·base, ...
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub name: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(name: &str, max_attempts: u32, base_delay: Duration, backoff: Backoff) -> Self {
        Self {
            name: name.to_string(),
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(30),
            backoff,
        }
    }

    pub fn chain_read() -> Self {
        Self::new(CHAIN_READ, 3, Duration::from_millis(500), Backoff::Exponential)
    }

    pub fn transaction_submit() -> Self {
        Self::new(TRANSACTION_SUBMIT, 3, Duration::from_secs(1), Backoff::Exponential)
    }

    /// Signature polling: 1s, 2s, 3s between attempts
    pub fn verification(attempts: u32) -> Self {
        Self::new(VERIFICATION, attempts, Duration::from_secs(1), Backoff::Linear)
    }

    /// Position cleanup: 2s, 4s, 8s between attempts
    pub fn cleanup() -> Self {
        Self::new(CLEANUP, 3, Duration::from_secs(2), Backoff::Exponential)
    }

    pub fn swap() -> Self {
        Self::new(SWAP, 2, Duration::from_secs(1), Backoff::Fixed)
    }

    pub fn without_delay(mut self) -> Self {
        self.base_delay = Duration::ZERO;
        self
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        delay.min(self.max_delay)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    #[error("{0}")]
    Fatal(E),

    #[error("Policy '{policy}' exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        policy: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Policy '{policy}' rejected the result of all {attempts} attempts")]
    Rejected { policy: String, attempts: u32 },
}

impl From<RetryError<ChainError>> for EngineError {
    fn from(err: RetryError<ChainError>) -> Self {
        match err {
            RetryError::Fatal(e) => EngineError::Chain(e),
            RetryError::Exhausted { policy, attempts, last_error } => {
                EngineError::RetryExhausted { policy, attempts, last_error }
            }
            RetryError::Rejected { policy, attempts } => EngineError::RetryExhausted {
                policy,
                attempts,
                last_error: "result rejected by validator".to_string(),
            },
        }
    }
}

/// `retry(operation, is_acceptable, policy)`
pub async fn retry<T, E, F, Fut, V>(
    policy: &RetryPolicy,
    mut operation: F,
    is_acceptable: V,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
    V: Fn(&T) -> bool,
{
    let mut last_error: Option<String> = None;

    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Ok(value) if is_acceptable(&value) => {
                if attempt > 1 {
                    debug!(policy = %policy.name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Ok(_) => {
                debug!(policy = %policy.name, attempt, "Result rejected by validator");
                last_error = None;
            }
            Err(e) if !e.is_retryable() => return Err(RetryError::Fatal(e)),
            Err(e) => {
                warn!(
                    policy = %policy.name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Retryable failure"
                );
                last_error = Some(e.to_string());
            }
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
    }

    Err(match last_error {
        Some(last_error) => RetryError::Exhausted {
            policy: policy.name.clone(),
            attempts: policy.max_attempts,
            last_error,
        },
        None => RetryError::Rejected {
            policy: policy.name.clone(),
            attempts: policy.max_attempts,
        },
    })
}

/// Poll `signature` until it confirms, fails, or `policy` runs out.
pub async fn verify_transaction_with_retry(
    transactions: &dyn TransactionService,
    signature: &str,
    policy: &RetryPolicy,
) -> VerificationResult {
    let outcome = retry(
        policy,
        || transactions.get_signature_status(signature),
        |s: &SignatureStatus| s.status != TransactionStatus::Unknown,
    )
    .await;

    match outcome {
        Ok(s) => {
            debug!(signature, status = ?s.status, slot = ?s.slot, "Signature resolved");
            VerificationResult {
                success: s.status.is_success(),
                status: s.status,
                slot: s.slot,
                error: s.error,
            }
        }
        Err(e) => {
            if matches!(e, RetryError::Fatal(_)) {
                warn!(signature, error = %e, "Signature lookup failed");
            } else {
                warn!(signature, attempts = policy.max_attempts, "Signature not confirmed in time");
            }
            VerificationResult {
                success: false,
                status: TransactionStatus::Unknown,
                slot: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Registry of named policies shared by every chain-touching component
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policies: HashMap<String, RetryPolicy>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    pub fn new() -> Self {
        let policies = [
            RetryPolicy::chain_read(),
            RetryPolicy::transaction_submit(),
            RetryPolicy::verification(VERIFICATION_ATTEMPTS),
            RetryPolicy::cleanup(),
            RetryPolicy::swap(),
        ]
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect();
        Self { policies }
    }

    /// Standard policies with every back-off delay removed
    pub fn without_delays() -> Self {
        let mut executor = Self::new();
        for policy in executor.policies.values_mut() {
            policy.base_delay = Duration::ZERO;
        }
        executor
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policies.insert(policy.name.clone(), policy);
        self
    }

    /// Policy by name; unknown names fall back to `chain_read`
    pub fn policy(&self, name: &str) -> RetryPolicy {
        match self.policies.get(name) {
            Some(p) => p.clone(),
            None => {
                warn!(policy = name, "Unknown retry policy, using chain_read");
                let mut fallback = RetryPolicy::chain_read();
                fallback.name = name.to_string();
                fallback
            }
        }
    }

    pub async fn run<T, E, F, Fut>(&self, policy: &str, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        retry(&self.policy(policy), operation, |_| true).await
    }

    /// `verify_transaction_with_retry` under the `verification` policy
    pub async fn verify_transaction(
        &self,
        transactions: &dyn TransactionService,
        signature: &str,
    ) -> VerificationResult {
        verify_transaction_with_retry(transactions, signature, &self.policy(VERIFICATION)).await
    }

    pub async fn run_validated<T, E, F, Fut, V>(
        &self,
        policy: &str,
        operation: F,
        is_acceptable: V,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
        V: Fn(&T) -> bool,
    {
        retry(&self.policy(policy), operation, is_acceptable).await
    }
}
