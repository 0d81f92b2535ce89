//! Engine Errors
//!
//! Error taxonomy shared by the executor, the manager and the per-instance workflows.

use thiserror::Error;

use crate::domain::instance::InstanceStatus;
use crate::domain::state::Phase;
use crate::ports::{ChainError, StorageError};

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Missing or invalid instance configuration (fatal)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wallet is locked")]
    WalletLocked,

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Unsupported strategy type: {0}")]
    UnsupportedStrategy(String),

    #[error("Cannot {action} instance {instance_id} in phase {phase:?}")]
    InvalidTransition {
        instance_id: String,
        phase: Phase,
        action: &'static str,
    },

    #[error("Cannot {action} instance {instance_id} with status {status:?}")]
    InvalidStatus {
        instance_id: String,
        status: InstanceStatus,
        action: &'static str,
    },

    /// A late result arrived after the instance moved on (stopped, paused, errored)
    #[error("Instance {instance_id} left phase {expected:?} (now {actual:?})")]
    PhaseChanged {
        instance_id: String,
        expected: Phase,
        actual: Phase,
    },

    #[error("Swap already in progress for instance {0}")]
    SwapLockBusy(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Retry policy ran out of attempts on a transient chain failure
    #[error("Retry policy '{policy}' exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        policy: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Position creation failed: {0}")]
    CreationFailed(String),

    #[error("Cleanup failed for instance {instance_id} after {attempts} attempts")]
    CleanupExhausted { instance_id: String, attempts: u32 },

    /// No position could be closed while exiting
    #[error("Exit failed for instance {instance_id}: {reason}")]
    ExitFailed { instance_id: String, reason: String },

    #[error("Market data unavailable: {0}")]
    MarketData(String),
}

impl EngineError {
    /// Transient errors end the current tick normally; the next cycle retries.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::RetryExhausted { .. }
            | EngineError::MarketData(_)
            | EngineError::SwapLockBusy(_) => true,
            EngineError::Chain(e) => e.is_retryable(),
            _ => false,
        }
    }
}
