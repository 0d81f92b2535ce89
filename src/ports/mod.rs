//! Ports Layer - Trait definitions for external dependencies
//!
//! This module defines the interfaces (ports) that adapters must implement.
//! Following hexagonal architecture, these traits abstract:
//! - DLMM pools and positions (read, create, close, harvest)
//! - Transaction verification
//! - Token swaps
//! - Wallet access
//! - Instance persistence
//! - Event publication
//! - Time

pub mod chain;
pub mod clock;
pub mod events;
pub mod mocks;
pub mod storage;
pub mod swap;
pub mod transaction;
pub mod wallet;

pub use chain::{
    to_ui_amount, ChainError, ChainPositionProvider, CreatePositionRequest, HarvestResult,
    PoolInfo, PositionOnChainInfo, PositionOpResult, YieldHarvester,
};
pub use clock::{Clock, SystemClock};
pub use events::{topics, EventBus, NoopEventBus};
pub use storage::{StorageError, StrategyStorage};
pub use swap::{SwapOutcome, SwapParams, SwapService};
pub use transaction::{SignatureStatus, TransactionService, TransactionStatus, VerificationResult};
pub use wallet::WalletService;
