//! Adapters Layer - External System Implementations
//!
//! Implementations of the port traits:
//! - Solana: RPC client, signature verification and keypair wallet
//! - Jupiter: swap service used for residual liquidation
//! - Storage: one JSON file per instance
//! - Events: broadcast event bus
//! - Paper: simulated DLMM pool for `run --paper`
//! - CLI: command-line interface handlers

pub mod cli;
pub mod events;
pub mod jupiter;
pub mod paper;
pub mod solana;
pub mod storage;

pub use cli::CliApp;
pub use events::{BroadcastEventBus, EngineEvent};
pub use jupiter::{JupiterClient, JupiterSwapService};
pub use paper::PaperChain;
pub use solana::{KeypairWallet, SolanaClient, SolanaTransactionService};
pub use storage::JsonFileStorage;
