pub mod rpc;
pub mod wallet;

pub use rpc::{SolanaClient, SolanaClientError, SolanaTransactionService};
pub use wallet::{KeypairWallet, WalletError};
