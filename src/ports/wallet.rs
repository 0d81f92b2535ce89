//! Wallet Service Port

use std::sync::Arc;

use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;

#[cfg_attr(test, mockall::automock)]
pub trait WalletService: Send + Sync {
    fn is_unlocked(&self) -> bool;

    /// The signing keypair, `None` while locked
    fn get_current_keypair(&self) -> Option<Arc<Keypair>>;

    fn unlock(&self, password: &str) -> bool;

    /// Base58 public key of the unlocked wallet
    fn public_key(&self) -> Option<String> {
        self.get_current_keypair().map(|k| k.pubkey().to_string())
    }
}
