// Blockchain module
//
// This module contains the core ledger implementation including:
// - Proof-of-work hash engine and difficulty controller
// - Block and share structures
// - The share/block ledger and chain selection
// - Coin records and the coin ledger
// - Cryptography utilities
// - Persistent storage

pub mod block;
pub mod chain;
pub mod clock;
pub mod coin;
pub mod consensus;
pub mod crypto;
pub mod difficulty;
pub mod hash;
pub mod ledger;
pub mod params;
pub mod storage;
pub mod validator;

// Re-export main components for easier access
pub use chain::{Blockchain, BlockchainError, ChainInfo, ChainState, ShareError, ShareReceipt, Template};
pub use coin::Coin;
pub use crypto::{DigitalSignature, PublicKey, Wallet};
pub use hash::{Digest, HashEngine};
pub use ledger::{CoinError, CoinLedger};
pub use params::ChainParams;
