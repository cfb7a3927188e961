// Blockchain module
//
// This module contains the consensus core:
// - Block structure and ledger state transitions
// - Transaction structure
// - Chain configuration and genesis construction
// - Cryptography utilities

pub mod block;
pub mod chain;
pub mod crypto;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, ChainConfig, ChainError, Participant};
pub use crypto::{Address, Wallet};
pub use transaction::{Output, Transaction, TransactionRejection};
