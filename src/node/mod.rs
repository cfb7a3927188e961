// Node module
//
// Participants of the simulated network:
// - Client: tracks the chain, posts and settles transactions
// - Miner: a client that also searches for proofs of work

pub mod client;
pub mod miner;

pub use client::Client;
pub use miner::Miner;
