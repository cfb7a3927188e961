use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::blockchain::{Address, Block, Transaction};

/// Everything nodes say to each other, keyed by event type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// A new transaction entering the network
    PostTransaction(Transaction),

    /// A freshly mined block
    ProofFound(Block),

    /// A request for the block with id `missing`, to be answered to `from`
    MissingBlock { from: Address, missing: String },

    /// A miner's signal to itself to run another mining round
    StartMining,
}

impl Message {
    /// The event name carried on the wire
    pub fn event(&self) -> &'static str {
        match self {
            Message::PostTransaction(_) => "POST_TRANSACTION",
            Message::ProofFound(_) => "PROOF_FOUND",
            Message::MissingBlock { .. } => "MISSING_BLOCK",
            Message::StartMining => "START_MINING",
        }
    }
}

/// Sending half of a node's inbound queue
pub type Outbox = mpsc::UnboundedSender<Message>;

/// Receiving half of a node's inbound queue
pub type Inbox = mpsc::UnboundedReceiver<Message>;
