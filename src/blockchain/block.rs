use chrono::Utc;
use indexmap::IndexMap;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use std::collections::HashMap;

use super::chain::ChainConfig;
use super::crypto::Address;
use super::transaction::{Transaction, TransactionRejection};

/// A block of transactions together with the ledger state it produces.
///
/// Balances and nonces are not part of the serialized form. A block that
/// arrives over the network carries only its transactions and has to be
/// replayed on top of its parent with [`Block::rerun`] before its ledger
/// state means anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Hash of the previous block, `None` for genesis
    prev_block_hash: Option<String>,

    /// Proof-of-work threshold the block hash must fall below
    #[serde(with = "target_hex")]
    target: BigUint,

    /// Included transactions keyed by id, in inclusion order
    transactions: IndexMap<String, Transaction>,

    /// Number of blocks between this block and genesis
    chain_length: u64,

    /// Creation time in milliseconds since the Unix epoch
    timestamp: i64,

    /// Receives this block's coinbase and fees once its successor is built
    reward_address: Option<Address>,

    coinbase_reward: u64,

    /// Proof-of-work counter searched by miners
    pub proof: u64,

    #[serde(skip)]
    balances: HashMap<Address, u64>,

    #[serde(skip)]
    next_nonce: HashMap<Address, u64>,
}

impl Block {
    /// Creates a block on top of `prev_block`, or a genesis block when there
    /// is no predecessor.
    ///
    /// The predecessor's ledger state is copied and its reward address is
    /// paid the predecessor's coinbase and fees.
    pub fn new(reward_address: Option<Address>, prev_block: Option<&Block>, config: &ChainConfig) -> Self {
        let mut block = Block {
            prev_block_hash: prev_block.map(Block::id),
            target: config.pow_target().clone(),
            transactions: IndexMap::new(),
            chain_length: prev_block.map_or(0, |prev| prev.chain_length + 1),
            timestamp: Utc::now().timestamp_millis(),
            reward_address,
            coinbase_reward: config.coinbase_amount(),
            proof: 0,
            balances: HashMap::new(),
            next_nonce: HashMap::new(),
        };

        if let Some(prev) = prev_block {
            block.inherit_ledger(prev);
        }

        block
    }

    /// Copies `prev`'s balances and nonces and pays out its rewards
    fn inherit_ledger(&mut self, prev: &Block) {
        self.balances = prev.balances.clone();
        self.next_nonce = prev.next_nonce.clone();

        if let Some(winner) = &prev.reward_address {
            let balance = self.balance_of(winner);
            self.balances
                .insert(winner.clone(), balance.saturating_add(prev.total_rewards()));
        }
    }

    #[cfg(test)]
    pub fn is_genesis_block(&self) -> bool {
        self.chain_length == 0
    }

    pub fn prev_block_hash(&self) -> Option<&str> {
        self.prev_block_hash.as_deref()
    }

    pub fn target(&self) -> &BigUint {
        &self.target
    }

    pub fn chain_length(&self) -> u64 {
        self.chain_length
    }

    pub fn coinbase_reward(&self) -> u64 {
        self.coinbase_reward
    }

    /// Included transactions in inclusion order
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.transactions.contains_key(tx_id)
    }

    /// Canonical JSON encoding of the block, the preimage of its hash
    pub fn serialize(&self) -> String {
        // Every map in the hashed form is keyed by strings, so encoding cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    fn digest(&self) -> Vec<u8> {
        Sha256::digest(self.serialize().as_bytes()).to_vec()
    }

    /// The block's hash as a lowercase hex string
    pub fn id(&self) -> String {
        hex::encode(self.digest())
    }

    /// True when the block hash, read as an unsigned integer, is below the target
    pub fn has_valid_proof(&self) -> bool {
        BigUint::from_bytes_be(&self.digest()) < self.target
    }

    /// Balance of `address`; unknown addresses hold nothing
    pub fn balance_of(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    /// The nonce the next transaction from `address` must carry
    pub fn next_nonce_of(&self, address: &Address) -> u64 {
        self.next_nonce.get(address).copied().unwrap_or(0)
    }

    /// Sum of all fees plus the coinbase reward
    pub fn total_rewards(&self) -> u64 {
        self.transactions
            .values()
            .fold(self.coinbase_reward, |total, tx| total.saturating_add(tx.fee()))
    }

    /// Sets a starting balance. Only genesis blocks are seeded this way.
    pub(crate) fn seed_balance(&mut self, address: Address, amount: u64) {
        self.balances.insert(address, amount);
    }

    /// Validates `tx` against the current ledger state and applies it.
    ///
    /// Nothing is modified when the transaction is rejected.
    pub fn add_transaction(&mut self, tx: &Transaction) -> Result<(), TransactionRejection> {
        let id = tx.id();

        if self.transactions.contains_key(&id) {
            return Err(TransactionRejection::Duplicate(id));
        }
        if tx.signature().is_none() {
            return Err(TransactionRejection::Unsigned(id));
        }
        if !tx.has_valid_signature() {
            return Err(TransactionRejection::InvalidSignature(id));
        }
        if !tx.sufficient_funds(self) {
            return Err(TransactionRejection::InsufficientFunds {
                required: tx.total_output(),
                available: self.balance_of(tx.from()),
                id,
            });
        }

        let expected = self.next_nonce_of(tx.from());
        if tx.nonce() < expected {
            return Err(TransactionRejection::Replayed {
                id,
                expected,
                got: tx.nonce(),
            });
        }
        if tx.nonce() > expected {
            return Err(TransactionRejection::OutOfOrder {
                id,
                expected,
                got: tx.nonce(),
            });
        }

        self.next_nonce.insert(tx.from().clone(), expected + 1);

        let sender_balance = self.balance_of(tx.from());
        self.balances
            .insert(tx.from().clone(), sender_balance - tx.total_output());

        for output in tx.outputs() {
            let balance = self.balance_of(&output.address);
            self.balances
                .insert(output.address.clone(), balance.saturating_add(output.amount));
        }

        self.transactions.insert(id, tx.clone());
        Ok(())
    }

    /// Rebuilds the ledger state on top of `prev_block` by replaying every
    /// held transaction in its original order.
    ///
    /// An error means the block is not valid on top of `prev_block`; its
    /// state is left partially replayed and the block must be discarded.
    pub fn rerun(&mut self, prev_block: &Block) -> Result<(), TransactionRejection> {
        self.inherit_ledger(prev_block);

        let transactions = std::mem::take(&mut self.transactions);
        for tx in transactions.values() {
            self.add_transaction(tx)?;
        }

        Ok(())
    }
}

/// Serializes the proof target as a lowercase hex string
mod target_hex {
    use num_bigint::BigUint;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(target: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&target.to_str_radix(16))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigUint::parse_bytes(s.as_bytes(), 16)
            .ok_or_else(|| D::Error::custom(format!("invalid target: {}", s)))
    }
}
