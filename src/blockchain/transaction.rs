use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::block::Block;
use super::crypto::{hash_hex, verify_signature, Address, DigitalSignature, PublicKey, Wallet};

/// Domain-separation prefix mixed into every transaction id
const TX_CONST: &str = "TX";

/// Reasons a block refuses a transaction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionRejection {
    #[error("Duplicate transaction {0}")]
    Duplicate(String),

    #[error("Unsigned transaction {0}")]
    Unsigned(String),

    #[error("Invalid signature for transaction {0}")]
    InvalidSignature(String),

    #[error("Insufficient gold for transaction {id}: required {required}, available {available}")]
    InsufficientFunds { id: String, required: u64, available: u64 },

    #[error("Replayed transaction {id}: expected nonce {expected}, got {got}")]
    Replayed { id: String, expected: u64, got: u64 },

    #[error("Out of order transaction {id}: expected nonce {expected}, got {got}")]
    OutOfOrder { id: String, expected: u64, got: u64 },
}

/// A single payment inside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub amount: u64,
    pub address: Address,
}

impl Output {
    pub fn new(amount: u64, address: Address) -> Self {
        Output { amount, address }
    }
}

/// A signed transfer of gold from one account to any number of outputs.
///
/// Transactions from one account are ordered by `nonce`; a block only
/// accepts the sender's next expected nonce. The id is a hash of the
/// content (the signature excluded), so it is stable across signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    from: Address,
    nonce: u64,
    pub_key: PublicKey,
    outputs: Vec<Output>,
    fee: u64,
    data: Option<String>,
    signature: Option<DigitalSignature>,
}

/// The part of a transaction covered by its id
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionContent<'a> {
    from: &'a Address,
    nonce: u64,
    pub_key: &'a PublicKey,
    outputs: &'a [Output],
    fee: u64,
    data: &'a Option<String>,
}

impl Transaction {
    /// Creates a new unsigned transaction
    pub fn new(
        from: Address,
        nonce: u64,
        pub_key: PublicKey,
        outputs: Vec<Output>,
        fee: u64,
        data: Option<String>,
    ) -> Self {
        Transaction {
            from,
            nonce,
            pub_key,
            outputs,
            fee,
            data,
            signature: None,
        }
    }

    pub fn from(&self) -> &Address {
        &self.from
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn fee(&self) -> u64 {
        self.fee
    }

    #[cfg(test)]
    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn signature(&self) -> Option<&DigitalSignature> {
        self.signature.as_ref()
    }

    /// Content hash of the transaction, used both as its id and as the
    /// message that gets signed
    pub fn id(&self) -> String {
        let content = TransactionContent {
            from: &self.from,
            nonce: self.nonce,
            pub_key: &self.pub_key,
            outputs: &self.outputs,
            fee: self.fee,
            data: &self.data,
        };

        // Serializing plain strings and integers cannot fail.
        let encoded = serde_json::to_string(&content).unwrap_or_default();
        hash_hex(format!("{}{}", TX_CONST, encoded).as_bytes())
    }

    /// Signs the transaction, replacing any earlier signature
    pub fn sign(&mut self, wallet: &Wallet) {
        self.signature = Some(wallet.sign(self.id().as_bytes()));
    }

    /// True when the transaction is signed by the key that owns `from`
    pub fn has_valid_signature(&self) -> bool {
        match &self.signature {
            Some(signature) => {
                self.from.matches_key(&self.pub_key)
                    && verify_signature(self.id().as_bytes(), signature, &self.pub_key)
            }
            None => false,
        }
    }

    /// Checks the sender's balance in `block` covers every output plus the fee
    pub fn sufficient_funds(&self, block: &Block) -> bool {
        self.total_output() <= block.balance_of(&self.from)
    }

    /// Sum of all outputs plus the fee.
    ///
    /// Saturates instead of wrapping, so an overflowing transaction simply
    /// never has sufficient funds.
    pub fn total_output(&self) -> u64 {
        self.outputs
            .iter()
            .fold(self.fee, |total, output| total.saturating_add(output.amount))
    }
}
