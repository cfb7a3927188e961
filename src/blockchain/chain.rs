use log::info;
use num_bigint::BigUint;
use thiserror::Error;

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;

use super::block::Block;
use super::crypto::Address;

/// Width of a block hash in bits
pub const POW_BASE_TARGET_BITS: u32 = 256;

/// Default number of leading zero bits a block hash needs
pub const POW_LEADING_ZEROES: u32 = 15;

/// Gold minted for the winner of every block
pub const COINBASE_AMT_ALLOWED: u64 = 25;

pub const DEFAULT_TX_FEE: u64 = 1;

/// A block this many blocks behind the tip is considered confirmed.
/// The genesis block is always confirmed.
pub const CONFIRMED_DEPTH: u64 = 6;

/// Hash attempts a miner makes before yielding to its event loop
pub const NUM_ROUNDS_MINING: u64 = 2000;

/// Errors raised while configuring or walking a chain
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot set genesis block for existing blockchain")]
    GenesisAlreadySet,

    #[error("No common ancestor between {from} and {to}")]
    NoCommonAncestor { from: String, to: String },
}

/// The largest possible target, `2^256 - 1`, which every hash but one meets
pub fn pow_base_target() -> BigUint {
    (BigUint::from(1u8) << POW_BASE_TARGET_BITS) - 1u8
}

/// Consensus parameters shared by every node of one simulated network.
///
/// Built once at startup and handed to each component behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pow_leading_zeroes: u32,
    pow_target: BigUint,
    coinbase_amount: u64,
    default_tx_fee: u64,
    confirmed_depth: u64,
    mining_rounds: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            pow_leading_zeroes: POW_LEADING_ZEROES,
            pow_target: pow_base_target() >> POW_LEADING_ZEROES,
            coinbase_amount: COINBASE_AMT_ALLOWED,
            default_tx_fee: DEFAULT_TX_FEE,
            confirmed_depth: CONFIRMED_DEPTH,
            mining_rounds: NUM_ROUNDS_MINING,
        }
    }
}

impl ChainConfig {
    /// Creates a configuration whose target requires `pow_leading_zeroes`
    /// leading zero bits
    pub fn new(pow_leading_zeroes: u32) -> Result<Self, ChainError> {
        if pow_leading_zeroes > POW_BASE_TARGET_BITS {
            return Err(ChainError::Config(format!(
                "pow_leading_zeroes must be at most {}, got {}",
                POW_BASE_TARGET_BITS, pow_leading_zeroes
            )));
        }

        Ok(ChainConfig {
            pow_leading_zeroes,
            pow_target: pow_base_target() >> pow_leading_zeroes,
            ..ChainConfig::default()
        })
    }

    /// Reads the configuration from the environment, falling back to the
    /// defaults for unset variables
    pub fn from_env() -> Result<Self, ChainError> {
        let defaults = ChainConfig::default();
        let config = ChainConfig::new(env_or("POW_LEADING_ZEROES", defaults.pow_leading_zeroes)?)?
            .with_coinbase_amount(env_or("COINBASE_AMOUNT", defaults.coinbase_amount)?)
            .with_default_tx_fee(env_or("DEFAULT_TX_FEE", defaults.default_tx_fee)?)
            .with_confirmed_depth(env_or("CONFIRMED_DEPTH", defaults.confirmed_depth)?);

        let mining_rounds = env_or("MINING_ROUNDS", defaults.mining_rounds)?;
        if mining_rounds == 0 {
            return Err(ChainError::Config("MINING_ROUNDS must be positive".to_string()));
        }

        Ok(config.with_mining_rounds(mining_rounds))
    }

    /// Overrides the target directly
    #[cfg(test)]
    pub fn with_pow_target(mut self, target: BigUint) -> Self {
        self.pow_target = target;
        self
    }

    pub fn with_coinbase_amount(mut self, amount: u64) -> Self {
        self.coinbase_amount = amount;
        self
    }

    pub fn with_default_tx_fee(mut self, fee: u64) -> Self {
        self.default_tx_fee = fee;
        self
    }

    pub fn with_confirmed_depth(mut self, depth: u64) -> Self {
        self.confirmed_depth = depth;
        self
    }

    pub fn with_mining_rounds(mut self, rounds: u64) -> Self {
        self.mining_rounds = rounds;
        self
    }

    pub fn pow_leading_zeroes(&self) -> u32 {
        self.pow_leading_zeroes
    }

    pub fn pow_target(&self) -> &BigUint {
        &self.pow_target
    }

    pub fn coinbase_amount(&self) -> u64 {
        self.coinbase_amount
    }

    pub fn default_tx_fee(&self) -> u64 {
        self.default_tx_fee
    }

    pub fn confirmed_depth(&self) -> u64 {
        self.confirmed_depth
    }

    pub fn mining_rounds(&self) -> u64 {
        self.mining_rounds
    }
}

pub fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ChainError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| ChainError::Config(format!("{}={:?}: {}", key, value, e))),
        Err(_) => Ok(default),
    }
}

/// Anything that keeps its own view of the chain and has to start from
/// the shared genesis block
pub trait Participant {
    fn address(&self) -> &Address;

    fn set_genesis_block(&mut self, genesis: &Block) -> Result<(), ChainError>;
}

/// Factory for the blocks of one network
#[derive(Debug, Clone)]
pub struct Blockchain {
    config: Arc<ChainConfig>,
}

impl Blockchain {
    pub fn new(config: Arc<ChainConfig>) -> Self {
        Blockchain { config }
    }

    /// Creates an unmined block on top of `prev_block`
    fn make_block(&self, reward_address: Option<Address>, prev_block: Option<&Block>) -> Block {
        Block::new(reward_address, prev_block, &self.config)
    }

    /// Builds the genesis block.
    ///
    /// Starting balances come either from an explicit address map or from a
    /// list of participants; each participant also adopts the new genesis
    /// block. Supplying both is a configuration error.
    pub fn make_genesis(
        &self,
        starting_balances: Option<HashMap<Address, u64>>,
        client_balances: Option<Vec<(&mut dyn Participant, u64)>>,
    ) -> Result<Block, ChainError> {
        if starting_balances.is_some() && client_balances.is_some() {
            return Err(ChainError::Config(
                "You may set client_balances OR set starting_balances, but not both".to_string(),
            ));
        }

        let mut genesis = self.make_block(None, None);

        for (address, amount) in starting_balances.unwrap_or_default() {
            genesis.seed_balance(address, amount);
        }

        let mut clients = client_balances.unwrap_or_default();
        for (client, amount) in clients.iter() {
            genesis.seed_balance(client.address().clone(), *amount);
        }
        for (client, _) in clients.iter_mut() {
            client.set_genesis_block(&genesis)?;
        }

        info!("Created genesis block {}", genesis.id());
        Ok(genesis)
    }
}
