use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::blockchain::{Address, Block, ChainConfig, ChainError, Output, Participant, Transaction, Wallet};
use crate::network::{FakeNet, Inbox, Message, NetworkError};

// Requests sent per missing parent: the first ask plus one re-request
const MISSING_BLOCK_REQUESTS: u32 = 2;

/// Errors that can occur while a client issues transactions
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Requested {requested}, but account only has {available}")]
    InsufficientGold { requested: u64, available: u64 },

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

/// A node that holds gold, posts transactions and follows the longest chain.
///
/// Every client keeps its own copy of each block it accepts. Blocks whose
/// parent is unknown are parked until the parent shows up. The parent is
/// requested from the network when the first orphan is parked, and asked for
/// once more if an orphan under it shows up again.
#[derive(Debug)]
pub struct Client {
    name: String,
    wallet: Wallet,
    net: Arc<FakeNet>,
    config: Arc<ChainConfig>,

    /// Nonce for the next transaction this client posts
    nonce: u64,

    pending_outgoing_transactions: HashMap<String, Transaction>,
    pending_received_transactions: HashMap<String, Transaction>,

    /// Every accepted block, keyed by id
    blocks: HashMap<String, Block>,

    /// Orphans keyed by the id of the parent they are waiting for
    pending_blocks: HashMap<String, Vec<Block>>,

    /// Requests sent so far for each missing parent
    missing_requests: HashMap<String, u32>,

    last_block: Option<String>,
    last_confirmed_block: Option<String>,
}

impl Client {
    /// Creates a client with a fresh key pair
    pub fn new(name: &str, net: Arc<FakeNet>, config: Arc<ChainConfig>) -> Self {
        Self::with_wallet(name, Wallet::new(), net, config)
    }

    pub fn with_wallet(name: &str, wallet: Wallet, net: Arc<FakeNet>, config: Arc<ChainConfig>) -> Self {
        Client {
            name: name.to_string(),
            wallet,
            net,
            config,
            nonce: 0,
            pending_outgoing_transactions: HashMap::new(),
            pending_received_transactions: HashMap::new(),
            blocks: HashMap::new(),
            pending_blocks: HashMap::new(),
            missing_requests: HashMap::new(),
            last_block: None,
            last_confirmed_block: None,
        }
    }

    /// Registers this client with the network and returns its inbound queue
    pub fn connect(&self) -> Inbox {
        let (outbox, inbox) = mpsc::unbounded_channel();
        self.net.register(self.address().clone(), outbox);
        inbox
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Address {
        self.wallet.address()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn net(&self) -> &Arc<FakeNet> {
        &self.net
    }

    pub fn config(&self) -> &Arc<ChainConfig> {
        &self.config
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Tip of the longest chain this client has accepted
    pub fn last_block(&self) -> Option<&Block> {
        self.last_block.as_deref().and_then(|id| self.blocks.get(id))
    }

    pub fn last_confirmed_block(&self) -> Option<&Block> {
        self.last_confirmed_block
            .as_deref()
            .and_then(|id| self.blocks.get(id))
    }

    /// The accepted parent of `block`, if any
    pub fn parent_of(&self, block: &Block) -> Option<&Block> {
        block.prev_block_hash().and_then(|id| self.blocks.get(id))
    }

    pub fn pending_outgoing_transactions(&self) -> &HashMap<String, Transaction> {
        &self.pending_outgoing_transactions
    }

    #[cfg(test)]
    pub fn pending_received_transactions(&self) -> &HashMap<String, Transaction> {
        &self.pending_received_transactions
    }

    /// Number of orphans waiting for a parent
    #[cfg(test)]
    pub fn parked_block_count(&self) -> usize {
        self.pending_blocks.values().map(Vec::len).sum()
    }

    /// Drops an accepted block from the local view
    #[cfg(test)]
    pub(crate) fn forget_block(&mut self, id: &str) {
        self.blocks.remove(id);
    }

    /// Balance according to the last confirmed block
    pub fn confirmed_balance(&self) -> u64 {
        self.last_confirmed_block()
            .map_or(0, |block| block.balance_of(self.address()))
    }

    /// Confirmed balance minus everything still pending outbound
    pub fn available_gold(&self) -> u64 {
        let pending_spent = self
            .pending_outgoing_transactions
            .values()
            .fold(0u64, |total, tx| total.saturating_add(tx.total_output()));
        self.confirmed_balance().saturating_sub(pending_spent)
    }

    /// Pays `outputs` plus `fee` out of this client's available gold
    pub fn post_transaction(&mut self, outputs: Vec<Output>, fee: u64) -> Result<Transaction, ClientError> {
        self.post_generic_transaction(outputs, fee, None)
    }

    /// Like [`Client::post_transaction`], with free-form data attached
    pub fn post_generic_transaction(
        &mut self,
        outputs: Vec<Output>,
        fee: u64,
        data: Option<String>,
    ) -> Result<Transaction, ClientError> {
        let mut tx = Transaction::new(
            self.address().clone(),
            self.nonce,
            self.wallet.public_key().clone(),
            outputs,
            fee,
            data,
        );

        let requested = tx.total_output();
        let available = self.available_gold();
        if requested > available {
            return Err(ClientError::InsufficientGold { requested, available });
        }

        tx.sign(&self.wallet);
        self.net.broadcast(&Message::PostTransaction(tx.clone()))?;

        info!("{}: posted transaction {} (nonce {})", self.name, tx.id(), tx.nonce());
        self.nonce += 1;
        self.pending_outgoing_transactions.insert(tx.id(), tx.clone());
        Ok(tx)
    }

    /// Records a transaction seen on the network.
    ///
    /// Returns `true` when it is correctly signed and was not already pending.
    pub fn receive_transaction(&mut self, tx: Transaction) -> bool {
        if !tx.has_valid_signature() {
            debug!("{}: ignoring badly signed transaction {}", self.name, tx.id());
            return false;
        }

        let id = tx.id();
        if self.pending_received_transactions.contains_key(&id) {
            return false;
        }

        self.pending_received_transactions.insert(id, tx);
        true
    }

    /// Processes a block from the network, together with any parked blocks
    /// it unblocks.
    ///
    /// Returns the ids of every block accepted, in acceptance order.
    pub fn receive_block(&mut self, block: Block) -> Vec<String> {
        let mut accepted = Vec::new();

        if self.last_block.is_none() {
            warn!("{}: no genesis block yet, ignoring block", self.name);
            return accepted;
        }

        let mut worklist = VecDeque::from([block]);
        while let Some(block) = worklist.pop_front() {
            match self.accept_block(block) {
                Verdict::Accepted(id) => {
                    self.missing_requests.remove(&id);
                    if let Some(unstuck) = self.pending_blocks.remove(&id) {
                        worklist.extend(unstuck);
                    }
                    accepted.push(id);
                }
                Verdict::Rejected(id) => self.evict_orphans(id),
                Verdict::Parked | Verdict::Ignored => {}
            }
        }

        accepted
    }

    /// Validates a single block and records it, or parks it if its parent
    /// is missing
    fn accept_block(&mut self, mut block: Block) -> Verdict {
        let id = block.id();

        if self.blocks.contains_key(&id) {
            debug!("{}: already have block {}", self.name, id);
            return Verdict::Ignored;
        }

        let Some(prev_id) = block.prev_block_hash().map(str::to_string) else {
            warn!("{}: ignoring unsolicited genesis block {}", self.name, id);
            return Verdict::Ignored;
        };

        if !block.has_valid_proof() {
            warn!("{}: invalid proof for block {}", self.name, id);
            return Verdict::Rejected(id);
        }

        if block.target() != self.config.pow_target()
            || block.coinbase_reward() != self.config.coinbase_amount()
        {
            warn!("{}: block {} does not follow the chain rules", self.name, id);
            return Verdict::Rejected(id);
        }

        let Some(prev) = self.blocks.get(&prev_id) else {
            self.park_orphan(prev_id, block);
            return Verdict::Parked;
        };

        if block.chain_length() != prev.chain_length() + 1 {
            warn!("{}: block {} has a bad chain length", self.name, id);
            return Verdict::Rejected(id);
        }

        if let Err(rejection) = block.rerun(prev) {
            warn!("{}: rejecting block {}: {}", self.name, id, rejection);
            return Verdict::Rejected(id);
        }

        for tx in block.transactions() {
            self.pending_received_transactions.remove(&tx.id());
        }

        let chain_length = block.chain_length();
        self.blocks.insert(id.clone(), block);

        let tip_length = self.last_block().map_or(0, Block::chain_length);
        if chain_length > tip_length {
            self.last_block = Some(id.clone());
            self.set_last_confirmed();
        }

        Verdict::Accepted(id)
    }

    /// Parks `block` under its missing parent and asks the network for that
    /// parent, at most `MISSING_BLOCK_REQUESTS` times
    fn park_orphan(&mut self, prev_id: String, block: Block) {
        let id = block.id();
        let siblings = self.pending_blocks.entry(prev_id.clone()).or_default();
        if siblings.iter().any(|parked| parked.id() == id) {
            debug!("{}: block {} is already waiting for {}", self.name, id, prev_id);
        } else {
            debug!("{}: parking block {} until {} arrives", self.name, id, prev_id);
            siblings.push(block);
        }

        let requests = self.missing_requests.entry(prev_id.clone()).or_insert(0);
        if *requests < MISSING_BLOCK_REQUESTS {
            *requests += 1;
            self.request_missing_block(prev_id);
        }
    }

    /// Drops every parked block that descends from the rejected block `id`
    fn evict_orphans(&mut self, id: String) {
        let mut doomed = vec![id];
        while let Some(parent) = doomed.pop() {
            self.missing_requests.remove(&parent);
            for orphan in self.pending_blocks.remove(&parent).unwrap_or_default() {
                debug!("{}: evicting block {}, its parent {} is invalid", self.name, orphan.id(), parent);
                doomed.push(orphan.id());
            }
        }
    }

    fn request_missing_block(&self, missing: String) {
        info!("{}: asking for missing block {}", self.name, missing);

        let request = Message::MissingBlock {
            from: self.address().clone(),
            missing,
        };
        if let Err(err) = self.net.broadcast(&request) {
            warn!("{}: failed to request missing block: {}", self.name, err);
        }
    }

    /// Sends a requested block straight back to the node that asked for it
    pub fn provide_missing_block(&self, from: &Address, missing: &str) {
        let Some(block) = self.block(missing) else {
            return;
        };

        debug!("{}: providing block {} to {}", self.name, missing, from);
        if let Err(err) = self.net.send_message(from, &Message::ProofFound(block.clone())) {
            warn!("{}: failed to provide block {}: {}", self.name, missing, err);
        }
    }

    /// Moves the confirmed pointer to the ancestor `confirmed_depth` blocks
    /// behind the tip and settles pending transactions against it
    fn set_last_confirmed(&mut self) {
        let Some(tip) = self.last_block() else {
            return;
        };

        let confirmed_height = tip
            .chain_length()
            .saturating_sub(self.config.confirmed_depth());

        let mut block = tip;
        while block.chain_length() > confirmed_height {
            match self.parent_of(block) {
                Some(parent) => block = parent,
                None => return,
            }
        }

        let address = self.address();
        let own_nonce = tip.next_nonce_of(address);
        let confirmed_nonce = block.next_nonce_of(address);
        let confirmed_id = block.id();

        self.nonce = self.nonce.max(own_nonce);
        self.last_confirmed_block = Some(confirmed_id);
        self.pending_outgoing_transactions
            .retain(|_, tx| tx.nonce() >= confirmed_nonce);
    }

    /// Dispatches one inbound message
    pub fn handle(&mut self, message: Message) {
        match message {
            Message::PostTransaction(tx) => {
                self.receive_transaction(tx);
            }
            Message::ProofFound(block) => {
                self.receive_block(block);
            }
            Message::MissingBlock { from, missing } => self.provide_missing_block(&from, &missing),
            Message::StartMining => debug!("{}: clients do not mine", self.name),
        }
    }

    /// Handles inbound messages until shutdown is signalled, then hands the
    /// client back
    pub async fn run(mut self, mut inbox: Inbox, mut shutdown: watch::Receiver<bool>) -> Self {
        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        self
    }
}

/// What became of a block handed to `Client::accept_block`
enum Verdict {
    Accepted(String),
    Parked,
    Ignored,
    Rejected(String),
}

impl Participant for Client {
    fn address(&self) -> &Address {
        self.wallet.address()
    }

    fn set_genesis_block(&mut self, genesis: &Block) -> Result<(), ChainError> {
        if self.last_block.is_some() {
            return Err(ChainError::GenesisAlreadySet);
        }

        let id = genesis.id();
        self.blocks.insert(id.clone(), genesis.clone());
        self.last_block = Some(id.clone());
        self.last_confirmed_block = Some(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::chain::pow_base_target;
    use crate::blockchain::Blockchain;
    use num_bigint::BigUint;

    fn trivial_config() -> Arc<ChainConfig> {
        Arc::new(ChainConfig::default().with_pow_target(pow_base_target()))
    }

    fn mine(config: &ChainConfig, prev: &Block, reward: &str, txs: &[Transaction]) -> Block {
        let mut block = Block::new(Some(Address::from(reward)), Some(prev), config);
        for tx in txs {
            block.add_transaction(tx).unwrap();
        }
        while !block.has_valid_proof() {
            block.proof += 1;
        }
        block
    }

    /// A connected client holding 100 gold in a fresh genesis block
    fn funded_client(config: &Arc<ChainConfig>) -> (Client, Inbox, Block) {
        let net = Arc::new(FakeNet::reliable());
        let mut alice = Client::new("alice", net, config.clone());
        let inbox = alice.connect();

        let genesis = Blockchain::new(config.clone())
            .make_genesis(None, Some(vec![(&mut alice as &mut dyn Participant, 100)]))
            .unwrap();

        (alice, inbox, genesis)
    }

    fn drain(inbox: &mut Inbox) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = inbox.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_genesis_cannot_be_replaced() {
        let config = trivial_config();
        let (mut alice, _inbox, genesis) = funded_client(&config);

        assert_eq!(alice.last_block().unwrap().id(), genesis.id());
        assert_eq!(alice.last_confirmed_block().unwrap().id(), genesis.id());
        assert!(matches!(
            alice.set_genesis_block(&genesis),
            Err(ChainError::GenesisAlreadySet)
        ));
    }

    #[test]
    fn test_post_transaction_broadcasts() {
        let config = trivial_config();
        let (mut alice, mut inbox, _genesis) = funded_client(&config);

        let tx = alice
            .post_transaction(vec![Output::new(40, Address::from("bob"))], 1)
            .unwrap();

        assert!(tx.has_valid_signature());
        assert_eq!(tx.nonce(), 0);
        assert_eq!(alice.nonce(), 1);
        assert_eq!(alice.available_gold(), 59);
        assert!(alice.pending_outgoing_transactions().contains_key(&tx.id()));

        let messages = drain(&mut inbox);
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Message::PostTransaction(sent) if sent.id() == tx.id()));
    }

    #[test]
    fn test_post_transaction_rejects_overspend() {
        let config = trivial_config();
        let (mut alice, mut inbox, _genesis) = funded_client(&config);

        alice
            .post_transaction(vec![Output::new(60, Address::from("bob"))], 1)
            .unwrap();
        drain(&mut inbox);

        let result = alice.post_transaction(vec![Output::new(39, Address::from("bob"))], 1);
        assert!(matches!(
            result,
            Err(ClientError::InsufficientGold { requested: 40, available: 39 })
        ));
        assert_eq!(alice.nonce(), 1);
        assert!(drain(&mut inbox).is_empty());
    }

    #[test]
    fn test_post_generic_transaction_carries_data() {
        let config = trivial_config();
        let (mut alice, _inbox, _genesis) = funded_client(&config);

        let tx = alice
            .post_generic_transaction(vec![], 1, Some("hello".to_string()))
            .unwrap();
        assert_eq!(tx.data(), Some("hello"));
    }

    #[test]
    fn test_receive_block_extends_chain() {
        let config = trivial_config();
        let (mut alice, _inbox, genesis) = funded_client(&config);

        let b1 = mine(&config, &genesis, "minnie", &[]);
        let accepted = alice.receive_block(b1.clone());

        assert_eq!(accepted, vec![b1.id()]);
        assert_eq!(alice.last_block().unwrap().id(), b1.id());
        assert_eq!(alice.last_block().unwrap().balance_of(alice.address()), 100);
        assert!(alice.receive_block(b1).is_empty());
    }

    #[test]
    fn test_orphan_is_parked_then_applied() {
        let config = trivial_config();
        let (mut alice, mut inbox, genesis) = funded_client(&config);

        let b1 = mine(&config, &genesis, "minnie", &[]);
        let b2 = mine(&config, &b1, "minnie", &[]);
        let b3 = mine(&config, &b2, "minnie", &[]);

        assert!(alice.receive_block(b3.clone()).is_empty());
        assert!(alice.receive_block(b2.clone()).is_empty());
        assert_eq!(alice.last_block().unwrap().id(), genesis.id());

        let requests: Vec<String> = drain(&mut inbox)
            .into_iter()
            .filter_map(|message| match message {
                Message::MissingBlock { missing, .. } => Some(missing),
                _ => None,
            })
            .collect();
        assert_eq!(requests, vec![b2.id(), b1.id()]);

        let accepted = alice.receive_block(b1.clone());
        assert_eq!(accepted, vec![b1.id(), b2.id(), b3.id()]);
        assert_eq!(alice.last_block().unwrap().id(), b3.id());
    }

    fn requests_for(messages: &[Message], id: &str) -> usize {
        messages
            .iter()
            .filter(|message| matches!(message, Message::MissingBlock { missing, .. } if missing == id))
            .count()
    }

    #[test]
    fn test_missing_parent_requested_at_most_twice() {
        let config = trivial_config();
        let (mut alice, mut inbox, genesis) = funded_client(&config);

        let b1 = mine(&config, &genesis, "minnie", &[]);
        let b2 = mine(&config, &b1, "minnie", &[]);
        let b2_alt = mine(&config, &b1, "mickey", &[]);

        alice.receive_block(b2.clone());
        alice.receive_block(b2.clone());
        alice.receive_block(b2);
        alice.receive_block(b2_alt);

        assert_eq!(requests_for(&drain(&mut inbox), &b1.id()), 2);
        assert_eq!(alice.parked_block_count(), 2);

        assert_eq!(alice.receive_block(b1).len(), 3);
        assert_eq!(alice.parked_block_count(), 0);
    }

    #[test]
    fn test_lost_request_is_sent_again() {
        let config = trivial_config();
        let (mut alice, mut inbox, genesis) = funded_client(&config);

        let b1 = mine(&config, &genesis, "minnie", &[]);
        let b2 = mine(&config, &b1, "minnie", &[]);
        let b3 = mine(&config, &b2, "minnie", &[]);

        // The first request for b1 never reaches anyone.
        alice.receive_block(b2.clone());
        assert_eq!(requests_for(&drain(&mut inbox), &b1.id()), 1);

        alice.receive_block(b2.clone());
        alice.receive_block(b3.clone());
        alice.receive_block(b2.clone());

        let messages = drain(&mut inbox);
        assert_eq!(requests_for(&messages, &b1.id()), 1);
        assert_eq!(requests_for(&messages, &b2.id()), 1);
        assert_eq!(alice.last_block().unwrap().id(), genesis.id());

        assert_eq!(alice.receive_block(b1).len(), 3);
        assert_eq!(alice.last_block().unwrap().id(), b3.id());
    }

    #[test]
    fn test_orphans_of_rejected_block_are_evicted() {
        let config = trivial_config();
        let (mut alice, _inbox, genesis) = funded_client(&config);

        let greedy = ChainConfig::default()
            .with_pow_target(pow_base_target())
            .with_coinbase_amount(1_000);
        let bad_b1 = mine(&greedy, &genesis, "minnie", &[]);
        let b2 = mine(&config, &bad_b1, "minnie", &[]);
        let b3 = mine(&config, &b2, "minnie", &[]);
        let b2_id = b2.id();

        alice.receive_block(b3);
        alice.receive_block(b2);
        assert_eq!(alice.parked_block_count(), 2);

        assert!(alice.receive_block(bad_b1).is_empty());
        assert_eq!(alice.parked_block_count(), 0);
        assert_eq!(alice.last_block().unwrap().id(), genesis.id());
        assert!(alice.block(&b2_id).is_none());
    }

    #[test]
    fn test_provide_missing_block() {
        let config = trivial_config();
        let (alice, _inbox, genesis) = funded_client(&config);

        let bob = Client::new("bob", alice.net().clone(), config.clone());
        let mut bob_inbox = bob.connect();

        alice.provide_missing_block(bob.address(), &genesis.id());
        alice.provide_missing_block(bob.address(), "unknown");

        let messages = drain(&mut bob_inbox);
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Message::ProofFound(block) if block.id() == genesis.id()));
    }

    #[test]
    fn test_equal_length_keeps_first_seen() {
        let config = trivial_config();
        let (mut alice, _inbox, genesis) = funded_client(&config);

        let first = mine(&config, &genesis, "minnie", &[]);
        let second = mine(&config, &genesis, "mickey", &[]);

        alice.receive_block(first.clone());
        assert_eq!(alice.receive_block(second.clone()), vec![second.id()]);
        assert_eq!(alice.last_block().unwrap().id(), first.id());

        let longer = mine(&config, &second, "mickey", &[]);
        alice.receive_block(longer.clone());
        assert_eq!(alice.last_block().unwrap().id(), longer.id());
    }

    #[test]
    fn test_rejects_block_with_foreign_rules() {
        let config = trivial_config();
        let (mut alice, _inbox, genesis) = funded_client(&config);

        let greedy = ChainConfig::default()
            .with_pow_target(pow_base_target())
            .with_coinbase_amount(1_000);
        let block = mine(&greedy, &genesis, "minnie", &[]);

        assert!(alice.receive_block(block).is_empty());
        assert_eq!(alice.last_block().unwrap().id(), genesis.id());
    }

    #[test]
    fn test_rejects_block_without_valid_proof() {
        let config = trivial_config();
        let (mut alice, _inbox, genesis) = funded_client(&config);

        let impossible = ChainConfig::default().with_pow_target(BigUint::from(0u8));
        let block = Block::new(Some(Address::from("minnie")), Some(&genesis), &impossible);

        assert!(alice.receive_block(block).is_empty());
    }

    #[test]
    fn test_rejects_block_that_fails_replay() {
        let config = trivial_config();
        let (mut alice, _inbox, genesis) = funded_client(&config);

        // Same id as the real genesis, since balances are not hashed, but richer.
        let mut forged_genesis = genesis.clone();
        forged_genesis.seed_balance(alice.address().clone(), 1_000);

        let mut tx = Transaction::new(
            alice.address().clone(),
            0,
            alice.wallet.public_key().clone(),
            vec![Output::new(500, Address::from("bob"))],
            1,
            None,
        );
        tx.sign(&alice.wallet);
        let block = mine(&config, &forged_genesis, "minnie", &[tx]);

        assert!(alice.receive_block(block).is_empty());
        assert_eq!(alice.last_block().unwrap().id(), genesis.id());
    }

    #[test]
    fn test_confirmation_settles_pending_transactions() {
        let config = Arc::new(ChainConfig::default().with_pow_target(pow_base_target()).with_confirmed_depth(1));
        let (mut alice, _inbox, genesis) = funded_client(&config);

        let tx = alice
            .post_transaction(vec![Output::new(40, Address::from("bob"))], 1)
            .unwrap();
        alice.receive_transaction(tx.clone());
        assert_eq!(alice.pending_received_transactions().len(), 1);

        let b1 = mine(&config, &genesis, "minnie", &[tx.clone()]);
        alice.receive_block(b1.clone());
        assert!(alice.pending_received_transactions().is_empty());
        assert_eq!(alice.last_confirmed_block().unwrap().id(), genesis.id());
        assert_eq!(alice.available_gold(), 59);

        let b2 = mine(&config, &b1, "minnie", &[]);
        alice.receive_block(b2);
        assert_eq!(alice.last_confirmed_block().unwrap().id(), b1.id());
        assert!(alice.pending_outgoing_transactions().is_empty());
        assert_eq!(alice.confirmed_balance(), 59);
        assert_eq!(alice.available_gold(), 59);
    }

    #[test]
    fn test_nonce_tracks_included_transactions() {
        let config = trivial_config();
        let (alice, _inbox, genesis) = funded_client(&config);

        // A second node using alice's key, e.g. a restored wallet.
        let mut twin = Client::with_wallet("twin", alice.wallet.clone(), alice.net().clone(), config.clone());
        twin.set_genesis_block(&genesis).unwrap();

        let mut tx = Transaction::new(
            alice.address().clone(),
            0,
            alice.wallet.public_key().clone(),
            vec![Output::new(10, Address::from("bob"))],
            1,
            None,
        );
        tx.sign(&alice.wallet);

        let b1 = mine(&config, &genesis, "minnie", &[tx]);
        twin.receive_block(b1);
        assert_eq!(twin.nonce(), 1);
    }

    #[test]
    fn test_handle_dispatches_messages() {
        let config = trivial_config();
        let (mut alice, _inbox, genesis) = funded_client(&config);

        let b1 = mine(&config, &genesis, "minnie", &[]);
        alice.handle(Message::ProofFound(b1.clone()));
        alice.handle(Message::StartMining);

        assert_eq!(alice.last_block().unwrap().id(), b1.id());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = trivial_config();
        let (alice, inbox, genesis) = funded_client(&config);
        let (stop, shutdown) = watch::channel(false);

        let b1 = mine(&config, &genesis, "minnie", &[]);
        alice.net().broadcast(&Message::ProofFound(b1.clone())).unwrap();

        let handle = tokio::spawn(alice.run(inbox, shutdown));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stop.send(true).unwrap();

        let alice = handle.await.unwrap();
        assert_eq!(alice.last_block().unwrap().id(), b1.id());
    }
}
