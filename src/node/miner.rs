use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::client::Client;
use crate::blockchain::{
    Address, Block, ChainConfig, ChainError, Participant, Transaction, TransactionRejection, Wallet,
};
use crate::network::{FakeNet, Inbox, Message, Outbox};

/// A client that also searches for proofs of work.
///
/// Mining happens in bounded rounds. After each round the miner posts
/// `StartMining` to its own inbox, so blocks and transactions that arrived
/// in the meantime are handled before the search resumes.
#[derive(Debug)]
pub struct Miner {
    client: Client,

    /// Hash attempts per round
    mining_rounds: u64,

    /// Candidate block the proof search runs on
    current_block: Option<Block>,

    /// Transactions waiting for the next candidate block
    transactions: IndexMap<String, Transaction>,

    /// Lowest nonce per sender whose transaction was dropped. Later nonces
    /// from that sender cannot apply until the sender moves past it.
    dropped_nonces: HashMap<Address, u64>,

    /// Own inbound queue, used to schedule the next round
    scheduler: Option<Outbox>,
}

impl Miner {
    pub fn new(name: &str, net: Arc<FakeNet>, config: Arc<ChainConfig>) -> Self {
        Self::with_wallet(name, Wallet::new(), net, config)
    }

    pub fn with_wallet(name: &str, wallet: Wallet, net: Arc<FakeNet>, config: Arc<ChainConfig>) -> Self {
        let mining_rounds = config.mining_rounds().max(1);
        Miner {
            client: Client::with_wallet(name, wallet, net, config),
            mining_rounds,
            current_block: None,
            transactions: IndexMap::new(),
            dropped_nonces: HashMap::new(),
            scheduler: None,
        }
    }

    /// Overrides the number of hash attempts per round, i.e. this miner's
    /// share of the hash power
    pub fn with_mining_rounds(mut self, mining_rounds: u64) -> Self {
        self.mining_rounds = mining_rounds.max(1);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    #[cfg(test)]
    pub fn current_block(&self) -> Option<&Block> {
        self.current_block.as_ref()
    }

    /// Transactions queued for the next candidate block
    #[cfg(test)]
    pub fn queued_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    /// Registers with the network and keeps a handle on the inbound queue
    /// for scheduling mining rounds
    pub fn connect(&mut self) -> Inbox {
        let (outbox, inbox) = mpsc::unbounded_channel();
        self.scheduler = Some(outbox.clone());
        self.client.net().register(self.client.address().clone(), outbox);
        inbox
    }

    /// Builds the first candidate block and schedules the first round
    pub fn initialize(&mut self) {
        self.start_new_search(IndexMap::new());
        self.schedule_mining();
    }

    fn schedule_mining(&self) {
        match &self.scheduler {
            Some(scheduler) => {
                if scheduler.send(Message::StartMining).is_err() {
                    debug!("{}: inbox closed, mining stops", self.client.name());
                }
            }
            None => warn!("{}: not connected, cannot schedule mining", self.client.name()),
        }
    }

    /// Starts a candidate block on the current tip.
    ///
    /// `carry_over` holds transactions recovered from an abandoned chain.
    /// They are merged with the queued transactions and applied in nonce
    /// order. Rejected transactions are dropped, except those whose nonce is
    /// still ahead of the sender's, which wait for a later candidate unless
    /// one of their predecessors was dropped.
    pub fn start_new_search(&mut self, carry_over: IndexMap<String, Transaction>) {
        let Some(tip) = self.client.last_block() else {
            warn!("{}: no genesis block, nothing to mine on", self.client.name());
            return;
        };
        let mut block = Block::new(Some(self.client.address().clone()), Some(tip), self.client.config());

        let mut pool = carry_over;
        pool.extend(std::mem::take(&mut self.transactions));

        let mut candidates: Vec<Transaction> = pool.into_values().collect();
        candidates.sort_by_key(Transaction::nonce);

        self.dropped_nonces
            .retain(|sender, lowest| block.next_nonce_of(sender) <= *lowest);

        for tx in candidates {
            match block.add_transaction(&tx) {
                Ok(()) => {}
                Err(TransactionRejection::OutOfOrder { .. }) if !self.follows_dropped(&tx) => {
                    self.transactions.insert(tx.id(), tx);
                }
                Err(rejection) => {
                    debug!("{}: dropping {}", self.client.name(), rejection);
                    if !matches!(
                        rejection,
                        TransactionRejection::Duplicate(_) | TransactionRejection::Replayed { .. }
                    ) {
                        let lowest = self.dropped_nonces.entry(tx.from().clone()).or_insert(tx.nonce());
                        *lowest = (*lowest).min(tx.nonce());
                    }
                }
            }
        }

        block.proof = 0;
        self.current_block = Some(block);
    }

    fn follows_dropped(&self, tx: &Transaction) -> bool {
        self.dropped_nonces
            .get(tx.from())
            .is_some_and(|&lowest| lowest < tx.nonce())
    }

    /// Runs one bounded round of proof search.
    ///
    /// Unless `one_and_done` is set, the next round is scheduled whether or
    /// not a proof was found.
    pub fn find_proof(&mut self, one_and_done: bool) {
        if let Some(block) = self.current_block.as_mut() {
            let pause_point = block.proof.saturating_add(self.mining_rounds);
            let mut found = false;

            while block.proof < pause_point {
                if block.has_valid_proof() {
                    found = true;
                    break;
                }
                block.proof += 1;
            }

            if found {
                let block = block.clone();
                info!(
                    "{}: found proof for block {} ({} transactions): {}",
                    self.client.name(),
                    block.chain_length(),
                    block.transaction_count(),
                    block.proof
                );
                self.announce_proof(&block);
                self.receive_block(block);
            }
        }

        if !one_and_done {
            self.schedule_mining();
        }
    }

    fn announce_proof(&self, block: &Block) {
        if let Err(err) = self.client.net().broadcast(&Message::ProofFound(block.clone())) {
            warn!("{}: failed to announce block: {}", self.client.name(), err);
        }
    }

    /// Accepts a block like any client, then abandons the current search
    /// when the new tip is at least as long as the candidate
    pub fn receive_block(&mut self, block: Block) {
        if self.client.receive_block(block).is_empty() {
            return;
        }

        let cut_over = match (self.client.last_block(), &self.current_block) {
            (Some(tip), Some(current)) => tip.chain_length() >= current.chain_length(),
            _ => false,
        };
        if !cut_over {
            return;
        }

        info!("{}: cutting over to new chain", self.client.name());
        let carry_over = match self.sync_transactions() {
            Ok(carry_over) => carry_over,
            Err(err) => {
                warn!("{}: {}", self.client.name(), err);
                self.current_block
                    .iter()
                    .flat_map(|block| block.transactions())
                    .map(|tx| (tx.id(), tx.clone()))
                    .collect()
            }
        };
        self.start_new_search(carry_over);
    }

    /// Collects the transactions of the abandoned chain segment that the new
    /// chain does not contain.
    ///
    /// Both chains are walked back from the candidate block and the new tip
    /// until they meet.
    fn sync_transactions(&self) -> Result<IndexMap<String, Transaction>, ChainError> {
        let (Some(current), Some(tip)) = (self.current_block.as_ref(), self.client.last_block()) else {
            return Ok(IndexMap::new());
        };

        let no_common_ancestor = || ChainError::NoCommonAncestor {
            from: current.id(),
            to: tip.id(),
        };

        let mut old_chain = current;
        let mut new_chain = tip;
        let mut old_txs: IndexMap<String, Transaction> = IndexMap::new();
        let mut new_tx_ids: HashSet<String> = HashSet::new();
        let mut visited: HashSet<String> = HashSet::new();

        while new_chain.chain_length() > old_chain.chain_length() {
            new_tx_ids.extend(new_chain.transactions().map(Transaction::id));
            new_chain = self.client.parent_of(new_chain).ok_or_else(no_common_ancestor)?;
        }

        while old_chain.chain_length() > new_chain.chain_length() {
            old_txs.extend(old_chain.transactions().map(|tx| (tx.id(), tx.clone())));
            old_chain = self.client.parent_of(old_chain).ok_or_else(no_common_ancestor)?;
        }

        loop {
            let old_id = old_chain.id();
            if old_id == new_chain.id() {
                break;
            }
            if !visited.insert(old_id) {
                return Err(no_common_ancestor());
            }

            old_txs.extend(old_chain.transactions().map(|tx| (tx.id(), tx.clone())));
            new_tx_ids.extend(new_chain.transactions().map(Transaction::id));

            old_chain = self.client.parent_of(old_chain).ok_or_else(no_common_ancestor)?;
            new_chain = self.client.parent_of(new_chain).ok_or_else(no_common_ancestor)?;
        }

        old_txs.retain(|id, _| !new_tx_ids.contains(id));
        Ok(old_txs)
    }

    /// Queues a transaction from the network for the next candidate block
    pub fn add_transaction(&mut self, tx: Transaction) {
        if self.client.receive_transaction(tx.clone()) {
            self.transactions.insert(tx.id(), tx);
        }
    }

    /// Dispatches one inbound message
    pub fn handle(&mut self, message: Message) {
        match message {
            Message::PostTransaction(tx) => self.add_transaction(tx),
            Message::ProofFound(block) => self.receive_block(block),
            Message::MissingBlock { from, missing } => self.client.provide_missing_block(&from, &missing),
            Message::StartMining => self.find_proof(false),
        }
    }

    /// Mines and handles inbound messages until shutdown is signalled, then
    /// hands the miner back
    pub async fn run(mut self, mut inbox: Inbox, mut shutdown: watch::Receiver<bool>) -> Self {
        self.initialize();

        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => {
                        let mined = matches!(message, Message::StartMining);
                        self.handle(message);
                        if mined {
                            tokio::task::yield_now().await;
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        self
    }
}

impl Participant for Miner {
    fn address(&self) -> &Address {
        self.client.address()
    }

    fn set_genesis_block(&mut self, genesis: &Block) -> Result<(), ChainError> {
        self.client.set_genesis_block(genesis)
    }
}
