//! The ledger: round driver tying the view graph, Snowball and the applier
//! together.
//!
//! The driver loop continuously ingests transactions into the view graph,
//! proposes a candidate block from the graph's tips, samples K peers for
//! their preferred block and feeds the stake-weighted tallies into Snowball.
//! When Snowball decides, the block's transactions are replayed against the
//! state tree, the round advances and the graph is reset and pruned.
//!
//! Per-transaction failures never abort a round: the failing transaction is
//! reverted and recorded as rejected. The only exceptions are gas accounting
//! invariant violations, which indicate ledger corruption and stop the node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::applier::{Applier, ApplyError, ContractExecutor};
use crate::config::ConsensusConfig;
use crate::consensus::graph::{Graph, GraphError};
use crate::consensus::snowball::Snowball;
use crate::state::{self, StateTree};
use crate::transaction::{Tag, Transaction};
use crate::{AccountId, BlockId, Hash, TransactionId};

/// A consensus epoch bounded by two finalized roots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Round {
    pub index: u64,
    /// The distinguished transaction finalized as this round's root.
    pub root: Transaction,
    /// Root id of the previous round.
    pub start_id: TransactionId,
    /// Id of this round's root.
    pub end_id: TransactionId,
    /// State merkle root after applying this round.
    pub merkle_root: Hash,
}

impl Round {
    pub fn new(index: u64, root: Transaction, start_id: TransactionId, merkle_root: Hash) -> Round {
        let end_id = root.id;
        Round {
            index,
            root,
            start_id,
            end_id,
            merkle_root,
        }
    }

    /// Round zero: rooted at the zero transaction over the genesis state.
    pub fn genesis(merkle_root: Hash) -> Round {
        Round::new(0, Transaction::zero(), TransactionId::default(), merkle_root)
    }
}

/// The Snowball subject: a candidate set of transactions to finalize.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub index: u64,
    pub merkle_root: Hash,
    /// Transactions in topological order; the last one is the new root.
    pub tx_ids: Vec<TransactionId>,
}

impl Block {
    pub fn new(index: u64, merkle_root: Hash, tx_ids: Vec<TransactionId>) -> Block {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&index.to_le_bytes());
        hasher.update(&merkle_root);
        hasher.update(&(tx_ids.len() as u64).to_le_bytes());
        for tx_id in &tx_ids {
            hasher.update(&tx_id.0);
        }
        Block {
            id: BlockId(*hasher.finalize().as_bytes()),
            index,
            merkle_root,
            tx_ids,
        }
    }
}

/// A peer's answer to a consensus query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vote {
    pub voter: AccountId,
    pub block: Block,
}

/// The peer sampling service the consensus core relies on.
///
/// Provided by the networking layer; typically backed by an S/Kademlia
/// overlay. Queries carry the node's current preferred block so the peer can
/// adopt it into its own view before answering.
#[async_trait]
pub trait PeerSampler: Send + Sync {
    /// Up to K peers to query this tick.
    fn sample(&self) -> Vec<AccountId>;
    /// Ask a peer for its preferred block. `None` on timeout or error.
    async fn query(&self, peer: &AccountId, subject: &Block) -> Option<Vote>;
}

/// Loopback sampler for a single-node network: the node's own preferred
/// block is echoed back as the sole vote, so rounds decide locally.
pub struct SoloSampler {
    voter: AccountId,
}

impl SoloSampler {
    pub fn new(voter: AccountId) -> SoloSampler {
        SoloSampler { voter }
    }
}

#[async_trait]
impl PeerSampler for SoloSampler {
    fn sample(&self) -> Vec<AccountId> {
        vec![self.voter]
    }

    async fn query(&self, peer: &AccountId, subject: &Block) -> Option<Vote> {
        Some(Vote {
            voter: *peer,
            block: subject.clone(),
        })
    }
}

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("no eligible parents available in the graph")]
    NoEligibleParents,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("ledger state is corrupt: {0}")]
    Corrupt(ApplyError),
}

/// Aggregate sampled votes into per-block tallies.
///
/// Votes are weighted by the voter's stake, with a floor of one so that an
/// unstaked network degenerates to uniform weighting. Tallies are normalized
/// to sum to one.
pub fn tally_votes(
    state: &StateTree,
    votes: Vec<Vote>,
) -> (HashMap<BlockId, f64>, HashMap<BlockId, Block>) {
    let mut weights: HashMap<BlockId, u64> = HashMap::new();
    let mut blocks: HashMap<BlockId, Block> = HashMap::new();
    let mut total: u64 = 0;

    for vote in votes {
        let weight = state::read_stake(state, &vote.voter).max(1);
        *weights.entry(vote.block.id).or_insert(0) += weight;
        total += weight;
        blocks.entry(vote.block.id).or_insert(vote.block);
    }

    let tallies = weights
        .into_iter()
        .map(|(id, weight)| (id, weight as f64 / total as f64))
        .collect();

    (tallies, blocks)
}

/// The ledger.
pub struct Ledger {
    config: Arc<ConsensusConfig>,
    graph: Graph,
    snowball: Snowball,
    applier: Applier,
    sampler: Arc<dyn PeerSampler>,
    state: RwLock<StateTree>,
    round: RwLock<Round>,
    last_progress: RwLock<Instant>,
    /// Consecutive consensus ticks that failed to reach the alpha quorum.
    /// Surfaced as a metric, never as an error.
    failed_quorum_ticks: AtomicU64,
}

impl Ledger {
    /// Build a ledger over an already-initialized (genesis-applied) state.
    pub fn new(
        config: Arc<ConsensusConfig>,
        state: StateTree,
        executor: Box<dyn ContractExecutor>,
        sampler: Arc<dyn PeerSampler>,
    ) -> Ledger {
        let round = Round::genesis(state.merkle_root());
        let graph = Graph::new(&round, &config);
        let snowball = Snowball::new(config.snowball_alpha, config.snowball_beta);
        let applier = Applier::new(config.clone(), executor);

        Ledger {
            config,
            graph,
            snowball,
            applier,
            sampler,
            state: RwLock::new(state),
            round: RwLock::new(round),
            last_progress: RwLock::new(Instant::now()),
            failed_quorum_ticks: AtomicU64::new(0),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The current round.
    pub fn round(&self) -> Round {
        self.read_round().clone()
    }

    /// Run a closure against the committed state.
    pub fn with_state<R>(&self, f: impl FnOnce(&StateTree) -> R) -> R {
        f(&self.read_state())
    }

    /// Consecutive consensus ticks that missed the alpha quorum.
    pub fn failed_quorum_ticks(&self) -> u64 {
        self.failed_quorum_ticks.load(Ordering::Relaxed)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StateTree> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, StateTree> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_round(&self) -> std::sync::RwLockReadGuard<'_, Round> {
        self.round.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Ingest a transaction received from gossip or the API.
    ///
    /// Structural failures surface to the caller. A transaction with missing
    /// ancestry is retained and promoted automatically once the ancestry
    /// arrives, so `MissingParents` is not an error here; neither is a
    /// duplicate, which makes retries idempotent.
    pub fn receive_transaction(&self, tx: Transaction) -> Result<(), GraphError> {
        match self.graph.add(tx) {
            Ok(()) => Ok(()),
            Err(GraphError::AlreadyExists) => Ok(()),
            Err(GraphError::MissingParents) => {
                tracing::debug!(
                    num_missing = self.graph.num_missing_transactions(),
                    "transaction held incomplete until ancestry arrives"
                );
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Create a transaction on top of the currently eligible parents and
    /// insert it into the graph.
    pub fn create_transaction(
        &self,
        sender: AccountId,
        creator: AccountId,
        nonce: u64,
        tag: Tag,
        payload: Vec<u8>,
    ) -> Result<Transaction, LedgerError> {
        let mut parent_ids = self.graph.find_eligible_parents();
        if parent_ids.is_empty() {
            return Err(LedgerError::NoEligibleParents);
        }
        parent_ids.truncate(self.config.max_parents);

        let parents: Vec<Transaction> = parent_ids
            .iter()
            .filter_map(|id| self.graph.lookup(id))
            .collect();
        if parents.is_empty() {
            return Err(LedgerError::NoEligibleParents);
        }
        let parent_refs: Vec<&Transaction> = parents.iter().collect();

        let tx = Transaction::new(sender, creator, nonce, tag, payload, &parent_refs);
        self.graph.add(tx.clone())?;
        Ok(tx)
    }

    /// Propose a candidate block if Snowball has no preference yet.
    ///
    /// The candidate is the topologically ordered set of transactions
    /// between the current root and the deepest eligible tip, and its merkle
    /// root is the state root that replaying them would produce.
    pub fn propose(&self) -> Result<(), LedgerError> {
        if self.snowball.preferred().is_some() {
            return Ok(());
        }

        let round = self.read_round().clone();

        let eligible = self.graph.find_eligible_parents();
        let mut tips: Vec<Transaction> = eligible
            .iter()
            .filter(|id| **id != round.end_id)
            .filter_map(|id| self.graph.lookup(id))
            .collect();
        tips.sort_by(|a, b| b.depth.cmp(&a.depth).then(a.id.cmp(&b.id)));

        let Some(tip) = tips.into_iter().next() else {
            return Ok(());
        };

        let transactions = self.graph.transactions_since_root(&tip.id);
        if transactions.is_empty() {
            return Ok(());
        }

        let next_index = round.index + 1;
        let merkle_root = {
            let mut state = self.write_state();
            let scratch = state.snapshot();
            let outcome = self.replay(&mut state, &round, next_index, &transactions);
            let merkle_root = state.merkle_root();
            state.revert(scratch);
            outcome?;
            merkle_root
        };

        let tx_ids = transactions.iter().map(|tx| tx.id).collect();
        let block = Block::new(next_index, merkle_root, tx_ids);
        tracing::debug!(
            block = ?block.id,
            index = block.index,
            num_tx = block.tx_ids.len(),
            "proposing candidate block"
        );
        self.snowball.prefer(block);

        Ok(())
    }

    /// One consensus tick: sample peers, query them about our preferred
    /// block, tally the answers and feed Snowball. Finalizes the round when
    /// Snowball decides. Returns whether a round was finalized.
    pub async fn sample_and_tick(&self) -> Result<bool, LedgerError> {
        let Some(preferred) = self.snowball.preferred() else {
            return Ok(false);
        };

        let mut peers = self.sampler.sample();
        peers.truncate(self.config.sample_size);

        let deadline = Duration::from_millis(self.config.query_timeout_ms);
        let mut queries = JoinSet::new();
        for peer in peers {
            let sampler = Arc::clone(&self.sampler);
            let subject = preferred.clone();
            queries.spawn(async move {
                tokio::time::timeout(deadline, sampler.query(&peer, &subject))
                    .await
                    .ok()
                    .flatten()
            });
        }

        let mut votes = Vec::new();
        while let Some(result) = queries.join_next().await {
            // Expired or failed queries contribute nothing to the tallies.
            if let Ok(Some(vote)) = result {
                votes.push(vote);
            }
        }

        {
            let state = self.read_state();
            let (tallies, blocks) = tally_votes(&state, votes);
            self.snowball.tick(&tallies, &blocks);
        }

        if self.snowball.progress() == 0 {
            self.failed_quorum_ticks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_quorum_ticks.store(0, Ordering::Relaxed);
        }

        if !self.snowball.decided() {
            // A preference that cannot reach the alpha quorum is abandoned
            // so the next proposal can pick a different tip.
            let stuck_after = self.config.snowball_beta as u64 * 4;
            if self.failed_quorum_ticks() >= stuck_after.max(8) {
                tracing::warn!(
                    ticks = self.failed_quorum_ticks(),
                    "abandoning preferred block after sustained quorum failure"
                );
                self.snowball.reset();
                self.failed_quorum_ticks.store(0, Ordering::Relaxed);
            }
            return Ok(false);
        }

        let Some(decided) = self.snowball.preferred() else {
            return Ok(false);
        };
        self.finalize(decided)
    }

    /// Apply a decided block and advance the round.
    ///
    /// An invalid block (wrong index, unknown transactions, mismatched
    /// merkle root) resets Snowball so the proposer retries with a different
    /// tip; it is not an error.
    fn finalize(&self, block: Block) -> Result<bool, LedgerError> {
        let round = self.read_round().clone();

        if block.index != round.index + 1 {
            tracing::warn!(
                block = ?block.id,
                expected = round.index + 1,
                got = block.index,
                "decided block targets the wrong round"
            );
            self.snowball.reset();
            return Ok(false);
        }

        if !block.tx_ids.iter().all(|id| self.graph.is_complete(id)) {
            tracing::warn!(block = ?block.id, "decided block references unknown transactions");
            self.snowball.reset();
            return Ok(false);
        }

        let transactions: Vec<Transaction> = block
            .tx_ids
            .iter()
            .filter_map(|id| self.graph.lookup(id))
            .collect();
        let Some(tip) = transactions.last().cloned() else {
            self.snowball.reset();
            return Ok(false);
        };

        let merkle_root = {
            let mut state = self.write_state();
            let snapshot = state.snapshot();
            let outcome = self.replay(&mut state, &round, block.index, &transactions);

            if let Err(error) = outcome {
                state.revert(snapshot);
                return Err(error);
            }

            let merkle_root = state.merkle_root();
            if merkle_root != block.merkle_root {
                tracing::warn!(
                    block = ?block.id,
                    expected = %hex::encode(&block.merkle_root[..8]),
                    got = %hex::encode(&merkle_root[..8]),
                    "decided block merkle root mismatch"
                );
                state.revert(snapshot);
                self.snowball.reset();
                return Ok(false);
            }

            state.commit();
            merkle_root
        };

        let new_round = Round::new(block.index, tip, round.end_id, merkle_root);

        self.graph.reset(&new_round);
        self.graph.prune(&new_round);

        {
            let mut current = self.round.write().unwrap_or_else(|e| e.into_inner());
            *current = new_round.clone();
        }
        {
            let mut last = self.last_progress.write().unwrap_or_else(|e| e.into_inner());
            *last = Instant::now();
        }

        self.snowball.reset();

        tracing::info!(
            round = new_round.index,
            root = ?new_round.end_id,
            num_tx = block.tx_ids.len(),
            merkle = %hex::encode(&merkle_root[..8]),
            "finalized round"
        );

        Ok(true)
    }

    /// Replay a block's transactions plus the matured reward withdrawals.
    ///
    /// Per-transaction failures are logged and skipped; the transaction is
    /// still considered applied by consensus. Fatal errors (gas accounting
    /// corruption) abort the replay.
    fn replay(
        &self,
        state: &mut StateTree,
        round: &Round,
        next_index: u64,
        transactions: &[Transaction],
    ) -> Result<(), LedgerError> {
        for tx in transactions {
            match self.applier.apply(round, state, tx) {
                Ok(()) => {}
                Err(error) if error.is_fatal() => {
                    tracing::error!(tx = ?tx.id, %error, "ledger corruption detected");
                    return Err(LedgerError::Corrupt(error));
                }
                Err(error) => {
                    tracing::debug!(tx = ?tx.id, %error, "transaction rejected during replay");
                }
            }
        }

        state::process_reward_withdrawals(
            state,
            next_index,
            self.config.reward_withdrawals_round_limit,
        );

        Ok(())
    }

    /// The driver loop: propose and tick until cancelled.
    pub async fn run(
        self: Arc<Self>,
        proposal_interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<(), LedgerError> {
        let mut interval = tokio::time::interval(proposal_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.propose()?;
            self.sample_and_tick().await?;
        }

        tracing::info!("ledger driver stopped");
        Ok(())
    }

    /// Watchdog: cancel the node when no round finalizes within the
    /// configured stall timeout. The driver finishes its current round
    /// application and stops cooperatively.
    pub async fn watch_for_stall(self: Arc<Self>, shutdown: CancellationToken) {
        let timeout = Duration::from_secs(self.config.stall_timeout_secs);
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let elapsed = {
                let last = self.last_progress.read().unwrap_or_else(|e| e.into_inner());
                last.elapsed()
            };
            if elapsed > timeout {
                tracing::warn!(
                    stalled_for_secs = elapsed.as_secs(),
                    failed_quorum_ticks = self.failed_quorum_ticks(),
                    "no consensus progress within the stall timeout, shutting down"
                );
                shutdown.cancel();
                return;
            }
        }
    }
}


#[cfg(test)]
impl Ledger {
    /// Test hook: peek at Snowball's preference.
    fn snowball_preferred_for_tests(&self) -> Option<Block> {
        self.snowball.preferred()
    }
}
