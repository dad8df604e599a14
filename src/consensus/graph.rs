//! The view graph: the local in-memory DAG of transactions.
//!
//! Every transaction references one or more parents, and the graph tracks
//! ancestry adjacency, completeness, parent eligibility and per-round
//! membership. A transaction whose ancestry is not yet fully present is held
//! as *incomplete* and promoted once its last missing parent completes.
//!
//! All public operations are thread-safe behind a single coarse
//! reader-writer lock covering every map and index; mutators take the write
//! side, observers the read side.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::ConsensusConfig;
use crate::ledger::Round;
use crate::transaction::{Tag, Transaction};
use crate::{AccountId, TransactionId};

/// Errors from view graph operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("transaction already exists in the graph")]
    AlreadyExists,
    #[error("parents for transaction are not in graph")]
    MissingParents,
    #[error("transaction must have an id")]
    ZeroId,
    #[error("transaction must have a sender associated to it")]
    ZeroSender,
    #[error("transaction must have a creator associated to it")]
    ZeroCreator,
    #[error("transaction has no parents")]
    NoParents,
    #[error("transaction must have sorted parent ids")]
    ParentsUnsorted,
    #[error("transaction must not have duplicate parent ids")]
    DuplicateParent,
    #[error("transaction must not include itself in its parents")]
    SelfParent,
    #[error("transaction must have no payload if it is a nop")]
    UnexpectedPayload,
    #[error("transaction must have a payload if it is not a nop")]
    MissingPayload,
    #[error("parent not stored in graph")]
    ParentNotStored,
    #[error("parent depth {parent_depth} exceeds max eligible parents depth diff against depth {depth}")]
    DepthDiffExceeded { parent_depth: u64, depth: u64 },
    #[error("transaction depth is invalid: expected {expected}, got {got}")]
    DepthMismatch { expected: u64, got: u64 },
    #[error("transaction confidence is invalid: expected {expected}, got {got}")]
    ConfidenceMismatch { expected: u64, got: u64 },
}

/// Everything the coarse lock protects.
struct GraphInner {
    /// All live transactions, keyed by id. Owns the transaction data;
    /// adjacency and indices hold ids only.
    transactions: HashMap<TransactionId, Transaction>,
    /// Children of transactions (reverse ancestry edges).
    children: HashMap<TransactionId, Vec<TransactionId>>,
    /// Transactions eligible to be referenced as parents.
    eligible: HashSet<TransactionId>,
    /// Transactions whose parent set is not fully present and complete.
    incomplete: HashSet<TransactionId>,
    /// Ids referenced as parents but absent from the graph.
    missing: HashSet<TransactionId>,
    /// Index of transactions by their one-byte seed.
    seed_index: HashMap<u8, HashSet<TransactionId>>,
    /// Index of transactions by depth.
    depth_index: HashMap<u64, HashSet<TransactionId>>,
    /// Index of transactions by the round that finalized them.
    round_index: HashMap<u64, HashSet<TransactionId>>,
    /// Root of the current round.
    root_id: TransactionId,
    /// 1 + the maximum depth observed.
    height: u64,
}

/// The transaction view graph.
pub struct Graph {
    max_depth_diff: u64,
    pruning_depth: u64,
    inner: RwLock<GraphInner>,
}

impl Graph {
    /// Create a graph rooted at the given round's root transaction.
    pub fn new(genesis: &Round, config: &ConsensusConfig) -> Graph {
        let root = genesis.root.clone();
        let mut inner = GraphInner {
            transactions: HashMap::new(),
            children: HashMap::new(),
            eligible: HashSet::new(),
            incomplete: HashSet::new(),
            missing: HashSet::new(),
            seed_index: HashMap::new(),
            depth_index: HashMap::new(),
            round_index: HashMap::new(),
            root_id: root.id,
            height: root.depth + 1,
        };

        inner.transactions.insert(root.id, root.clone());

        let graph = Graph {
            max_depth_diff: config.max_eligible_parents_depth_diff,
            pruning_depth: config.pruning_depth,
            inner: RwLock::new(inner),
        };
        graph.create_indices(&mut graph.write(), &root);
        graph
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a transaction into the graph.
    ///
    /// Returns [`GraphError::MissingParents`] when the transaction is
    /// retained as incomplete because some ancestor is absent or itself
    /// incomplete; no retry is needed, the graph promotes the transaction
    /// automatically once its ancestry arrives.
    pub fn add(&self, tx: Transaction) -> Result<(), GraphError> {
        let mut inner = self.write();

        if inner.transactions.contains_key(&tx.id) {
            return Err(GraphError::AlreadyExists);
        }

        assert_transaction_is_valid(&tx)?;

        let id = tx.id;
        let parent_ids = tx.parent_ids.clone();

        inner.transactions.insert(id, tx);
        inner.missing.remove(&id);

        let missing_parents = process_parents(&mut inner, id, &parent_ids);

        if !missing_parents.is_empty() {
            inner.incomplete.insert(id);
            return Err(GraphError::MissingParents);
        }

        self.mark_complete(&mut inner, id)
    }

    /// Promote a transaction to complete, then promote any incomplete
    /// children whose ancestry became fully available.
    ///
    /// Uses an explicit work queue rather than recursion so that arbitrarily
    /// long dependent chains cannot exhaust the stack. A promoted child that
    /// fails depth/confidence validation is deleted along with its progeny;
    /// only a failure of the initially added transaction is surfaced.
    fn mark_complete(
        &self,
        inner: &mut GraphInner,
        id: TransactionId,
    ) -> Result<(), GraphError> {
        let mut queue = VecDeque::new();
        queue.push_back(id);
        let mut first = true;

        while let Some(current) = queue.pop_front() {
            let tx = match inner.transactions.get(&current) {
                Some(tx) => tx.clone(),
                None => continue,
            };

            if let Err(e) = self.assert_transaction_is_complete(inner, &tx) {
                delete_progeny(inner, current);
                if first {
                    return Err(e);
                }
                tracing::debug!(id = ?current, error = %e, "deleted invalid promoted transaction");
                continue;
            }
            first = false;

            self.create_indices(inner, &tx);

            for child_id in inner.children.get(&current).cloned().unwrap_or_default() {
                if !inner.incomplete.contains(&child_id) {
                    continue;
                }
                let Some(child) = inner.transactions.get(&child_id) else {
                    continue;
                };
                let ready = child.parent_ids.iter().all(|parent_id| {
                    inner.transactions.contains_key(parent_id)
                        && !inner.incomplete.contains(parent_id)
                });
                if ready {
                    inner.incomplete.remove(&child_id);
                    queue.push_back(child_id);
                }
            }
        }

        Ok(())
    }

    /// Check that a transaction's depth and confidence match its parents and
    /// that no parent lies beyond the eligibility horizon.
    fn assert_transaction_is_complete(
        &self,
        inner: &GraphInner,
        tx: &Transaction,
    ) -> Result<(), GraphError> {
        let mut max_depth: u64 = 0;
        let mut confidence: u64 = 0;

        for parent_id in &tx.parent_ids {
            let parent = inner
                .transactions
                .get(parent_id)
                .ok_or(GraphError::ParentNotStored)?;

            if parent.depth + self.max_depth_diff < tx.depth {
                return Err(GraphError::DepthDiffExceeded {
                    parent_depth: parent.depth,
                    depth: tx.depth,
                });
            }

            max_depth = max_depth.max(parent.depth);
            confidence += parent.confidence;
        }

        let expected_depth = max_depth + 1;
        let expected_confidence = confidence + tx.parent_ids.len() as u64;

        if tx.depth != expected_depth {
            return Err(GraphError::DepthMismatch {
                expected: expected_depth,
                got: tx.depth,
            });
        }
        if tx.confidence != expected_confidence {
            return Err(GraphError::ConfidenceMismatch {
                expected: expected_confidence,
                got: tx.confidence,
            });
        }

        Ok(())
    }

    /// Index a complete transaction by seed and depth, update the graph
    /// height, and mark it eligible if it is childless within the horizon.
    fn create_indices(&self, inner: &mut GraphInner, tx: &Transaction) {
        inner.seed_index.entry(tx.seed).or_default().insert(tx.id);
        inner.depth_index.entry(tx.depth).or_default().insert(tx.id);

        if inner.height <= tx.depth {
            inner.height = tx.depth + 1;
        }

        let childless = inner.children.get(&tx.id).map_or(true, Vec::is_empty);
        if childless && tx.depth + self.max_depth_diff >= inner.height {
            inner.eligible.insert(tx.id);
        }
    }

    /// Candidate parents for a new transaction.
    ///
    /// Lazily evicts entries whose transaction disappeared, whose depth fell
    /// to or below the root's, or whose depth dropped out of the horizon.
    pub fn find_eligible_parents(&self) -> Vec<TransactionId> {
        let mut inner = self.write();

        let root_id = inner.root_id;
        let root_depth = inner
            .transactions
            .get(&root_id)
            .map(|root| root.depth)
            .unwrap_or(0);
        let height = inner.height;
        let max_depth_diff = self.max_depth_diff;

        let candidates = std::mem::take(&mut inner.eligible);
        let mut surviving = HashSet::with_capacity(candidates.len());
        let mut eligible = Vec::with_capacity(candidates.len());

        for id in candidates {
            let Some(tx) = inner.transactions.get(&id) else {
                continue;
            };
            if tx.id != root_id && tx.depth <= root_depth {
                continue;
            }
            if tx.depth + max_depth_diff <= height {
                continue;
            }
            surviving.insert(id);
            eligible.push(id);
        }

        inner.eligible = surviving;
        eligible.sort();
        eligible
    }

    /// Install the new round's root and move every transaction whose depth
    /// lies in `(old_root.depth, new_root.depth]` into the round's index.
    pub fn reset(&self, new_round: &Round) {
        let mut inner = self.write();

        let root = new_round.root.clone();
        let old_root_depth = inner
            .transactions
            .get(&inner.root_id)
            .map(|old| old.depth)
            .unwrap_or(0);

        inner.transactions.insert(root.id, root.clone());
        inner.missing.remove(&root.id);
        inner.incomplete.remove(&root.id);
        self.create_indices(&mut inner, &root);

        let mut finalized = HashSet::new();
        for depth in old_root_depth + 1..=root.depth {
            if let Some(ids) = inner.depth_index.get(&depth) {
                finalized.extend(ids.iter().copied());
            }
        }
        inner.round_index.insert(new_round.index, finalized);

        inner.root_id = root.id;
    }

    /// Delete every transaction finalized in a round at least
    /// `pruning_depth` rounds behind the given one.
    pub fn prune(&self, current: &Round) {
        let mut inner = self.write();

        let expired: Vec<u64> = inner
            .round_index
            .keys()
            .copied()
            .filter(|round_index| round_index + self.pruning_depth <= current.index)
            .collect();

        for round_index in expired {
            if let Some(ids) = inner.round_index.remove(&round_index) {
                let num_pruned = ids.len();
                for id in ids {
                    delete_transaction(&mut inner, id);
                }
                tracing::debug!(
                    pruned_round = round_index,
                    current_round = current.index,
                    num_tx = num_pruned,
                    "pruned round and its transactions"
                );
            }
        }
    }

    /// Look up a transaction by id.
    ///
    /// A miss records the id in the missing set so the gossip layer can
    /// fetch it from peers.
    pub fn lookup(&self, id: &TransactionId) -> Option<Transaction> {
        let mut inner = self.write();
        match inner.transactions.get(id) {
            Some(tx) => Some(tx.clone()),
            None => {
                inner.missing.insert(*id);
                None
            }
        }
    }

    /// List transactions, optionally filtered by sender or creator, stably
    /// sorted by depth, with offset/limit pagination.
    pub fn list(
        &self,
        offset: usize,
        limit: usize,
        sender: Option<AccountId>,
        creator: Option<AccountId>,
    ) -> Vec<Transaction> {
        let inner = self.read();

        let mut transactions: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|tx| match (sender, creator) {
                (None, None) => true,
                (s, c) => s.is_some_and(|s| tx.sender == s) || c.is_some_and(|c| tx.creator == c),
            })
            .cloned()
            .collect();

        transactions.sort_by_key(|tx| tx.id);
        transactions.sort_by_key(|tx| tx.depth);

        if offset >= transactions.len() {
            return Vec::new();
        }
        if limit > 0 {
            transactions.truncate((offset + limit).min(transactions.len()));
        }
        transactions.split_off(offset)
    }

    /// Ids referenced as parents but not yet received.
    pub fn missing(&self) -> Vec<TransactionId> {
        self.read().missing.iter().copied().collect()
    }

    /// Ids of transactions whose seed matches the given difficulty byte.
    pub fn transactions_with_difficulty(&self, seed: u8) -> Option<Vec<TransactionId>> {
        let inner = self.read();
        inner
            .seed_index
            .get(&seed)
            .map(|ids| ids.iter().copied().collect())
    }

    /// Whether a transaction has been finalized into some round.
    pub fn is_applied(&self, id: &TransactionId) -> bool {
        let inner = self.read();
        inner.round_index.values().any(|round| round.contains(id))
    }

    /// The transactions strictly above the current root, up to and including
    /// the given tip, in topological (depth, id) order.
    ///
    /// This is the candidate transaction set of a proposed block.
    pub fn transactions_since_root(&self, tip: &TransactionId) -> Vec<Transaction> {
        let inner = self.read();

        let root_depth = inner
            .transactions
            .get(&inner.root_id)
            .map(|root| root.depth)
            .unwrap_or(0);

        let mut collected = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![*tip];

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(tx) = inner.transactions.get(&id) else {
                continue;
            };
            if tx.depth <= root_depth {
                continue;
            }
            stack.extend(tx.parent_ids.iter().copied());
            collected.push(tx.clone());
        }

        collected.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.id.cmp(&b.id)));
        collected
    }

    pub fn num_transactions_in_depth(&self, depth: u64) -> u64 {
        self.read().depth_index.get(&depth).map_or(0, |ids| ids.len() as u64)
    }

    pub fn num_transactions_in_store(&self) -> u64 {
        self.read().transactions.len() as u64
    }

    pub fn num_missing_transactions(&self) -> u64 {
        self.read().missing.len() as u64
    }

    pub fn num_incomplete_transactions(&self) -> u64 {
        self.read().incomplete.len() as u64
    }

    pub fn height(&self) -> u64 {
        self.read().height
    }

    /// The current round root.
    pub fn root(&self) -> Option<Transaction> {
        let inner = self.read();
        inner.transactions.get(&inner.root_id).cloned()
    }

    /// Whether a transaction is present and complete.
    pub fn is_complete(&self, id: &TransactionId) -> bool {
        let inner = self.read();
        inner.transactions.contains_key(id) && !inner.incomplete.contains(id)
    }
}

/// Structural validation of a transaction, independent of graph state.
fn assert_transaction_is_valid(tx: &Transaction) -> Result<(), GraphError> {
    if tx.id == TransactionId::default() {
        return Err(GraphError::ZeroId);
    }
    if tx.sender == AccountId::default() {
        return Err(GraphError::ZeroSender);
    }
    if tx.creator == AccountId::default() {
        return Err(GraphError::ZeroCreator);
    }
    if tx.parent_ids.is_empty() {
        return Err(GraphError::NoParents);
    }

    for window in tx.parent_ids.windows(2) {
        match window[0].cmp(&window[1]) {
            std::cmp::Ordering::Less => {}
            std::cmp::Ordering::Equal => return Err(GraphError::DuplicateParent),
            std::cmp::Ordering::Greater => return Err(GraphError::ParentsUnsorted),
        }
    }
    if tx.parent_ids.contains(&tx.id) {
        return Err(GraphError::SelfParent);
    }

    match tx.tag {
        Tag::Nop if !tx.payload.is_empty() => return Err(GraphError::UnexpectedPayload),
        tag if tag != Tag::Nop && tx.payload.is_empty() => {
            return Err(GraphError::MissingPayload)
        }
        _ => {}
    }

    Ok(())
}

/// Record child links for every parent and collect those absent or
/// incomplete. Parents gain a child here, so they leave the eligible set;
/// absent parents are recorded as missing for the gossip layer.
fn process_parents(
    inner: &mut GraphInner,
    id: TransactionId,
    parent_ids: &[TransactionId],
) -> Vec<TransactionId> {
    let mut missing_parents = Vec::new();

    for parent_id in parent_ids {
        let exists = inner.transactions.contains_key(parent_id);
        if !exists {
            inner.missing.insert(*parent_id);
        }
        if !exists || inner.incomplete.contains(parent_id) {
            missing_parents.push(*parent_id);
        }

        inner.children.entry(*parent_id).or_default().push(id);
        inner.eligible.remove(parent_id);
    }

    missing_parents
}

/// Delete all traces of a transaction from the graph and its indices.
fn delete_transaction(inner: &mut GraphInner, id: TransactionId) {
    if let Some(tx) = inner.transactions.get(&id) {
        let (seed, depth) = (tx.seed, tx.depth);
        if let Some(ids) = inner.seed_index.get_mut(&seed) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.seed_index.remove(&seed);
            }
        }
        if let Some(ids) = inner.depth_index.get_mut(&depth) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.depth_index.remove(&depth);
            }
        }
    }

    inner.transactions.remove(&id);
    inner.children.remove(&id);
    inner.eligible.remove(&id);
    inner.incomplete.remove(&id);
    inner.missing.remove(&id);
}

/// Delete a transaction together with its entire progeny. Used when a
/// transaction can never validate; its descendants cannot either.
fn delete_progeny(inner: &mut GraphInner, id: TransactionId) {
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
        if let Some(children) = inner.children.get(&current) {
            stack.extend(children.iter().copied());
        }
        delete_transaction(inner, current);
    }
}
