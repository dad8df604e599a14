//! Consensus property tests: randomized and scenario-based verification of
//! the view graph, Snowball and applier invariants.
//!
//! These tests exercise the public API of the consensus core to verify the
//! structural properties that underpin the ledger:
//!
//! - **Graph**: depth/confidence derivation, parent ordering, missing-set
//!   accounting, height maintenance, round assignment and pruning
//! - **Snowball**: convergence under a sustained quorum
//! - **Applier**: atomicity of failing transactions, batch equivalence and
//!   gas conservation

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use riptide::applier::{Applier, ContractExecutor, ExecutionOutcome, NoopExecutor};
use riptide::config::ConsensusConfig;
use riptide::consensus::graph::{Graph, GraphError};
use riptide::consensus::snowball::Snowball;
use riptide::ledger::{Block, Round};
use riptide::state::{
    read_balance, read_contract_gas_balance, write_balance, write_contract_code, StateTree,
};
use riptide::transaction::{
    BatchPayload, StakeOpcode, StakePayload, Tag, Transaction, TransferPayload,
};
use riptide::{AccountId, BlockId, TransactionId};

// ── Helpers ─────────────────────────────────────────────────────────────

fn account(byte: u8) -> AccountId {
    AccountId([byte; 32])
}

fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        max_eligible_parents_depth_diff: 10,
        pruning_depth: 3,
        ..Default::default()
    }
}

fn genesis_round() -> Round {
    Round::genesis([0u8; 32])
}

fn nop(nonce: u64, parents: &[&Transaction]) -> Transaction {
    Transaction::new(account(1), account(1), nonce, Tag::Nop, vec![], parents)
}

fn transfer_tx(creator: AccountId, recipient: AccountId, amount: u64) -> Transaction {
    let payload = TransferPayload {
        recipient,
        amount,
        ..Default::default()
    };
    Transaction {
        id: TransactionId([7u8; 32]),
        sender: creator,
        creator,
        nonce: 0,
        parent_ids: vec![TransactionId([1u8; 32])],
        depth: 1,
        confidence: 1,
        seed: 7,
        tag: Tag::Transfer,
        payload: payload.encode(),
    }
}

fn default_applier() -> Applier {
    Applier::new(Arc::new(ConsensusConfig::default()), Box::new(NoopExecutor))
}

/// Build a random DAG layer by layer: each transaction references one to
/// three transactions from the preceding layers.
fn random_dag(rng: &mut StdRng, layers: usize, per_layer: usize) -> (Graph, Vec<Transaction>) {
    let genesis = genesis_round();
    let graph = Graph::new(&genesis, &test_config());

    let mut all = vec![genesis.root.clone()];
    let mut nonce = 0u64;

    for _ in 0..layers {
        let mut layer = Vec::new();
        for _ in 0..per_layer {
            let num_parents = rng.gen_range(1..=3.min(all.len()));
            let mut parents: Vec<&Transaction> = Vec::new();
            while parents.len() < num_parents {
                let candidate = &all[rng.gen_range(0..all.len())];
                if !parents.iter().any(|p| p.id == candidate.id) {
                    parents.push(candidate);
                }
            }
            let tx = nop(nonce, &parents);
            nonce += 1;
            graph.add(tx.clone()).expect("valid transaction");
            layer.push(tx);
        }
        all.extend(layer);
    }

    (graph, all)
}

// ── Graph properties ────────────────────────────────────────────────────

/// Property 1 + 2: every transaction's depth and confidence derive from its
/// parents and parent ids are strictly ascending without duplicates.
#[test]
fn prop_depth_confidence_and_parent_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let (_graph, all) = random_dag(&mut rng, 6, 4);

    let by_id: HashMap<TransactionId, &Transaction> = all.iter().map(|tx| (tx.id, tx)).collect();

    for tx in all.iter().skip(1) {
        let parents: Vec<&&Transaction> = tx
            .parent_ids
            .iter()
            .map(|id| by_id.get(id).expect("parent exists"))
            .collect();

        let max_depth = parents.iter().map(|p| p.depth).max().unwrap();
        let confidence: u64 =
            parents.iter().map(|p| p.confidence).sum::<u64>() + tx.parent_ids.len() as u64;

        assert_eq!(tx.depth, max_depth + 1);
        assert_eq!(tx.confidence, confidence);
        assert!(tx.parent_ids.windows(2).all(|w| w[0] < w[1]));
    }
}

/// Property 3 / scenario S5: every id in the missing set is referenced as a
/// parent by some stored transaction and is itself absent; delivery promotes
/// the held children.
#[test]
fn prop_missing_set_accounting() {
    let genesis = genesis_round();
    let graph = Graph::new(&genesis, &test_config());

    let a = nop(0, &[&genesis.root]);
    let b = nop(1, &[&a]);
    let c = nop(2, &[&a, &b]);

    // Withhold a; b and c are incomplete.
    assert_eq!(graph.add(b.clone()), Err(GraphError::MissingParents));
    assert_eq!(graph.add(c.clone()), Err(GraphError::MissingParents));

    for id in graph.missing() {
        assert!(!graph.is_complete(&id));
        let referenced = [&b, &c].iter().any(|tx| tx.parent_ids.contains(&id));
        assert!(referenced, "missing id is referenced by a stored transaction");
    }

    // Delivering a drains the missing set and promotes everything.
    graph.add(a.clone()).unwrap();
    assert_eq!(graph.num_missing_transactions(), 0);
    assert!(graph.is_complete(&b.id));
    assert!(graph.is_complete(&c.id));
}

/// Property 4: the graph height is one above the deepest transaction.
#[test]
fn prop_height_tracks_max_depth() {
    let mut rng = StdRng::seed_from_u64(11);
    let (graph, all) = random_dag(&mut rng, 5, 3);

    let max_depth = all.iter().map(|tx| tx.depth).max().unwrap();
    assert_eq!(graph.height(), max_depth + 1);
}

/// Property 5: after reset, every transaction between the old and new root
/// depths belongs to the new round's index.
#[test]
fn prop_reset_assigns_rounds() {
    let genesis = genesis_round();
    let graph = Graph::new(&genesis, &test_config());

    let a = nop(0, &[&genesis.root]);
    let b = nop(1, &[&a]);
    let c = nop(2, &[&b]);
    for tx in [&a, &b, &c] {
        graph.add(tx.clone()).unwrap();
    }

    let round_one = Round::new(1, b.clone(), genesis.root.id, [1u8; 32]);
    graph.reset(&round_one);

    // a and b (depths 1..=2) are in round 1; c (depth 3) is not.
    assert!(graph.is_applied(&a.id));
    assert!(graph.is_applied(&b.id));
    assert!(!graph.is_applied(&c.id));
}

/// Property 6 / scenario S6: pruning drops every round more than
/// `pruning_depth` behind, and nothing newer.
#[test]
fn prop_pruning_horizon() {
    let genesis = genesis_round();
    let graph = Graph::new(&genesis, &test_config()); // pruning_depth = 3

    let mut head = genesis.root.clone();
    let mut round = genesis.clone();
    let mut roots = Vec::new();

    for index in 1..=5u64 {
        let tx = nop(index, &[&head]);
        graph.add(tx.clone()).unwrap();
        round = Round::new(index, tx.clone(), round.end_id, [0u8; 32]);
        graph.reset(&round);
        roots.push(tx.clone());
        head = tx;
    }

    graph.prune(&round);

    for (index, tx) in roots.iter().enumerate() {
        let round_index = index as u64 + 1;
        let expect_pruned = round_index + 3 <= 5;
        assert_eq!(
            graph.lookup(&tx.id).is_none(),
            expect_pruned,
            "round {round_index}"
        );
    }
}

// ── Snowball properties ─────────────────────────────────────────────────

/// Property 7 / scenario S4: a subject with a sustained quorum tally decides
/// after beta + 1 consecutive ticks.
#[test]
fn prop_snowball_converges() {
    let snowball = Snowball::new(0.8, 3);

    let x = Block::new(1, [0u8; 32], vec![TransactionId([1u8; 32])]);
    let y = Block::new(1, [0u8; 32], vec![TransactionId([2u8; 32])]);

    let mut tallies = HashMap::new();
    tallies.insert(x.id, 0.9);
    tallies.insert(y.id, 0.1);

    let mut votes: HashMap<BlockId, Block> = HashMap::new();
    votes.insert(x.id, x.clone());
    votes.insert(y.id, y.clone());
    for filler in 0..8u64 {
        let block = Block::new(100 + filler, [0u8; 32], vec![]);
        votes.insert(block.id, block);
    }
    assert_eq!(votes.len(), 10);

    for tick in 1..=4u16 {
        snowball.tick(&tallies, &votes);
        assert_eq!(snowball.progress(), tick);
    }

    assert!(snowball.decided());
    assert_eq!(snowball.preferred().unwrap().id, x.id);
    assert_eq!(snowball.progress(), 4);
}

// ── Applier properties ──────────────────────────────────────────────────

/// Property 8: a failing transaction leaves the state bytewise unchanged.
#[test]
fn prop_failed_transactions_are_atomic() {
    let applier = default_applier();
    let round = genesis_round();

    let mut state = StateTree::new();
    write_balance(&mut state, &account(1), 10);
    let before = state.merkle_root();

    // Overdraft transfer.
    let overdraft = transfer_tx(account(1), account(2), 100);
    assert!(applier.apply(&round, &mut state, &overdraft).is_err());
    assert_eq!(state.merkle_root(), before);

    // Understaked withdrawal.
    let mut withdraw = transfer_tx(account(1), account(2), 0);
    withdraw.tag = Tag::Stake;
    withdraw.payload = StakePayload {
        opcode: StakeOpcode::WithdrawStake,
        amount: 5,
    }
    .encode();
    assert!(applier.apply(&round, &mut state, &withdraw).is_err());
    assert_eq!(state.merkle_root(), before);

    // Malformed payload.
    let mut malformed = transfer_tx(account(1), account(2), 0);
    malformed.payload = vec![0xff];
    assert!(applier.apply(&round, &mut state, &malformed).is_err());
    assert_eq!(state.merkle_root(), before);
}

/// Property 9: applying a batch of succeeding entries is equivalent to
/// applying them sequentially as standalone transactions.
#[test]
fn prop_batch_equals_sequential() {
    let applier = default_applier();
    let round = genesis_round();

    let seed = |state: &mut StateTree| {
        write_balance(state, &account(1), 1_000);
    };

    let entries = [
        (
            Tag::Transfer,
            TransferPayload {
                recipient: account(2),
                amount: 100,
                ..Default::default()
            }
            .encode(),
        ),
        (
            Tag::Stake,
            StakePayload {
                opcode: StakeOpcode::PlaceStake,
                amount: 300,
            }
            .encode(),
        ),
        (
            Tag::Transfer,
            TransferPayload {
                recipient: account(3),
                amount: 50,
                ..Default::default()
            }
            .encode(),
        ),
    ];

    // Batched.
    let mut batched = StateTree::new();
    seed(&mut batched);
    let mut batch = BatchPayload::default();
    for (tag, payload) in &entries {
        batch.push(*tag, payload.clone());
    }
    let mut batch_tx = transfer_tx(account(1), account(2), 0);
    batch_tx.tag = Tag::Batch;
    batch_tx.payload = batch.encode();
    applier.apply(&round, &mut batched, &batch_tx).unwrap();

    // Sequential.
    let mut sequential = StateTree::new();
    seed(&mut sequential);
    for (tag, payload) in &entries {
        let mut tx = transfer_tx(account(1), account(2), 0);
        tx.tag = *tag;
        tx.payload = payload.clone();
        applier.apply(&round, &mut sequential, &tx).unwrap();
    }

    assert_eq!(batched.merkle_root(), sequential.merkle_root());
}

/// Executor that burns a fixed amount of gas and optionally faults.
struct BurningExecutor {
    gas_used: u64,
    error: Option<String>,
}

impl ContractExecutor for BurningExecutor {
    fn execute(
        &self,
        state: &mut StateTree,
        _contract_id: &AccountId,
        _round: &Round,
        _tx: &Transaction,
        _amount: u64,
        _gas_limit: u64,
        _func_name: &[u8],
        _func_params: &[u8],
        _code: &[u8],
    ) -> ExecutionOutcome {
        state.put(b"scratch".to_vec(), vec![1]);
        ExecutionOutcome {
            gas_used: self.gas_used,
            gas_limit_exceeded: false,
            queue: vec![],
            error: self.error.clone(),
        }
    }
}

/// Property 10: gas charged to the payer balance plus the contract gas
/// balance delta equals the gas the executor reported, on both the success
/// and the fault path.
#[test]
fn prop_gas_conservation() {
    for (error, contract_gas) in [
        (None, 0u64),
        (None, 25),
        (Some("trap".to_string()), 0),
        (Some("trap".to_string()), 25),
    ] {
        let applier = Applier::new(
            Arc::new(ConsensusConfig::default()),
            Box::new(BurningExecutor {
                gas_used: 40,
                error: error.clone(),
            }),
        );
        let round = genesis_round();

        let mut state = StateTree::new();
        write_balance(&mut state, &account(1), 500);
        write_contract_code(&mut state, &account(2), b"\0asm");
        riptide::state::write_contract_gas_balance(&mut state, &account(2), contract_gas);

        let payload = TransferPayload {
            recipient: account(2),
            amount: 0,
            gas_limit: 100,
            func_name: b"run".to_vec(),
            ..Default::default()
        };
        let mut tx = transfer_tx(account(1), account(2), 0);
        tx.payload = payload.encode();

        applier.apply(&round, &mut state, &tx).unwrap();

        let paid_from_balance = 500 - read_balance(&state, &account(1));
        let paid_from_gas_balance = contract_gas - read_contract_gas_balance(&state, &account(2));
        assert_eq!(
            paid_from_balance + paid_from_gas_balance,
            40,
            "error={error:?} contract_gas={contract_gas}"
        );
    }
}
