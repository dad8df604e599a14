//! End-to-end tests for the Riptide ledger.
//!
//! These tests drive a single-node ledger with the loopback sampler through
//! complete flows: transaction ingest, block proposal, Snowball decision,
//! round application, reward disbursement, pruning and stall detection.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use riptide::applier::NoopExecutor;
use riptide::config::ConsensusConfig;
use riptide::genesis::{apply_genesis, dev_genesis};
use riptide::ledger::{Ledger, SoloSampler};
use riptide::state::{read_balance, read_stake, StateTree};
use riptide::transaction::{StakeOpcode, StakePayload, Tag, TransferPayload};
use riptide::AccountId;

// ── Helpers ─────────────────────────────────────────────────────────────

fn account(byte: u8) -> AccountId {
    AccountId([byte; 32])
}

fn fast_config() -> ConsensusConfig {
    ConsensusConfig {
        snowball_beta: 1,
        sample_size: 4,
        pruning_depth: 2,
        reward_withdrawals_round_limit: 2,
        min_reward_withdraw: 10,
        ..Default::default()
    }
}

fn solo_ledger(config: ConsensusConfig) -> Arc<Ledger> {
    let mut state = StateTree::new();
    apply_genesis(&mut state, &dev_genesis());
    Arc::new(Ledger::new(
        Arc::new(config),
        state,
        Box::new(NoopExecutor),
        Arc::new(SoloSampler::new(account(1))),
    ))
}

/// Drive consensus until the current proposal finalizes.
async fn finalize_round(ledger: &Ledger) {
    ledger.propose().unwrap();
    for _ in 0..64 {
        if ledger.sample_and_tick().await.unwrap() {
            return;
        }
    }
    panic!("round did not finalize within 64 ticks");
}

// ── Flows ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn transfer_finalizes_and_settles() {
    let ledger = solo_ledger(fast_config());
    let initial = ledger.with_state(|s| read_balance(s, &account(1)));

    let payload = TransferPayload {
        recipient: account(9),
        amount: 12_345,
        ..Default::default()
    };
    ledger
        .create_transaction(account(1), account(1), 0, Tag::Transfer, payload.encode())
        .unwrap();

    finalize_round(&ledger).await;

    assert_eq!(ledger.round().index, 1);
    assert_eq!(
        ledger.with_state(|s| read_balance(s, &account(1))),
        initial - 12_345
    );
    assert_eq!(ledger.with_state(|s| read_balance(s, &account(9))), 12_345);

    // The committed merkle root matches the finalized round's.
    assert_eq!(
        ledger.round().merkle_root,
        ledger.with_state(|s| s.merkle_root())
    );
}

#[tokio::test]
async fn stake_lifecycle_across_rounds() {
    let ledger = solo_ledger(fast_config());

    let place = StakePayload {
        opcode: StakeOpcode::PlaceStake,
        amount: 500,
    };
    ledger
        .create_transaction(account(1), account(1), 0, Tag::Stake, place.encode())
        .unwrap();
    finalize_round(&ledger).await;
    assert_eq!(ledger.with_state(|s| read_stake(s, &account(1))), 500);

    let withdraw = StakePayload {
        opcode: StakeOpcode::WithdrawStake,
        amount: 200,
    };
    ledger
        .create_transaction(account(1), account(1), 1, Tag::Stake, withdraw.encode())
        .unwrap();
    finalize_round(&ledger).await;
    assert_eq!(ledger.with_state(|s| read_stake(s, &account(1))), 300);
}

#[tokio::test]
async fn reward_withdrawal_disburses_rounds_later() {
    // Genesis grants account(1) a reward balance; the withdrawal request is
    // disbursed once the round limit (2) has elapsed.
    let mut state = StateTree::new();
    apply_genesis(&mut state, &dev_genesis());
    riptide::state::write_reward(&mut state, &account(1), 1_000);
    state.commit();
    let ledger = Arc::new(Ledger::new(
        Arc::new(fast_config()),
        state,
        Box::new(NoopExecutor),
        Arc::new(SoloSampler::new(account(1))),
    ));

    let withdraw = StakePayload {
        opcode: StakeOpcode::WithdrawReward,
        amount: 100,
    };
    ledger
        .create_transaction(account(1), account(1), 0, Tag::Stake, withdraw.encode())
        .unwrap();

    let balance_before = ledger.with_state(|s| read_balance(s, &account(1)));

    // Round 1 queues the request; nothing is credited yet.
    finalize_round(&ledger).await;
    assert_eq!(
        ledger.with_state(|s| read_balance(s, &account(1))),
        balance_before
    );

    // Drive further rounds until the request matures.
    for nonce in 1..=2u64 {
        ledger
            .create_transaction(account(1), account(1), nonce, Tag::Nop, vec![])
            .unwrap();
        finalize_round(&ledger).await;
    }

    assert_eq!(
        ledger.with_state(|s| read_balance(s, &account(1))),
        balance_before + 100
    );
}

#[tokio::test]
async fn graph_prunes_old_rounds() {
    let ledger = solo_ledger(fast_config()); // pruning_depth = 2

    let mut round_one_tx = None;
    for round in 1..=4u64 {
        let tx = ledger
            .create_transaction(account(1), account(1), round, Tag::Nop, vec![])
            .unwrap();
        if round == 1 {
            round_one_tx = Some(tx);
        }
        finalize_round(&ledger).await;
    }

    // Round 1 is beyond the pruning horizon (1 + 2 <= 4).
    let pruned = round_one_tx.unwrap();
    assert!(ledger.graph().lookup(&pruned.id).is_none());
    assert_eq!(ledger.round().index, 4);
}

#[tokio::test]
async fn rejected_transactions_do_not_stall_consensus() {
    let ledger = solo_ledger(fast_config());

    // account(9) is unfunded; this transfer will be rejected at replay.
    let overdraft = TransferPayload {
        recipient: account(1),
        amount: 777,
        ..Default::default()
    };
    ledger
        .create_transaction(account(9), account(9), 0, Tag::Transfer, overdraft.encode())
        .unwrap();

    let funded = TransferPayload {
        recipient: account(9),
        amount: 5,
        ..Default::default()
    };
    ledger
        .create_transaction(account(1), account(1), 0, Tag::Transfer, funded.encode())
        .unwrap();

    finalize_round(&ledger).await;

    assert_eq!(ledger.round().index, 1);
    assert_eq!(ledger.with_state(|s| read_balance(s, &account(9))), 5);
}

#[tokio::test]
async fn driver_loop_finalizes_rounds() {
    let config = ConsensusConfig {
        snowball_beta: 1,
        ..fast_config()
    };
    let ledger = solo_ledger(config);

    for nonce in 0..4u64 {
        ledger
            .create_transaction(account(1), account(1), nonce, Tag::Nop, vec![])
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let driver = tokio::spawn(
        Arc::clone(&ledger).run(Duration::from_millis(10), shutdown.clone()),
    );

    // Wait until at least one round lands, then stop the driver.
    for _ in 0..100 {
        if ledger.round().index >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    driver.await.unwrap().unwrap();

    assert!(ledger.round().index >= 1);
}

#[tokio::test]
async fn stall_watchdog_cancels_on_no_progress() {
    let config = ConsensusConfig {
        stall_timeout_secs: 0,
        ..fast_config()
    };
    let ledger = solo_ledger(config);

    let shutdown = CancellationToken::new();
    let watchdog = tokio::spawn(Arc::clone(&ledger).watch_for_stall(shutdown.clone()));

    watchdog.await.unwrap();
    assert!(shutdown.is_cancelled());
}
