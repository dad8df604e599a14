//! Authenticated ledger state.
//!
//! [`StateTree`] is an ordered key-value map with scoped snapshot/revert and
//! a merkle root over its contents, the contract the consensus core expects
//! from the authenticated persistent map. Reverts are implemented as an
//! explicit journal of writes: every mutation records the previous value, a
//! snapshot is a journal position, and reverting undoes entries back to that
//! position. Snapshots nest, which the applier relies on for contract calls
//! inside already-snapshotted transactions.
//!
//! The typed accessors below define the stable key layout:
//!
//! ```text
//! balance/<account>                          u64 LE
//! stake/<account>                            u64 LE
//! reward/<account>                           u64 LE
//! contract_code/<account>                    bytes
//! contract_gas_balance/<account>             u64 LE
//! reward_withdrawal/<round>/<account>/<seq>  u64 LE amount
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AccountId, Hash};

/// A journal position to revert to. Only valid until the next `commit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotId(usize);

struct JournalEntry {
    key: Vec<u8>,
    /// Value before the write; `None` if the key was absent.
    previous: Option<Vec<u8>>,
}

/// In-memory authenticated ordered map with snapshot/revert.
#[derive(Default)]
pub struct StateTree {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    journal: Vec<JournalEntry>,
}

impl StateTree {
    pub fn new() -> StateTree {
        StateTree::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let previous = self.entries.insert(key.clone(), value);
        self.journal.push(JournalEntry { key, previous });
    }

    pub fn delete(&mut self, key: &[u8]) {
        if let Some(previous) = self.entries.remove(key) {
            self.journal.push(JournalEntry {
                key: key.to_vec(),
                previous: Some(previous),
            });
        }
    }

    /// Take a revert point at the current journal position.
    pub fn snapshot(&self) -> SnapshotId {
        SnapshotId(self.journal.len())
    }

    /// Undo every write made since the snapshot was taken.
    pub fn revert(&mut self, snapshot: SnapshotId) {
        while self.journal.len() > snapshot.0 {
            // Pop cannot fail: len > snapshot.0 >= 0.
            let Some(entry) = self.journal.pop() else {
                break;
            };
            match entry.previous {
                Some(previous) => self.entries.insert(entry.key, previous),
                None => self.entries.remove(&entry.key),
            };
        }
    }

    /// Discard the journal, fixing the current contents as the new baseline.
    /// Outstanding [`SnapshotId`]s are invalidated.
    pub fn commit(&mut self) {
        self.journal.clear();
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merkle root over all entries in key order.
    pub fn merkle_root(&self) -> Hash {
        let mut level: Vec<Hash> = self
            .entries
            .iter()
            .map(|(key, value)| crate::hash_parts(&[key, value]))
            .collect();

        if level.is_empty() {
            return [0u8; 32];
        }

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => crate::hash_parts(&[left, right]),
                    [single] => *single,
                    _ => unreachable!("chunks(2) yields 1 or 2 elements"),
                })
                .collect();
        }

        level[0]
    }
}

/// A reward withdrawal waiting for disbursement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardWithdrawalRequest {
    pub account: AccountId,
    pub amount: u64,
    pub round_index: u64,
}

const BALANCE_PREFIX: &[u8] = b"balance/";
const STAKE_PREFIX: &[u8] = b"stake/";
const REWARD_PREFIX: &[u8] = b"reward/";
const CONTRACT_CODE_PREFIX: &[u8] = b"contract_code/";
const CONTRACT_GAS_BALANCE_PREFIX: &[u8] = b"contract_gas_balance/";
const REWARD_WITHDRAWAL_PREFIX: &[u8] = b"reward_withdrawal/";

fn account_key(prefix: &[u8], account: &AccountId) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + account.0.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(&account.0);
    key
}

fn read_u64(state: &StateTree, key: &[u8]) -> u64 {
    state
        .get(key)
        .and_then(|value| value.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

pub fn read_balance(state: &StateTree, account: &AccountId) -> u64 {
    read_u64(state, &account_key(BALANCE_PREFIX, account))
}

pub fn write_balance(state: &mut StateTree, account: &AccountId, balance: u64) {
    state.put(
        account_key(BALANCE_PREFIX, account),
        balance.to_le_bytes().to_vec(),
    );
}

pub fn read_stake(state: &StateTree, account: &AccountId) -> u64 {
    read_u64(state, &account_key(STAKE_PREFIX, account))
}

pub fn write_stake(state: &mut StateTree, account: &AccountId, stake: u64) {
    state.put(
        account_key(STAKE_PREFIX, account),
        stake.to_le_bytes().to_vec(),
    );
}

pub fn read_reward(state: &StateTree, account: &AccountId) -> u64 {
    read_u64(state, &account_key(REWARD_PREFIX, account))
}

pub fn write_reward(state: &mut StateTree, account: &AccountId, reward: u64) {
    state.put(
        account_key(REWARD_PREFIX, account),
        reward.to_le_bytes().to_vec(),
    );
}

pub fn read_contract_code(state: &StateTree, account: &AccountId) -> Option<Vec<u8>> {
    state
        .get(&account_key(CONTRACT_CODE_PREFIX, account))
        .map(<[u8]>::to_vec)
}

pub fn write_contract_code(state: &mut StateTree, account: &AccountId, code: &[u8]) {
    state.put(account_key(CONTRACT_CODE_PREFIX, account), code.to_vec());
}

pub fn read_contract_gas_balance(state: &StateTree, account: &AccountId) -> u64 {
    read_u64(state, &account_key(CONTRACT_GAS_BALANCE_PREFIX, account))
}

pub fn write_contract_gas_balance(state: &mut StateTree, account: &AccountId, balance: u64) {
    state.put(
        account_key(CONTRACT_GAS_BALANCE_PREFIX, account),
        balance.to_le_bytes().to_vec(),
    );
}

/// Round component of a reward withdrawal key, big-endian so prefix scans
/// enumerate rounds in order.
fn reward_withdrawal_round_prefix(round_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(REWARD_WITHDRAWAL_PREFIX.len() + 8);
    key.extend_from_slice(REWARD_WITHDRAWAL_PREFIX);
    key.extend_from_slice(&round_index.to_be_bytes());
    key
}

/// Queue a reward withdrawal request for later disbursement.
pub fn store_reward_withdrawal(state: &mut StateTree, request: &RewardWithdrawalRequest) {
    let mut account_prefix = reward_withdrawal_round_prefix(request.round_index);
    account_prefix.extend_from_slice(&request.account.0);

    let seq = state.scan_prefix(&account_prefix).len() as u64;

    let mut key = account_prefix;
    key.extend_from_slice(&seq.to_be_bytes());
    state.put(key, request.amount.to_le_bytes().to_vec());
}

/// Disburse every queued withdrawal whose round is at least `round_limit`
/// rounds behind `round_index`: the entry is deleted and its amount credited
/// to the account balance. Returns the number of requests disbursed.
pub fn process_reward_withdrawals(
    state: &mut StateTree,
    round_index: u64,
    round_limit: u64,
) -> usize {
    let threshold = match round_index.checked_sub(round_limit) {
        Some(threshold) => threshold,
        None => return 0,
    };

    let mut due = Vec::new();
    for (key, value) in state.scan_prefix(REWARD_WITHDRAWAL_PREFIX) {
        let suffix = &key[REWARD_WITHDRAWAL_PREFIX.len()..];
        // Layout: round (8 BE) || account (32) || seq (8 BE).
        if suffix.len() != 8 + 32 + 8 {
            continue;
        }
        let round = u64::from_be_bytes(suffix[..8].try_into().unwrap_or_default());
        if round > threshold {
            break;
        }
        let account = AccountId(suffix[8..40].try_into().unwrap_or_default());
        let amount = value.try_into().map(u64::from_le_bytes).unwrap_or_default();
        due.push((key, account, amount));
    }

    for (key, account, amount) in &due {
        state.delete(key);
        let balance = read_balance(state, account);
        write_balance(state, account, balance + amount);
        tracing::debug!(account = ?account, amount, "disbursed reward withdrawal");
    }

    due.len()
}
