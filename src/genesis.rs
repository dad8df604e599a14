//! Genesis allocation loading.
//!
//! A genesis file is a JSON array of account entries, each carrying a hex
//! `public_key` and optional `balance`, `stake` and `reward` amounts:
//!
//! ```json
//! [
//!   { "public_key": "0101…01", "balance": 10000000, "stake": 100 },
//!   { "public_key": "0202…02", "balance": 5000000 }
//! ]
//! ```
//!
//! The allocation is written into a fresh state tree before round zero so
//! every node starts from the same merkle root.

use std::path::Path;

use serde::Deserialize;

use crate::state::{self, StateTree};
use crate::AccountId;

/// Errors from genesis loading.
#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("failed to read genesis file: {0}")]
    Io(#[from] std::io::Error),
    #[error("genesis file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("genesis entry {index} has an invalid public key")]
    InvalidPublicKey { index: usize },
}

/// One account's initial allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenesisAccount {
    pub id: AccountId,
    pub balance: u64,
    pub stake: u64,
    pub reward: u64,
}

#[derive(Deserialize)]
struct GenesisEntry {
    public_key: String,
    #[serde(default)]
    balance: u64,
    #[serde(default)]
    stake: u64,
    #[serde(default)]
    reward: u64,
}

/// Load a genesis allocation from a JSON file.
pub fn load_genesis(path: &Path) -> Result<Vec<GenesisAccount>, GenesisError> {
    let contents = std::fs::read_to_string(path)?;
    parse_genesis(&contents)
}

/// Parse a genesis allocation from JSON.
pub fn parse_genesis(contents: &str) -> Result<Vec<GenesisAccount>, GenesisError> {
    let entries: Vec<GenesisEntry> = serde_json::from_str(contents)?;

    let mut accounts = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let bytes = hex::decode(&entry.public_key)
            .map_err(|_| GenesisError::InvalidPublicKey { index })?;
        let id: crate::Hash = bytes
            .try_into()
            .map_err(|_| GenesisError::InvalidPublicKey { index })?;

        accounts.push(GenesisAccount {
            id: AccountId(id),
            balance: entry.balance,
            stake: entry.stake,
            reward: entry.reward,
        });
    }

    Ok(accounts)
}

/// Write an allocation into the state tree and fix it as the baseline.
pub fn apply_genesis(state: &mut StateTree, accounts: &[GenesisAccount]) {
    for account in accounts {
        if account.balance > 0 {
            state::write_balance(state, &account.id, account.balance);
        }
        if account.stake > 0 {
            state::write_stake(state, &account.id, account.stake);
        }
        if account.reward > 0 {
            state::write_reward(state, &account.id, account.reward);
        }
        tracing::debug!(account = ?account.id, balance = account.balance, "seeded genesis account");
    }
    state.commit();
}

/// The built-in developer allocation: a handful of well-funded accounts for
/// local networks and tests.
pub fn dev_genesis() -> Vec<GenesisAccount> {
    (1u8..=3)
        .map(|byte| GenesisAccount {
            id: AccountId([byte; 32]),
            balance: 10_000_000,
            stake: 0,
            reward: 0,
        })
        .collect()
}
