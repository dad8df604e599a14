//! # Riptide
//!
//! A leaderless, probabilistic-finality distributed ledger:
//! - **Transaction DAG** — transactions reference multiple parents, forming a
//!   view graph that orders work without a leader or mining
//! - **Snowball consensus** — repeated peer sampling drives binary agreement
//!   on the next block; finality is probabilistic, parameterized by α and β
//! - **Authenticated state** — an ordered key-value tree with snapshot/revert,
//!   mutated atomically per transaction by the applier
//! - **Smart contracts** — gas-metered contract invocation with recursive
//!   sub-transaction queues and nested batch transactions

pub mod applier;
pub mod config;
pub mod consensus;
pub mod genesis;
pub mod ledger;
pub mod state;
pub mod transaction;

/// Protocol constants and tunable defaults.
///
/// Runtime behavior is driven by [`config::ConsensusConfig`]; the values here
/// are the defaults it starts from.
pub mod constants {
    /// Default Snowball quorum fraction (α).
    pub const DEFAULT_SNOWBALL_ALPHA: f64 = 0.8;
    /// Default Snowball confidence threshold (β): consecutive successful
    /// ticks required before a block is decided.
    pub const DEFAULT_SNOWBALL_BETA: u16 = 150;
    /// Default number of peers sampled per consensus tick (K).
    pub const DEFAULT_SAMPLE_SIZE: usize = 16;
    /// Default per-peer query deadline in milliseconds.
    pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 1_000;
    /// Default interval between block proposal attempts in milliseconds.
    pub const DEFAULT_BLOCK_PROPOSAL_INTERVAL_MS: u64 = 500;
    /// How far (in depth) an eligible parent may lag behind the graph height.
    pub const DEFAULT_MAX_ELIGIBLE_PARENTS_DEPTH_DIFF: u64 = 5;
    /// Maximum number of parents a transaction may reference.
    pub const DEFAULT_MAX_PARENTS: usize = 32;
    /// Rounds of history retained in the view graph before pruning.
    pub const DEFAULT_PRUNING_DEPTH: u64 = 30;
    /// Minimum amount accepted for a reward withdrawal request.
    pub const DEFAULT_MIN_REWARD_WITHDRAW: u64 = 100;
    /// Rounds a reward withdrawal request waits before disbursement.
    pub const DEFAULT_REWARD_WITHDRAWALS_ROUND_LIMIT: u64 = 50;
    /// Seconds without a finalized round before the stall watchdog fires.
    pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 300;
    /// S/Kademlia prefix-matching difficulty handed to the peer sampler.
    pub const DEFAULT_SKADEMLIA_C1: usize = 1;
    /// S/Kademlia prefix-matching difficulty handed to the peer sampler.
    pub const DEFAULT_SKADEMLIA_C2: usize = 1;
}

/// 32-byte hash used throughout the protocol.
pub type Hash = [u8; 32];

/// A transaction identifier: the BLAKE3 content hash of the transaction.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct TransactionId(pub Hash);

/// A 32-byte account identifier.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct AccountId(pub Hash);

/// A block identifier: the BLAKE3 hash of the block header fields.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct BlockId(pub Hash);

impl std::fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx:{}", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Debug for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "acct:{}", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "blk:{}", hex::encode(&self.0[..8]))
    }
}

/// Hash a sequence of byte slices into one BLAKE3 digest.
///
/// Every slice contributes its length as a big-endian u32 before its bytes,
/// so two sequences that concatenate to the same data still hash apart.
pub fn hash_parts(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}
