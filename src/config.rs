//! Configuration file support for the Riptide node.
//!
//! Loads optional `riptide.toml` from the data directory. CLI flags override
//! config file values. If no config file exists, defaults are used.
//!
//! Consensus tunables are injected into the components that need them rather
//! than read from process globals, so tests can run with deterministic,
//! per-instance parameters.

use serde::Deserialize;
use std::path::Path;

use crate::constants;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RiptideConfig {
    pub node: NodeConfig,
    pub consensus: ConsensusConfig,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: String,
    /// Path to a genesis JSON file. The built-in developer genesis is used
    /// when unset.
    pub genesis_path: Option<String>,
    /// Milliseconds between block proposal attempts.
    pub block_proposal_interval_ms: u64,
    /// S/Kademlia prefix difficulties, handed through to the peer sampler.
    pub skademlia_c1: usize,
    pub skademlia_c2: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: "./riptide-data".into(),
            genesis_path: None,
            block_proposal_interval_ms: constants::DEFAULT_BLOCK_PROPOSAL_INTERVAL_MS,
            skademlia_c1: constants::DEFAULT_SKADEMLIA_C1,
            skademlia_c2: constants::DEFAULT_SKADEMLIA_C2,
        }
    }
}

/// Consensus tunables.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Snowball quorum fraction α, in (0, 1].
    pub snowball_alpha: f64,
    /// Snowball confidence threshold β.
    pub snowball_beta: u16,
    /// Number of peers sampled per consensus tick (K).
    pub sample_size: usize,
    /// Per-peer query deadline in milliseconds.
    pub query_timeout_ms: u64,
    /// How far (in depth) an eligible parent may lag behind the graph height.
    pub max_eligible_parents_depth_diff: u64,
    /// Maximum number of parents a transaction may reference.
    pub max_parents: usize,
    /// Rounds of history retained in the view graph before pruning.
    pub pruning_depth: u64,
    /// Minimum amount accepted for a reward withdrawal request.
    pub min_reward_withdraw: u64,
    /// Rounds a reward withdrawal request waits before disbursement.
    pub reward_withdrawals_round_limit: u64,
    /// Testnet compatibility: transfers created by the faucet address credit
    /// the recipient without debiting the faucet. Off by default.
    pub faucet_enabled: bool,
    /// Hex-encoded faucet account id, only consulted when `faucet_enabled`.
    pub faucet_address: String,
    /// Seconds without a finalized round before the stall watchdog fires.
    pub stall_timeout_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            snowball_alpha: constants::DEFAULT_SNOWBALL_ALPHA,
            snowball_beta: constants::DEFAULT_SNOWBALL_BETA,
            sample_size: constants::DEFAULT_SAMPLE_SIZE,
            query_timeout_ms: constants::DEFAULT_QUERY_TIMEOUT_MS,
            max_eligible_parents_depth_diff: constants::DEFAULT_MAX_ELIGIBLE_PARENTS_DEPTH_DIFF,
            max_parents: constants::DEFAULT_MAX_PARENTS,
            pruning_depth: constants::DEFAULT_PRUNING_DEPTH,
            min_reward_withdraw: constants::DEFAULT_MIN_REWARD_WITHDRAW,
            reward_withdrawals_round_limit: constants::DEFAULT_REWARD_WITHDRAWALS_ROUND_LIMIT,
            faucet_enabled: false,
            faucet_address: String::new(),
            stall_timeout_secs: constants::DEFAULT_STALL_TIMEOUT_SECS,
        }
    }
}

impl ConsensusConfig {
    /// Parse the configured faucet address, if faucet mode is enabled.
    pub fn faucet_account(&self) -> Option<crate::AccountId> {
        if !self.faucet_enabled {
            return None;
        }
        let bytes = hex::decode(&self.faucet_address).ok()?;
        let id: crate::Hash = bytes.try_into().ok()?;
        Some(crate::AccountId(id))
    }
}

impl RiptideConfig {
    /// Load configuration from `riptide.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("riptide.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
