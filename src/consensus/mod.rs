//! # Leaderless DAG consensus
//!
//! Riptide orders transactions in a directed acyclic graph (the view graph)
//! and finalizes them in rounds through Snowball, an Avalanche-family
//! binary-agreement procedure driven by repeated peer sampling.
//!
//! ## How a round finalizes
//!
//! ```text
//! 1. Transactions enter the view graph, referencing eligible parents
//! 2. The node proposes a block: the transactions between the current round
//!    root and a chosen tip, in topological order
//! 3. K peers are sampled and queried for their preferred block
//! 4. Tallies (stake-weighted, uniform when no stake exists) feed Snowball
//! 5. A block preferred for beta consecutive ticks at quorum fraction alpha
//!    is decided; its transactions are applied and the round advances
//! ```
//!
//! Finality is probabilistic: the chance of a decided block being reverted
//! falls exponentially with beta. There is no leader, no mining and no view
//! change; a node that cannot reach the alpha quorum simply re-proposes with
//! a different tip.

pub mod graph;
pub mod snowball;
