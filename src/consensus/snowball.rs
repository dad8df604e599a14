//! Snowball binary-value agreement over block identifiers.
//!
//! Each tick receives the tallied outcome of one round of peer sampling. A
//! block whose tally reaches the alpha quorum keeps a per-block counter and
//! a consecutive-success counter; once the same block wins beta + 1 ticks in
//! a row, the instance decides. A tick without a quorum resets the
//! consecutive counter but not the per-block counters, so preference is
//! sticky across noisy samples.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::ledger::Block;
use crate::BlockId;

struct SnowballInner {
    preferred: Option<Block>,
    last: Option<Block>,
    counts: HashMap<BlockId, u16>,
    count: u16,
    decided: bool,
}

/// A single-decision Snowball instance.
///
/// `reset()` re-arms it for the next round.
pub struct Snowball {
    alpha: f64,
    beta: u16,
    inner: RwLock<SnowballInner>,
}

impl Snowball {
    pub fn new(alpha: f64, beta: u16) -> Snowball {
        Snowball {
            alpha,
            beta,
            inner: RwLock::new(SnowballInner {
                preferred: None,
                last: None,
                counts: HashMap::new(),
                count: 0,
                decided: false,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SnowballInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SnowballInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Clear all agreement state for a new round.
    pub fn reset(&self) {
        let mut inner = self.write();
        inner.preferred = None;
        inner.last = None;
        inner.counts.clear();
        inner.count = 0;
        inner.decided = false;
    }

    /// Feed one round of sampled votes into the instance.
    ///
    /// `tallies` maps block ids to their aggregated vote weight in `[0, 1]`;
    /// `votes` maps the same ids to the blocks themselves. Equal tallies are
    /// broken deterministically towards the smallest block id.
    pub fn tick(&self, tallies: &HashMap<BlockId, f64>, votes: &HashMap<BlockId, Block>) {
        let mut inner = self.write();

        if inner.decided {
            return;
        }

        let mut majority: Option<(&BlockId, f64)> = None;
        for (id, &tally) in tallies {
            let better = match majority {
                None => true,
                Some((best_id, best_tally)) => match tally.total_cmp(&best_tally) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Equal => id < best_id,
                    std::cmp::Ordering::Less => false,
                },
            };
            if better {
                majority = Some((id, tally));
            }
        }

        let denom = (votes.len().max(2)) as f64;

        let majority = majority
            .filter(|(_, tally)| *tally >= self.alpha * 2.0 / denom)
            .and_then(|(id, _)| votes.get(id));

        let Some(majority) = majority else {
            inner.count = 0;
            return;
        };

        *inner.counts.entry(majority.id).or_insert(0) += 1;

        let majority_count = inner.counts[&majority.id];
        let preferred_count = inner
            .preferred
            .as_ref()
            .and_then(|preferred| inner.counts.get(&preferred.id))
            .copied()
            .unwrap_or(0);

        if inner.preferred.is_none() || majority_count > preferred_count {
            inner.preferred = Some(majority.clone());
        }

        match &inner.last {
            Some(last) if last.id == majority.id => {
                inner.count += 1;
                if inner.count > self.beta {
                    inner.decided = true;
                }
            }
            _ => {
                inner.last = Some(majority.clone());
                inner.count = 1;
            }
        }
    }

    /// Seed the instance with our own candidate block.
    pub fn prefer(&self, block: Block) {
        self.write().preferred = Some(block);
    }

    pub fn preferred(&self) -> Option<Block> {
        self.read().preferred.clone()
    }

    pub fn decided(&self) -> bool {
        self.read().decided
    }

    /// Number of consecutive successful ticks for the current leader.
    pub fn progress(&self) -> u16 {
        self.read().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(byte: u8) -> Block {
        Block {
            id: BlockId([byte; 32]),
            index: 1,
            merkle_root: [0u8; 32],
            tx_ids: vec![],
        }
    }

    fn single_vote(b: &Block, tally: f64, num_votes: usize) -> (HashMap<BlockId, f64>, HashMap<BlockId, Block>) {
        let mut tallies = HashMap::new();
        let mut votes = HashMap::new();
        tallies.insert(b.id, tally);
        votes.insert(b.id, b.clone());
        // Pad the vote set so |votes| reflects the number of responders.
        for i in 0..num_votes.saturating_sub(1) {
            let filler = block(200 + i as u8);
            tallies.insert(filler.id, 0.0);
            votes.insert(filler.id, filler);
        }
        (tallies, votes)
    }

    #[test]
    fn converges_after_beta_plus_one_ticks() {
        let snowball = Snowball::new(0.8, 3);
        let x = block(1);
        let y = block(2);

        let mut tallies = HashMap::new();
        let mut votes = HashMap::new();
        tallies.insert(x.id, 0.9);
        tallies.insert(y.id, 0.1);
        votes.insert(x.id, x.clone());
        votes.insert(y.id, y.clone());
        // 8 extra empty voters for |votes| = 10.
        for i in 0..8 {
            let filler = block(100 + i);
            tallies.insert(filler.id, 0.0);
            votes.insert(filler.id, filler);
        }

        for tick in 1..=4u16 {
            snowball.tick(&tallies, &votes);
            assert_eq!(snowball.progress(), tick);
            assert_eq!(snowball.decided(), tick == 4);
        }

        assert_eq!(snowball.preferred().unwrap().id, x.id);
    }

    #[test]
    fn below_alpha_resets_progress() {
        let snowball = Snowball::new(0.8, 3);
        let x = block(1);

        // alpha * 2 / denom with denom=10 is 0.16; 0.5 clears it.
        let (tallies, votes) = single_vote(&x, 0.5, 10);
        snowball.tick(&tallies, &votes);
        snowball.tick(&tallies, &votes);
        assert_eq!(snowball.progress(), 2);

        let (weak_tallies, weak_votes) = single_vote(&x, 0.1, 10);
        snowball.tick(&weak_tallies, &weak_votes);
        assert_eq!(snowball.progress(), 0);
        assert!(!snowball.decided());

        // Preference survives the reset of the consecutive counter.
        assert_eq!(snowball.preferred().unwrap().id, x.id);
    }

    #[test]
    fn small_vote_sets_use_denominator_two() {
        let snowball = Snowball::new(0.8, 1);
        let x = block(1);

        // |votes| = 1 < 2, so the threshold is alpha * 2 / 2 = alpha.
        let (tallies, votes) = single_vote(&x, 0.79, 1);
        snowball.tick(&tallies, &votes);
        assert_eq!(snowball.progress(), 0);

        let (tallies, votes) = single_vote(&x, 0.81, 1);
        snowball.tick(&tallies, &votes);
        assert_eq!(snowball.progress(), 1);
    }

    #[test]
    fn equal_tallies_break_towards_smallest_id() {
        let snowball = Snowball::new(0.1, 5);
        let a = block(1);
        let b = block(2);

        let mut tallies = HashMap::new();
        let mut votes = HashMap::new();
        tallies.insert(a.id, 0.5);
        tallies.insert(b.id, 0.5);
        votes.insert(a.id, a.clone());
        votes.insert(b.id, b.clone());

        snowball.tick(&tallies, &votes);
        assert_eq!(snowball.preferred().unwrap().id, a.id);
    }

    #[test]
    fn flips_preference_to_stronger_block() {
        let snowball = Snowball::new(0.5, 10);
        let x = block(1);
        let y = block(2);

        let (tallies_x, votes_x) = single_vote(&x, 1.0, 2);
        snowball.tick(&tallies_x, &votes_x);
        assert_eq!(snowball.preferred().unwrap().id, x.id);
        assert_eq!(snowball.progress(), 1);

        // Y wins twice; its per-block count overtakes X's and `last`
        // switches, resetting the consecutive counter.
        let (tallies_y, votes_y) = single_vote(&y, 1.0, 2);
        snowball.tick(&tallies_y, &votes_y);
        assert_eq!(snowball.progress(), 1);
        snowball.tick(&tallies_y, &votes_y);
        assert_eq!(snowball.preferred().unwrap().id, y.id);
        assert_eq!(snowball.progress(), 2);
    }

    #[test]
    fn decided_instance_ignores_ticks() {
        let snowball = Snowball::new(0.5, 0);
        let x = block(1);
        let y = block(2);

        let (tallies, votes) = single_vote(&x, 1.0, 2);
        snowball.tick(&tallies, &votes);
        assert!(snowball.decided());

        let (tallies_y, votes_y) = single_vote(&y, 1.0, 2);
        snowball.tick(&tallies_y, &votes_y);
        assert_eq!(snowball.preferred().unwrap().id, x.id);
    }

    #[test]
    fn reset_clears_everything() {
        let snowball = Snowball::new(0.5, 0);
        let x = block(1);

        let (tallies, votes) = single_vote(&x, 1.0, 2);
        snowball.tick(&tallies, &votes);
        assert!(snowball.decided());

        snowball.reset();
        assert!(!snowball.decided());
        assert!(snowball.preferred().is_none());
        assert_eq!(snowball.progress(), 0);
    }
}
