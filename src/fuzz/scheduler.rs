//! Shared fuzzing state: the score-bucketed seed index, the global
//! coverage set, and the halt flag.
//!
//! One mutex guards everything. Workers spend almost all of their time
//! inside external tool invocations, which never hold the lock; holding
//! it across a subprocess call is forbidden.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use parking_lot::Mutex;
use rand::Rng;

use crate::core::{Error, Result};
use crate::verifier::VerificationError;

use super::seed::{Seed, SeedStore};

/// Starting score of a fresh seed before the novelty weighting.
pub const DEFAULT_SEED_SCORE: u64 = 1000;

#[derive(Default)]
struct State {
    /// Union of every coverage set observed, insertion-ordered.
    cov: Vec<VerificationError>,
    /// The same values as `cov`, for O(1) membership by value equality.
    cov_index: HashSet<VerificationError>,
    /// Seed names bucketed by their current score. Invariant: a bucket's
    /// key equals the integer in each member's score.txt, and empty
    /// buckets are removed.
    seeds: BTreeMap<u64, Vec<String>>,
    flag_halt: bool,
}

/// Process-wide scheduler, shared by reference across workers.
#[derive(Default)]
pub struct Scheduler {
    state: Mutex<State>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a seed under its score.
    pub fn add_seed(&self, name: &str, score: u64) {
        let mut state = self.state.lock();
        state.seeds.entry(score).or_default().push(name.to_string());
    }

    /// Number of indexed seeds.
    pub fn seed_count(&self) -> usize {
        let state = self.state.lock();
        state.seeds.values().map(Vec::len).sum()
    }

    /// Pick the next seed to fuzz and charge it one point.
    ///
    /// All seeds in the maximum-score bucket are equiprobable. The
    /// decrement lands in the bucket index and in `score.txt` before the
    /// lock is released; the seed itself is loaded afterwards. Fails
    /// fast when the scheduler is empty.
    pub fn next_seed(&self, store: &SeedStore) -> Result<(Seed, u64)> {
        let (name, prior_score) = {
            let mut state = self.state.lock();

            let (&score, bucket) = state
                .seeds
                .iter_mut()
                .next_back()
                .ok_or_else(|| Error::scheduler("no seeds available"))?;
            let index = rand::thread_rng().gen_range(0..bucket.len());
            let name = bucket.swap_remove(index);
            if bucket.is_empty() {
                state.seeds.remove(&score);
            }

            let new_score = score.saturating_sub(1);
            if let Err(err) = store.write_score(&name, new_score) {
                // Keep the index consistent with disk before bailing.
                state.seeds.entry(score).or_default().push(name);
                return Err(err);
            }
            state.seeds.entry(new_score).or_default().push(name.clone());

            (name, score)
        };

        let seed = store.load_seed(&name)?;
        Ok((seed, prior_score))
    }

    /// Adjust a seed's score by a signed delta, clamped at zero.
    pub fn update_seed_score(&self, store: &SeedStore, name: &str, delta: i64) -> Result<u64> {
        let mut state = self.state.lock();

        let current = state
            .seeds
            .iter()
            .find(|(_, bucket)| bucket.iter().any(|n| n == name))
            .map(|(&score, _)| score)
            .ok_or_else(|| Error::scheduler(format!("unknown seed: {name}")))?;

        let updated = (current as i64 + delta).max(0) as u64;
        if updated == current {
            return Ok(current);
        }
        store.write_score(name, updated)?;

        let bucket = state.seeds.get_mut(&current).expect("bucket exists");
        bucket.retain(|n| n != name);
        if bucket.is_empty() {
            state.seeds.remove(&current);
        }
        state
            .seeds
            .entry(updated)
            .or_default()
            .push(name.to_string());

        Ok(updated)
    }

    /// Merge a coverage set into the global one; returns how many
    /// entries were new.
    pub fn update_coverage(&self, new_cov: &[VerificationError]) -> usize {
        let mut state = self.state.lock();
        let mut additions = 0;
        for error in new_cov {
            if state.cov_index.insert(error.clone()) {
                state.cov.push(error.clone());
                additions += 1;
            }
        }
        additions
    }

    /// Size of the global coverage set.
    pub fn coverage_len(&self) -> usize {
        self.state.lock().cov.len()
    }

    /// Serialize a sorted snapshot of the global coverage set.
    pub fn dump_cov(&self, status_dir: &Path) -> Result<()> {
        let mut snapshot = {
            let state = self.state.lock();
            state.cov.clone()
        };
        snapshot.sort();

        std::fs::create_dir_all(status_dir)?;
        std::fs::write(
            status_dir.join("cov.json"),
            serde_json::to_string_pretty(&snapshot)?,
        )?;
        Ok(())
    }

    /// Whether shutdown has been requested.
    pub fn flag_halt(&self) -> bool {
        self.state.lock().flag_halt
    }

    /// Request cooperative shutdown.
    pub fn set_flag_halt(&self) {
        self.state.lock().flag_halt = true;
    }
}
