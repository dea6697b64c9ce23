//! Per-thread fuzzing loop.
//!
//! Each worker owns a private duplicate of the proof workspace and a
//! private verifier output directory; the only shared mutable state it
//! touches is the scheduler (under its lock) and the corpus (through
//! atomic allocation).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;

use crate::bitcode::{
    load_mutate_result, mutation_pass_mutate, mutation_pass_replay, save_trace, trace_covers,
    MutationPoint, MutationStep,
};
use crate::config::Config;
use crate::core::{Error, Result};
use crate::verifier::{duplicate_workspace, verify_all, VerificationOutcome};

use super::scheduler::{Scheduler, DEFAULT_SEED_SCORE};
use super::seed::SeedStore;

/// What one fuzzing iteration accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// A mutant with a novel or reduced error set became a new seed.
    NewSeed(String),
    /// The mutant verified cleanly; its trace was archived.
    Survival(String),
    /// The verifier crashed; no coverage was diffed.
    Skipped,
    /// Every catalogue point was already covered by the base trace.
    Exhausted,
}

/// Initial score of a freshly created seed.
///
/// Discovery is rewarded; error-heavy and deeply-mutated descendants
/// are penalized to keep the frontier shallow.
pub fn initial_seed_score(novelty: usize, cov_len: usize, trace_len: usize) -> u64 {
    (DEFAULT_SEED_SCORE as i64 + novelty as i64 - 5 * cov_len as i64 - trace_len as i64).max(0)
        as u64
}

/// A fuzzing worker bound to one thread directory.
pub struct Worker {
    tid: u64,
    config: Arc<Config>,
    scheduler: Arc<Scheduler>,
    store: SeedStore,
    points: Arc<Vec<MutationPoint>>,
    wks: PathBuf,
    saw_dir: PathBuf,
}

impl Worker {
    /// Set up the worker's private workspace.
    pub fn new(
        tid: u64,
        config: Arc<Config>,
        scheduler: Arc<Scheduler>,
        points: Arc<Vec<MutationPoint>>,
    ) -> Result<Self> {
        let thread_dir = config.thread_dir(tid);
        let wks = thread_dir.join("wks");
        let saw_dir = thread_dir.join("saw");
        std::fs::create_dir_all(&wks)?;
        std::fs::create_dir_all(&saw_dir)?;
        duplicate_workspace(&config.base, &wks)?;

        let store = SeedStore::open(&config)?;
        Ok(Self {
            tid,
            config,
            scheduler,
            store,
            points,
            wks,
            saw_dir,
        })
    }

    fn bitcode(&self) -> PathBuf {
        self.wks.join("bitcode").join("all_llvm.bc")
    }

    fn trace_file(&self) -> PathBuf {
        self.config.thread_dir(self.tid).join("trace.json")
    }

    fn mutate_result_file(&self) -> PathBuf {
        self.config.thread_dir(self.tid).join("mutate-result.json")
    }

    /// Fuzz until the halt flag is raised or a fatal error escapes.
    ///
    /// Tool failures skip the iteration; anything else (notably an
    /// unrecognized transcript shape) ends the thread, and the
    /// supervisor replaces it.
    pub fn run(&self) {
        tracing::info!("worker {} started", self.tid);
        loop {
            if self.scheduler.flag_halt() {
                tracing::info!("worker {} halting", self.tid);
                return;
            }
            match self.run_iteration() {
                Ok(outcome) => {
                    tracing::debug!("worker {}: {:?}", self.tid, outcome);
                }
                Err(err @ Error::Subprocess { .. }) => {
                    tracing::warn!("worker {}: tool failure, skipping: {}", self.tid, err);
                }
                Err(err) => {
                    tracing::error!("worker {} died: {}", self.tid, err);
                    return;
                }
            }
        }
    }

    /// One fuzzing iteration, as a pure function of the shared state.
    pub fn run_iteration(&self) -> Result<IterationOutcome> {
        let (base, _prior_score) = self.scheduler.next_seed(&self.store)?;
        let old_trace = base.trace;
        let old_cov = base.cov;

        // Rebuild the base mutant, then stack one fresh mutation on it.
        save_trace(&self.trace_file(), &old_trace)?;
        mutation_pass_replay(&self.config, &self.trace_file(), &self.bitcode())?;

        let mut rng = rand::thread_rng();
        let mut tried: HashSet<usize> = HashSet::new();
        let (point, result) = loop {
            if tried.len() == self.points.len() {
                tracing::debug!(
                    "worker {}: catalogue exhausted for seed {}",
                    self.tid,
                    base.name
                );
                return Ok(IterationOutcome::Exhausted);
            }
            let index = rng.gen_range(0..self.points.len());
            if !tried.insert(index) {
                continue;
            }
            let point = &self.points[index];
            if trace_covers(&old_trace, point) {
                continue;
            }

            mutation_pass_mutate(
                &self.config,
                point,
                &self.mutate_result_file(),
                &self.bitcode(),
                &self.bitcode(),
            )?;
            let result = load_mutate_result(&self.mutate_result_file())?;
            if result.changed {
                break (point, result);
            }
        };

        let mut new_trace = old_trace.clone();
        new_trace.push(MutationStep::recorded(point, result));
        debug_assert_eq!(new_trace.len(), old_trace.len() + 1);

        let new_cov = match verify_all(&self.config, &self.wks, &self.saw_dir)? {
            VerificationOutcome::VerifierCrash => return Ok(IterationOutcome::Skipped),
            VerificationOutcome::Errors(errors) => errors,
        };

        // Coverage novelty: errors this mutant eliminated plus errors
        // never seen globally. Membership is value equality throughout.
        let eliminated = old_cov
            .iter()
            .filter(|&e| !new_cov.contains(e))
            .count();
        let additions = self.scheduler.update_coverage(&new_cov);
        let novelty = eliminated + additions;

        if novelty > 0 {
            self.scheduler
                .update_seed_score(&self.store, &base.name, 2)?;
        }

        if new_cov.is_empty() {
            let name = self.store.save_survival(&new_trace)?;
            tracing::info!(
                "worker {}: mutant survived verification, archived as {}",
                self.tid,
                name
            );
            return Ok(IterationOutcome::Survival(name));
        }

        let score = initial_seed_score(novelty, new_cov.len(), new_trace.len());
        let name = self.store.save_seed(&new_trace, &new_cov, score)?;
        self.scheduler.add_seed(&name, score);
        tracing::debug!(
            "worker {}: new seed {} (novelty {}, score {})",
            self.tid,
            name,
            novelty,
            score
        );
        Ok(IterationOutcome::NewSeed(name))
    }
}
