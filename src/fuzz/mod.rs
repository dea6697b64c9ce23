//! The coverage-guided fuzzing loop.

pub mod scheduler;
pub mod seed;
pub mod supervisor;
pub mod worker;

pub use scheduler::{Scheduler, DEFAULT_SEED_SCORE};
pub use seed::{Seed, SeedStore};
pub use worker::{IterationOutcome, Worker};

use std::sync::Arc;

use crate::bitcode::{ensure_mutation_points, MutationPoint};
use crate::config::Config;
use crate::core::{Error, Result};
use crate::verifier::dump_verification_output;

/// Launch the fuzzing campaign.
pub fn fuzz_start(config: &Config, clean: bool, jobs: Option<usize>) -> Result<()> {
    if clean && config.fuzz_dir().exists() {
        std::fs::remove_dir_all(config.fuzz_dir())?;
        tracing::info!("previous fuzzing work cleared out");
    }

    let points = ensure_mutation_points(config)?;
    tracing::info!("mutation points collected: {}", points.len());

    let store = SeedStore::open(config)?;
    let scheduler = Arc::new(Scheduler::new());
    prepare_corpus(&store, &scheduler, &points)?;
    std::fs::create_dir_all(config.status_dir())?;

    let jobs = jobs.unwrap_or_else(|| config.effective_jobs());
    supervisor::run(Arc::new(config.clone()), scheduler, Arc::new(points), jobs)
}

/// Bring the scheduler in sync with the on-disk corpus, creating the
/// base seed when the corpus is empty.
///
/// The base seed starts with an empty trace and coverage, its score
/// boosted by the catalogue size so early picks explore widely.
pub fn prepare_corpus(
    store: &SeedStore,
    scheduler: &Scheduler,
    points: &[MutationPoint],
) -> Result<()> {
    let existing = store.list()?;
    tracing::info!("processing existing fuzzing seeds: {}", existing.len());

    if existing.is_empty() {
        store.save_seed(&[], &[], DEFAULT_SEED_SCORE + points.len() as u64)?;
    }

    for name in store.list()? {
        let seed = store.load_seed(&name)?;
        scheduler.update_coverage(&seed.cov);
        scheduler.add_seed(&name, seed.score);
    }
    Ok(())
}

/// Dispatch the dump analyzer over the selected workspace/output pairs.
///
/// `BASE` is the standalone verification tree, `SEED` the seed
/// re-validation scratch pair, a number one worker's pair, and `ALL`
/// every pair that exists.
pub fn parse_verification_output(config: &Config, target: &str) -> Result<()> {
    match target {
        "BASE" => dump_verification_output(&config.base, &config.work_saw()),
        "SEED" => {
            let (wks, saw) = config.seed_eval_pair();
            dump_verification_output(&wks, &saw)
        }
        "ALL" => {
            if config.work_saw().is_dir() {
                dump_verification_output(&config.base, &config.work_saw())?;
            }
            let threads = config.fuzz_dir().join("threads");
            if threads.is_dir() {
                let mut dirs: Vec<_> = std::fs::read_dir(&threads)?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .collect();
                dirs.sort();
                for dir in dirs {
                    let saw = dir.join("saw");
                    if saw.is_dir() {
                        dump_verification_output(&dir.join("wks"), &saw)?;
                    }
                }
            }
            Ok(())
        }
        other => {
            let tid: u64 = other.parse().map_err(|_| {
                Error::InvalidArgument(format!("unknown analysis target: {other}"))
            })?;
            let dir = config.thread_dir(tid);
            dump_verification_output(&dir.join("wks"), &dir.join("saw"))
        }
    }
}
