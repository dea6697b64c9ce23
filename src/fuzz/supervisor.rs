//! Worker lifecycle, periodic housekeeping, and the command file.

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bitcode::MutationPoint;
use crate::config::Config;
use crate::core::Result;

use super::scheduler::Scheduler;
use super::worker::Worker;

/// Seconds between housekeeping ticks.
const TICK_SECS: u64 = 60;
/// Stagger between worker launches.
const STAGGER: Duration = Duration::from_secs(1);

struct WorkerHandle {
    tid: u64,
    handle: JoinHandle<()>,
}

/// Run the fuzzing campaign until an `exit` command arrives.
pub fn run(
    config: Arc<Config>,
    scheduler: Arc<Scheduler>,
    points: Arc<Vec<MutationPoint>>,
    jobs: usize,
) -> Result<()> {
    let mut next_tid: u64 = 0;
    let mut workers: Vec<WorkerHandle> = Vec::new();

    for _ in 0..jobs {
        workers.push(spawn_worker(
            &mut next_tid,
            &config,
            &scheduler,
            &points,
        ));
        std::thread::sleep(STAGGER);
    }
    tracing::info!("supervisor: {jobs} workers launched");

    'supervise: loop {
        for _ in 0..TICK_SECS {
            if scheduler.flag_halt() {
                break 'supervise;
            }
            std::thread::sleep(Duration::from_secs(1));
        }

        reap_core_dumps(&config)?;
        scheduler.dump_cov(&config.status_dir())?;

        let alive = workers.iter().filter(|w| !w.handle.is_finished()).count();
        tracing::info!(
            "supervisor: {alive}/{jobs} workers alive, coverage {}",
            scheduler.coverage_len()
        );

        if let Some(command) = poll_command(&config.status_cmd())? {
            if command == "exit" {
                tracing::info!("supervisor: exit requested");
                scheduler.set_flag_halt();
                break;
            }
            tracing::error!("supervisor: unknown command: {command}");
        }

        // Join the dead and replace them with fresh tids.
        let (dead, live): (Vec<_>, Vec<_>) = workers
            .into_iter()
            .partition(|w| w.handle.is_finished());
        workers = live;
        for worker in dead {
            tracing::warn!("supervisor: worker {} died, respawning", worker.tid);
            let _ = worker.handle.join();
            workers.push(spawn_worker(
                &mut next_tid,
                &config,
                &scheduler,
                &points,
            ));
        }
    }

    for worker in workers {
        let _ = worker.handle.join();
    }
    scheduler.dump_cov(&config.status_dir())?;
    tracing::info!("supervisor: all workers joined");
    Ok(())
}

fn spawn_worker(
    next_tid: &mut u64,
    config: &Arc<Config>,
    scheduler: &Arc<Scheduler>,
    points: &Arc<Vec<MutationPoint>>,
) -> WorkerHandle {
    let tid = *next_tid;
    *next_tid += 1;

    let config = Arc::clone(config);
    let scheduler = Arc::clone(scheduler);
    let points = Arc::clone(points);
    let handle = std::thread::spawn(move || {
        match Worker::new(tid, config, scheduler, points) {
            Ok(worker) => worker.run(),
            Err(err) => tracing::error!("worker {tid} failed to set up: {err}"),
        }
    });

    WorkerHandle { tid, handle }
}

/// Read and consume the command file, if the user wrote one.
pub fn poll_command(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let command = std::fs::read_to_string(path)?.trim().to_string();
    std::fs::remove_file(path)?;
    Ok(Some(command))
}

/// Remove core dumps left by crashed verifier or pass processes.
///
/// Children run with cwd in the base workspace or a worker's wks
/// duplicate, so those are the only places dumps can land.
pub fn reap_core_dumps(config: &Config) -> Result<()> {
    let mut roots = vec![config.base.clone()];
    let threads = config.fuzz_dir().join("threads");
    if threads.is_dir() {
        for entry in std::fs::read_dir(&threads)? {
            let wks = entry?.path().join("wks");
            if wks.is_dir() {
                roots.push(wks);
            }
        }
    }

    for root in roots {
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_core_dump(&name) {
                tracing::warn!("reaping core dump: {}", entry.path().display());
                std::fs::remove_file(entry.path())?;
            }
        }
    }
    Ok(())
}

fn is_core_dump(name: &str) -> bool {
    name == "core"
        || name
            .strip_prefix("core.")
            .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}
