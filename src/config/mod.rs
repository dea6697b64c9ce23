//! Configuration loading and workspace layout.
//!
//! All paths the pipeline touches are derived from two roots: the proof
//! workspace (`base`, holding the SAW scripts, `spec/`, `HMAC/` and the
//! bitcode build) and the scratch tree (`work`, holding everything this
//! tool generates).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Name of the optional configuration file at the workspace root.
pub const CONFIG_FILE: &str = "sawfuzz.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Proof workspace root (SAW scripts, spec/, HMAC/, bitcode build).
    pub base: PathBuf,
    /// Dependency root holding the saw and llvm distributions.
    pub deps: PathBuf,
    /// Scratch root for everything this tool writes.
    pub work: PathBuf,
    /// Shared library implementing the mutation pass.
    pub pass_lib: PathBuf,
    /// Number of fuzzing workers (0 = half the available cores).
    pub jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base: PathBuf::from("."),
            deps: PathBuf::from("deps"),
            work: PathBuf::from("work"),
            pass_lib: PathBuf::from("deps/pass/libmutest.so"),
            jobs: 0,
        }
    }
}

impl Config {
    /// Load configuration for the given workspace root.
    ///
    /// Reads `sawfuzz.toml` at the root when present, otherwise uses
    /// defaults. Relative paths in the file are anchored at the root.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let file = root.join(CONFIG_FILE);
        let mut config = if file.exists() {
            let raw = std::fs::read_to_string(&file)?;
            toml::from_str(&raw)?
        } else {
            Self::default()
        };
        config.anchor(root);
        Ok(config)
    }

    /// Load configuration from an explicit file path.
    ///
    /// Errors if the file does not exist. Use this for explicit `--config`
    /// flags. Relative paths are anchored at the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)?;
        config.anchor(path.parent().unwrap_or(Path::new(".")));
        Ok(config)
    }

    fn anchor(&mut self, root: &Path) {
        for path in [
            &mut self.base,
            &mut self.deps,
            &mut self.work,
            &mut self.pass_lib,
        ] {
            if path.is_relative() {
                let anchored = root.join(path.as_path());
                *path = anchored;
            }
        }
    }

    /// Get the effective number of fuzzing workers.
    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            (num_cpus() / 2).max(1)
        } else {
            self.jobs
        }
    }

    // Dependency binaries.

    /// Directory holding the `saw` executable.
    pub fn deps_saw_bin(&self) -> PathBuf {
        self.deps.join("saw").join("bin")
    }

    /// Directory holding the LLVM executables (`opt` among them).
    pub fn deps_llvm_bin(&self) -> PathBuf {
        self.deps.join("llvm").join("bin")
    }

    // Base workspace artifacts.

    /// Bitcode artifact produced by the proof workspace build.
    pub fn orig_bitcode(&self) -> PathBuf {
        self.base.join("bitcode").join("all_llvm.bc")
    }

    // Scratch tree.

    /// Pristine copy of the base bitcode.
    pub fn work_bitcode(&self) -> PathBuf {
        self.work.join("bitcode").join("all_llvm.bc")
    }

    /// Scratch JSON file the round-trip diagnostic shares between
    /// mutate results and single-step traces.
    pub fn work_bitcode_mutation(&self) -> PathBuf {
        self.work.join("bitcode").join("mutation.json")
    }

    /// Verifier transcripts for the standalone `verify` command.
    pub fn work_saw(&self) -> PathBuf {
        self.work.join("saw")
    }

    /// Root of the fuzzing state.
    pub fn fuzz_dir(&self) -> PathBuf {
        self.work.join("fuzz")
    }

    /// Sorted list of verified function names.
    pub fn entry_targets(&self) -> PathBuf {
        self.fuzz_dir().join("entry-targets.json")
    }

    /// Mutation-point catalogue.
    pub fn mutation_points(&self) -> PathBuf {
        self.fuzz_dir().join("mutation-points.json")
    }

    /// Seed corpus root.
    pub fn seed_dir(&self) -> PathBuf {
        self.fuzz_dir().join("seeds")
    }

    /// Surviving-mutant records.
    pub fn survival_dir(&self) -> PathBuf {
        self.fuzz_dir().join("survival")
    }

    /// Status directory (coverage snapshot, command file).
    pub fn status_dir(&self) -> PathBuf {
        self.fuzz_dir().join("status")
    }

    /// User-written command file polled by the supervisor.
    pub fn status_cmd(&self) -> PathBuf {
        self.status_dir().join("cmd")
    }

    /// Per-worker directory.
    pub fn thread_dir(&self, tid: u64) -> PathBuf {
        self.fuzz_dir().join("threads").join(tid.to_string())
    }

    /// Scratch workspace pair used when re-validating a seed.
    pub fn seed_eval_pair(&self) -> (PathBuf, PathBuf) {
        (self.fuzz_dir().join("wks"), self.fuzz_dir().join("saw"))
    }

    /// Log file written when `--log` is passed.
    pub fn fuzz_log(&self) -> PathBuf {
        self.fuzz_dir().join("log.txt")
    }
}

/// Get the number of CPUs available.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
