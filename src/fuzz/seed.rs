//! On-disk seed corpus and survival records.
//!
//! Seeds live in numbered directories claimed atomically by `mkdir`:
//! whichever writer creates the directory owns the number, and only the
//! owner populates it. Readers may observe a claimed-but-unpopulated
//! directory for a moment and retry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bitcode::{MutationStep, Trace};
use crate::config::Config;
use crate::core::{Error, Result};
use crate::verifier::VerificationError;

const READ_RETRIES: u32 = 50;
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A seed loaded from disk.
#[derive(Debug, Clone)]
pub struct Seed {
    pub name: String,
    pub trace: Trace,
    pub cov: Vec<VerificationError>,
    pub score: u64,
}

/// Handle to the corpus directories.
#[derive(Debug, Clone)]
pub struct SeedStore {
    seeds: PathBuf,
    survival: PathBuf,
}

impl SeedStore {
    /// Open (creating if needed) the corpus under the given config.
    pub fn open(config: &Config) -> Result<Self> {
        Self::new(config.seed_dir(), config.survival_dir())
    }

    /// Open (creating if needed) explicit corpus directories.
    pub fn new(seeds: PathBuf, survival: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&seeds)?;
        std::fs::create_dir_all(&survival)?;
        Ok(Self { seeds, survival })
    }

    /// Directory of a seed.
    pub fn seed_path(&self, name: &str) -> PathBuf {
        self.seeds.join(name)
    }

    /// Names of all seeds currently on disk, in numeric order.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<(u64, String)> = Vec::new();
        for entry in std::fs::read_dir(&self.seeds)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let index = name
                .parse::<u64>()
                .map_err(|_| Error::corpus(format!("non-numeric seed directory: {name}")))?;
            names.push((index, name));
        }
        names.sort();
        Ok(names.into_iter().map(|(_, name)| name).collect())
    }

    /// Persist a new seed; returns its allocated name.
    pub fn save_seed(
        &self,
        trace: &[MutationStep],
        cov: &[VerificationError],
        score: u64,
    ) -> Result<String> {
        let (name, dir) = claim_next(&self.seeds)?;
        std::fs::write(dir.join("trace.json"), serde_json::to_string_pretty(trace)?)?;
        std::fs::write(dir.join("cov.json"), serde_json::to_string_pretty(cov)?)?;
        atomic_write(&dir.join("score.txt"), score.to_string().as_bytes())?;
        Ok(name)
    }

    /// Load a seed, tolerating a directory whose writer has claimed it
    /// but not yet populated the files.
    pub fn load_seed(&self, name: &str) -> Result<Seed> {
        let dir = self.seed_path(name);

        let mut attempt = 0;
        loop {
            match self.try_load(name, &dir) {
                Ok(seed) => return Ok(seed),
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    attempt += 1;
                    if attempt >= READ_RETRIES {
                        return Err(Error::corpus(format!(
                            "seed {name} never became readable"
                        )));
                    }
                    std::thread::sleep(READ_RETRY_DELAY);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_load(&self, name: &str, dir: &Path) -> Result<Seed> {
        let trace = crate::bitcode::load_trace(&dir.join("trace.json"))?;
        let raw = std::fs::read_to_string(dir.join("cov.json"))?;
        let cov: Vec<VerificationError> = serde_json::from_str(&raw)?;
        let score = self.read_score(name)?;
        Ok(Seed {
            name: name.to_string(),
            trace,
            cov,
            score,
        })
    }

    /// Read a seed's current score.
    pub fn read_score(&self, name: &str) -> Result<u64> {
        let raw = std::fs::read_to_string(self.seed_path(name).join("score.txt"))?;
        raw.trim()
            .parse::<u64>()
            .map_err(|_| Error::corpus(format!("malformed score for seed {name}: {raw:?}")))
    }

    /// Overwrite a seed's score file.
    pub fn write_score(&self, name: &str, score: u64) -> Result<()> {
        atomic_write(
            &self.seed_path(name).join("score.txt"),
            score.to_string().as_bytes(),
        )
    }

    /// Record a surviving mutant's trace; returns the allocated name.
    pub fn save_survival(&self, trace: &[MutationStep]) -> Result<String> {
        let (name, dir) = claim_next(&self.survival)?;
        std::fs::write(dir.join("trace.json"), serde_json::to_string_pretty(trace)?)?;
        Ok(name)
    }

    /// Number of survival records on disk.
    pub fn survival_count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.survival)? {
            if entry?.file_type()?.is_dir() {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Claim the next numbered directory atomically.
///
/// Counts the existing subdirectories and tries `mkdir` with that
/// number; when another writer wins the race the `AlreadyExists` error
/// sends us around for a recount.
fn claim_next(root: &Path) -> Result<(String, PathBuf)> {
    loop {
        let mut count = 0;
        for entry in std::fs::read_dir(root)? {
            if entry?.file_type()?.is_dir() {
                count += 1;
            }
        }

        let name = count.to_string();
        let dir = root.join(&name);
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok((name, dir)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Write a file through a rename so readers never observe a torn write.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::corpus(format!("no parent for {}", path.display())))?;
    let tmp = parent.join(format!(".sawfuzz-{}.tmp", std::process::id()));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> SeedStore {
        SeedStore::new(
            temp_dir.path().join("seeds"),
            temp_dir.path().join("survival"),
        )
        .unwrap()
    }

    #[test]
    fn test_save_seed_allocates_sequential_names() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        assert_eq!(store.save_seed(&[], &[], 1000).unwrap(), "0");
        assert_eq!(store.save_seed(&[], &[], 990).unwrap(), "1");
        assert_eq!(store.save_seed(&[], &[], 980).unwrap(), "2");
        assert_eq!(store.list().unwrap(), vec!["0", "1", "2"]);
    }

    #[test]
    fn test_load_seed_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let name = store.save_seed(&[], &[], 1000).unwrap();
        let seed = store.load_seed(&name).unwrap();

        assert_eq!(seed.name, "0");
        assert!(seed.trace.is_empty());
        assert!(seed.cov.is_empty());
        assert_eq!(seed.score, 1000);
    }

    #[test]
    fn test_score_read_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let name = store.save_seed(&[], &[], 1000).unwrap();
        store.write_score(&name, 997).unwrap();
        assert_eq!(store.read_score(&name).unwrap(), 997);
    }

    #[test]
    fn test_survival_record_has_only_trace() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let name = store.save_survival(&[]).unwrap();
        assert_eq!(name, "0");
        assert_eq!(store.survival_count().unwrap(), 1);

        let dir = temp_dir.path().join("survival").join("0");
        assert!(dir.join("trace.json").is_file());
        assert!(!dir.join("cov.json").exists());
        assert!(!dir.join("score.txt").exists());
    }

    #[test]
    fn test_concurrent_claims_are_unique() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(store(&temp_dir));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut names = Vec::new();
                for _ in 0..10 {
                    names.push(store.save_seed(&[], &[], 1).unwrap());
                }
                names
            }));
        }

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_by_key(|n| n.parse::<u64>().unwrap());
        all.dedup();

        assert_eq!(all.len(), 80);
        assert_eq!(all.first().map(String::as_str), Some("0"));
        assert_eq!(all.last().map(String::as_str), Some("79"));
    }

    #[test]
    fn test_load_seed_waits_for_slow_writer() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        // Claim the directory but delay populating it, as a racing
        // writer would.
        std::fs::create_dir(temp_dir.path().join("seeds").join("0")).unwrap();
        let dir = temp_dir.path().join("seeds").join("0");
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            std::fs::write(dir.join("trace.json"), "[]").unwrap();
            std::fs::write(dir.join("cov.json"), "[]").unwrap();
            std::fs::write(dir.join("score.txt"), "1000").unwrap();
        });

        let seed = store.load_seed("0").unwrap();
        writer.join().unwrap();
        assert_eq!(seed.score, 1000);
    }

    #[test]
    fn test_load_seed_gives_up_on_empty_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        std::fs::create_dir(temp_dir.path().join("seeds").join("0")).unwrap();

        let result = store.load_seed("0");
        assert!(result.is_err());
    }
}
