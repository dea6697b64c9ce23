//! Driving the `saw` verifier and collecting its verdicts.
//!
//! A verification round runs every top-level script of the proof
//! workspace, captures the transcripts, and reduces them to a
//! de-duplicated sequence of [`VerificationError`]s. Per-script
//! `.mark` files record the ground-truth pass/fail status.

mod transcript;

pub use transcript::{parse_transcript, AbortDetails, ErrorDetails, VerificationError};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use colored::Colorize;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::config::Config;
use crate::core::{Error, Result};
use crate::process::CommandSpec;

/// Scripts excluded from verification rounds because their verification
/// is lengthy and nondeterministic.
pub const IGNORED_TOP_LEVEL_SCRIPTS: &[&str] = &["verify_imperative_cryptol_spec.saw"];

/// Outcome of a full verification round over one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// De-duplicated errors across all scripts (empty = clean mutant).
    Errors(Vec<VerificationError>),
    /// At least one script made the verifier itself crash; the round
    /// carries no usable coverage.
    VerifierCrash,
}

/// Collect the top-level verification scripts, sorted and filtered.
pub fn collect_saw_scripts(base: &Path) -> Result<Vec<String>> {
    let mut scripts = BTreeSet::new();
    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".saw") && !IGNORED_TOP_LEVEL_SCRIPTS.contains(&name.as_str()) {
            scripts.insert(name);
        }
    }
    Ok(scripts.into_iter().collect())
}

/// Extract the names of all verified functions from the SAW scripts.
///
/// Scans the top-level scripts plus everything under `spec/`, recording
/// the (quoted) symbol that follows each `crucible_llvm_verify` token.
pub fn collect_verified_functions(base: &Path) -> Result<Vec<String>> {
    let mut files: Vec<PathBuf> = collect_saw_scripts(base)?
        .into_iter()
        .map(|name| base.join(name))
        .collect();
    for entry in WalkDir::new(base.join("spec"))
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "saw")
        {
            files.push(entry.path().to_path_buf());
        }
    }

    let mut functions = BTreeSet::new();
    for file in files {
        let content = std::fs::read_to_string(&file)?;
        for line in content.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            for (i, token) in tokens.iter().enumerate() {
                if *token != "crucible_llvm_verify" {
                    continue;
                }
                let target = tokens.get(i + 2).ok_or_else(|| {
                    Error::config(format!(
                        "truncated crucible_llvm_verify in {}",
                        file.display()
                    ))
                })?;
                let name = target
                    .strip_prefix('"')
                    .and_then(|t| t.strip_suffix('"'))
                    .ok_or_else(|| {
                        Error::config(format!(
                            "unquoted crucible_llvm_verify target {target} in {}",
                            file.display()
                        ))
                    })?;
                functions.insert(name.to_string());
            }
        }
    }

    Ok(functions.into_iter().collect())
}

/// Run one script and record its transcripts and status mark.
///
/// Returns whether verification passed. A nonzero verifier exit is the
/// expected signal, not an error; it lands in the `.mark` file.
pub fn verify_one(config: &Config, wks: &Path, item: &str, outdir: &Path) -> Result<bool> {
    std::fs::create_dir_all(outdir)?;
    let file_out = outdir.join(format!("{item}.out"));
    let file_err = outdir.join(format!("{item}.err"));
    let file_log = outdir.join(format!("{item}.log"));
    let file_mark = outdir.join(format!("{item}.mark"));

    let spec = CommandSpec::new("saw")
        .args(["-v", "debug", "-s"])
        .arg(file_log.to_string_lossy())
        .args(["-f", "json"])
        .arg(item)
        .current_dir(wks)
        .prepend_path(config.deps_saw_bin())
        .stdout_to(&file_out)
        .stderr_to(&file_err);

    match spec.run() {
        Ok(()) => {
            std::fs::write(&file_mark, "success")?;
            Ok(true)
        }
        Err(err @ Error::Subprocess { .. }) => {
            std::fs::write(&file_mark, err.to_string())?;
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Parse the recorded transcript of a failed script.
///
/// Returns `None` (the crash sentinel) when the transcript has no
/// recognizable error but stderr shows the verifier itself blew up.
pub fn parse_failure_report(
    wks: &Path,
    item: &str,
    outdir: &Path,
) -> Result<Option<Vec<VerificationError>>> {
    let file_out = outdir.join(format!("{item}.out"));
    let content = std::fs::read_to_string(&file_out)?;

    let wks_prefix = wks.to_string_lossy();
    let details = parse_transcript(&wks_prefix, &file_out, &content)?;

    if details.is_empty() {
        let file_err = outdir.join(format!("{item}.err"));
        let stderr = std::fs::read_to_string(&file_err)?;
        if stderr.is_empty() {
            return Err(Error::transcript(&file_out, "no errors found in transcript"));
        }
        tracing::info!(
            "observed error in file: {}\n{}",
            file_err.display(),
            stderr.trim_end()
        );
        return Ok(None);
    }

    Ok(Some(
        details
            .into_iter()
            .map(|details| VerificationError {
                item: item.to_string(),
                details,
            })
            .collect(),
    ))
}

/// Run every top-level script sequentially and fold the results.
///
/// The returned error sequence is insertion-ordered with duplicates
/// dropped by value equality.
pub fn verify_all(config: &Config, wks: &Path, outdir: &Path) -> Result<VerificationOutcome> {
    let scripts = collect_saw_scripts(wks)?;

    let mut errors: Vec<VerificationError> = Vec::new();
    let mut has_crash = false;

    for script in &scripts {
        if verify_one(config, wks, script, outdir)? {
            continue;
        }
        match parse_failure_report(wks, script, outdir)? {
            None => has_crash = true,
            Some(reports) => {
                for error in reports {
                    if !errors.contains(&error) {
                        errors.push(error);
                    }
                }
            }
        }
    }

    if has_crash {
        return Ok(VerificationOutcome::VerifierCrash);
    }
    Ok(VerificationOutcome::Errors(errors))
}

/// Standalone verification of every script, in parallel, printing the
/// parsed errors of each failure.
pub fn verify_all_standalone(config: &Config) -> Result<()> {
    let outdir = config.work_saw();
    let scripts = collect_saw_scripts(&config.base)?;

    let results: Vec<Result<bool>> = scripts
        .par_iter()
        .map(|script| verify_one(config, &config.base, script, &outdir))
        .collect();

    for (script, result) in scripts.iter().zip(results) {
        if result? {
            continue;
        }
        print_failure(&config.base, script, &outdir)?;
    }
    Ok(())
}

/// Standalone verification of a single script.
pub fn verify_single(config: &Config, script: &str) -> Result<()> {
    let outdir = config.work_saw();
    if !verify_one(config, &config.base, script, &outdir)? {
        print_failure(&config.base, script, &outdir)?;
    }
    Ok(())
}

fn print_failure(wks: &Path, item: &str, outdir: &Path) -> Result<()> {
    println!("  Case failed: {}", item.red());
    if let Some(errors) = parse_failure_report(wks, item, outdir)? {
        for error in errors {
            println!("    {}", serde_json::to_string_pretty(&error)?);
        }
    }
    Ok(())
}

/// Clone the pieces of the proof workspace a worker needs.
///
/// Creates an empty `bitcode/` directory, copies every top-level `.saw`
/// script, and mirrors the `spec/` and `HMAC/` trees.
pub fn duplicate_workspace(base: &Path, wks: &Path) -> Result<()> {
    std::fs::create_dir_all(wks.join("bitcode"))?;

    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".saw") {
            std::fs::copy(entry.path(), wks.join(&name))?;
        }
    }

    for tree in ["spec", "HMAC"] {
        copy_tree(&base.join(tree), &wks.join(tree))?;
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .expect("walked path under root");
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// A mark is stale when its transcript was rewritten by a newer round.
fn is_stale(mark: &Path, out: &Path) -> Result<bool> {
    let time_mark = std::fs::metadata(mark)?.modified()?;
    let time_out = std::fs::metadata(out)?.modified()?;
    Ok(time_out > time_mark)
}

/// Read-only analyzer over a directory of `.mark` files.
///
/// Skips successful and stale marks, then parses and pretty-prints the
/// errors of every confirmed failure.
pub fn dump_verification_output(wks: &Path, outdir: &Path) -> Result<()> {
    println!("Analyzing: {}", outdir.display());

    let mut marks: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(outdir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".mark") {
            marks.push(name);
        }
    }
    marks.sort();

    for mark in marks {
        let path_mark = outdir.join(&mark);
        let status = std::fs::read_to_string(&path_mark)?;
        if status.trim() == "success" {
            continue;
        }

        let item = mark.strip_suffix(".mark").expect("filtered on suffix");
        let path_out = outdir.join(format!("{item}.out"));
        if is_stale(&path_mark, &path_out)? {
            continue;
        }

        print_failure(wks, item, outdir)?;
    }
    Ok(())
}
