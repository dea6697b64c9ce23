//! Bitcode artifacts and the external mutation pass.
//!
//! The mutation pass is an LLVM `opt` plugin reached through one command
//! template; this module owns the catalogue of mutation points it can
//! act on, the steps and traces recorded against them, and the
//! `init` / `mutate` / `replay` actions that rewrite bitcode.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{num_cpus, Config};
use crate::core::Result;
use crate::process::CommandSpec;
use crate::verifier::collect_verified_functions;

/// Immutable identity of a mutable program location.
///
/// Ordered lexicographically by rule, then function, then instruction.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MutationPoint {
    pub rule: String,
    pub function: String,
    pub instruction: u64,
}

/// One concrete mutation decision, replayable through the pass.
///
/// `package` carries whatever parameters the mutation tool chose (for
/// example the replacement value) and is treated as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationStep {
    pub rule: String,
    pub function: String,
    pub instruction: u64,
    pub package: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_mutation: Option<bool>,
}

impl MutationStep {
    /// A bare step, as the round-trip diagnostic records it.
    pub fn new(point: &MutationPoint, package: Map<String, Value>) -> Self {
        Self {
            rule: point.rule.clone(),
            function: point.function.clone(),
            instruction: point.instruction,
            package,
            timestamp: None,
            second_mutation: None,
        }
    }

    /// A step recorded by the fuzzing loop: stamped, with the tool's
    /// optional second-mutation flag carried through unchanged.
    pub fn recorded(point: &MutationPoint, result: MutateResult) -> Self {
        Self {
            rule: point.rule.clone(),
            function: point.function.clone(),
            instruction: point.instruction,
            package: result.package,
            timestamp: Some(Utc::now()),
            second_mutation: result.second_mutation,
        }
    }
}

/// An ordered sequence of mutation steps. No two steps of a valid trace
/// share the same `(function, instruction)` pair.
pub type Trace = Vec<MutationStep>;

/// Whether the trace already mutates the point's program location.
pub fn trace_covers(trace: &[MutationStep], point: &MutationPoint) -> bool {
    trace
        .iter()
        .any(|step| step.function == point.function && step.instruction == point.instruction)
}

/// Load a trace from JSON.
pub fn load_trace(path: &Path) -> Result<Trace> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Save a trace as pretty-printed JSON.
pub fn save_trace(path: &Path, trace: &[MutationStep]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(trace)?)?;
    Ok(())
}

/// What the pass reports after a `mutate` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutateResult {
    /// False when the tool declined to mutate the point.
    pub changed: bool,
    pub package: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_mutation: Option<bool>,
}

/// Read a `mutate` result file.
pub fn load_mutate_result(path: &Path) -> Result<MutateResult> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Build the base bitcode via the workspace's make target and save a
/// pristine copy under the work tree.
pub fn build_bitcode(config: &Config, clean: bool) -> Result<()> {
    if clean {
        CommandSpec::new("make")
            .arg("clean")
            .current_dir(&config.base)
            .run()?;
    }

    CommandSpec::new("make")
        .args(["-j", &num_cpus().to_string()])
        .arg("bitcode/all_llvm.bc")
        .current_dir(&config.base)
        .prepend_path(config.deps_llvm_bin())
        .run()?;

    let work_copy = config.work_bitcode();
    if let Some(parent) = work_copy.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(config.orig_bitcode(), work_copy)?;
    Ok(())
}

/// Run one action of the mutation pass.
fn run_mutation_pass(config: &Config, bc_from: &Path, bc_into: &Path, args: &[String]) -> Result<()> {
    CommandSpec::new("opt")
        .arg("-load")
        .arg(config.pass_lib.to_string_lossy())
        .arg("-mutest")
        .arg("-o")
        .arg(bc_into.to_string_lossy())
        .arg(bc_from.to_string_lossy())
        .args(args.iter().cloned())
        .current_dir(&config.base)
        .prepend_path(config.deps_llvm_bin())
        .run()
}

/// Load the mutation-point catalogue.
pub fn load_mutation_points(config: &Config) -> Result<Vec<MutationPoint>> {
    let raw = std::fs::read_to_string(config.mutation_points())?;
    Ok(serde_json::from_str(&raw)?)
}

/// Enumerate every mutation point the pass can act on.
///
/// Collects the verified function names into `entry-targets.json`, then
/// runs the pass in `init` mode, which rewrites the base bitcode in
/// place and emits the catalogue.
pub fn mutation_init(config: &Config) -> Result<Vec<MutationPoint>> {
    std::fs::create_dir_all(config.fuzz_dir())?;

    let targets = collect_verified_functions(&config.base)?;
    std::fs::write(
        config.entry_targets(),
        serde_json::to_string_pretty(&targets)?,
    )?;

    run_mutation_pass(
        config,
        &config.work_bitcode(),
        &config.orig_bitcode(),
        &[
            "init".to_string(),
            "-mutest-input".to_string(),
            config.entry_targets().to_string_lossy().into_owned(),
            "-mutest-output".to_string(),
            config.mutation_points().to_string_lossy().into_owned(),
        ],
    )?;

    load_mutation_points(config)
}

/// Load the catalogue, enumerating it first only when missing.
pub fn ensure_mutation_points(config: &Config) -> Result<Vec<MutationPoint>> {
    if config.mutation_points().exists() {
        load_mutation_points(config)
    } else {
        mutation_init(config)
    }
}

/// Reproduce a recorded trace deterministically onto `bc_into`.
pub fn mutation_pass_replay(config: &Config, trace: &Path, bc_into: &Path) -> Result<()> {
    run_mutation_pass(
        config,
        &config.work_bitcode(),
        bc_into,
        &[
            "replay".to_string(),
            "-mutest-input".to_string(),
            trace.to_string_lossy().into_owned(),
        ],
    )
}

/// Apply one fresh random mutation at a point. `bc_from` and `bc_into`
/// may alias; the chosen parameters land in `output`.
pub fn mutation_pass_mutate(
    config: &Config,
    point: &MutationPoint,
    output: &Path,
    bc_from: &Path,
    bc_into: &Path,
) -> Result<()> {
    run_mutation_pass(
        config,
        bc_from,
        bc_into,
        &[
            "mutate".to_string(),
            "-mutest-target-rule".to_string(),
            point.rule.clone(),
            "-mutest-target-function".to_string(),
            point.function.clone(),
            "-mutest-target-instruction".to_string(),
            point.instruction.to_string(),
            "-mutest-output".to_string(),
            output.to_string_lossy().into_owned(),
        ],
    )
}

/// Filters for the round-trip diagnostic.
#[derive(Debug, Clone, Default)]
pub struct PassTestFilter {
    pub rule: Option<String>,
    pub function: Option<String>,
    pub instruction: Option<u64>,
}

impl PassTestFilter {
    fn accepts(&self, point: &MutationPoint) -> bool {
        self.rule.as_ref().is_none_or(|r| *r == point.rule)
            && self.function.as_ref().is_none_or(|f| *f == point.function)
            && self
                .instruction
                .is_none_or(|i| i == point.instruction)
    }
}

/// Round-trip every catalogue point through mutate and replay.
///
/// For each accepted point, `repetition` times: apply a fresh mutation,
/// rebuild a single-step trace from its package, and replay it. Points
/// the tool declines are logged and skipped.
pub fn mutation_pass_test(config: &Config, repetition: u32, filter: &PassTestFilter) -> Result<()> {
    let scratch = config.work_bitcode_mutation();
    if let Some(parent) = scratch.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let all_points = ensure_mutation_points(config)?;
    for point in all_points.iter().filter(|p| filter.accepts(p)) {
        tracing::info!(
            "testing: {} on {}::{}",
            point.rule,
            point.function,
            point.instruction
        );

        for k in 0..repetition {
            mutation_pass_mutate(
                config,
                point,
                &scratch,
                &config.work_bitcode(),
                &config.orig_bitcode(),
            )?;
            tracing::debug!("  [{k}] mutation done");

            let result = load_mutate_result(&scratch)?;
            if !result.changed {
                tracing::warn!("mutation point results in no change");
                continue;
            }

            let step = MutationStep::new(point, result.package);
            save_trace(&scratch, &[step])?;
            mutation_pass_replay(config, &scratch, &config.orig_bitcode())?;
            tracing::debug!("  [{k}] replay done");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_point_order_is_lexicographic() {
        let a = MutationPoint {
            rule: "a".to_string(),
            function: "z".to_string(),
            instruction: 9,
        };
        let b = MutationPoint {
            rule: "b".to_string(),
            function: "a".to_string(),
            instruction: 0,
        };
        assert!(a < b);

        let c = MutationPoint {
            rule: "a".to_string(),
            function: "z".to_string(),
            instruction: 10,
        };
        assert!(a < c);
    }

    #[test]
    fn test_trace_covers_matches_function_and_instruction() {
        let point = MutationPoint {
            rule: "cmp-flip".to_string(),
            function: "f".to_string(),
            instruction: 7,
        };
        let step = MutationStep::new(&point, Map::new());

        // Same location under a different rule is still covered.
        let other_rule = MutationPoint {
            rule: "const-replace".to_string(),
            function: "f".to_string(),
            instruction: 7,
        };
        assert!(trace_covers(&[step.clone()], &other_rule));

        let elsewhere = MutationPoint {
            rule: "cmp-flip".to_string(),
            function: "f".to_string(),
            instruction: 8,
        };
        assert!(!trace_covers(&[step], &elsewhere));
    }

    #[test]
    fn test_step_serialization_skips_absent_options() {
        let point = MutationPoint {
            rule: "cmp-flip".to_string(),
            function: "f".to_string(),
            instruction: 7,
        };
        let mut package = Map::new();
        package.insert("repl".to_string(), serde_json::json!(42));
        let step = MutationStep::new(&point, package);

        let json = serde_json::to_string(&step).unwrap();
        assert!(!json.contains("timestamp"));
        assert!(!json.contains("second_mutation"));

        let back: MutationStep = serde_json::from_str(&json).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn test_mutate_result_optional_second_mutation() {
        let result: MutateResult =
            serde_json::from_str(r#"{"changed": true, "package": {"repl": 1}}"#).unwrap();
        assert!(result.changed);
        assert_eq!(result.second_mutation, None);

        let result: MutateResult = serde_json::from_str(
            r#"{"changed": false, "package": {}, "second_mutation": true}"#,
        )
        .unwrap();
        assert_eq!(result.second_mutation, Some(true));

        let point = MutationPoint {
            rule: "r".to_string(),
            function: "f".to_string(),
            instruction: 1,
        };
        let step = MutationStep::recorded(&point, result);
        assert_eq!(step.second_mutation, Some(true));
        assert!(step.timestamp.is_some());
    }

    #[test]
    fn test_pass_test_filter() {
        let point = MutationPoint {
            rule: "cmp-flip".to_string(),
            function: "f".to_string(),
            instruction: 7,
        };

        assert!(PassTestFilter::default().accepts(&point));
        assert!(PassTestFilter {
            rule: Some("cmp-flip".to_string()),
            ..Default::default()
        }
        .accepts(&point));
        assert!(!PassTestFilter {
            function: Some("g".to_string()),
            ..Default::default()
        }
        .accepts(&point));
        assert!(!PassTestFilter {
            instruction: Some(8),
            ..Default::default()
        }
        .accepts(&point));
    }

    #[cfg(unix)]
    mod with_forged_opt {
        use super::*;
        use crate::testutil::{forge_opt, scratch_config, small_catalogue, touch};
        use tempfile::TempDir;

        const CHANGED: &str = r#"{"changed": true, "package": {"repl": 42}}"#;

        #[test]
        fn test_mutation_init_writes_targets_and_loads_catalogue() {
            let temp_dir = TempDir::new().unwrap();
            let config = scratch_config(temp_dir.path());
            forge_opt(&config, small_catalogue(), CHANGED);
            touch(
                &config.base.join("verify_hmac.saw"),
                "crucible_llvm_verify m \"s2n_hmac_update\" [] true spec;\n",
            );
            touch(&config.work_bitcode(), "BASE-BITCODE\n");

            let points = mutation_init(&config).unwrap();

            assert_eq!(points.len(), 3);
            assert_eq!(points[0].rule, "const-replace");
            let targets = std::fs::read_to_string(config.entry_targets()).unwrap();
            assert!(targets.contains("s2n_hmac_update"));
        }

        #[test]
        fn test_ensure_mutation_points_is_idempotent() {
            let temp_dir = TempDir::new().unwrap();
            let config = scratch_config(temp_dir.path());
            let calls = forge_opt(&config, small_catalogue(), CHANGED);
            touch(&config.base.join("verify_hmac.saw"), "");
            touch(&config.work_bitcode(), "BASE-BITCODE\n");

            let first = ensure_mutation_points(&config).unwrap();
            let second = ensure_mutation_points(&config).unwrap();

            assert_eq!(first.len(), second.len());
            // The pass ran exactly once; the second call only decoded.
            let log = std::fs::read_to_string(calls).unwrap();
            assert_eq!(log, "init\n");
        }

        #[test]
        fn test_replay_is_deterministic() {
            let temp_dir = TempDir::new().unwrap();
            let config = scratch_config(temp_dir.path());
            forge_opt(&config, small_catalogue(), CHANGED);
            touch(&config.work_bitcode(), "BASE-BITCODE\n");

            let point = MutationPoint {
                rule: "const-replace".to_string(),
                function: "s2n_hmac_update".to_string(),
                instruction: 1,
            };
            let mut package = Map::new();
            package.insert("repl".to_string(), serde_json::json!(42));
            let trace_path = temp_dir.path().join("trace.json");
            save_trace(&trace_path, &[MutationStep::new(&point, package)]).unwrap();

            let out_a = temp_dir.path().join("a.bc");
            let out_b = temp_dir.path().join("b.bc");
            mutation_pass_replay(&config, &trace_path, &out_a).unwrap();
            mutation_pass_replay(&config, &trace_path, &out_b).unwrap();

            let a = std::fs::read(&out_a).unwrap();
            let b = std::fs::read(&out_b).unwrap();
            assert!(!a.is_empty());
            assert_eq!(a, b);
        }

        #[test]
        fn test_mutate_in_place_and_result() {
            let temp_dir = TempDir::new().unwrap();
            let config = scratch_config(temp_dir.path());
            forge_opt(&config, small_catalogue(), CHANGED);

            let bc = temp_dir.path().join("wks.bc");
            touch(&bc, "BASE-BITCODE\n");
            let result_path = temp_dir.path().join("result.json");

            let point = MutationPoint {
                rule: "cmp-flip".to_string(),
                function: "s2n_hmac_digest".to_string(),
                instruction: 2,
            };
            mutation_pass_mutate(&config, &point, &result_path, &bc, &bc).unwrap();

            let result = load_mutate_result(&result_path).unwrap();
            assert!(result.changed);
            assert_eq!(result.package["repl"], 42);

            let mutated = std::fs::read_to_string(&bc).unwrap();
            assert!(mutated.contains("BASE-BITCODE"));
            assert!(mutated.contains("mutated"));
        }

        #[test]
        fn test_pass_test_round_trip() {
            let temp_dir = TempDir::new().unwrap();
            let config = scratch_config(temp_dir.path());
            let calls = forge_opt(&config, small_catalogue(), CHANGED);
            touch(&config.base.join("verify_hmac.saw"), "");
            touch(&config.work_bitcode(), "BASE-BITCODE\n");
            touch(&config.orig_bitcode(), "ORIG-BITCODE\n");

            let filter = PassTestFilter {
                function: Some("s2n_hmac_digest".to_string()),
                ..Default::default()
            };
            mutation_pass_test(&config, 2, &filter).unwrap();

            // init once, then mutate+replay per repetition.
            let log = std::fs::read_to_string(calls).unwrap();
            assert_eq!(log, "init\nmutate\nreplay\nmutate\nreplay\n");
        }
    }
}
