//! Shared helpers for tests that forge the external tools.
//!
//! The verifier and the mutation pass are black boxes reached through
//! PATH lookup, so tests stand in small shell scripts for them.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Write a file, creating parent directories.
pub fn touch(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Write an executable shell script.
pub fn write_script(path: &Path, body: &str) {
    touch(path, &format!("#!/bin/sh\n{body}\n"));
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

/// A config rooted in a temp directory with base/deps/work subtrees.
pub fn scratch_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.base = root.join("base");
    config.deps = root.join("deps");
    config.work = root.join("work");
    config.pass_lib = root.join("deps/pass/libmutest.so");
    std::fs::create_dir_all(&config.base).unwrap();
    config
}

/// Forge an `opt` that understands the mutation-pass protocol.
///
/// `init` writes `catalogue` to the `-mutest-output` file; `mutate`
/// writes `mutate_result` there and appends a marker to the bitcode;
/// `replay` concatenates the base bitcode with the trace file, which
/// makes replay deterministic and trace-dependent. Every invocation
/// also appends the action to `<llvm-bin>/calls.log`.
pub fn forge_opt(config: &Config, catalogue: &str, mutate_result: &str) -> PathBuf {
    let bin = config.deps_llvm_bin();
    std::fs::create_dir_all(&bin).unwrap();
    let log = bin.join("calls.log");

    let body = format!(
        r#"shift 2
shift
shift
OUT=$1; shift
IN=$1; shift
ACTION=$1; shift
INPUT=""
MOUT=""
while [ $# -gt 0 ]; do
  case "$1" in
    -mutest-input) INPUT=$2; shift 2 ;;
    -mutest-output) MOUT=$2; shift 2 ;;
    *) shift ;;
  esac
done
echo "$ACTION" >> "{log}"
case "$ACTION" in
  init)
    cat > "$MOUT" <<'CATEOF'
{catalogue}
CATEOF
    ;;
  mutate)
    cat > "$MOUT" <<'RESEOF'
{mutate_result}
RESEOF
    if [ "$IN" != "$OUT" ]; then cp "$IN" "$OUT"; fi
    echo mutated >> "$OUT"
    ;;
  replay)
    cat "$IN" "$INPUT" > "$OUT"
    ;;
esac
"#,
        log = log.display(),
        catalogue = catalogue,
        mutate_result = mutate_result,
    );
    write_script(&bin.join("opt"), &body);
    log
}

/// Forge a `saw` that prints `transcript` on stdout and exits with
/// `exit`.
pub fn forge_saw(config: &Config, transcript: &str, exit: i32) {
    let bin = config.deps_saw_bin();
    std::fs::create_dir_all(&bin).unwrap();
    let body = format!("cat <<'EOF'\n{transcript}EOF\nexit {exit}");
    write_script(&bin.join("saw"), &body);
}

/// A catalogue of three mutation points, JSON-encoded.
pub fn small_catalogue() -> &'static str {
    r#"[
  {"rule": "const-replace", "function": "s2n_hmac_update", "instruction": 1},
  {"rule": "cmp-flip", "function": "s2n_hmac_digest", "instruction": 2},
  {"rule": "branch-swap", "function": "s2n_hash_init", "instruction": 3}
]"#
}
