//! CLI implementation using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// sawfuzz - coverage-guided mutation fuzzing for SAW-verified proofs.
#[derive(Parser)]
#[command(name = "sawfuzz")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Proof workspace root
    #[arg(short, long, default_value = ".")]
    pub path: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also write logs to the fuzzing log file
    #[arg(short, long)]
    pub log: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build the base bitcode and save a pristine copy
    Bitcode(BitcodeArgs),

    /// Run the verifier over ALL scripts or a single one
    Verify(VerifyArgs),

    /// Invoke a single action of the mutation pass
    Pass {
        #[command(subcommand)]
        action: PassAction,
    },

    /// Launch the fuzzing loop
    Fuzz(FuzzArgs),

    /// Maintenance helpers
    Misc {
        #[command(subcommand)]
        action: MiscAction,
    },
}

#[derive(Args)]
pub struct BitcodeArgs {
    /// Clean the build tree first
    #[arg(long)]
    pub clean: bool,
}

#[derive(Args)]
pub struct VerifyArgs {
    /// ALL, or the name of one top-level script
    pub input: String,
}

#[derive(Subcommand)]
pub enum PassAction {
    /// Enumerate every mutation point into the catalogue
    Init,

    /// Replay a recorded trace onto the base bitcode
    Replay {
        /// Trace file to reproduce
        trace: PathBuf,
    },

    /// Round-trip catalogue points through mutate and replay
    Test(PassTestArgs),
}

#[derive(Args)]
pub struct PassTestArgs {
    /// Only test points with this rule
    #[arg(long)]
    pub filter_rule: Option<String>,

    /// Only test points in this function
    #[arg(long)]
    pub filter_function: Option<String>,

    /// Only test points at this instruction
    #[arg(long)]
    pub filter_instruction: Option<u64>,

    /// How many times to round-trip each point
    #[arg(long, default_value = "1")]
    pub repetition: u32,
}

#[derive(Args)]
pub struct FuzzArgs {
    /// Discard all previous fuzzing state first
    #[arg(long)]
    pub clean: bool,

    /// Number of workers (default: half the cores)
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,
}

#[derive(Subcommand)]
pub enum MiscAction {
    /// Analyze recorded verification outputs
    #[command(alias = "parse_verification_output")]
    ParseVerificationOutput {
        /// BASE, ALL, SEED, or a worker tid
        target: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fuzz_with_jobs() {
        let cli = Cli::try_parse_from(["sawfuzz", "-v", "fuzz", "--clean", "-j", "4"]).unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Command::Fuzz(args) => {
                assert!(args.clean);
                assert_eq!(args.jobs, Some(4));
            }
            _ => panic!("expected fuzz command"),
        }
    }

    #[test]
    fn test_parse_pass_test_filters() {
        let cli = Cli::try_parse_from([
            "sawfuzz",
            "pass",
            "test",
            "--filter-rule",
            "cmp-flip",
            "--repetition",
            "3",
        ])
        .unwrap();
        match cli.command {
            Command::Pass {
                action: PassAction::Test(args),
            } => {
                assert_eq!(args.filter_rule.as_deref(), Some("cmp-flip"));
                assert_eq!(args.filter_function, None);
                assert_eq!(args.repetition, 3);
            }
            _ => panic!("expected pass test command"),
        }
    }

    #[test]
    fn test_parse_misc_target() {
        let cli = Cli::try_parse_from(["sawfuzz", "misc", "parse-verification-output", "ALL"])
            .unwrap();
        match cli.command {
            Command::Misc {
                action: MiscAction::ParseVerificationOutput { target },
            } => assert_eq!(target, "ALL"),
            _ => panic!("expected misc command"),
        }
    }

    #[test]
    fn test_missing_subcommand_is_usage_error() {
        assert!(Cli::try_parse_from(["sawfuzz"]).is_err());
    }
}
