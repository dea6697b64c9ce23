//! sawfuzz CLI - mutation fuzzing driver for SAW-verified proofs.

use std::fs::File;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sawfuzz::bitcode;
use sawfuzz::cli::{Cli, Command, MiscAction, PassAction};
use sawfuzz::config::Config;
use sawfuzz::fuzz;
use sawfuzz::process::prepend_process_path;
use sawfuzz::verifier;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(&cli.path),
    }
    .context("loading configuration")?;

    init_tracing(&cli, &config)?;

    // Every child should see the saw and llvm distributions.
    prepend_process_path(&[config.deps_saw_bin(), config.deps_llvm_bin()]);

    match cli.command {
        Command::Bitcode(args) => {
            bitcode::build_bitcode(&config, args.clean)?;
        }
        Command::Verify(args) => {
            if args.input == "ALL" {
                verifier::verify_all_standalone(&config)?;
            } else {
                verifier::verify_single(&config, &args.input)?;
            }
        }
        Command::Pass { action } => match action {
            PassAction::Init => {
                let points = bitcode::mutation_init(&config)?;
                tracing::info!("catalogued {} mutation points", points.len());
            }
            PassAction::Replay { trace } => {
                bitcode::mutation_pass_replay(&config, &trace, &config.orig_bitcode())?;
            }
            PassAction::Test(args) => {
                let filter = bitcode::PassTestFilter {
                    rule: args.filter_rule,
                    function: args.filter_function,
                    instruction: args.filter_instruction,
                };
                bitcode::mutation_pass_test(&config, args.repetition, &filter)?;
            }
        },
        Command::Fuzz(args) => {
            fuzz::fuzz_start(&config, args.clean, args.jobs)?;
        }
        Command::Misc { action } => match action {
            MiscAction::ParseVerificationOutput { target } => {
                fuzz::parse_verification_output(&config, &target)?;
            }
        },
    }

    Ok(())
}

fn init_tracing(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(fmt::layer()).with(filter);

    if cli.log {
        let path = config.fuzz_log();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)
            .with_context(|| format!("creating log file {}", path.display()))?;
        registry
            .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
            .init();
    } else {
        registry.init();
    }
    Ok(())
}
