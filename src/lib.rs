//! sawfuzz - coverage-guided mutation fuzzing for formally verified
//! cryptographic code.
//!
//! The pipeline mutates compiled LLVM bitcode at catalogued program
//! points through an external rewriter, re-runs the SAW verifier over
//! each mutant, and treats the set of structured verification failures
//! as the coverage signal that evolves a corpus of mutation traces.
//! Mutants the verifier still accepts are archived as candidate
//! weaknesses in the proofs.
//!
//! # Example
//!
//! ```no_run
//! use sawfuzz::config::Config;
//! use sawfuzz::verifier::{verify_all, VerificationOutcome};
//!
//! let config = Config::load(".").unwrap();
//! let outcome = verify_all(&config, &config.base, &config.work_saw()).unwrap();
//! if let VerificationOutcome::Errors(errors) = outcome {
//!     println!("observed {} distinct proof failures", errors.len());
//! }
//! ```

pub mod bitcode;
pub mod cli;
pub mod config;
pub mod core;
pub mod fuzz;
pub mod process;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testutil;

pub use core::{Error, Result};
pub use verifier::VerificationError;
