//! Error types for the sawfuzz library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using sawfuzz's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// How a child process failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubprocessKind {
    /// Nonzero exit status (negated signal number on signal death).
    Exit(i32),
    /// The child exceeded its deadline and was killed.
    Timeout,
}

impl std::fmt::Display for SubprocessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exit(code) => write!(f, "exit code {code}"),
            Self::Timeout => write!(f, "timed out"),
        }
    }
}

/// Errors that can occur while driving the fuzzing pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A child process exited abnormally or timed out.
    #[error("Failed to execute {cmd}: {kind}")]
    Subprocess { cmd: String, kind: SubprocessKind },

    /// A verifier transcript did not match any known error shape.
    #[error("Transcript error in {path}: {message}")]
    Transcript { path: PathBuf, message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Seed corpus error.
    #[error("Corpus error: {0}")]
    Corpus(String),

    /// Scheduler error.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Create a new subprocess error.
    pub fn subprocess(cmd: impl Into<String>, kind: SubprocessKind) -> Self {
        Self::Subprocess {
            cmd: cmd.into(),
            kind,
        }
    }

    /// Create a new transcript error.
    pub fn transcript(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Transcript {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a new corpus error.
    pub fn corpus(message: impl Into<String>) -> Self {
        Self::Corpus(message.into())
    }

    /// Create a new scheduler error.
    pub fn scheduler(message: impl Into<String>) -> Self {
        Self::Scheduler(message.into())
    }
}
