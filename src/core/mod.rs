//! Core types shared across the fuzzing pipeline.

mod error;

pub use error::{Error, Result, SubprocessKind};
