//! Errors of the command line front-end.

use thiserror::Error;

use super::*;

/// Error type alias used for the CLI.
pub type Result<T> = core::result::Result<T, CliError>;

/// Everything the CLI can fail with.
#[derive(Error, Debug)]
pub enum CliError {
  /// An error from the bibolamazi core.
  #[error(transparent)]
  Bibolamazi(#[from] BibolamaziError),

  /// Writing to the terminal failed.
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl CliError {
  /// Process exit code: 130 for interruptions, 1 otherwise.
  pub fn exit_code(&self) -> i32 {
    match self {
      CliError::Bibolamazi(e) if e.is_interrupted() => 130,
      _ => 1,
    }
  }
}
