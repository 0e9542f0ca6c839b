//! Error types for the bibolamazi core.
//!
//! Two error types live here:
//!
//! - [`BibolamaziError`]: everything the engine itself can report, from filter lookup failures
//!   to remote package problems. Document-level operations wrap these in
//!   [`BibolamaziError::AtLine`] so callers can point at the offending configuration line.
//! - [`FilterError`]: what a filter returns from its processing methods. The engine converts
//!   it into a [`BibolamaziError`] at the per-filter boundary.
//!
//! # Examples
//!
//! ```
//! use bibolamazi::error::BibolamaziError;
//!
//! let err = BibolamaziError::FilterNotFound {
//!   name:    "arxiv".into(),
//!   reasons: vec!["bibolamazi_filters: no module named arxiv".into()],
//! };
//! let located = err.at_line(12);
//! assert_eq!(located.line(), Some(12));
//! ```

use thiserror::Error;

/// Error type alias used for the [`bibolamazi`](crate) crate.
pub type Result<T> = core::result::Result<T, BibolamaziError>;

/// Errors that can occur while configuring or running a bibolamazi document.
#[derive(Error, Debug)]
pub enum BibolamaziError {
  /// No package on the search path provides the requested filter.
  ///
  /// Every candidate that was examined contributes one line to `reasons`, so the user can see
  /// why each package was rejected (absent module, broken module, missing directory, ...).
  #[error("No such filter \"{name}\":\n  {}", .reasons.join("\n  "))]
  FilterNotFound {
    /// The filter name as requested
    name:    String,
    /// One reason per rejected candidate
    reasons: Vec<String>,
  },

  /// An explicitly requested filter package (`pkg:filter` or `package:`) is unavailable.
  #[error("No such filter package \"{name}\":\n  {}", .reasons.join("\n  "))]
  FilterPackageNotFound {
    /// The package name as requested
    name:    String,
    /// One reason per rejected candidate
    reasons: Vec<String>,
  },

  /// A module was found but exposes neither a filter class nor exactly one simple function.
  #[error("\"{name}\" is not a valid filter: {reason}")]
  NotAFilter {
    /// Name of the offending module
    name:   String,
    /// What the module is missing
    reason: String,
  },

  /// A filter's documentation and signature disagree with each other.
  ///
  /// This is a bug for the filter author to fix and is reported as soon as the option
  /// specification is built.
  #[error("Filter \"{filter}\" has an inconsistent specification: {message}")]
  FilterSpecification {
    /// Filter name
    filter:  String,
    /// Description of the mismatch
    message: String,
  },

  /// The option string given to a filter could not be parsed.
  #[error("Invalid options for filter \"{filter}\" near `{fragment}`: {message}")]
  OptionParse {
    /// Filter name
    filter:   String,
    /// The literal offending fragment of the option string
    fragment: String,
    /// What went wrong
    message:  String,
  },

  /// The filter constructor rejected otherwise well-formed arguments.
  #[error("Filter \"{filter}\" construction failed: {kind}: {message}")]
  FilterConstruction {
    /// Filter name
    filter:  String,
    /// Kind of the original failure
    kind:    String,
    /// Original failure description
    message: String,
  },

  /// A filter reported one of its own declared errors while running.
  #[error("Filter \"{filter}\" failed: {message}")]
  FilterFailed {
    /// Filter name
    filter:  String,
    /// Message reported by the filter
    message: String,
  },

  /// A filter failed unexpectedly while running.
  #[error("Internal error in filter \"{filter}\": {message}\n{trace}")]
  InternalFilter {
    /// Filter name
    filter:  String,
    /// Description of the original failure
    message: String,
    /// Captured stack trace
    trace:   String,
  },

  /// The run was interrupted from outside. Never wrapped into another error kind.
  #[error("Interrupted")]
  Interrupted,

  /// The configuration block could not be parsed.
  #[error("Configuration error: {0}")]
  ConfigParse(String),

  /// A source was read successfully but its content is not valid bibliographic data.
  #[error("Failed to parse source \"{source_name}\": {message}")]
  SourceContent {
    /// Source location that was read
    source_name: String,
    /// Parser message
    message:     String,
  },

  /// The declared sources yielded no entry: none could be read, or the ones read were empty.
  #[error("No entries could be read from the declared sources: {}", .0.join(", "))]
  NoSources(Vec<String>),

  /// A remote package location was requested while remote packages are disabled.
  #[error("Remote filter packages are not allowed (requested \"{0}\"); enable them in settings")]
  RemotePackagesDisabled(String),

  /// A remote package could not be fetched or checked.
  #[error("Remote package error for \"{location}\": {message}")]
  RemotePackage {
    /// Location string of the package
    location: String,
    /// What went wrong
    message:  String,
  },

  /// A package location string is malformed or uses an unknown scheme.
  #[error("Invalid package location \"{0}\"")]
  InvalidLocation(String),

  /// The cache was used in a way it does not support.
  #[error("Cache error: {0}")]
  Cache(String),

  /// Wraps another error with the configuration line it originates from.
  #[error("Line {line}: {source}")]
  AtLine {
    /// 1-based line number in the document
    line:   usize,
    /// The original error
    #[source]
    source: Box<BibolamaziError>,
  },

  /// A network request failed.
  #[error(transparent)]
  Network(#[from] reqwest::Error),

  /// A file system operation failed.
  #[error(transparent)]
  Path(#[from] std::io::Error),

  /// JSON (de)serialization failed.
  #[error(transparent)]
  Json(#[from] serde_json::Error),

  /// The settings file is not valid TOML.
  #[error(transparent)]
  TomlDe(#[from] toml::de::Error),

  /// A downloaded archive could not be extracted.
  #[error(transparent)]
  Zip(#[from] zip::result::ZipError),

  /// Anything else.
  #[error("{0}")]
  Config(String),
}

impl BibolamaziError {
  /// Attaches a configuration line number, unless the error already carries one.
  pub fn at_line(self, line: usize) -> Self {
    match self {
      located @ BibolamaziError::AtLine { .. } => located,
      other => BibolamaziError::AtLine { line, source: Box::new(other) },
    }
  }

  /// The configuration line this error was attributed to, if any.
  pub fn line(&self) -> Option<usize> {
    match self {
      BibolamaziError::AtLine { line, .. } => Some(*line),
      _ => None,
    }
  }

  /// The error with any line annotation stripped.
  pub fn root(&self) -> &BibolamaziError {
    match self {
      BibolamaziError::AtLine { source, .. } => source.root(),
      other => other,
    }
  }

  /// Whether this error (or the error it wraps) is an interruption.
  pub fn is_interrupted(&self) -> bool { matches!(self.root(), BibolamaziError::Interrupted) }
}

/// Errors returned by filters from their processing and construction methods.
#[derive(Error, Debug)]
pub enum FilterError {
  /// A failure the filter anticipates and reports deliberately (bad input, unmet condition).
  #[error("{0}")]
  Failed(String),

  /// The filter does not implement the requested processing mode.
  #[error("filter does not support {0} processing")]
  Unsupported(&'static str),

  /// Any unexpected failure; reported as an internal filter error with a trace.
  #[error("{0}")]
  Other(#[from] Box<dyn std::error::Error + Send + Sync>),

  /// Processing was interrupted and must stop immediately.
  #[error("interrupted")]
  Interrupted,
}

impl FilterError {
  /// Shorthand for [`FilterError::Failed`].
  pub fn failed(message: impl Into<String>) -> Self { FilterError::Failed(message.into()) }

  /// Wraps any error as an unexpected failure.
  pub fn other<E>(err: E) -> Self
  where E: std::error::Error + Send + Sync + 'static {
    FilterError::Other(Box::new(err))
  }

  /// A short name for the error kind, used when reporting construction failures.
  pub fn kind(&self) -> &'static str {
    match self {
      FilterError::Failed(_) => "FilterError",
      FilterError::Unsupported(_) => "Unsupported",
      FilterError::Other(_) => "Error",
      FilterError::Interrupted => "Interrupted",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_at_line_keeps_first_annotation() {
    let err = BibolamaziError::ConfigParse("bad".into()).at_line(3).at_line(9);
    assert_eq!(err.line(), Some(3));
    assert!(matches!(err.root(), BibolamaziError::ConfigParse(_)));
  }

  #[test]
  fn test_not_found_lists_every_reason() {
    let err = BibolamaziError::FilterNotFound {
      name:    "nope".into(),
      reasons: vec!["pkg_a: no module named nope".into(), "pkg_b: import failed".into()],
    };
    let text = err.to_string();
    assert!(text.contains("pkg_a: no module named nope"));
    assert!(text.contains("pkg_b: import failed"));
  }

  #[test]
  fn test_interrupted_survives_annotation() {
    assert!(BibolamaziError::Interrupted.at_line(4).is_interrupted());
  }
}
