//! Bibliography preprocessing core.
//!
//! `bibolamazi` reads a configuration block embedded in a bibliography file, resolves the
//! filters it names, runs them over the collected bibliographic entries and writes the result
//! back. This crate contains the engine behind that loop:
//!
//! - Filter discovery and instantiation over an ordered, extensible search path
//! - Option-string parsing driven by each filter's declared signature
//! - A persistent, self-validating cache shared by filters across runs
//! - Remote filter packages, fetched on demand and cached on disk
//! - The [`Document`](document::Document) orchestrating all of the above
//!
//! # Getting Started
//!
//! ```no_run
//! use bibolamazi::{document::Document, environment::Environment, prelude::*};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BibolamaziError> {
//!   let mut env = Environment::builder().build()?;
//!
//!   let mut doc = Document::open("references.bibolamazi.json", &mut env).await?;
//!   doc.run()?;
//!   doc.save()?;
//!   Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`search_path`]: Ordered package-name to directory bindings
//! - [`filter`]: Filter traits, the registry/factory and option handling
//! - [`cache`]: Token checkers, the arena-backed cache tree and accessors
//! - [`package`]: Local and remote filter package resolution
//! - [`document`]: Configuration parsing, source merging and filter execution
//! - [`bibliography`]: Entry model and bibliography formats
//! - [`environment`]: User settings and the injected runtime context

#![warn(missing_docs, clippy::missing_docs_in_private_items)]

use std::{
  collections::{BTreeMap, HashMap, HashSet},
  fmt::{self, Debug, Display},
  path::{Path, PathBuf},
  sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, trace, warn};
#[cfg(test)]
use {tempfile::tempdir, tracing_test::traced_test};

pub mod bibliography;
pub mod cache;
pub mod document;
pub mod environment;
pub mod error;
pub mod filter;
pub mod package;
pub mod search_path;

use crate::{
  bibliography::*,
  cache::*,
  document::*,
  environment::*,
  error::*,
  filter::*,
  package::*,
  search_path::*,
};

/// Common traits and types for ergonomic imports.
///
/// ```no_run
/// use bibolamazi::prelude::*;
///
/// fn example(entry: &mut Entry) -> Result<(), FilterError> {
///   entry.set_field("note", "checked");
///   Ok(())
/// }
/// ```
pub mod prelude {
  pub use crate::{
    bibliography::{Bibliography, Entry},
    cache::CacheHandle,
    error::{BibolamaziError, FilterError},
    filter::{Filter, FilterAction, FilterClass, FilterPackage},
  };
}
