use clap::{Args, Subcommand};

use super::*;

pub mod filters;
pub mod run;

pub use filters::{filters, help_filter};
pub use run::{check, run};

/// Available commands for the CLI
#[derive(Subcommand, Clone)]
pub enum Commands {
  /// Run the filters of a document and write the result back
  Run(RunOptions),

  /// Parse a document and resolve its filters without running them
  Check(DocumentOptions),

  /// List the filters available to a document, or globally
  Filters(FiltersOptions),

  /// Show the documentation and options of a filter
  HelpFilter(HelpFilterOptions),
}

/// Options of [`Commands::Run`]
#[derive(Args, Clone)]
pub struct RunOptions {
  /// The document to process
  pub document: PathBuf,

  /// Print the result instead of writing it back
  #[arg(long)]
  pub stdout: bool,
}

/// Options of [`Commands::Check`]
#[derive(Args, Clone)]
pub struct DocumentOptions {
  /// The document to check
  pub document: PathBuf,
}

/// Options of [`Commands::Filters`]
#[derive(Args, Clone)]
pub struct FiltersOptions {
  /// Also include the packages declared by this document
  #[arg(long)]
  pub document: Option<PathBuf>,
}

/// Options of [`Commands::HelpFilter`]
#[derive(Args, Clone)]
pub struct HelpFilterOptions {
  /// Filter name, optionally qualified as `package:filter`
  pub filter: String,

  /// Also search the packages declared by this document
  #[arg(long)]
  pub document: Option<PathBuf>,
}

/// The search path of a document, or an empty one.
async fn document_search_path(env: &mut Environment, document: Option<&PathBuf>) -> Result<SearchPath> {
  match document {
    Some(path) => Ok(Document::open(path, env).await?.search_path().clone()),
    None => Ok(SearchPath::new()),
  }
}
