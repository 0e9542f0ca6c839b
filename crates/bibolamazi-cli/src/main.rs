//! Command line front-end for the bibolamazi bibliography preprocessor.
//!
//! # Usage
//!
//! ```bash
//! # Run the filters of a document and write the result back
//! bibolamazi run references.bibolamazi.json
//!
//! # Only check that the configuration is valid
//! bibolamazi check references.bibolamazi.json
//!
//! # List the available filters, and show the options of one
//! bibolamazi filters
//! bibolamazi help-filter strip
//! ```
//!
//! Engine logs go to stderr. Each `-v` shows one more level below warnings, and `RUST_LOG`
//! directives are applied on top (for example `RUST_LOG=bibolamazi::cache=trace`).

#![warn(missing_docs, clippy::missing_docs_in_private_items)]

use std::path::PathBuf;

use bibolamazi::{
  document::Document,
  environment::{Environment, Settings},
  filter::InterruptHandle,
  prelude::*,
  search_path::SearchPath,
};
use clap::{builder::ArgAction, Parser};
use console::{style, StyledObject};
use tracing::{debug, trace};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

pub mod commands;
pub mod error;

use crate::{commands::*, error::*};

/// Kind of a status line printed by the commands.
#[derive(Debug, Clone, Copy)]
pub enum Status {
  /// Progress or detail
  Note,
  /// The command achieved its goal
  Done,
  /// Something was skipped but the command goes on
  Skipped,
  /// The command failed
  Failed,
}

impl Status {
  /// Coloured marker opening a line of this kind.
  pub fn marker(self) -> StyledObject<&'static str> {
    match self {
      Status::Note => style("•").cyan(),
      Status::Done => style("✓").green(),
      Status::Skipped => style("!").yellow().bold(),
      Status::Failed => style("✗").red().bold(),
    }
  }
}

/// Command line interface configuration and argument parsing
#[derive(Parser)]
#[command(author, version, about = "Bibliography preprocessor driven by an embedded filter pipeline")]
pub struct Cli {
  /// Show engine logs below warnings: `-v` info, `-vv` debug, `-vvv` trace
  #[arg(short, long, action = ArgAction::Count, global = true)]
  verbose: u8,

  /// Settings file to use instead of the default one
  #[arg(long, global = true)]
  settings: Option<PathBuf>,

  /// Allow remote filter packages for this invocation, whatever the settings say
  #[arg(long, global = true)]
  allow_remote: bool,

  /// The subcommand to execute
  #[command(subcommand)]
  command: Commands,
}

/// Sends engine logs to stderr, `RUST_LOG` directives refining the `-v` level.
fn setup_logging(verbosity: u8) {
  let levels = [LevelFilter::WARN, LevelFilter::INFO, LevelFilter::DEBUG];
  let level = levels.get(usize::from(verbosity)).copied().unwrap_or(LevelFilter::TRACE);
  let filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

  // module paths only help once debugging
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(level >= LevelFilter::DEBUG)
    .without_time()
    .with_writer(std::io::stderr)
    .init();
}

/// Builds the environment from the settings file and the command line overrides.
fn environment(cli: &Cli) -> Result<Environment> {
  let path = cli.settings.clone().unwrap_or_else(Settings::default_path);
  let mut settings = Settings::load(&path)?;
  if cli.allow_remote {
    settings.allow_remote_packages = true;
  }
  debug!(path = %path.display(), "Loaded settings");
  Ok(Environment::builder().settings(settings).build()?)
}

/// Sets the interruption flag when Ctrl-C is pressed.
fn watch_interrupts(interrupt: InterruptHandle) {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      trace!("Received Ctrl-C");
      interrupt.interrupt();
    }
  });
}

/// Entry point for the bibolamazi CLI application
#[tokio::main]
async fn main() {
  let cli = Cli::parse();
  setup_logging(cli.verbose);

  let result = match environment(&cli) {
    Ok(mut env) => {
      watch_interrupts(env.interrupt.clone());
      match &cli.command {
        Commands::Run(options) => run(&mut env, options).await,
        Commands::Check(options) => check(&mut env, options).await,
        Commands::Filters(options) => filters(&mut env, options).await,
        Commands::HelpFilter(options) => help_filter(&mut env, options).await,
      }
    },
    Err(e) => Err(e),
  };

  if let Err(e) = result {
    eprintln!("{} {e}", Status::Failed.marker());
    std::process::exit(e.exit_code());
  }
}
