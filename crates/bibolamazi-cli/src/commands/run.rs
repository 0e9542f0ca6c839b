//! Processing and checking documents.

use super::*;

/// Function for the [`Commands::Run`] in the CLI.
pub async fn run(env: &mut Environment, options: &RunOptions) -> Result<()> {
  let mut document = Document::open(&options.document, env).await?;
  println!(
    "{} Loaded {} entries from {} source(s)",
    Status::Note.marker(),
    style(document.bibliography().len()).bold(),
    document.sources().iter().filter(|s| s.used.is_some()).count()
  );
  for source in document.sources().iter().filter(|s| s.used.is_none()) {
    println!(
      "{} None of {} could be read (line {})",
      Status::Skipped.marker(),
      source.alternatives.join(", "),
      source.line
    );
  }

  document.run()?;

  if options.stdout {
    print!("{}", document.render());
    return Ok(());
  }
  document.save()?;
  println!(
    "{} Wrote {}",
    Status::Done.marker(),
    style(document.path().display()).yellow()
  );
  Ok(())
}

/// Function for the [`Commands::Check`] in the CLI.
pub async fn check(env: &mut Environment, options: &DocumentOptions) -> Result<()> {
  let document = Document::open(&options.document, env).await?;
  for filter in document.filters() {
    println!(
      "{} {} {} {}",
      Status::Note.marker(),
      style(&filter.name).bold(),
      style(format!("({})", filter.package)).dim(),
      filter.options
    );
  }
  println!(
    "{} Configuration is valid: {} filter(s), {} entries",
    Status::Done.marker(),
    document.filters().count(),
    document.bibliography().len()
  );
  Ok(())
}
