//! Filter listing and documentation.

use super::*;

/// Function for the [`Commands::Filters`] in the CLI.
pub async fn filters(env: &mut Environment, options: &FiltersOptions) -> Result<()> {
  let search_path = document_search_path(env, options.document.as_ref()).await?;
  let mut current_package = None;
  for listing in env.registry.list_filters(&search_path) {
    if current_package.as_ref() != Some(&listing.package) {
      println!("{}", style(&listing.package).bold().underlined());
      current_package = Some(listing.package.clone());
    }
    match listing.help {
      Ok(help) => println!("  {:<16} {help}", style(&listing.name).cyan()),
      Err(e) => println!("  {:<16} {} {e}", style(&listing.name).red(), Status::Skipped.marker()),
    }
  }
  Ok(())
}

/// Function for the [`Commands::HelpFilter`] in the CLI.
pub async fn help_filter(env: &mut Environment, options: &HelpFilterOptions) -> Result<()> {
  let search_path = document_search_path(env, options.document.as_ref()).await?;
  let spec = env.registry.resolve(&options.filter, &search_path)?;

  println!("{} {}", style(&spec.name).bold(), style(format!("({})", spec.package)).dim());
  println!();
  let docstring = spec.class.docstring().trim();
  println!("{}", if docstring.is_empty() { spec.help.as_str() } else { docstring });
  for preset in &spec.presets {
    println!("\n{} Preset options: {preset}", Status::Note.marker());
  }
  if spec.default_options {
    println!("\nOptions:");
    print!("{}", spec.option_spec.format_help());
  }
  Ok(())
}
