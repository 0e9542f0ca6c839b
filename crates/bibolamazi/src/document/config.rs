//! The configuration block embedded in a document.
//!
//! A document is free text with one configuration block delimited by sentinel lines. Inside
//! the block, lines are commented out with `%`; the commands are what remains after removing
//! one leading `% ` or `%`:
//!
//! ```text
//! %%%-BIBOLAMAZI-CONFIGURATION-BEGIN-%%%
//! %% This is a comment.
//! % src: refs.json more-refs.json
//! % package: mine=/path/to/filters
//! % filter: strip --fields=note
//! %         --entry-types=article
//! %%%-BIBOLAMAZI-CONFIGURATION-END-%%%
//! ```
//!
//! Everything after the end sentinel is the generated bibliography.

use super::*;

/// First line of the configuration block.
pub const CONFIG_BEGIN: &str = "%%%-BIBOLAMAZI-CONFIGURATION-BEGIN-%%%";

/// Last line of the configuration block.
pub const CONFIG_END: &str = "%%%-BIBOLAMAZI-CONFIGURATION-END-%%%";

/// Kind of a configuration command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
  /// `src:` declares alternative source locations
  Src,
  /// `package:` adds a filter package
  Package,
  /// `filter:` appends a filter to the pipeline
  Filter,
}

impl Display for CommandKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CommandKind::Src => write!(f, "src"),
      CommandKind::Package => write!(f, "package"),
      CommandKind::Filter => write!(f, "filter"),
    }
  }
}

/// One parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
  /// What the command does
  pub kind:       CommandKind,
  /// Arguments, continuation lines joined with newlines
  pub text:       String,
  /// 1-based line of the keyword in the whole file
  pub start_line: usize,
  /// 1-based last line of the command, inclusive
  pub end_line:   usize,
}

/// A document split around its configuration block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentText {
  /// Lines before the begin sentinel
  pub header:       Vec<String>,
  /// Raw lines between the sentinels, still commented
  pub config_lines: Vec<String>,
  /// 1-based line of the first configuration line
  pub config_start: usize,
  /// Everything after the end sentinel line
  pub body:         String,
}

impl DocumentText {
  /// Splits a document. Fails if the block is missing or not terminated.
  pub fn parse(text: &str) -> Result<Self> {
    let lines: Vec<&str> = text.lines().collect();
    let begin = lines
      .iter()
      .position(|l| l.trim_end() == CONFIG_BEGIN)
      .ok_or_else(|| BibolamaziError::ConfigParse("no configuration block found".into()))?;
    let end = lines[begin + 1..].iter().position(|l| l.trim_end() == CONFIG_END).ok_or_else(|| {
      BibolamaziError::ConfigParse("configuration block is not terminated".into()).at_line(begin + 1)
    })? + begin
      + 1;

    Ok(Self {
      header:       lines[..begin].iter().map(|l| l.to_string()).collect(),
      config_lines: lines[begin + 1..end].iter().map(|l| l.to_string()).collect(),
      config_start: begin + 2,
      body:         lines[end + 1..].join("\n"),
    })
  }

  /// The configuration block as stored, between the sentinels.
  pub fn config_text(&self) -> String { self.config_lines.join("\n") }

  /// Renders the document around a new body.
  pub fn render(&self, body: &str) -> String {
    let mut out = String::new();
    for line in &self.header {
      out.push_str(line);
      out.push('\n');
    }
    out.push_str(CONFIG_BEGIN);
    out.push('\n');
    for line in &self.config_lines {
      out.push_str(line);
      out.push('\n');
    }
    out.push_str(CONFIG_END);
    out.push_str("\n\n");
    out.push_str(body.trim_end());
    out.push('\n');
    out
  }
}

lazy_static! {
  static ref COMMAND: Regex = Regex::new(r"^\s?(src|package|filter):\s*(.*)$").expect("valid regex");
}

/// Removes one leading `% ` or `%`.
fn uncomment(line: &str) -> &str {
  line.strip_prefix("% ").or_else(|| line.strip_prefix('%')).unwrap_or(line)
}

/// Parses configuration lines into commands.
///
/// `first_line` is the 1-based line number of `lines[0]` in the whole file. A command runs from
/// its keyword line to the line before the next keyword or blank line. `%%` lines are skipped.
/// Text outside any command is ignored.
pub fn parse_config(lines: &[String], first_line: usize) -> Result<Vec<Command>> {
  let mut commands: Vec<Command> = Vec::new();
  let mut open = false;
  let mut seen_filter = false;

  for (index, raw) in lines.iter().enumerate() {
    let line_number = first_line + index;
    let line = uncomment(raw.trim_end());
    if line.starts_with('%') {
      continue;
    }
    if line.trim().is_empty() {
      open = false;
      continue;
    }

    if let Some(captures) = COMMAND.captures(line) {
      let kind = match &captures[1] {
        "src" => CommandKind::Src,
        "package" => CommandKind::Package,
        _ => CommandKind::Filter,
      };
      match kind {
        CommandKind::Src if seen_filter =>
          return Err(
            BibolamaziError::ConfigParse("`src:` must come before any `filter:`".into()).at_line(line_number),
          ),
        CommandKind::Filter => seen_filter = true,
        _ => {},
      }
      commands.push(Command {
        kind,
        text: captures[2].trim_end().to_string(),
        start_line: line_number,
        end_line: line_number,
      });
      open = true;
    } else if let (true, Some(current)) = (open, commands.last_mut()) {
      if !current.text.is_empty() {
        current.text.push('\n');
      }
      current.text.push_str(line.trim());
      current.end_line = line_number;
    } else {
      trace!(line = line_number, "Ignoring text outside of commands");
    }
  }
  Ok(commands)
}
