//! Reading and merging bibliography sources.

use super::*;

/// The alternatives of one `src:` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceList {
  /// Locations in order of preference, local paths or HTTP(S) URLs
  pub alternatives: Vec<String>,
  /// Line of the `src:` command
  pub line:         usize,
  /// The alternative that was read, once sources are loaded
  pub used:         Option<String>,
}

impl SourceList {
  /// Parses the arguments of a `src:` command, honoring shell quoting.
  pub fn parse(text: &str, line: usize) -> Result<Self> {
    let alternatives = shlex::split(text)
      .ok_or_else(|| BibolamaziError::ConfigParse(format!("unbalanced quotes in `src: {text}`")))?;
    if alternatives.is_empty() {
      return Err(BibolamaziError::ConfigParse("`src:` needs at least one location".into()));
    }
    Ok(Self { alternatives, line, used: None })
  }
}

/// Whether a location is fetched over the network.
fn is_url(location: &str) -> bool { location.starts_with("http://") || location.starts_with("https://") }

/// Reads the raw bytes of a source, relative paths resolved against `base_dir`.
pub async fn read_source(location: &str, base_dir: &Path) -> Result<Vec<u8>> {
  if is_url(location) {
    let response = reqwest::get(location).await?;
    if !response.status().is_success() {
      return Err(BibolamaziError::Config(format!("HTTP {}", response.status())));
    }
    return Ok(response.bytes().await?.to_vec());
  }
  let path = base_dir.join(location);
  Ok(tokio::fs::read(&path).await?)
}

/// Decodes source bytes as UTF-8, falling back to Latin-1.
pub fn decode(bytes: Vec<u8>) -> String {
  match String::from_utf8(bytes) {
    Ok(text) => text,
    Err(e) => {
      trace!("Source is not UTF-8, decoding as Latin-1");
      e.into_bytes().iter().map(|&b| b as char).collect()
    },
  }
}

/// Outcome of merging sources.
#[derive(Debug, Default)]
pub struct MergedSources {
  /// All entries
  pub bibliography: Bibliography,
  /// Entries that had to be renamed
  pub conflicts:    usize,
}

/// Reads the first readable alternative of every list and merges the entries.
///
/// Unreadable alternatives are skipped. A list with no readable alternative only produces a
/// warning, unless the lists yield no entry at all. Content that fails to parse is an error
/// attributed to the list's line.
#[instrument(skip_all, level = "debug")]
pub async fn load_sources(
  lists: &mut [SourceList],
  base_dir: &Path,
  formats: &FormatRegistry,
) -> Result<MergedSources> {
  let mut merged = MergedSources::default();
  let mut tried = Vec::new();

  for list in lists.iter_mut() {
    list.used = None;
    for location in &list.alternatives {
      let bytes = match read_source(location, base_dir).await {
        Ok(bytes) => bytes,
        Err(e) => {
          info!(source = %location, error = %e, "Source alternative not readable");
          tried.push(location.clone());
          continue;
        },
      };
      let text = decode(bytes);
      let entries = formats.for_path(location).parse(&text).map_err(|message| {
        BibolamaziError::SourceContent { source_name: location.clone(), message }.at_line(list.line)
      })?;
      debug!(source = %location, entries = entries.len(), "Read source");
      if entries.is_empty() {
        tried.push(location.clone());
      }
      for entry in entries {
        let (_, renamed) = merged.bibliography.insert_renaming(entry);
        if renamed {
          merged.conflicts += 1;
        }
      }
      list.used = Some(location.clone());
      break;
    }
    if list.used.is_none() {
      warn!(line = list.line, alternatives = ?list.alternatives, "No source alternative could be read");
    }
  }

  if !lists.is_empty() && merged.bibliography.is_empty() {
    return Err(BibolamaziError::NoSources(tried));
  }
  if merged.conflicts > 0 {
    info!(
      conflicts = merged.conflicts,
      "Renamed entries with conflicting keys (look for \"{}\")",
      CONFLICT_KEY_SUFFIX
    );
  }
  Ok(merged)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_source_list() {
    let list = SourceList::parse("a.json 'with space.json'", 4).unwrap();
    assert_eq!(list.alternatives, vec!["a.json", "with space.json"]);
    assert!(SourceList::parse("   ", 4).is_err());
  }

  #[test]
  fn test_latin1_fallback() {
    assert_eq!(decode("caf\u{e9}".as_bytes().to_vec()), "café");
    assert_eq!(decode(vec![b'c', b'a', b'f', 0xe9]), "café");
  }

  #[traced_test]
  #[tokio::test]
  async fn test_first_readable_alternative_wins() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("second.json"), r#"{"k": {"title": "two"}}"#).unwrap();
    std::fs::write(dir.path().join("third.json"), r#"{"k": {"title": "three"}}"#).unwrap();
    let mut lists = vec![SourceList::parse("first.json second.json third.json", 1).unwrap()];

    let merged = load_sources(&mut lists, dir.path(), &FormatRegistry::new()).await.unwrap();
    assert_eq!(lists[0].used.as_deref(), Some("second.json"));
    assert_eq!(merged.bibliography.get("k").unwrap().field("title"), Some("two"));
    assert!(logs_contain("Source alternative not readable"));
  }

  #[traced_test]
  #[tokio::test]
  async fn test_unreadable_lists() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("ok.json"), r#"{"a": {}}"#).unwrap();
    let mut lists =
      vec![SourceList::parse("missing.json", 1).unwrap(), SourceList::parse("ok.json", 2).unwrap()];
    let merged = load_sources(&mut lists, dir.path(), &FormatRegistry::new()).await.unwrap();
    assert_eq!(merged.bibliography.len(), 1);
    assert!(logs_contain("No source alternative could be read"));

    let mut none = vec![SourceList::parse("missing.json gone.json", 1).unwrap()];
    let err = load_sources(&mut none, dir.path(), &FormatRegistry::new()).await.unwrap_err();
    assert!(matches!(err, BibolamaziError::NoSources(ref tried) if tried.len() == 2));
  }

  #[tokio::test]
  async fn test_sources_without_entries_count_as_missing() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("empty.json"), "{}").unwrap();
    let mut lists = vec![SourceList::parse("missing.json empty.json", 1).unwrap()];
    let err = load_sources(&mut lists, dir.path(), &FormatRegistry::new()).await.unwrap_err();
    match err {
      BibolamaziError::NoSources(tried) => assert_eq!(tried, vec!["missing.json", "empty.json"]),
      other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(lists[0].used.as_deref(), Some("empty.json"));

    // an empty source next to a productive one is fine
    std::fs::write(dir.path().join("full.json"), r#"{"a": {}}"#).unwrap();
    let mut lists = vec![SourceList::parse("empty.json", 1).unwrap(), SourceList::parse("full.json", 2).unwrap()];
    let merged = load_sources(&mut lists, dir.path(), &FormatRegistry::new()).await.unwrap();
    assert_eq!(merged.bibliography.len(), 1);

    // no `src:` at all is not an error
    assert!(load_sources(&mut [], dir.path(), &FormatRegistry::new()).await.is_ok());
  }

  #[tokio::test]
  async fn test_malformed_content_is_fatal() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("bad.json"), "{ nope").unwrap();
    std::fs::write(dir.path().join("good.json"), "{}").unwrap();
    let mut lists = vec![SourceList::parse("bad.json good.json", 7).unwrap()];
    let err = load_sources(&mut lists, dir.path(), &FormatRegistry::new()).await.unwrap_err();
    assert_eq!(err.line(), Some(7));
    assert!(matches!(err.root(), BibolamaziError::SourceContent { .. }));
  }
}
