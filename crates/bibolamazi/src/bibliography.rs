//! Bibliographic entries and the formats they are read from and written to.
//!
//! The engine treats entries as opaque bags of fields: a citation key, an entry type and a map
//! of field names to string values. Parsing and serializing concrete formats happens behind
//! the [`BibFormat`] trait; the crate ships a JSON format so that documents round-trip without
//! any external parser.

use std::collections::btree_map;

use super::*;

/// Entry type used when a source does not declare one.
pub const DEFAULT_ENTRY_TYPE: &str = "misc";

/// Field name carrying the entry type in the JSON format.
pub const ENTRY_TYPE_FIELD: &str = "ENTRYTYPE";

/// Suffix inserted between a colliding key and its counter when sources are merged.
pub const CONFLICT_KEY_SUFFIX: &str = ".conflictkey.";

/// A single bibliographic record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
  /// Citation key
  pub key:        String,
  /// Entry type such as `article` or `book`
  pub entry_type: String,
  /// Field values by field name
  pub fields:     BTreeMap<String, String>,
}

impl Entry {
  /// Creates an entry without fields.
  pub fn new(key: impl Into<String>, entry_type: impl Into<String>) -> Self {
    Self { key: key.into(), entry_type: entry_type.into(), fields: BTreeMap::new() }
  }

  /// Builder-style field setter.
  pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.set_field(name, value);
    self
  }

  /// Value of a field, if present.
  pub fn field(&self, name: &str) -> Option<&str> { self.fields.get(name).map(String::as_str) }

  /// Sets a field, returning the previous value.
  pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
    self.fields.insert(name.into(), value.into())
  }

  /// Removes a field, returning its value.
  pub fn remove_field(&mut self, name: &str) -> Option<String> { self.fields.remove(name) }
}

/// The in-memory collection of entries a document operates on, keyed by citation key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bibliography {
  /// Entries by key
  entries: BTreeMap<String, Entry>,
}

impl Bibliography {
  /// Creates an empty bibliography.
  pub fn new() -> Self { Self::default() }

  /// Number of entries.
  pub fn len(&self) -> usize { self.entries.len() }

  /// Whether there are no entries.
  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  /// Entry by key.
  pub fn get(&self, key: &str) -> Option<&Entry> { self.entries.get(key) }

  /// Mutable entry by key.
  pub fn get_mut(&mut self, key: &str) -> Option<&mut Entry> { self.entries.get_mut(key) }

  /// Whether an entry with this key exists.
  pub fn contains_key(&self, key: &str) -> bool { self.entries.contains_key(key) }

  /// Inserts an entry under its own key, replacing any entry with the same key.
  pub fn insert(&mut self, entry: Entry) -> Option<Entry> {
    self.entries.insert(entry.key.clone(), entry)
  }

  /// Removes an entry by key.
  pub fn remove(&mut self, key: &str) -> Option<Entry> { self.entries.remove(key) }

  /// Keeps only the entries for which `keep` returns true.
  pub fn retain(&mut self, mut keep: impl FnMut(&Entry) -> bool) {
    self.entries.retain(|_, entry| keep(entry));
  }

  /// Iterates the entries in key order.
  pub fn iter(&self) -> btree_map::Values<'_, String, Entry> { self.entries.values() }

  /// Iterates the entries mutably in key order.
  ///
  /// Keys must not be changed through this iterator; re-insert the entry instead.
  pub fn iter_mut(&mut self) -> btree_map::ValuesMut<'_, String, Entry> {
    self.entries.values_mut()
  }

  /// Iterates the citation keys in order.
  pub fn keys(&self) -> impl Iterator<Item = &str> { self.entries.keys().map(String::as_str) }

  /// Inserts an entry, renaming its key if it collides with an existing one.
  ///
  /// The first entry with a given key keeps it. Later ones become `key.conflictkey.1`,
  /// `key.conflictkey.2`, ... using the first free counter. Returns the key the entry was
  /// stored under and whether it had to be renamed.
  pub fn insert_renaming(&mut self, mut entry: Entry) -> (String, bool) {
    if !self.entries.contains_key(&entry.key) {
      let key = entry.key.clone();
      self.entries.insert(key.clone(), entry);
      return (key, false);
    }

    let mut counter = 1usize;
    let new_key = loop {
      let candidate = format!("{}{}{}", entry.key, CONFLICT_KEY_SUFFIX, counter);
      if !self.entries.contains_key(&candidate) {
        break candidate;
      }
      counter += 1;
    };
    trace!(original = %entry.key, renamed = %new_key, "Renaming conflicting entry key");
    entry.key = new_key.clone();
    self.entries.insert(new_key.clone(), entry);
    (new_key, true)
  }
}

impl FromIterator<Entry> for Bibliography {
  fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
    let mut bibliography = Bibliography::new();
    for entry in iter {
      bibliography.insert(entry);
    }
    bibliography
  }
}

/// A bibliography file format.
///
/// Implementations parse the text of a source into entries and serialize a bibliography back
/// into text. Failing to parse is reported as a plain message; the document attaches the
/// source location.
pub trait BibFormat: Send + Sync {
  /// Short name of the format.
  fn name(&self) -> &str;

  /// File extensions (without the dot) handled by this format.
  fn extensions(&self) -> &[&str];

  /// Parses source text into entries, in source order.
  fn parse(&self, text: &str) -> std::result::Result<Vec<Entry>, String>;

  /// Serializes a bibliography.
  fn serialize(&self, bibliography: &Bibliography) -> String;
}

/// JSON bibliography format.
///
/// A source is one object mapping citation keys to objects of string fields. The entry type is
/// carried by the optional `ENTRYTYPE` field:
///
/// ```json
/// { "knuth84": { "ENTRYTYPE": "book", "title": "The TeXbook" } }
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormat;

impl BibFormat for JsonFormat {
  fn name(&self) -> &str { "json" }

  fn extensions(&self) -> &[&str] { &["json"] }

  fn parse(&self, text: &str) -> std::result::Result<Vec<Entry>, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let Value::Object(map) = value else {
      return Err("expected a JSON object mapping keys to entries".to_string());
    };

    let mut entries = Vec::with_capacity(map.len());
    for (key, raw) in map {
      let Value::Object(fields) = raw else {
        return Err(format!("entry \"{key}\" is not an object"));
      };
      let mut entry = Entry::new(key.clone(), DEFAULT_ENTRY_TYPE);
      for (name, value) in fields {
        let text = match value {
          Value::String(s) => s,
          Value::Number(n) => n.to_string(),
          Value::Bool(b) => b.to_string(),
          other => return Err(format!("field \"{name}\" of entry \"{key}\" is not a string: {other}")),
        };
        if name == ENTRY_TYPE_FIELD {
          entry.entry_type = text;
        } else {
          entry.fields.insert(name, text);
        }
      }
      entries.push(entry);
    }
    Ok(entries)
  }

  fn serialize(&self, bibliography: &Bibliography) -> String {
    let mut map = serde_json::Map::new();
    for entry in bibliography.iter() {
      let mut fields = serde_json::Map::new();
      fields.insert(ENTRY_TYPE_FIELD.to_string(), Value::String(entry.entry_type.clone()));
      for (name, value) in &entry.fields {
        fields.insert(name.clone(), Value::String(value.clone()));
      }
      map.insert(entry.key.clone(), Value::Object(fields));
    }
    // serializing a map of strings cannot fail
    serde_json::to_string_pretty(&Value::Object(map)).unwrap_or_default()
  }
}

/// Known bibliography formats, looked up by file extension.
#[derive(Clone)]
pub struct FormatRegistry {
  /// Registered formats
  formats: Vec<Arc<dyn BibFormat>>,
  /// Format used when no extension matches
  default: Arc<dyn BibFormat>,
}

impl FormatRegistry {
  /// A registry that only knows the JSON format.
  pub fn new() -> Self {
    let json: Arc<dyn BibFormat> = Arc::new(JsonFormat);
    Self { formats: vec![json.clone()], default: json }
  }

  /// Registers a format. Later registrations win for shared extensions.
  pub fn register(&mut self, format: Arc<dyn BibFormat>) { self.formats.insert(0, format); }

  /// The format for a path, falling back to the default format.
  pub fn for_path(&self, path: &str) -> Arc<dyn BibFormat> {
    let extension = Path::new(path)
      .extension()
      .and_then(|e| e.to_str())
      .map(|e| e.to_ascii_lowercase())
      .unwrap_or_default();
    self
      .formats
      .iter()
      .find(|f| f.extensions().iter().any(|e| *e == extension))
      .cloned()
      .unwrap_or_else(|| self.default.clone())
  }

  /// The default format, used for document bodies.
  pub fn default_format(&self) -> Arc<dyn BibFormat> { self.default.clone() }
}

impl Default for FormatRegistry {
  fn default() -> Self { Self::new() }
}

impl Debug for FormatRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FormatRegistry")
      .field("formats", &self.formats.iter().map(|f| f.name().to_string()).collect::<Vec<_>>())
      .finish()
  }
}
