//! Ordered filter-package search path.
//!
//! A [`SearchPath`] binds filter-package names to the directory they were declared with (or
//! `None` for packages resolved through the [`FilterRegistry`] alone). Lookup walks the path
//! front to back and the first package providing a filter wins.
//!
//! Inserting a name that is already present moves it to the front, so the most recently
//! declared binding always takes precedence:
//!
//! ```
//! use bibolamazi::search_path::SearchPath;
//!
//! let mut path = SearchPath::new();
//! path.prepend("core", None);
//! path.prepend("mine", Some("/tmp/mine".into()));
//! path.prepend("core", None);
//! assert_eq!(path.names().collect::<Vec<_>>(), vec!["core", "mine"]);
//! ```

use std::hash::{Hash, Hasher};

use super::*;

/// One binding of the search path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchPathEntry {
  /// Filter-package name
  pub name: String,
  /// Directory the package lives in, `None` to use the registry's own binding
  pub dir:  Option<PathBuf>,
}

/// Ordered, duplicate-free list of package bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPath {
  /// Bindings, highest precedence first
  entries: Vec<SearchPathEntry>,
}

impl SearchPath {
  /// Creates an empty search path.
  pub fn new() -> Self { Self::default() }

  /// Puts `name` at the front of the path.
  ///
  /// If the name is already present it is moved to the front. Its directory is replaced when
  /// `dir` is `Some`, and kept otherwise.
  pub fn prepend(&mut self, name: impl Into<String>, dir: Option<PathBuf>) {
    let name = name.into();
    let dir = match self.entries.iter().position(|e| e.name == name) {
      Some(index) => {
        let previous = self.entries.remove(index);
        dir.or(previous.dir)
      },
      None => dir,
    };
    self.entries.insert(0, SearchPathEntry { name, dir });
  }

  /// Adds `name` at the end of the path, unless it is already present.
  pub fn append(&mut self, name: impl Into<String>, dir: Option<PathBuf>) {
    let name = name.into();
    if !self.contains(&name) {
      self.entries.push(SearchPathEntry { name, dir });
    }
  }

  /// Removes a binding, returning it if it was present.
  pub fn remove(&mut self, name: &str) -> Option<SearchPathEntry> {
    let index = self.entries.iter().position(|e| e.name == name)?;
    Some(self.entries.remove(index))
  }

  /// Whether a package with this name is bound.
  pub fn contains(&self, name: &str) -> bool { self.entries.iter().any(|e| e.name == name) }

  /// The binding for `name`, if any.
  pub fn get(&self, name: &str) -> Option<&SearchPathEntry> {
    self.entries.iter().find(|e| e.name == name)
  }

  /// Iterates the bindings in precedence order.
  pub fn iter(&self) -> impl Iterator<Item = &SearchPathEntry> { self.entries.iter() }

  /// Iterates the package names in precedence order.
  pub fn names(&self) -> impl Iterator<Item = &str> { self.entries.iter().map(|e| e.name.as_str()) }

  /// Number of bindings.
  pub fn len(&self) -> usize { self.entries.len() }

  /// Whether the path is empty.
  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  /// This path followed by every binding of `fallback` not already present.
  pub fn chain(&self, fallback: &SearchPath) -> SearchPath {
    let mut joined = self.clone();
    for entry in fallback.iter() {
      joined.append(entry.name.clone(), entry.dir.clone());
    }
    joined
  }

  /// A stable fingerprint of the bindings, used to key resolution caches.
  pub fn identity(&self) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    self.entries.hash(&mut hasher);
    hasher.finish()
  }
}

impl<'a> IntoIterator for &'a SearchPath {
  type IntoIter = std::slice::Iter<'a, SearchPathEntry>;
  type Item = &'a SearchPathEntry;

  fn into_iter(self) -> Self::IntoIter { self.entries.iter() }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_prepend_moves_existing_to_front() {
    let mut path = SearchPath::new();
    path.prepend("a", Some(PathBuf::from("/a")));
    path.prepend("b", None);
    path.prepend("c", None);
    path.prepend("a", None);

    assert_eq!(path.names().collect::<Vec<_>>(), vec!["a", "c", "b"]);
    // value kept when not replaced
    assert_eq!(path.get("a").unwrap().dir, Some(PathBuf::from("/a")));

    path.prepend("b", Some(PathBuf::from("/b2")));
    assert_eq!(path.names().next(), Some("b"));
    assert_eq!(path.get("b").unwrap().dir, Some(PathBuf::from("/b2")));
  }

  #[test]
  fn test_no_duplicates_after_arbitrary_insertions() {
    let names = ["x", "y", "x", "z", "y", "y", "w", "x", "z"];
    let mut path = SearchPath::new();
    for (i, name) in names.iter().enumerate() {
      if i % 2 == 0 {
        path.prepend(*name, None);
      } else {
        path.append(*name, None);
      }
    }
    let collected: Vec<_> = path.names().collect();
    let unique: HashSet<_> = collected.iter().collect();
    assert_eq!(collected.len(), unique.len());
    assert_eq!(path.len(), 4);
  }

  #[test]
  fn test_chain_keeps_local_precedence() {
    let mut local = SearchPath::new();
    local.prepend("mine", Some(PathBuf::from("/mine")));
    local.prepend("core", Some(PathBuf::from("/override")));

    let mut global = SearchPath::new();
    global.append("core", None);
    global.append("extra", None);

    let joined = local.chain(&global);
    assert_eq!(joined.names().collect::<Vec<_>>(), vec!["core", "mine", "extra"]);
    assert_eq!(joined.get("core").unwrap().dir, Some(PathBuf::from("/override")));
  }

  #[test]
  fn test_identity_tracks_content() {
    let mut a = SearchPath::new();
    a.append("p", None);
    let mut b = SearchPath::new();
    b.append("p", None);
    assert_eq!(a.identity(), b.identity());
    b.prepend("q", None);
    assert_ne!(a.identity(), b.identity());
  }
}
