//! Named views into the root cache, one per feature.
//!
//! Filters do not touch the [`RootCache`] directly. Instead they declare the sub-caches they
//! need by name ([`CacheAccessorSpec`]); the document creates one [`CacheAccessor`] per name,
//! initializes it before the first filter runs and hands filters a [`Caches`] view through
//! which they open [`CacheHandle`]s.

use super::*;

/// Validation policy of a named sub-cache.
#[derive(Debug, Clone)]
pub enum CachePolicy {
  /// Entries never expire.
  Plain,
  /// Entries expire after the configured cache lifetime.
  Expiring,
  /// Entries keyed by citation key are dropped when these fields of the entry change.
  EntryFields(Vec<String>),
  /// Any other checker.
  Custom(Arc<dyn TokenChecker>),
}

/// Declaration of a named sub-cache a filter wants access to.
#[derive(Debug, Clone)]
pub struct CacheAccessorSpec {
  /// Top-level key in the root cache
  pub name:   String,
  /// How entries are validated
  pub policy: CachePolicy,
}

impl CacheAccessorSpec {
  /// A sub-cache without expiry.
  pub fn plain(name: impl Into<String>) -> Self {
    Self { name: name.into(), policy: CachePolicy::Plain }
  }

  /// A sub-cache whose entries expire.
  pub fn expiring(name: impl Into<String>) -> Self {
    Self { name: name.into(), policy: CachePolicy::Expiring }
  }

  /// A sub-cache tied to the given fields of bibliography entries.
  pub fn entry_fields(name: impl Into<String>, fields: &[&str]) -> Self {
    Self {
      name:   name.into(),
      policy: CachePolicy::EntryFields(fields.iter().map(|f| f.to_string()).collect()),
    }
  }
}

/// Owner of one named sub-cache for the duration of a run.
#[derive(Debug)]
pub struct CacheAccessor {
  /// What this accessor manages
  spec: CacheAccessorSpec,
  /// The sub-cache dictionary, once initialized
  node: Option<NodeId>,
}

impl CacheAccessor {
  /// Creates an uninitialized accessor.
  pub fn new(spec: CacheAccessorSpec) -> Self { Self { spec, node: None } }

  /// Name of the sub-cache.
  pub fn name(&self) -> &str { &self.spec.name }

  /// The declaration this accessor was created from.
  pub fn spec(&self) -> &CacheAccessorSpec { &self.spec }

  /// Whether [`CacheAccessor::initialize`] already ran.
  pub fn is_initialized(&self) -> bool { self.node.is_some() }

  /// Binds the accessor to its sub-cache and validates it. Calling it again does nothing.
  ///
  /// The top-level entry is first checked against the root policy (so a version change drops
  /// it), then the sub-cache gets this accessor's policy installed and is validated.
  #[instrument(skip(self, cache, bibliography), fields(name = %self.spec.name), level = "debug")]
  pub fn initialize(&mut self, cache: &mut RootCache, bibliography: &Bibliography) -> Result<NodeId> {
    if let Some(node) = self.node {
      return Ok(node);
    }
    let root = cache.root();
    cache.validate_key(root, &self.spec.name)?;
    let node = cache.child(root, &self.spec.name)?;

    let checker: Option<Arc<dyn TokenChecker>> = match &self.spec.policy {
      CachePolicy::Plain => None,
      CachePolicy::Expiring => Some(cache.expiry_checker()),
      CachePolicy::EntryFields(fields) =>
        Some(Arc::new(EntryFieldsTokenChecker::new(bibliography, fields))),
      CachePolicy::Custom(checker) => Some(checker.clone()),
    };
    cache.set_validation(node, checker, true)?;
    debug!(entries = cache.len(node)?, "Initialized cache accessor");

    self.node = Some(node);
    Ok(node)
  }

  /// The sub-cache dictionary. Fails if the accessor was never initialized.
  pub fn cache_dic(&self) -> Result<NodeId> {
    self.node.ok_or_else(|| {
      BibolamaziError::Cache(format!("cache accessor \"{}\" used before initialization", self.spec.name))
    })
  }
}

/// The set of initialized sub-caches, as seen by a running filter.
#[derive(Debug)]
pub struct Caches<'a> {
  /// The whole tree
  cache:     &'a mut RootCache,
  /// Sub-cache nodes by name
  accessors: &'a BTreeMap<String, CacheAccessor>,
}

impl<'a> Caches<'a> {
  /// Wraps a cache and its accessors.
  pub fn new(cache: &'a mut RootCache, accessors: &'a BTreeMap<String, CacheAccessor>) -> Self {
    Self { cache, accessors }
  }

  /// Opens a declared sub-cache by name.
  pub fn open(&mut self, name: &str) -> Result<CacheHandle<'_>> {
    let accessor = self.accessors.get(name).ok_or_else(|| {
      BibolamaziError::Cache(format!("no cache accessor \"{name}\" was declared for this filter"))
    })?;
    let node = accessor.cache_dic()?;
    Ok(CacheHandle { cache: &mut *self.cache, node })
  }

  /// Names of the available sub-caches.
  pub fn names(&self) -> impl Iterator<Item = &str> { self.accessors.keys().map(String::as_str) }
}

/// Mutable view of one cache dictionary.
#[derive(Debug)]
pub struct CacheHandle<'a> {
  /// The whole tree
  cache: &'a mut RootCache,
  /// Dictionary this handle points at
  node:  NodeId,
}

impl<'a> CacheHandle<'a> {
  /// A handle on `node`.
  pub fn new(cache: &'a mut RootCache, node: NodeId) -> Self { Self { cache, node } }

  /// Node this handle points at.
  pub fn node(&self) -> NodeId { self.node }

  /// Value stored under `key`, materialized as JSON.
  pub fn get(&self, key: &str) -> Result<Option<Value>> {
    match self.cache.peek(self.node, key)? {
      Some(slot) => Ok(Some(self.cache.to_json(slot)?)),
      None => Ok(None),
    }
  }

  /// String value stored under `key`, if it is one.
  pub fn get_str(&self, key: &str) -> Result<Option<String>> {
    Ok(self.get(key)?.and_then(|v| v.as_str().map(str::to_string)))
  }

  /// Stores `value` under `key`.
  pub fn set(&mut self, key: &str, value: impl Into<CacheInput>) -> Result<()> {
    self.cache.set(self.node, key, value)
  }

  /// Removes `key`, returning what it held.
  pub fn remove(&mut self, key: &str) -> Result<Option<Value>> { self.cache.remove(self.node, key) }

  /// Whether `key` is present.
  pub fn contains_key(&self, key: &str) -> Result<bool> { self.cache.contains_key(self.node, key) }

  /// Keys, sorted.
  pub fn keys(&self) -> Result<Vec<String>> { self.cache.keys(self.node) }

  /// Number of keys.
  pub fn len(&self) -> Result<usize> { self.cache.len(self.node) }

  /// Whether the dictionary is empty.
  pub fn is_empty(&self) -> Result<bool> { self.cache.is_empty(self.node) }

  /// Nested dictionary under `key`; created lazily on first write.
  pub fn child(&mut self, key: &str) -> Result<CacheHandle<'_>> {
    let node = self.cache.child(self.node, key)?;
    Ok(CacheHandle { cache: &mut *self.cache, node })
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn accessors(specs: Vec<CacheAccessorSpec>) -> BTreeMap<String, CacheAccessor> {
    specs.into_iter().map(|s| (s.name.clone(), CacheAccessor::new(s))).collect()
  }

  #[traced_test]
  #[test]
  fn test_initialize_is_idempotent() {
    let mut cache = RootCache::new("1");
    let bib = Bibliography::new();
    let mut accessor = CacheAccessor::new(CacheAccessorSpec::expiring("feature"));
    assert!(accessor.cache_dic().is_err());

    let first = accessor.initialize(&mut cache, &bib).unwrap();
    let second = accessor.initialize(&mut cache, &bib).unwrap();
    assert_eq!(first, second);
    assert!(accessor.is_initialized());
  }

  #[traced_test]
  #[test]
  fn test_handles_read_and_write_through_accessors() {
    let mut cache = RootCache::new("1");
    let bib = Bibliography::new();
    let mut map = accessors(vec![CacheAccessorSpec::plain("one"), CacheAccessorSpec::plain("two")]);
    for accessor in map.values_mut() {
      accessor.initialize(&mut cache, &bib).unwrap();
    }

    let mut caches = Caches::new(&mut cache, &map);
    caches.open("one").unwrap().set("k", "v").unwrap();
    caches.open("two").unwrap().child("nested").unwrap().set("n", 1).unwrap();
    assert!(caches.open("three").is_err());

    assert_eq!(caches.open("one").unwrap().get_str("k").unwrap().as_deref(), Some("v"));
    assert_eq!(caches.open("two").unwrap().get("nested").unwrap(), Some(json!({"n": 1})));
    assert_eq!(caches.names().collect::<Vec<_>>(), vec!["one", "two"]);
  }

  #[traced_test]
  #[test]
  fn test_entry_fields_policy_drops_changed_entries() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("c");
    let spec = CacheAccessorSpec::entry_fields("fields", &["title"]);

    let before: Bibliography = [
      Entry::new("a", "article").with_field("title", "A"),
      Entry::new("b", "article").with_field("title", "B"),
    ]
    .into_iter()
    .collect();
    let mut cache = RootCache::new("1");
    let mut accessor = CacheAccessor::new(spec.clone());
    let node = accessor.initialize(&mut cache, &before).unwrap();
    let mut handle = CacheHandle::new(&mut cache, node);
    handle.set("a", "data-a").unwrap();
    handle.set("b", "data-b").unwrap();
    cache.save(&path).unwrap();

    let after: Bibliography = [
      Entry::new("a", "article").with_field("title", "A"),
      Entry::new("b", "article").with_field("title", "B, revised"),
    ]
    .into_iter()
    .collect();
    let mut cache = RootCache::load(&path, "1", Duration::days(30));
    let mut accessor = CacheAccessor::new(spec);
    let node = accessor.initialize(&mut cache, &after).unwrap();
    assert_eq!(cache.keys(node).unwrap(), vec!["a".to_string()]);
  }

  #[traced_test]
  #[test]
  fn test_expired_sub_cache_entries_are_dropped_on_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("c");
    let bib = Bibliography::new();

    let mut cache = RootCache::new("1");
    let mut accessor = CacheAccessor::new(CacheAccessorSpec::expiring("feature"));
    let node = accessor.initialize(&mut cache, &bib).unwrap();
    cache.set(node, "k", 1).unwrap();
    cache.save(&path).unwrap();

    // a zero lifetime makes every stored entry stale
    let mut cache = RootCache::load(&path, "1", Duration::zero());
    let mut accessor = CacheAccessor::new(CacheAccessorSpec::expiring("feature"));
    let node = accessor.initialize(&mut cache, &bib).unwrap();
    assert!(cache.is_empty(node).unwrap());
  }
}
