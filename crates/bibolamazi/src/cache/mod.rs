//! Persistent, self-validating cache shared by filters across runs.
//!
//! The cache is a tree of dictionaries and lists stored in an arena owned by [`RootCache`].
//! Nodes refer to each other by [`NodeId`]: a parent holds its children by id and each child
//! records back-links to the parents it is attached to. The arena is the only owner.
//!
//! Each dictionary carries, per key, a validation token computed by the dictionary's
//! [`TokenChecker`]. Entries go through a simple life cycle during a run:
//!
//! - **unvalidated**: loaded from disk, token present but not checked yet
//! - **valid**: checked once and kept; never re-checked for the rest of the run
//! - **invalid**: checked, token stale; the entry is removed together with its sub-tree
//!
//! Writing a value always stores a fresh token, so written entries are valid immediately.
//! Validation is never eager: it happens when an accessor first touches its sub-cache.
//!
//! Reading a missing key yields a fresh empty dictionary that is *pending*: it is attached to
//! its parent only when something is first written into it, so reads never pollute the tree.
//!
//! # Examples
//!
//! ```
//! use bibolamazi::cache::RootCache;
//! use serde_json::json;
//!
//! let mut cache = RootCache::new("1.0");
//! let root = cache.root();
//! let sub = cache.child(root, "arxiv").unwrap();
//! assert!(!cache.contains_key(root, "arxiv").unwrap());
//!
//! cache.set(sub, "2301.07041", json!({"title": "Some paper"})).unwrap();
//! assert!(cache.contains_key(root, "arxiv").unwrap());
//! ```

use std::fs;

use super::*;

mod accessor;
mod token;

pub use accessor::*;
pub use token::*;

/// Version of the on-disk cache layout. Files with another format tag are ignored.
pub const CACHE_FORMAT: u32 = 1;

/// Extension appended to a document's file name to form its cache sidecar.
pub const CACHE_FILE_SUFFIX: &str = ".bibolamazicache";

/// Default lifetime of entries validated by the shared expiry checker.
pub const DEFAULT_CACHE_EXPIRY_DAYS: i64 = 30;

/// Index of a node in the cache arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// What a dictionary key or list item holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
  /// A scalar JSON value
  Value(Value),
  /// A nested dictionary or list
  Node(NodeId),
}

/// Input accepted by [`RootCache::set`].
///
/// JSON objects and arrays are converted into new dictionary and list nodes; passing a
/// [`NodeId`] attaches that very node, so ids held elsewhere stay valid.
#[derive(Debug, Clone)]
pub enum CacheInput {
  /// Plain JSON, converted recursively
  Json(Value),
  /// An existing node
  Node(NodeId),
}

impl From<Value> for CacheInput {
  fn from(value: Value) -> Self { CacheInput::Json(value) }
}

impl From<NodeId> for CacheInput {
  fn from(node: NodeId) -> Self { CacheInput::Node(node) }
}

impl From<&str> for CacheInput {
  fn from(value: &str) -> Self { CacheInput::Json(Value::from(value)) }
}

impl From<String> for CacheInput {
  fn from(value: String) -> Self { CacheInput::Json(Value::from(value)) }
}

impl From<i32> for CacheInput {
  fn from(value: i32) -> Self { CacheInput::Json(Value::from(value)) }
}

impl From<i64> for CacheInput {
  fn from(value: i64) -> Self { CacheInput::Json(Value::from(value)) }
}

impl From<f64> for CacheInput {
  fn from(value: f64) -> Self { CacheInput::Json(Value::from(value)) }
}

impl From<bool> for CacheInput {
  fn from(value: bool) -> Self { CacheInput::Json(Value::from(value)) }
}

/// The two node shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
  /// Mapping with per-key tokens
  Dic,
  /// Ordered sequence
  List,
}

/// Dictionary payload.
#[derive(Debug, Default)]
struct Dic {
  /// Values by key
  items:   BTreeMap<String, Slot>,
  /// Validation token by key
  tokens:  BTreeMap<String, Token>,
  /// Active policy, identity when unset
  checker: Option<Arc<dyn TokenChecker>>,
  /// Keys confirmed valid during this run
  checked: HashSet<String>,
}

/// Node payload.
#[derive(Debug)]
enum NodeData {
  /// Dictionary node
  Dic(Dic),
  /// List node
  List(Vec<Slot>),
}

/// Back-link from a child to one of its parents.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Link {
  /// Parent node
  parent: NodeId,
  /// Key in the parent, `None` when the parent is a list
  key:    Option<String>,
}

/// One arena slot.
#[derive(Debug)]
struct Node {
  /// Payload
  data:    NodeData,
  /// Back-links to the parents holding this node
  parents: Vec<Link>,
  /// Where to attach this node on first write, for placeholders created by reads
  pending: Option<Link>,
}

impl Node {
  /// A fresh, unattached node.
  fn new(data: NodeData) -> Self { Self { data, parents: Vec::new(), pending: None } }
}

/// Owner of the whole cache tree.
///
/// The root dictionary is validated by the combination of a version tag (the cache is dropped
/// wholesale when the version changes) and a per-key dispatcher accessors can register their
/// own top-level policy with. A single date-expiry checker is shared by every sub-cache that
/// opts into expiry.
#[derive(Debug)]
pub struct RootCache {
  /// Node arena; `None` marks released nodes
  nodes:    Vec<Option<Node>>,
  /// The top-level dictionary
  root:     NodeId,
  /// Current version tag
  version:  String,
  /// Top-level per-key policies
  per_key:  PerKeyTokenChecker,
  /// Shared expiry policy
  expiry:   Arc<DateExpiryTokenChecker>,
  /// Policy for dictionaries without one
  identity: Arc<dyn TokenChecker>,
  /// Uncommitted placeholders by the parent and key they will attach to
  pending:  HashMap<(NodeId, String), NodeId>,
}

impl RootCache {
  /// Creates an empty cache tagged with `version`.
  pub fn new(version: impl Into<String>) -> Self {
    Self::with_expiry(version, Duration::days(DEFAULT_CACHE_EXPIRY_DAYS))
  }

  /// Creates an empty cache whose shared expiry checker uses `max_age`.
  pub fn with_expiry(version: impl Into<String>, max_age: Duration) -> Self {
    let mut cache = Self {
      nodes:    vec![Some(Node::new(NodeData::Dic(Dic::default())))],
      root:     NodeId(0),
      version:  version.into(),
      per_key:  PerKeyTokenChecker::new(),
      expiry:   Arc::new(DateExpiryTokenChecker::new(max_age)),
      identity: Arc::new(IdentityTokenChecker),
      pending:  HashMap::new(),
    };
    cache.install_root_checker();
    cache
  }

  /// The top-level dictionary.
  pub fn root(&self) -> NodeId { self.root }

  /// The version tag this cache validates against.
  pub fn version(&self) -> &str { &self.version }

  /// The expiry checker shared by sub-caches that opt into expiry.
  pub fn expiry_checker(&self) -> Arc<DateExpiryTokenChecker> { self.expiry.clone() }

  /// Registers the policy the root dictionary uses for one top-level key.
  pub fn register_key_checker(&mut self, key: impl Into<String>, checker: Arc<dyn TokenChecker>) {
    self.per_key.insert(key, checker);
    self.install_root_checker();
  }

  /// Rebuilds the root dictionary's combined checker from the version and per-key parts.
  fn install_root_checker(&mut self) {
    let combined: Arc<dyn TokenChecker> = Arc::new(CombineTokenChecker::new(vec![
      Arc::new(VersionTokenChecker::new(self.version.clone())),
      Arc::new(self.per_key.clone()),
    ]));
    let root = self.root;
    if let Ok(dic) = self.dic_mut(root) {
      dic.checker = Some(combined);
    }
  }

  // --- arena access -------------------------------------------------------------------------

  /// Node by id.
  fn node(&self, id: NodeId) -> Result<&Node> {
    self
      .nodes
      .get(id.0)
      .and_then(Option::as_ref)
      .ok_or_else(|| BibolamaziError::Cache(format!("cache node {} no longer exists", id.0)))
  }

  /// Mutable node by id.
  fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
    self
      .nodes
      .get_mut(id.0)
      .and_then(Option::as_mut)
      .ok_or_else(|| BibolamaziError::Cache(format!("cache node {} no longer exists", id.0)))
  }

  /// Dictionary payload by id.
  fn dic(&self, id: NodeId) -> Result<&Dic> {
    match &self.node(id)?.data {
      NodeData::Dic(dic) => Ok(dic),
      NodeData::List(_) => Err(BibolamaziError::Cache("expected a dictionary, found a list".into())),
    }
  }

  /// Mutable dictionary payload by id.
  fn dic_mut(&mut self, id: NodeId) -> Result<&mut Dic> {
    match &mut self.node_mut(id)?.data {
      NodeData::Dic(dic) => Ok(dic),
      NodeData::List(_) => Err(BibolamaziError::Cache("expected a dictionary, found a list".into())),
    }
  }

  /// Mutable list payload by id.
  fn list_mut(&mut self, id: NodeId) -> Result<&mut Vec<Slot>> {
    match &mut self.node_mut(id)?.data {
      NodeData::List(items) => Ok(items),
      NodeData::Dic(_) => Err(BibolamaziError::Cache("expected a list, found a dictionary".into())),
    }
  }

  /// Allocates a node.
  fn alloc(&mut self, data: NodeData) -> NodeId {
    self.nodes.push(Some(Node::new(data)));
    NodeId(self.nodes.len() - 1)
  }

  /// The checker a dictionary validates with.
  fn checker_of(&self, id: NodeId) -> Result<Arc<dyn TokenChecker>> {
    Ok(self.dic(id)?.checker.clone().unwrap_or_else(|| self.identity.clone()))
  }

  // --- reading ------------------------------------------------------------------------------

  /// Shape of a node, or `None` if it was released.
  pub fn kind(&self, id: NodeId) -> Option<NodeKind> {
    self.node(id).ok().map(|node| match node.data {
      NodeData::Dic(_) => NodeKind::Dic,
      NodeData::List(_) => NodeKind::List,
    })
  }

  /// Whether a dictionary holds `key`.
  pub fn contains_key(&self, node: NodeId, key: &str) -> Result<bool> {
    Ok(self.dic(node)?.items.contains_key(key))
  }

  /// Keys of a dictionary, sorted.
  pub fn keys(&self, node: NodeId) -> Result<Vec<String>> {
    Ok(self.dic(node)?.items.keys().cloned().collect())
  }

  /// Number of items in a dictionary or list.
  pub fn len(&self, node: NodeId) -> Result<usize> {
    Ok(match &self.node(node)?.data {
      NodeData::Dic(dic) => dic.items.len(),
      NodeData::List(items) => items.len(),
    })
  }

  /// Whether a dictionary or list is empty.
  pub fn is_empty(&self, node: NodeId) -> Result<bool> { Ok(self.len(node)? == 0) }

  /// The slot stored under `key`, without creating anything.
  pub fn peek(&self, node: NodeId, key: &str) -> Result<Option<&Slot>> {
    Ok(self.dic(node)?.items.get(key))
  }

  /// The stored token for `key`, if any.
  pub fn token(&self, node: NodeId, key: &str) -> Result<Option<&Token>> {
    Ok(self.dic(node)?.tokens.get(key))
  }

  /// Reads `key`. A missing key yields a fresh pending dictionary.
  pub fn get(&mut self, node: NodeId, key: &str) -> Result<Slot> {
    if let Some(slot) = self.dic(node)?.items.get(key) {
      return Ok(slot.clone());
    }
    Ok(Slot::Node(self.new_pending(node, key)))
  }

  /// The dictionary stored under `key`, or a fresh pending one if the key is missing.
  pub fn child(&mut self, node: NodeId, key: &str) -> Result<NodeId> {
    match self.get(node, key)? {
      Slot::Node(id) if self.kind(id) == Some(NodeKind::Dic) => Ok(id),
      _ => Err(BibolamaziError::Cache(format!("cache key \"{key}\" does not hold a dictionary"))),
    }
  }

  /// The placeholder dictionary that attaches itself to `parent[key]` on first write.
  ///
  /// Repeated reads of the same missing key share one placeholder.
  fn new_pending(&mut self, parent: NodeId, key: &str) -> NodeId {
    let slot = (parent, key.to_string());
    if let Some(&id) = self.pending.get(&slot) {
      if self.is_pending(id) {
        return id;
      }
    }
    let id = self.alloc(NodeData::Dic(Dic::default()));
    if let Ok(node) = self.node_mut(id) {
      node.pending = Some(Link { parent, key: Some(key.to_string()) });
    }
    self.pending.insert(slot, id);
    id
  }

  /// Stops tracking a placeholder that is being attached.
  fn forget_pending(&mut self, link: &Link) {
    if let Some(key) = &link.key {
      self.pending.remove(&(link.parent, key.clone()));
    }
  }

  /// Whether a node is a placeholder not yet attached to its parent.
  pub fn is_pending(&self, node: NodeId) -> bool {
    self.node(node).map(|n| n.pending.is_some()).unwrap_or(false)
  }

  /// Item of a list by index.
  pub fn list_get(&self, list: NodeId, index: usize) -> Result<Option<Slot>> {
    match &self.node(list)?.data {
      NodeData::List(items) => Ok(items.get(index).cloned()),
      NodeData::Dic(_) => Err(BibolamaziError::Cache("expected a list, found a dictionary".into())),
    }
  }

  /// Materializes a node (recursively) or slot as plain JSON.
  pub fn to_json(&self, slot: &Slot) -> Result<Value> {
    match slot {
      Slot::Value(value) => Ok(value.clone()),
      Slot::Node(id) => match &self.node(*id)?.data {
        NodeData::Dic(dic) => {
          let mut map = serde_json::Map::new();
          for (key, child) in &dic.items {
            map.insert(key.clone(), self.to_json(child)?);
          }
          Ok(Value::Object(map))
        },
        NodeData::List(items) =>
          Ok(Value::Array(items.iter().map(|s| self.to_json(s)).collect::<Result<_>>()?)),
      },
    }
  }

  // --- writing ------------------------------------------------------------------------------

  /// Stores `value` under `key`, computing a fresh token and notifying ancestors.
  pub fn set(&mut self, node: NodeId, key: &str, value: impl Into<CacheInput>) -> Result<()> {
    self.commit_pending(node)?;
    let slot = self.import(value.into())?;
    self.store(node, key, slot)
  }

  /// Appends to a list.
  pub fn push(&mut self, list: NodeId, value: impl Into<CacheInput>) -> Result<()> {
    self.list_mut(list)?;
    self.commit_pending(list)?;
    let slot = self.import(value.into())?;
    if let Slot::Node(child) = &slot {
      self.node_mut(*child)?.parents.push(Link { parent: list, key: None });
    }
    self.list_mut(list)?.push(slot);
    self.notify_changed(list)
  }

  /// Creates an empty list under `key` and returns it.
  pub fn new_list(&mut self, node: NodeId, key: &str) -> Result<NodeId> {
    self.set(node, key, Value::Array(Vec::new()))?;
    match self.peek(node, key)? {
      Some(Slot::Node(id)) => Ok(*id),
      _ => Err(BibolamaziError::Cache("failed to create list".into())),
    }
  }

  /// Removes `key` and releases its sub-tree if nothing else references it.
  pub fn remove(&mut self, node: NodeId, key: &str) -> Result<Option<Value>> {
    let removed = self.remove_silently(node, key)?;
    if removed.is_some() {
      self.notify_changed(node)?;
    }
    Ok(removed)
  }

  /// Removes `key` without notifying ancestors, returning the removed content as JSON.
  fn remove_silently(&mut self, node: NodeId, key: &str) -> Result<Option<Value>> {
    let dic = self.dic_mut(node)?;
    dic.tokens.remove(key);
    dic.checked.remove(key);
    let Some(slot) = dic.items.remove(key) else { return Ok(None) };
    let json = self.to_json(&slot)?;
    if let Slot::Node(child) = slot {
      self.detach(child, &Link { parent: node, key: Some(key.to_string()) })?;
    }
    Ok(Some(json))
  }

  /// Converts input into a slot, allocating nodes for JSON containers.
  fn import(&mut self, input: CacheInput) -> Result<Slot> {
    match input {
      CacheInput::Node(id) => {
        // attaching an existing placeholder makes it a regular node
        if let Some(link) = self.node_mut(id)?.pending.take() {
          self.forget_pending(&link);
        }
        Ok(Slot::Node(id))
      },
      CacheInput::Json(Value::Object(map)) => {
        let id = self.alloc(NodeData::Dic(Dic::default()));
        for (key, value) in map {
          let slot = self.import(CacheInput::Json(value))?;
          self.store(id, &key, slot)?;
        }
        Ok(Slot::Node(id))
      },
      CacheInput::Json(Value::Array(values)) => {
        let id = self.alloc(NodeData::List(Vec::new()));
        for value in values {
          let slot = self.import(CacheInput::Json(value))?;
          if let Slot::Node(child) = &slot {
            self.node_mut(*child)?.parents.push(Link { parent: id, key: None });
          }
          self.list_mut(id)?.push(slot);
        }
        Ok(Slot::Node(id))
      },
      CacheInput::Json(value) => Ok(Slot::Value(value)),
    }
  }

  /// Puts a slot into a dictionary, linking, tokenizing and notifying.
  fn store(&mut self, node: NodeId, key: &str, slot: Slot) -> Result<()> {
    if let Some(Slot::Node(previous)) = self.dic(node)?.items.get(key).cloned() {
      if slot != Slot::Node(previous) {
        self.detach(previous, &Link { parent: node, key: Some(key.to_string()) })?;
      }
    }
    if let Slot::Node(child) = &slot {
      let link = Link { parent: node, key: Some(key.to_string()) };
      let child = self.node_mut(*child)?;
      if !child.parents.contains(&link) {
        child.parents.push(link);
      }
    }
    let token = self.checker_of(node)?.new_token(key, &slot);
    let dic = self.dic_mut(node)?;
    dic.items.insert(key.to_string(), slot);
    dic.tokens.insert(key.to_string(), token);
    dic.checked.insert(key.to_string());
    self.notify_changed(node)
  }

  /// Attaches a placeholder (and its own pending ancestors) to the tree.
  fn commit_pending(&mut self, node: NodeId) -> Result<()> {
    let Some(link) = self.node_mut(node)?.pending.take() else { return Ok(()) };
    self.forget_pending(&link);
    self.commit_pending(link.parent)?;
    match link.key {
      Some(key) => {
        trace!(node = node.0, parent = link.parent.0, key = %key, "Attaching pending cache node");
        self.store(link.parent, &key, Slot::Node(node))
      },
      None => Ok(()),
    }
  }

  /// Drops one back-link and releases the node once no parent references it.
  fn detach(&mut self, child: NodeId, link: &Link) -> Result<()> {
    let node = self.node_mut(child)?;
    node.parents.retain(|l| l != link);
    if node.parents.is_empty() && node.pending.is_none() {
      self.release(child);
    }
    Ok(())
  }

  /// Frees a node and every descendant left without parents.
  fn release(&mut self, id: NodeId) {
    let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) else { return };
    let children: Vec<(NodeId, Link)> = match node.data {
      NodeData::Dic(dic) => dic
        .items
        .into_iter()
        .filter_map(|(key, slot)| match slot {
          Slot::Node(child) => Some((child, Link { parent: id, key: Some(key) })),
          Slot::Value(_) => None,
        })
        .collect(),
      NodeData::List(items) => items
        .into_iter()
        .filter_map(|slot| match slot {
          Slot::Node(child) => Some((child, Link { parent: id, key: None })),
          Slot::Value(_) => None,
        })
        .collect(),
    };
    for (child, link) in children {
      // children may already be gone when they were aliased under this node twice
      let _ = self.detach(child, &link);
    }
  }

  /// Propagates a change of `node` to every ancestor, refreshing the tokens that refer to it.
  fn notify_changed(&mut self, node: NodeId) -> Result<()> {
    let mut visited = HashSet::new();
    let mut queue = vec![node];
    while let Some(current) = queue.pop() {
      if !visited.insert(current) {
        continue;
      }
      let parents = self.node(current)?.parents.clone();
      for link in parents {
        if let Some(key) = &link.key {
          let checker = self.checker_of(link.parent)?;
          let token = checker.new_token(key, &Slot::Node(current));
          self.dic_mut(link.parent)?.tokens.insert(key.clone(), token);
        }
        queue.push(link.parent);
      }
    }
    Ok(())
  }

  // --- validation ---------------------------------------------------------------------------

  /// Installs a validation policy on a dictionary.
  ///
  /// Previous verdicts are forgotten since they were reached under another policy; when
  /// `validate` is set, the dictionary is validated right away.
  pub fn set_validation(
    &mut self,
    node: NodeId,
    checker: Option<Arc<dyn TokenChecker>>,
    validate: bool,
  ) -> Result<()> {
    let dic = self.dic_mut(node)?;
    dic.checker = checker;
    dic.checked.clear();
    if validate {
      self.validate(node)?;
    }
    Ok(())
  }

  /// Validates every not-yet-checked key of a dictionary, recursing into valid children.
  pub fn validate(&mut self, node: NodeId) -> Result<()> {
    let keys = self.keys(node)?;
    for key in keys {
      self.validate_key(node, &key)?;
    }
    Ok(())
  }

  /// Validates a single key of a dictionary. Returns whether it is (still) present.
  pub fn validate_key(&mut self, node: NodeId, key: &str) -> Result<bool> {
    let (slot, already_checked) = {
      let dic = self.dic(node)?;
      let Some(slot) = dic.items.get(key) else { return Ok(false) };
      (slot.clone(), dic.checked.contains(key))
    };

    if !already_checked {
      let checker = self.checker_of(node)?;
      let valid = match self.dic(node)?.tokens.get(key) {
        Some(token) => checker.cmp_tokens(key, &slot, token),
        None => false,
      };
      if !valid {
        debug!(key = %key, "Dropping stale cache entry");
        self.remove_silently(node, key)?;
        return Ok(false);
      }
      self.dic_mut(node)?.checked.insert(key.to_string());
    }

    if let Slot::Node(child) = slot {
      self.validate_node(child)?;
    }
    Ok(true)
  }

  /// Validates any node: dictionaries directly, lists through their dictionary items.
  fn validate_node(&mut self, node: NodeId) -> Result<()> {
    match self.kind(node) {
      Some(NodeKind::Dic) => self.validate(node),
      Some(NodeKind::List) => {
        let children: Vec<NodeId> = match &self.node(node)?.data {
          NodeData::List(items) => items
            .iter()
            .filter_map(|s| match s {
              Slot::Node(id) => Some(*id),
              Slot::Value(_) => None,
            })
            .collect(),
          NodeData::Dic(_) => Vec::new(),
        };
        for child in children {
          self.validate_node(child)?;
        }
        Ok(())
      },
      None => Ok(()),
    }
  }

  // --- persistence --------------------------------------------------------------------------

  /// Serializes the tree reachable from the root.
  fn export(&self, id: NodeId) -> Result<StoredNode> {
    let slot = |s: &Slot| -> Result<StoredSlot> {
      Ok(match s {
        Slot::Value(v) => StoredSlot::Value(v.clone()),
        Slot::Node(child) => StoredSlot::Node(self.export(*child)?),
      })
    };
    Ok(match &self.node(id)?.data {
      NodeData::Dic(dic) => StoredNode::Dic {
        items:  dic
          .items
          .iter()
          .map(|(k, s)| -> Result<(String, StoredSlot)> { Ok((k.clone(), slot(s)?)) })
          .collect::<Result<_>>()?,
        tokens: dic.tokens.clone(),
      },
      NodeData::List(items) =>
        StoredNode::List { items: items.iter().map(slot).collect::<Result<_>>()? },
    })
  }

  /// Rebuilds stored nodes into the arena. Tokens are restored as-is, unvalidated.
  fn restore(&mut self, stored: StoredNode) -> NodeId {
    match stored {
      StoredNode::Dic { items, tokens } => {
        let id = self.alloc(NodeData::Dic(Dic::default()));
        for (key, stored) in items {
          let slot = self.restore_slot(stored, Link { parent: id, key: Some(key.clone()) });
          if let Ok(dic) = self.dic_mut(id) {
            dic.items.insert(key, slot);
          }
        }
        if let Ok(dic) = self.dic_mut(id) {
          dic.tokens = tokens.into_iter().filter(|(k, _)| dic.items.contains_key(k)).collect();
        }
        id
      },
      StoredNode::List { items } => {
        let id = self.alloc(NodeData::List(Vec::new()));
        for stored in items {
          let slot = self.restore_slot(stored, Link { parent: id, key: None });
          if let Ok(list) = self.list_mut(id) {
            list.push(slot);
          }
        }
        id
      },
    }
  }

  /// Restores one stored slot under `link`.
  fn restore_slot(&mut self, stored: StoredSlot, link: Link) -> Slot {
    match stored {
      StoredSlot::Value(value) => Slot::Value(value),
      StoredSlot::Node(node) => {
        let child = self.restore(node);
        if let Ok(node) = self.node_mut(child) {
          node.parents.push(link);
        }
        Slot::Node(child)
      },
    }
  }

  /// Writes the cache to `path`.
  #[instrument(skip(self), level = "debug")]
  pub fn save(&self, path: &Path) -> Result<()> {
    let file = CacheFile {
      format:  CACHE_FORMAT,
      version: self.version.clone(),
      root:    self.export(self.root)?,
    };
    fs::write(path, serde_json::to_vec(&file)?)?;
    debug!("Saved cache");
    Ok(())
  }

  /// Loads a cache file, or returns an empty cache if the file is absent or unusable.
  ///
  /// Loading never fails: a missing file, a format or version mismatch or a parse error result in
  /// an empty cache, logged at debug level.
  #[instrument(level = "debug")]
  pub fn load(path: &Path, version: &str, max_age: Duration) -> Self {
    match Self::try_load(path, version, max_age) {
      Ok(cache) => {
        debug!("Loaded cache");
        cache
      },
      Err(e) => {
        debug!(error = %e, "Starting with an empty cache");
        Self::with_expiry(version, max_age)
      },
    }
  }

  /// Fallible part of [`RootCache::load`].
  fn try_load(path: &Path, version: &str, max_age: Duration) -> Result<Self> {
    let bytes = fs::read(path)?;
    let file: CacheFile = serde_json::from_slice(&bytes)?;
    if file.format != CACHE_FORMAT {
      return Err(BibolamaziError::Cache(format!("unsupported cache format {}", file.format)));
    }
    if file.version != version {
      return Err(BibolamaziError::Cache(format!("cache written by version {}", file.version)));
    }
    if !matches!(file.root, StoredNode::Dic { .. }) {
      return Err(BibolamaziError::Cache("cache root is not a dictionary".into()));
    }
    let mut cache = Self {
      nodes:    Vec::new(),
      root:     NodeId(0),
      version:  version.to_string(),
      per_key:  PerKeyTokenChecker::new(),
      expiry:   Arc::new(DateExpiryTokenChecker::new(max_age)),
      identity: Arc::new(IdentityTokenChecker),
      pending:  HashMap::new(),
    };
    cache.root = cache.restore(file.root);
    cache.install_root_checker();
    Ok(cache)
  }
}

/// Cache sidecar file contents.
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
  /// Layout version, see [`CACHE_FORMAT`]
  format:  u32,
  /// Version tag of the writer
  version: String,
  /// The root dictionary
  root:    StoredNode,
}

/// Serialized node.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum StoredNode {
  /// Dictionary with tokens
  Dic {
    /// Items by key
    items:  BTreeMap<String, StoredSlot>,
    /// Tokens by key
    tokens: BTreeMap<String, Token>,
  },
  /// List
  List {
    /// Items in order
    items: Vec<StoredSlot>,
  },
}

/// Serialized slot. Leaves are always scalars, so nodes and values cannot be confused.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredSlot {
  /// Nested node
  Node(StoredNode),
  /// Scalar value
  Value(Value),
}

/// Path of the cache sidecar for a document file.
pub fn cache_path_for(document: &Path) -> PathBuf {
  let mut name = document.file_name().map(|n| n.to_os_string()).unwrap_or_default();
  name.push(CACHE_FILE_SUFFIX);
  document.with_file_name(name)
}
