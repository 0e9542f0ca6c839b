//! Filters: the transformation plugins a document runs over its entries.
//!
//! A filter is described by a [`FilterClass`] (name, documentation, constructor signature)
//! and instantiated from an option string into a boxed [`Filter`]. Filter classes come from
//! [`FilterModule`]s, which [`FilterPackage`]s load by name. The [`FilterRegistry`] ties this
//! together: it walks a [`SearchPath`], loads and classifies modules, builds the option
//! grammar from the class signature and constructs instances.
//!
//! A module provides either a ready-made class (the "hook"), or exactly one plain function
//! processing a single entry or a whole document together with an explicit parameter table.
//! The latter is wrapped into a [`SimpleFilterClass`] by [`classify`].
//!
//! # Examples
//!
//! ```
//! use bibolamazi::{filter::*, prelude::*, search_path::SearchPath};
//!
//! let mut registry = FilterRegistry::new();
//! let spec = registry.resolve("strip", &SearchPath::new()).unwrap();
//! let args = registry.parse_args(&spec, "--fields=note,abstract").unwrap();
//! let instance = registry.instantiate(&spec, args).unwrap();
//! assert_eq!(instance.action(), FilterAction::Entry);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use super::*;

mod builtin;
mod factory;
mod option_spec;
mod options;
mod simple;

pub use builtin::*;
pub use factory::*;
pub use option_spec::*;
pub use options::*;
pub use simple::*;

/// Result type returned by filter code.
pub type FilterResult<T> = std::result::Result<T, FilterError>;

/// What a filter operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
  /// The whole document, including its configuration and cache
  Document,
  /// The whole entry collection, which it may freely reshape
  Bibliography,
  /// One entry at a time
  Entry,
}

impl Display for FilterAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FilterAction::Document => write!(f, "document"),
      FilterAction::Bibliography => write!(f, "bibliography"),
      FilterAction::Entry => write!(f, "entry"),
    }
  }
}

/// Shared flag signalling that the current run should stop.
///
/// Cloning yields a handle on the same flag. The document checks it between filters and
/// between entries; long-running filters should check it through
/// [`FilterContext::check_interrupt`].
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
  /// A fresh, unset flag.
  pub fn new() -> Self { Self::default() }

  /// Requests interruption.
  pub fn interrupt(&self) { self.0.store(true, Ordering::SeqCst); }

  /// Clears a previous request.
  pub fn reset(&self) { self.0.store(false, Ordering::SeqCst); }

  /// Whether interruption was requested.
  pub fn is_interrupted(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

/// What entry and bibliography filters get to work with besides the data itself.
#[derive(Debug)]
pub struct FilterContext<'a> {
  /// Sub-caches declared by the running filter
  pub caches: Caches<'a>,
  /// Interruption flag of the run
  interrupt:  InterruptHandle,
}

impl<'a> FilterContext<'a> {
  /// Bundles caches and the interruption flag.
  pub fn new(caches: Caches<'a>, interrupt: InterruptHandle) -> Self { Self { caches, interrupt } }

  /// Fails with [`FilterError::Interrupted`] if the run should stop.
  pub fn check_interrupt(&self) -> FilterResult<()> {
    if self.interrupt.is_interrupted() {
      Err(FilterError::Interrupted)
    } else {
      Ok(())
    }
  }
}

/// An instantiated filter.
///
/// Only the method matching [`Filter::action`] is ever called; the others default to
/// [`FilterError::Unsupported`].
pub trait Filter: Debug + Send {
  /// The processing mode.
  fn action(&self) -> FilterAction;

  /// Sub-caches this filter needs. They are initialized before the filter runs.
  fn cache_accessors(&self) -> Vec<CacheAccessorSpec> { Vec::new() }

  /// Processes one entry.
  fn filter_entry(&mut self, _entry: &mut Entry, _ctx: &mut FilterContext<'_>) -> FilterResult<()> {
    Err(FilterError::Unsupported("entry"))
  }

  /// Processes the whole entry collection.
  fn filter_bibliography(
    &mut self,
    _bibliography: &mut Bibliography,
    _ctx: &mut FilterContext<'_>,
  ) -> FilterResult<()> {
    Err(FilterError::Unsupported("bibliography"))
  }

  /// Processes the whole document.
  fn filter_document(&mut self, _document: &mut Document) -> FilterResult<()> {
    Err(FilterError::Unsupported("document"))
  }
}

/// A filter type: documentation, constructor signature and constructor.
pub trait FilterClass: Send + Sync {
  /// Name the filter is invoked by.
  fn name(&self) -> &str;

  /// One-line description.
  fn help(&self) -> &str;

  /// Long documentation. `* name (type): text` bullets document the parameters.
  fn docstring(&self) -> &str { "" }

  /// The constructor signature.
  fn signature(&self) -> Signature;

  /// Argument types specific to this filter, consulted before the built-in ones.
  fn custom_types(&self) -> Vec<ArgType> { Vec::new() }

  /// Whether options follow the standard grammar. Filters returning `false` parse their
  /// option string themselves in [`FilterClass::parse_options`].
  fn uses_default_options(&self) -> bool { true }

  /// Custom option parser, used when [`FilterClass::uses_default_options`] is `false`.
  fn parse_options(&self, _options: &str) -> std::result::Result<FilterArgs, String> {
    Err("this filter does not parse its own options".to_string())
  }

  /// Builds an instance from already validated arguments, defaults filled in.
  fn construct(&self, args: FilterArgs) -> FilterResult<Box<dyn Filter>>;
}

impl Debug for dyn FilterClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FilterClass").field("name", &self.name()).finish()
  }
}

/// The plain function shapes a module may provide instead of a class.
#[derive(Clone)]
pub enum SimpleFunction {
  /// Called once per entry
  Entry(Arc<dyn Fn(&mut Entry, &FilterArgs) -> FilterResult<()> + Send + Sync>),
  /// Called once with the whole document
  Document(Arc<dyn Fn(&mut Document, &FilterArgs) -> FilterResult<()> + Send + Sync>),
}

impl SimpleFunction {
  /// Wraps a per-entry function.
  pub fn entry<F>(f: F) -> Self
  where F: Fn(&mut Entry, &FilterArgs) -> FilterResult<()> + Send + Sync + 'static {
    SimpleFunction::Entry(Arc::new(f))
  }

  /// Wraps a whole-document function.
  pub fn document<F>(f: F) -> Self
  where F: Fn(&mut Document, &FilterArgs) -> FilterResult<()> + Send + Sync + 'static {
    SimpleFunction::Document(Arc::new(f))
  }

  /// The processing mode this function implies.
  pub fn action(&self) -> FilterAction {
    match self {
      SimpleFunction::Entry(_) => FilterAction::Entry,
      SimpleFunction::Document(_) => FilterAction::Document,
    }
  }
}

impl Debug for SimpleFunction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "SimpleFunction::{}", self.action())
  }
}

/// A plain function plus the parameter table and documentation it is invoked with.
#[derive(Debug, Clone)]
pub struct SimpleDefinition {
  /// The function
  pub function:  SimpleFunction,
  /// Parameters besides the entry or document, in order
  pub params:    Vec<Param>,
  /// Documentation; the first line is used as help text
  pub docstring: String,
}

/// A filter as loaded from a package, before classification.
#[derive(Debug, Clone, Default)]
pub struct FilterModule {
  /// A ready-made filter class
  pub hook:             Option<Arc<dyn FilterClass>>,
  /// A plain per-entry function
  pub process_entry:    Option<SimpleDefinition>,
  /// A plain whole-document function
  pub process_document: Option<SimpleDefinition>,
  /// Another filter, invoked with preset options
  pub preset:           Option<FilterPreset>,
}

impl FilterModule {
  /// A module exposing a class.
  pub fn with_class(class: Arc<dyn FilterClass>) -> Self {
    Self { hook: Some(class), ..Self::default() }
  }

  /// A module exposing a single plain function.
  pub fn with_function(function: SimpleFunction, params: Vec<Param>, docstring: &str) -> Self {
    let definition = SimpleDefinition { function, params, docstring: docstring.to_string() };
    match definition.function.action() {
      FilterAction::Entry => Self { process_entry: Some(definition), ..Self::default() },
      _ => Self { process_document: Some(definition), ..Self::default() },
    }
  }
}

/// A filter defined as another filter with fixed options, as found in package directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPreset {
  /// Target filter, optionally `package:`-qualified
  pub filter:  String,
  /// Options applied before the user's own
  #[serde(default)]
  pub options: String,
  /// Help text replacing the target's
  #[serde(default)]
  pub help:    Option<String>,
}

/// Turns a module into a filter class.
///
/// A hook wins. Otherwise the module must provide exactly one plain function, which gets
/// wrapped into a [`SimpleFilterClass`].
pub fn classify(name: &str, module: FilterModule) -> Result<Arc<dyn FilterClass>> {
  if let Some(class) = module.hook {
    return Ok(class);
  }
  match (module.process_entry, module.process_document) {
    (Some(definition), None) | (None, Some(definition)) =>
      Ok(Arc::new(SimpleFilterClass::new(name, definition))),
    (Some(_), Some(_)) => Err(BibolamaziError::NotAFilter {
      name:   name.to_string(),
      reason: "module defines both a per-entry and a whole-document function".to_string(),
    }),
    (None, None) => Err(BibolamaziError::NotAFilter {
      name:   name.to_string(),
      reason: "module defines neither a filter class nor a filter function".to_string(),
    }),
  }
}

/// Why a package could not provide a filter module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
  /// The package or module does not exist. Expected while scanning the search path.
  NotFound(String),
  /// The module exists but is broken. Points at a bug in the filter.
  Broken(String),
}

impl Display for LoadFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LoadFailure::NotFound(reason) => write!(f, "{reason}"),
      LoadFailure::Broken(reason) => write!(f, "failed to load: {reason}"),
    }
  }
}

/// A named collection of filter modules.
pub trait FilterPackage: Send + Sync {
  /// Package name, as used on the search path and in `package:filter` names.
  fn name(&self) -> &str;

  /// Checks that the package is usable with the given directory binding.
  fn check(&self, _dir: Option<&Path>) -> std::result::Result<(), LoadFailure> { Ok(()) }

  /// Loads the module for `filter`.
  fn load(&self, filter: &str, dir: Option<&Path>) -> std::result::Result<FilterModule, LoadFailure>;

  /// Names of the filters this package provides.
  fn filter_names(&self, dir: Option<&Path>) -> Vec<String>;
}

impl Debug for dyn FilterPackage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FilterPackage").field("name", &self.name()).finish()
  }
}

/// Loader producing a module, or the reason it is broken.
pub type ModuleLoader = Arc<dyn Fn() -> std::result::Result<FilterModule, String> + Send + Sync>;

/// A package whose modules are compiled in.
#[derive(Clone)]
pub struct StaticFilterPackage {
  /// Package name
  name:    String,
  /// Loaders by filter name
  modules: BTreeMap<String, ModuleLoader>,
}

impl StaticFilterPackage {
  /// An empty package.
  pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), modules: BTreeMap::new() } }

  /// Adds a module.
  pub fn with_module(mut self, filter: impl Into<String>, module: FilterModule) -> Self {
    self.modules.insert(filter.into(), Arc::new(move || Ok(module.clone())));
    self
  }

  /// Adds a module produced by a fallible loader.
  pub fn with_loader(mut self, filter: impl Into<String>, loader: ModuleLoader) -> Self {
    self.modules.insert(filter.into(), loader);
    self
  }
}

impl Debug for StaticFilterPackage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StaticFilterPackage")
      .field("name", &self.name)
      .field("modules", &self.modules.keys().collect::<Vec<_>>())
      .finish()
  }
}

impl FilterPackage for StaticFilterPackage {
  fn name(&self) -> &str { &self.name }

  fn load(&self, filter: &str, _dir: Option<&Path>) -> std::result::Result<FilterModule, LoadFailure> {
    let loader = self.modules.get(filter).ok_or_else(|| {
      LoadFailure::NotFound(format!("{}: no module named {filter}", self.name))
    })?;
    loader().map_err(LoadFailure::Broken)
  }

  fn filter_names(&self, _dir: Option<&Path>) -> Vec<String> { self.modules.keys().cloned().collect() }
}

/// File extension of preset modules in package directories.
pub const PRESET_EXTENSION: &str = "toml";

/// A package living in a directory on disk, typically a fetched remote package.
///
/// Each `<filter>.toml` file in the directory defines a [`FilterPreset`]:
///
/// ```toml
/// filter = "bibolamazi_filters:strip"
/// options = "--fields=abstract,annote"
/// help = "Remove bulky fields"
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryFilterPackage {
  /// Package name
  name: String,
}

impl DirectoryFilterPackage {
  /// A directory package called `name`, located at `<dir>/<name>` when loaded.
  pub fn new(name: impl Into<String>) -> Self { Self { name: name.into() } }

  /// The package directory for a binding.
  fn root(&self, dir: Option<&Path>) -> std::result::Result<PathBuf, LoadFailure> {
    let dir = dir.ok_or_else(|| {
      LoadFailure::NotFound(format!("{}: package is not bound to a directory", self.name))
    })?;
    let root = dir.join(&self.name);
    if !root.is_dir() {
      return Err(LoadFailure::NotFound(format!(
        "{}: no package directory at {}",
        self.name,
        root.display()
      )));
    }
    Ok(root)
  }
}

impl FilterPackage for DirectoryFilterPackage {
  fn name(&self) -> &str { &self.name }

  fn check(&self, dir: Option<&Path>) -> std::result::Result<(), LoadFailure> {
    self.root(dir).map(|_| ())
  }

  fn load(&self, filter: &str, dir: Option<&Path>) -> std::result::Result<FilterModule, LoadFailure> {
    let path = self.root(dir)?.join(format!("{filter}.{PRESET_EXTENSION}"));
    let content = match std::fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound =>
        return Err(LoadFailure::NotFound(format!("{}: no module named {filter}", self.name))),
      Err(e) => return Err(LoadFailure::Broken(format!("{}: {e}", path.display()))),
    };
    let preset: FilterPreset = toml::from_str(&content)
      .map_err(|e| LoadFailure::Broken(format!("{}: {e}", path.display())))?;
    Ok(FilterModule { preset: Some(preset), ..FilterModule::default() })
  }

  fn filter_names(&self, dir: Option<&Path>) -> Vec<String> {
    let Ok(root) = self.root(dir) else { return Vec::new() };
    let Ok(entries) = std::fs::read_dir(root) else { return Vec::new() };
    let mut names: Vec<String> = entries
      .filter_map(|e| e.ok())
      .map(|e| e.path())
      .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(PRESET_EXTENSION))
      .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
      .collect();
    names.sort();
    names
  }
}

/// A constructed filter together with how it was invoked.
#[derive(Debug)]
pub struct FilterInstance {
  /// Name the filter was invoked by
  pub name:    String,
  /// Package that provided it
  pub package: String,
  /// Option string it was constructed from
  pub options: String,
  /// The filter itself
  pub filter:  Box<dyn Filter>,
}

impl FilterInstance {
  /// The processing mode.
  pub fn action(&self) -> FilterAction { self.filter.action() }

  /// Sub-caches the filter needs.
  pub fn cache_accessors(&self) -> Vec<CacheAccessorSpec> { self.filter.cache_accessors() }
}
