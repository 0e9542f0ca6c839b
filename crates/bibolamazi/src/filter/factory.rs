//! Filter lookup, classification and instantiation.

use std::{
  any::Any,
  panic::{self, AssertUnwindSafe},
};

use super::*;

/// How many presets may refer to one another before lookup gives up.
const MAX_PRESET_DEPTH: usize = 8;

/// A located filter, ready to parse options and be instantiated.
#[derive(Debug, Clone)]
pub struct FilterSpec {
  /// Filter name, without package qualifier
  pub name:            String,
  /// Package the filter was found in
  pub package:         String,
  /// One-line description
  pub help:            String,
  /// The filter class
  pub class:           Arc<dyn FilterClass>,
  /// Option grammar derived from the class
  pub option_spec:     OptionSpec,
  /// Whether the standard option grammar applies
  pub default_options: bool,
  /// Preset option strings applied before the user's, innermost first
  pub presets:         Vec<String>,
}

/// One row of [`FilterRegistry::list_filters`].
#[derive(Debug, Clone)]
pub struct FilterListing {
  /// Package providing the filter
  pub package: String,
  /// Filter name
  pub name:    String,
  /// Help text, or why the filter could not be loaded
  pub help:    std::result::Result<String, String>,
}

/// Known filter packages, the default search path and the resolution cache.
///
/// Owned by the [`Environment`] and passed to whatever needs to look filters up.
#[derive(Debug)]
pub struct FilterRegistry {
  /// Compiled-in packages by name
  packages:            BTreeMap<String, Arc<dyn FilterPackage>>,
  /// Search path consulted after a document's own
  default_search_path: SearchPath,
  /// Resolved filters by qualified name and search path identity
  resolved:            HashMap<(String, u64), Arc<FilterSpec>>,
}

impl Default for FilterRegistry {
  fn default() -> Self { Self::new() }
}

impl FilterRegistry {
  /// A registry knowing the built-in filter package.
  pub fn new() -> Self {
    let mut registry = Self::empty();
    registry.register_package(Arc::new(builtin_package()));
    registry
  }

  /// A registry without any package.
  pub fn empty() -> Self {
    Self {
      packages:            BTreeMap::new(),
      default_search_path: SearchPath::new(),
      resolved:            HashMap::new(),
    }
  }

  /// Registers a compiled-in package and appends it to the default search path.
  pub fn register_package(&mut self, package: Arc<dyn FilterPackage>) {
    let name = package.name().to_string();
    debug!(package = %name, "Registering filter package");
    self.packages.insert(name.clone(), package);
    self.default_search_path.append(name, None);
    self.reset();
  }

  /// Puts a package binding at the front of the default search path.
  pub fn prepend_default(&mut self, name: impl Into<String>, dir: Option<PathBuf>) {
    self.default_search_path.prepend(name, dir);
    self.reset();
  }

  /// Drops every default binding except the registered compiled-in packages.
  pub fn reset_default_search_path(&mut self) {
    let mut path = SearchPath::new();
    for entry in self.default_search_path.iter() {
      if entry.dir.is_none() && self.packages.contains_key(&entry.name) {
        path.append(entry.name.clone(), None);
      }
    }
    self.default_search_path = path;
    self.reset();
  }

  /// The search path used after a document's own.
  pub fn default_search_path(&self) -> &SearchPath { &self.default_search_path }

  /// Forgets every resolved filter, e.g. after settings changed.
  pub fn reset(&mut self) {
    if !self.resolved.is_empty() {
      debug!(count = self.resolved.len(), "Clearing filter resolution cache");
    }
    self.resolved.clear();
  }

  /// The package implementation behind a binding: compiled-in first, then a directory.
  fn package_for(&self, entry: &SearchPathEntry) -> Option<Arc<dyn FilterPackage>> {
    if let Some(package) = self.packages.get(&entry.name) {
      return Some(package.clone());
    }
    entry.dir.as_ref().map(|_| Arc::new(DirectoryFilterPackage::new(&entry.name)) as Arc<dyn FilterPackage>)
  }

  /// Checks that a package can be used with the given directory binding.
  pub fn check_package(&self, name: &str, dir: Option<&Path>) -> Result<()> {
    let entry = SearchPathEntry { name: name.to_string(), dir: dir.map(Path::to_path_buf) };
    let package = self.package_for(&entry).ok_or_else(|| BibolamaziError::FilterPackageNotFound {
      name:    name.to_string(),
      reasons: vec![format!("{name}: not a known package and no directory given")],
    })?;
    package.check(dir).map_err(|failure| BibolamaziError::FilterPackageNotFound {
      name:    name.to_string(),
      reasons: vec![failure.to_string()],
    })
  }

  /// Locates a filter on `search_path` followed by the default search path.
  ///
  /// `name` may be qualified as `package:filter`, restricting the lookup to that package.
  pub fn resolve(&mut self, name: &str, search_path: &SearchPath) -> Result<Arc<FilterSpec>> {
    let path = search_path.chain(&self.default_search_path);
    self.resolve_in(name, &path, None)
  }

  /// Locates a filter on exactly `path`, optionally forcing the package.
  pub fn resolve_in(
    &mut self,
    name: &str,
    path: &SearchPath,
    package: Option<&str>,
  ) -> Result<Arc<FilterSpec>> {
    self.resolve_depth(name, path, package, 0)
  }

  /// [`FilterRegistry::resolve_in`] tracking how deep preset chains go.
  #[instrument(skip(self, path), level = "debug")]
  fn resolve_depth(
    &mut self,
    name: &str,
    path: &SearchPath,
    package: Option<&str>,
    depth: usize,
  ) -> Result<Arc<FilterSpec>> {
    if package.is_none() {
      if let Some((package, filter)) = name.split_once(':') {
        return self.resolve_depth(filter, path, Some(package), depth);
      }
    }

    let cache_key = (format!("{}:{name}", package.unwrap_or_default()), path.identity());
    if let Some(spec) = self.resolved.get(&cache_key) {
      trace!("Using cached filter resolution");
      return Ok(spec.clone());
    }

    let candidates: Vec<SearchPathEntry> = match package {
      Some(package) => {
        let entry = path
          .get(package)
          .cloned()
          .unwrap_or_else(|| SearchPathEntry { name: package.to_string(), dir: None });
        self.check_package(&entry.name, entry.dir.as_deref())?;
        vec![entry]
      },
      None => path.iter().cloned().collect(),
    };

    let mut reasons = Vec::new();
    for entry in candidates {
      let Some(filter_package) = self.package_for(&entry) else {
        debug!(package = %entry.name, "No such filter package");
        reasons.push(format!("{}: no such filter package", entry.name));
        continue;
      };

      let dir = entry.dir.as_deref();
      let loaded = panic::catch_unwind(AssertUnwindSafe(|| filter_package.load(name, dir)))
        .unwrap_or_else(|payload| Err(LoadFailure::Broken(panic_message(payload.as_ref()))));
      match loaded {
        Ok(module) => {
          let spec = Arc::new(self.build_spec(name, &entry.name, module, path, depth)?);
          debug!(filter = %name, package = %entry.name, "Resolved filter");
          self.resolved.insert(cache_key, spec.clone());
          return Ok(spec);
        },
        Err(LoadFailure::NotFound(reason)) => {
          debug!(package = %entry.name, %reason, "Filter not in package");
          reasons.push(reason);
        },
        Err(failure @ LoadFailure::Broken(_)) => {
          warn!(filter = %name, package = %entry.name, %failure, "Filter module failed to load");
          reasons.push(format!("{}: {name}: {failure}", entry.name));
        },
      }
    }

    let name = match package {
      Some(package) => format!("{package}:{name}"),
      None => name.to_string(),
    };
    Err(BibolamaziError::FilterNotFound { name, reasons })
  }

  /// Turns a loaded module into a spec, following presets.
  fn build_spec(
    &mut self,
    name: &str,
    package: &str,
    module: FilterModule,
    path: &SearchPath,
    depth: usize,
  ) -> Result<FilterSpec> {
    if let Some(preset) = module.preset {
      if depth >= MAX_PRESET_DEPTH {
        return Err(BibolamaziError::FilterSpecification {
          filter:  name.to_string(),
          message: format!("preset chain through \"{}\" is too deep", preset.filter),
        });
      }
      let target = self.resolve_depth(&preset.filter, path, None, depth + 1)?;
      let mut spec = (*target).clone();
      spec.presets.push(preset.options);
      spec.name = name.to_string();
      spec.package = package.to_string();
      if let Some(help) = preset.help {
        spec.help = help;
      }
      return Ok(spec);
    }

    let class = classify(name, module)?;
    let option_spec = build_option_spec(class.as_ref())?;
    Ok(FilterSpec {
      name: name.to_string(),
      package: package.to_string(),
      help: class.help().to_string(),
      default_options: class.uses_default_options(),
      class,
      option_spec,
      presets: Vec::new(),
    })
  }

  /// Parses an option string for a resolved filter, preset options first.
  pub fn parse_args(&self, spec: &FilterSpec, options: &str) -> Result<FilterArgs> {
    if !spec.default_options {
      return spec.class.parse_options(options).map_err(|message| BibolamaziError::OptionParse {
        filter: spec.name.clone(),
        fragment: options.to_string(),
        message,
      });
    }

    let custom = spec.class.custom_types();
    let mut args = FilterArgs::new();
    for preset in &spec.presets {
      args.merge(parse_option_tokens(&spec.option_spec, &custom, preset)?);
    }
    args.merge(parse_option_tokens(&spec.option_spec, &custom, options)?);
    check_required(&spec.option_spec, &args)?;
    Ok(args)
  }

  /// Checks arguments against the constructor signature, fills in defaults and constructs.
  ///
  /// Malformed calls are reported as option errors; failures inside the constructor (errors
  /// and panics alike) become [`BibolamaziError::FilterConstruction`].
  #[instrument(skip(self, spec, args), fields(filter = %spec.name), level = "debug")]
  pub fn instantiate(&self, spec: &FilterSpec, mut args: FilterArgs) -> Result<FilterInstance> {
    let signature = spec.class.signature();
    let call_error = |fragment: &str, message: String| BibolamaziError::OptionParse {
      filter: spec.name.clone(),
      fragment: fragment.to_string(),
      message,
    };

    if let Some(extra) = args.positional.first() {
      if !signature.var_args {
        return Err(call_error(&extra.to_string(), "unexpected positional argument".into()));
      }
    }
    if !signature.var_kwargs {
      if let Some(unknown) = args.keywords.keys().find(|k| signature.param(k).is_none()) {
        return Err(call_error(unknown, format!("unexpected keyword argument `{unknown}`")));
      }
    }
    for param in &signature.params {
      if args.keywords.contains_key(&param.name) {
        continue;
      }
      match &param.default {
        Some(default) => {
          args.keywords.insert(param.name.clone(), default.clone());
        },
        None =>
          return Err(call_error(&param.name, format!("missing required argument `{}`", param.name))),
      }
    }

    let class = spec.class.clone();
    let constructed = panic::catch_unwind(AssertUnwindSafe(move || class.construct(args)));
    let filter = match constructed {
      Ok(Ok(filter)) => filter,
      Ok(Err(FilterError::Interrupted)) => return Err(BibolamaziError::Interrupted),
      Ok(Err(e)) =>
        return Err(BibolamaziError::FilterConstruction {
          filter:  spec.name.clone(),
          kind:    e.kind().to_string(),
          message: e.to_string(),
        }),
      Err(payload) =>
        return Err(BibolamaziError::FilterConstruction {
          filter:  spec.name.clone(),
          kind:    "panic".to_string(),
          message: panic_message(payload.as_ref()),
        }),
    };

    Ok(FilterInstance {
      name: spec.name.clone(),
      package: spec.package.clone(),
      options: String::new(),
      filter,
    })
  }

  /// Resolves, parses options and instantiates in one go.
  pub fn make_filter(
    &mut self,
    name: &str,
    options: &str,
    search_path: &SearchPath,
  ) -> Result<FilterInstance> {
    let spec = self.resolve(name, search_path)?;
    let args = self.parse_args(&spec, options)?;
    let mut instance = self.instantiate(&spec, args)?;
    instance.options = options.to_string();
    Ok(instance)
  }

  /// Every filter reachable from `search_path` and the default search path.
  ///
  /// A filter name provided by several packages is listed once, for the package that wins.
  pub fn list_filters(&mut self, search_path: &SearchPath) -> Vec<FilterListing> {
    let path = search_path.chain(&self.default_search_path);
    let mut seen = HashSet::new();
    let mut listings = Vec::new();
    for entry in path.iter() {
      let Some(package) = self.package_for(entry) else { continue };
      for name in package.filter_names(entry.dir.as_deref()) {
        if !seen.insert(name.clone()) {
          continue;
        }
        let help = self
          .resolve_in(&name, &path, Some(&entry.name))
          .map(|spec| spec.help.clone())
          .map_err(|e| e.to_string());
        listings.push(FilterListing { package: entry.name.clone(), name, help });
      }
    }
    listings
  }
}

/// Best-effort description of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "panic with a non-string payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  #[derive(Debug)]
  struct Failing;

  impl FilterClass for Failing {
    fn name(&self) -> &str { "failing" }

    fn help(&self) -> &str { "Always fails to construct" }

    fn signature(&self) -> Signature { Signature::new(vec![Param::optional("mode", "error")]) }

    fn construct(&self, args: FilterArgs) -> FilterResult<Box<dyn Filter>> {
      match args.get_str("mode").as_deref() {
        Some("panic") => panic!("constructor exploded"),
        _ => Err(FilterError::failed("bad configuration")),
      }
    }
  }

  fn test_package() -> StaticFilterPackage {
    StaticFilterPackage::new("extra")
      .with_module("failing", FilterModule::with_class(Arc::new(Failing)))
      .with_loader("broken", Arc::new(|| Err("syntax error in module".to_string())))
      .with_loader("exploding", Arc::new(|| panic!("load-time panic")))
  }

  #[traced_test]
  #[test]
  fn test_builtin_filters_resolve_by_default() {
    let mut registry = FilterRegistry::new();
    let spec = registry.resolve("strip", &SearchPath::new()).unwrap();
    assert_eq!(spec.package, BUILTIN_PACKAGE);
    let qualified = registry.resolve("bibolamazi_filters:strip", &SearchPath::new()).unwrap();
    assert_eq!(qualified.name, "strip");
  }

  #[traced_test]
  #[test]
  fn test_not_found_aggregates_every_candidate() {
    let mut registry = FilterRegistry::new();
    registry.register_package(Arc::new(test_package()));

    let err = registry.resolve("broken", &SearchPath::new()).unwrap_err();
    let BibolamaziError::FilterNotFound { reasons, .. } = &err else { panic!("unexpected {err:?}") };
    assert_eq!(reasons.len(), 2);
    assert!(reasons.iter().any(|r| r.contains("no module named broken")));
    assert!(reasons.iter().any(|r| r.contains("syntax error in module")));
    assert!(logs_contain("Filter module failed to load"));

    let err = registry.resolve("exploding", &SearchPath::new()).unwrap_err();
    assert!(err.to_string().contains("load-time panic"));
  }

  #[traced_test]
  #[test]
  fn test_unknown_explicit_package() {
    let mut registry = FilterRegistry::new();
    let err = registry.resolve("nowhere:strip", &SearchPath::new()).unwrap_err();
    assert!(matches!(err, BibolamaziError::FilterPackageNotFound { .. }));
  }

  #[traced_test]
  #[test]
  fn test_resolution_is_cached_until_reset() {
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();
    let package = StaticFilterPackage::new("counted").with_loader(
      "once",
      Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(strip_module())
      }),
    );
    let mut registry = FilterRegistry::empty();
    registry.register_package(Arc::new(package));

    registry.resolve("once", &SearchPath::new()).unwrap();
    registry.resolve("once", &SearchPath::new()).unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    registry.reset();
    registry.resolve("once", &SearchPath::new()).unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
  }

  #[traced_test]
  #[test]
  fn test_construction_failures_are_reported_distinctly() {
    let mut registry = FilterRegistry::new();
    registry.register_package(Arc::new(test_package()));

    let err = registry.make_filter("failing", "", &SearchPath::new()).unwrap_err();
    match err {
      BibolamaziError::FilterConstruction { filter, kind, message } => {
        assert_eq!(filter, "failing");
        assert_eq!(kind, "FilterError");
        assert_eq!(message, "bad configuration");
      },
      other => panic!("unexpected {other:?}"),
    }

    let err = registry.make_filter("failing", "--mode=panic", &SearchPath::new()).unwrap_err();
    assert!(matches!(err, BibolamaziError::FilterConstruction { ref kind, .. } if kind == "panic"));

    // malformed calls never reach the constructor
    let err = registry.make_filter("failing", "--other=1", &SearchPath::new()).unwrap_err();
    assert!(matches!(err, BibolamaziError::OptionParse { .. }));
  }

  #[traced_test]
  #[test]
  fn test_instantiate_checks_the_call_shape() {
    let mut registry = FilterRegistry::new();
    let spec = registry.resolve("strip", &SearchPath::new()).unwrap();

    let mut positional = FilterArgs::new();
    positional.positional.push(ArgValue::Str("x".into()));
    assert!(matches!(registry.instantiate(&spec, positional), Err(BibolamaziError::OptionParse { .. })));

    let unknown = FilterArgs::new().with("nonsense", "1");
    assert!(matches!(registry.instantiate(&spec, unknown), Err(BibolamaziError::OptionParse { .. })));

    assert!(registry.instantiate(&spec, FilterArgs::new()).is_ok());
  }

  #[traced_test]
  #[test]
  fn test_directory_presets_layer_options() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mypkg");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(
      root.join("tidy.toml"),
      "filter = \"bibolamazi_filters:strip\"\noptions = \"--fields=note\"\nhelp = \"Tidy up\"\n",
    )
    .unwrap();
    std::fs::write(root.join("loop.toml"), "filter = \"mypkg:loop\"\n").unwrap();

    let mut path = SearchPath::new();
    path.prepend("mypkg", Some(dir.path().to_path_buf()));
    let mut registry = FilterRegistry::new();
    registry.check_package("mypkg", Some(dir.path())).unwrap();

    let spec = registry.resolve("tidy", &path).unwrap();
    assert_eq!(spec.package, "mypkg");
    assert_eq!(spec.help, "Tidy up");
    let args = registry.parse_args(&spec, "").unwrap();
    assert_eq!(args.get_list("fields"), Some(vec!["note".to_string()]));
    let args = registry.parse_args(&spec, "--fields=abstract").unwrap();
    assert_eq!(args.get_list("fields"), Some(vec!["abstract".to_string()]));

    let err = registry.resolve("loop", &path).unwrap_err();
    assert!(matches!(err, BibolamaziError::FilterSpecification { .. }));

    let listed = registry.list_filters(&path);
    assert!(listed.iter().any(|l| l.name == "tidy" && l.package == "mypkg"));
    assert!(listed.iter().any(|l| l.name == "strip" && l.package == BUILTIN_PACKAGE));
  }
}
