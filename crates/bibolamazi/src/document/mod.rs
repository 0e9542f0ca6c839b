//! A bibolamazi document: configuration, sources, filters and cache.
//!
//! Opening a document parses its configuration block, executes the commands in order
//! (recording sources, binding filter packages and instantiating filters), merges the sources
//! and loads the cache sidecar. [`Document::run`] then applies the filters in declared order,
//! and [`Document::save`] writes the result back together with the cache.
//!
//! Errors from configuration and sources carry the line they originate from (see
//! [`BibolamaziError::line`]).

use std::{
  backtrace::Backtrace,
  cell::{Cell, RefCell},
  panic::{self, AssertUnwindSafe},
  sync::Once,
};

use super::*;

mod config;
mod source;

pub use config::*;
pub use source::*;

/// Version tag of caches written by this build. A different tag discards the cache.
pub const CACHE_VERSION: &str = env!("CARGO_PKG_VERSION");

lazy_static! {
  static ref FILTER_NAME: Regex = Regex::new(r"^(?:[\w.]+:)?[\w.]+").expect("valid regex");
  static ref PACKAGE_NAME: Regex = Regex::new(r"^[\w.]+$").expect("valid regex");
}

thread_local! {
  /// Set while filter code runs on this thread.
  static CAPTURING: Cell<bool> = const { Cell::new(false) };
  /// Trace of the last filter panic on this thread, taken where the panic happened.
  static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Installs the panic hook that records filter panic traces, once per process.
static PANIC_HOOK: Once = Once::new();

/// A filter of the pipeline and the line that declared it.
#[derive(Debug)]
struct RegisteredFilter {
  /// The filter
  instance: FilterInstance,
  /// Line of the `filter:` command
  line:     usize,
}

/// Takes the place of a filter in the pipeline while it runs.
#[derive(Debug)]
struct RunningFilter {
  /// Processing mode of the running filter
  action:    FilterAction,
  /// Its sub-caches
  accessors: Vec<CacheAccessorSpec>,
}

impl Filter for RunningFilter {
  fn action(&self) -> FilterAction { self.action }

  fn cache_accessors(&self) -> Vec<CacheAccessorSpec> { self.accessors.clone() }
}

/// An open document.
#[derive(Debug)]
pub struct Document {
  /// File the document was read from
  path:         PathBuf,
  /// Text around the configuration block
  text:         DocumentText,
  /// Parsed commands
  commands:     Vec<Command>,
  /// Packages declared by `package:` commands, most recent first
  search_path:  SearchPath,
  /// Filter pipeline
  filters:      Vec<RegisteredFilter>,
  /// Declared sources
  sources:      Vec<SourceList>,
  /// Merged entries
  bibliography: Bibliography,
  /// Persistent cache
  cache:        RootCache,
  /// Whether the cache sidecar was loaded
  cache_loaded: bool,
  /// Sub-cache accessors requested by the filters, by name
  accessors:    BTreeMap<String, CacheAccessor>,
  /// Known bibliography formats
  formats:      FormatRegistry,
  /// Stops the run when set
  interrupt:    InterruptHandle,
}

impl Document {
  /// Opens a document: parses it, executes its commands, merges sources and loads the cache.
  #[instrument(skip_all, fields(path = %path.as_ref().display()))]
  pub async fn open(path: impl AsRef<Path>, env: &mut Environment) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let content = tokio::fs::read_to_string(&path).await?;
    let text = DocumentText::parse(&content)?;
    let mut document = Self {
      path,
      text,
      commands: Vec::new(),
      search_path: SearchPath::new(),
      filters: Vec::new(),
      sources: Vec::new(),
      bibliography: Bibliography::new(),
      cache: RootCache::with_expiry(CACHE_VERSION, env.settings().cache_expiry()),
      cache_loaded: false,
      accessors: BTreeMap::new(),
      formats: env.formats.clone(),
      interrupt: env.interrupt.clone(),
    };
    document.configure(env).await?;
    Ok(document)
  }

  /// Replaces the configuration block and reconfigures the document from scratch.
  ///
  /// The cache is kept; sources are read again.
  pub async fn set_config_text(&mut self, config: &str, env: &mut Environment) -> Result<()> {
    self.text.config_lines = config.lines().map(str::to_string).collect();
    self.configure(env).await
  }

  /// Parses and executes the configuration, then loads sources and the cache.
  async fn configure(&mut self, env: &mut Environment) -> Result<()> {
    self.commands = parse_config(&self.text.config_lines, self.text.config_start)?;
    self.search_path = SearchPath::new();
    self.filters.clear();
    self.sources.clear();
    self.accessors.clear();
    self.bibliography = Bibliography::new();

    // all `src:` commands precede the first `filter:`, so entries are known before any filter
    // initializes its sub-caches
    let mut inputs_loaded = false;
    for command in self.commands.clone() {
      if command.kind == CommandKind::Filter && !inputs_loaded {
        self.load_inputs(env).await?;
        inputs_loaded = true;
      }
      trace!(kind = %command.kind, line = command.start_line, "Executing command");
      self.execute(&command, env).await.map_err(|e| e.at_line(command.start_line))?;
    }
    if !inputs_loaded {
      self.load_inputs(env).await?;
    }
    info!(entries = self.bibliography.len(), filters = self.filters.len(), "Document ready");
    Ok(())
  }

  /// Merges the sources and, the first time, loads the cache sidecar.
  async fn load_inputs(&mut self, env: &Environment) -> Result<()> {
    self.load_sources().await?;
    if !self.cache_loaded {
      self.cache = RootCache::load(&self.cache_path(), CACHE_VERSION, env.settings().cache_expiry());
      self.cache_loaded = true;
    }
    Ok(())
  }

  /// Executes one command.
  async fn execute(&mut self, command: &Command, env: &mut Environment) -> Result<()> {
    match command.kind {
      CommandKind::Src => {
        self.sources.push(SourceList::parse(&command.text, command.start_line)?);
        Ok(())
      },
      CommandKind::Package => self.add_package(command.text.trim(), env).await,
      CommandKind::Filter => {
        let text = command.text.trim();
        let name = FILTER_NAME
          .find(text)
          .map(|m| m.as_str())
          .filter(|name| text[name.len()..].chars().next().map_or(true, char::is_whitespace))
          .ok_or_else(|| BibolamaziError::ConfigParse(format!("invalid filter name in `filter: {text}`")))?;
        let options = text[name.len()..].trim();
        let instance = env.registry.make_filter(name, options, &self.search_path)?;
        self.register_filter(instance, command.start_line)
      },
    }
  }

  /// Binds a filter package given as `name`, `name=dir` or a location.
  ///
  /// For `name=dir`, the package lives in `dir/name`. A location (a path or a remote URL)
  /// designates the package directory itself and the package takes its name.
  async fn add_package(&mut self, argument: &str, env: &mut Environment) -> Result<()> {
    let (name, dir) = match argument.split_once('=') {
      Some((name, dir)) if PACKAGE_NAME.is_match(name.trim()) =>
        (name.trim().to_string(), Some(self.base_dir().join(dir.trim()))),
      _ if PACKAGE_NAME.is_match(argument) && !self.base_dir().join(argument).is_dir() =>
        (argument.to_string(), None),
      _ => {
        let location = match local_path(argument) {
          Some(path) if path.is_relative() => self.base_dir().join(path).to_string_lossy().into_owned(),
          _ => argument.to_string(),
        };
        let (name, dir) = env.packages.resolve(&location).await?;
        (name, Some(dir))
      },
    };
    env.registry.check_package(&name, dir.as_deref())?;
    debug!(package = %name, dir = ?dir, "Added filter package");
    self.search_path.prepend(name, dir);
    Ok(())
  }

  /// Appends a filter to the pipeline, wiring the sub-caches it needs.
  fn register_filter(&mut self, instance: FilterInstance, line: usize) -> Result<()> {
    for spec in instance.cache_accessors() {
      let accessor = self.accessors.entry(spec.name.clone()).or_insert_with(|| CacheAccessor::new(spec));
      if self.cache_loaded {
        accessor.initialize(&mut self.cache, &self.bibliography)?;
      }
    }
    debug!(filter = %instance.name, package = %instance.package, line, "Registered filter");
    self.filters.push(RegisteredFilter { instance, line });
    Ok(())
  }

  /// Initializes every accessor that was not initialized yet.
  fn initialize_accessors(&mut self) -> Result<()> {
    for accessor in self.accessors.values_mut() {
      accessor.initialize(&mut self.cache, &self.bibliography)?;
    }
    Ok(())
  }

  /// Reads and merges the declared sources.
  pub async fn load_sources(&mut self) -> Result<()> {
    let base_dir = self.base_dir();
    let merged = load_sources(&mut self.sources, &base_dir, &self.formats).await?;
    self.bibliography = merged.bibliography;
    Ok(())
  }

  /// Runs the filters in declared order.
  ///
  /// Stops at the first failing filter. Errors carry the line of the failing `filter:`
  /// command, except interruptions which are returned as is.
  #[instrument(skip(self), fields(path = %self.path.display()))]
  pub fn run(&mut self) -> Result<()> {
    self.initialize_accessors()?;
    self.run_filters()
  }

  /// Runs each filter, converting failures at the filter boundary.
  fn run_filters(&mut self) -> Result<()> {
    for index in 0..self.filters.len() {
      if self.interrupt.is_interrupted() {
        return Err(BibolamaziError::Interrupted);
      }
      let Some(registered) = self.filters.get_mut(index) else { break };
      let (name, line) = (registered.instance.name.clone(), registered.line);
      info!(filter = %name, action = %registered.instance.action(), "Running filter");

      // the pipeline keeps a stand-in so document filters still see every filter
      let filter = &mut registered.instance.filter;
      let stand_in = RunningFilter { action: filter.action(), accessors: filter.cache_accessors() };
      let mut filter = std::mem::replace(filter, Box::new(stand_in));
      let outcome = catch_filter_panic(|| self.apply(filter.as_mut()));
      if let Some(registered) = self.filters.get_mut(index) {
        registered.instance.filter = filter;
      }

      let result = match outcome {
        Ok(result) => result.map_err(|e| convert_filter_error(&name, e)),
        Err((message, trace)) => Err(BibolamaziError::InternalFilter {
          filter: name.clone(),
          message: format!("panicked: {message}"),
          trace,
        }),
      };
      match result {
        Ok(()) => {},
        Err(e) if e.is_interrupted() => return Err(BibolamaziError::Interrupted),
        Err(e) => return Err(e.at_line(line)),
      }
    }
    Ok(())
  }

  /// Hands the document, the entry collection or each entry to a filter.
  fn apply(&mut self, filter: &mut dyn Filter) -> FilterResult<()> {
    match filter.action() {
      FilterAction::Document => filter.filter_document(self),
      FilterAction::Bibliography => {
        let (bibliography, mut ctx) = self.parts_mut();
        filter.filter_bibliography(bibliography, &mut ctx)
      },
      FilterAction::Entry => {
        let (bibliography, mut ctx) = self.parts_mut();
        for entry in bibliography.iter_mut() {
          ctx.check_interrupt()?;
          filter.filter_entry(entry, &mut ctx)?;
        }
        Ok(())
      },
    }
  }

  /// The entries together with a filter context, for document filters that process entries.
  pub fn parts_mut(&mut self) -> (&mut Bibliography, FilterContext<'_>) {
    let caches = Caches::new(&mut self.cache, &self.accessors);
    (&mut self.bibliography, FilterContext::new(caches, self.interrupt.clone()))
  }

  /// The document as text: header, configuration block and the serialized entries.
  pub fn render(&self) -> String {
    let format = self.formats.for_path(&self.path.to_string_lossy());
    self.text.render(&format.serialize(&self.bibliography))
  }

  /// Writes the document and its cache sidecar. Failing to save the cache is not an error.
  #[instrument(skip(self), fields(path = %self.path.display()))]
  pub fn save(&self) -> Result<()> {
    std::fs::write(&self.path, self.render())?;
    if let Err(e) = self.cache.save(&self.cache_path()) {
      debug!(error = %e, "Could not save cache");
    }
    info!("Saved document");
    Ok(())
  }

  /// File the document was read from.
  pub fn path(&self) -> &Path { &self.path }

  /// Directory relative paths are resolved against.
  pub fn base_dir(&self) -> PathBuf { self.path.parent().map(Path::to_path_buf).unwrap_or_default() }

  /// Location of the cache sidecar.
  pub fn cache_path(&self) -> PathBuf { cache_path_for(&self.path) }

  /// The raw configuration block.
  pub fn config_text(&self) -> String { self.text.config_text() }

  /// Parsed commands.
  pub fn commands(&self) -> &[Command] { &self.commands }

  /// Packages declared by the document.
  pub fn search_path(&self) -> &SearchPath { &self.search_path }

  /// Declared sources, with the alternative that was read.
  pub fn sources(&self) -> &[SourceList] { &self.sources }

  /// The filter pipeline.
  pub fn filters(&self) -> impl Iterator<Item = &FilterInstance> { self.filters.iter().map(|f| &f.instance) }

  /// The merged entries.
  pub fn bibliography(&self) -> &Bibliography { &self.bibliography }

  /// The merged entries, mutably.
  pub fn bibliography_mut(&mut self) -> &mut Bibliography { &mut self.bibliography }

  /// The persistent cache.
  pub fn cache(&self) -> &RootCache { &self.cache }

  /// The persistent cache, mutably.
  pub fn cache_mut(&mut self) -> &mut RootCache { &mut self.cache }

  /// The interruption flag of this document.
  pub fn interrupt_handle(&self) -> InterruptHandle { self.interrupt.clone() }
}

/// Runs filter code, returning the panic message and the trace of the panic site if it panics.
fn catch_filter_panic<R>(f: impl FnOnce() -> R) -> std::result::Result<R, (String, String)> {
  PANIC_HOOK.call_once(|| {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
      if CAPTURING.with(Cell::get) {
        let trace = Backtrace::force_capture().to_string();
        PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
      } else {
        previous(info);
      }
    }));
  });

  let outer = CAPTURING.with(|capturing| capturing.replace(true));
  let result = panic::catch_unwind(AssertUnwindSafe(f));
  CAPTURING.with(|capturing| capturing.set(outer));
  result.map_err(|payload| {
    let trace = PANIC_TRACE
      .with(|slot| slot.borrow_mut().take())
      .unwrap_or_else(|| Backtrace::force_capture().to_string());
    (panic_message(payload.as_ref()), trace)
  })
}

/// Converts an error returned by a running filter.
fn convert_filter_error(filter: &str, error: FilterError) -> BibolamaziError {
  match error {
    FilterError::Failed(message) => BibolamaziError::FilterFailed { filter: filter.to_string(), message },
    FilterError::Interrupted => BibolamaziError::Interrupted,
    other => BibolamaziError::InternalFilter {
      filter:  filter.to_string(),
      message: other.to_string(),
      trace:   Backtrace::force_capture().to_string(),
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn environment(dir: &Path, package: StaticFilterPackage) -> Environment {
    Environment::builder()
      .settings(Settings { package_cache_dir: Some(dir.join("packages")), ..Settings::default() })
      .filter_package(Arc::new(package))
      .build()
      .unwrap()
  }

  fn write_document(dir: &Path, config: &str) -> PathBuf {
    std::fs::write(dir.join("refs.json"), r#"{"a": {"title": "Alpha"}, "b": {"title": "Beta"}}"#).unwrap();
    let path = dir.join("doc.bibolamazi.json");
    let config: String = config.lines().map(|l| format!("% {l}\n")).collect();
    std::fs::write(&path, format!("Generated bibliography\n{CONFIG_BEGIN}\n{config}{CONFIG_END}\n")).unwrap();
    path
  }

  #[inline(never)]
  fn explode_on_entry(_: &mut Entry, _: &FilterArgs) -> FilterResult<()> { panic!("exploded") }

  fn failing_package() -> StaticFilterPackage {
    StaticFilterPackage::new("testing")
      .with_module(
        "fail",
        FilterModule::with_function(
          SimpleFunction::entry(|_, _| Err(FilterError::failed("nope"))),
          Vec::new(),
          "Always fails.",
        ),
      )
      .with_module(
        "boom",
        FilterModule::with_function(
          SimpleFunction::entry(explode_on_entry),
          Vec::new(),
          "Always panics.",
        ),
      )
      .with_module(
        "odd",
        FilterModule::with_function(
          SimpleFunction::entry(|_, _| Err(FilterError::other(std::fmt::Error))),
          Vec::new(),
          "Fails unexpectedly.",
        ),
      )
      .with_module(
        "count",
        FilterModule::with_function(
          SimpleFunction::document(|doc, _| {
            let total = doc.bibliography().len().to_string();
            for entry in doc.bibliography_mut().iter_mut() {
              entry.set_field("total", total.clone());
            }
            Ok(())
          }),
          Vec::new(),
          "Stamps the entry count.",
        ),
      )
      .with_module(
        "pipeline",
        FilterModule::with_function(
          SimpleFunction::document(|doc, _| {
            let names: Vec<String> = doc.filters().map(|f| format!("{}:{}", f.name, f.action())).collect();
            let names = names.join(",");
            for entry in doc.bibliography_mut().iter_mut() {
              entry.set_field("pipeline", names.clone());
            }
            Ok(())
          }),
          Vec::new(),
          "Lists the pipeline.",
        ),
      )
  }

  #[traced_test]
  #[tokio::test]
  async fn test_open_run_and_save() {
    let dir = tempdir().unwrap();
    let mut env = environment(dir.path(), failing_package());
    let path = write_document(dir.path(), "src: refs.json\nfilter: fieldset --field=note --value=seen\nfilter: count");

    let mut doc = Document::open(&path, &mut env).await.unwrap();
    assert_eq!(doc.sources()[0].used.as_deref(), Some("refs.json"));
    assert_eq!(doc.filters().map(|f| f.name.as_str()).collect::<Vec<_>>(), vec!["fieldset", "count"]);
    doc.run().unwrap();
    assert_eq!(doc.bibliography().get("a").unwrap().field("note"), Some("seen"));
    assert_eq!(doc.bibliography().get("b").unwrap().field("total"), Some("2"));

    doc.save().unwrap();
    let saved = std::fs::read_to_string(&path).unwrap();
    assert!(saved.starts_with("Generated bibliography\n"));
    assert!(saved.contains("\"note\": \"seen\""));
    assert!(doc.cache_path().is_file());

    // the saved document opens again with the same configuration
    let reopened = Document::open(&path, &mut env).await.unwrap();
    assert_eq!(reopened.config_text(), doc.config_text());
  }

  #[tokio::test]
  async fn test_configuration_errors_carry_lines() {
    let dir = tempdir().unwrap();
    let mut env = environment(dir.path(), failing_package());

    let path = write_document(dir.path(), "src: refs.json\n\nfilter: nosuchfilter");
    let err = Document::open(&path, &mut env).await.unwrap_err();
    assert_eq!(err.line(), Some(5));
    assert!(matches!(err.root(), BibolamaziError::FilterNotFound { .. }));

    let path = write_document(dir.path(), "src: refs.json\nfilter: fieldset --field=x");
    let err = Document::open(&path, &mut env).await.unwrap_err();
    assert_eq!(err.line(), Some(4));
    assert!(matches!(err.root(), BibolamaziError::OptionParse { .. }));

    let path = write_document(dir.path(), "src: refs.json\nfilter: bad/name");
    let err = Document::open(&path, &mut env).await.unwrap_err();
    assert!(matches!(err.root(), BibolamaziError::ConfigParse(_)));
  }

  #[tokio::test]
  async fn test_filter_failures_are_classified() {
    let dir = tempdir().unwrap();
    let mut env = environment(dir.path(), failing_package());

    let path = write_document(dir.path(), "src: refs.json\nfilter: fail");
    let err = Document::open(&path, &mut env).await.unwrap().run().unwrap_err();
    assert_eq!(err.line(), Some(4));
    assert!(matches!(err.root(), BibolamaziError::FilterFailed { message, .. } if message == "nope"));

    let path = write_document(dir.path(), "src: refs.json\nfilter: odd");
    let err = Document::open(&path, &mut env).await.unwrap().run().unwrap_err();
    assert!(matches!(err.root(), BibolamaziError::InternalFilter { filter, .. } if filter == "odd"));

    let path = write_document(dir.path(), "src: refs.json\nfilter: boom");
    let err = Document::open(&path, &mut env).await.unwrap().run().unwrap_err();
    match err.root() {
      BibolamaziError::InternalFilter { message, trace, .. } => {
        assert!(message.contains("exploded"));
        assert!(trace.contains("explode_on_entry"), "trace does not reach the filter:\n{trace}");
      },
      other => panic!("unexpected error {other:?}"),
    }

    // panics outside filters still reach the usual hook and leave nothing behind
    assert!(PANIC_TRACE.with(|slot| slot.borrow().is_none()));
    assert!(!CAPTURING.with(Cell::get));
  }

  #[tokio::test]
  async fn test_document_filters_see_the_whole_pipeline() {
    let dir = tempdir().unwrap();
    let mut env = environment(dir.path(), failing_package());
    let path = write_document(dir.path(), "src: refs.json\nfilter: strip\nfilter: pipeline\nfilter: count");

    let mut doc = Document::open(&path, &mut env).await.unwrap();
    doc.run().unwrap();
    let pipeline = doc.bibliography().get("a").unwrap().field("pipeline").map(str::to_string);
    assert_eq!(pipeline.as_deref(), Some("strip:entry,pipeline:document,count:document"));

    // every filter is back in place after the run
    assert_eq!(doc.filters().count(), 3);
    assert!(doc.filters().all(|f| !format!("{:?}", f.filter).contains("RunningFilter")));
  }

  #[tokio::test]
  async fn test_interruption_is_not_wrapped() {
    let dir = tempdir().unwrap();
    let mut env = environment(dir.path(), failing_package());
    let path = write_document(dir.path(), "src: refs.json\nfilter: strip");
    let mut doc = Document::open(&path, &mut env).await.unwrap();

    doc.interrupt_handle().interrupt();
    let err = doc.run().unwrap_err();
    assert!(matches!(err, BibolamaziError::Interrupted));
    assert_eq!(err.line(), None);
  }

  #[tokio::test]
  async fn test_packages_by_directory() {
    let dir = tempdir().unwrap();
    let pkg_dir = dir.path().join("mine");
    std::fs::create_dir_all(&pkg_dir).unwrap();
    std::fs::write(pkg_dir.join("tagged.toml"), "filter = \"fieldset\"\noptions = \"--field=tag --value=t\"\n")
      .unwrap();
    let mut env = environment(dir.path(), failing_package());

    let path = write_document(dir.path(), "src: refs.json\npackage: mine\nfilter: tagged");
    let mut doc = Document::open(&path, &mut env).await.unwrap();
    assert_eq!(doc.search_path().names().collect::<Vec<_>>(), vec!["mine"]);
    doc.run().unwrap();
    assert_eq!(doc.bibliography().get("a").unwrap().field("tag"), Some("t"));

    let path = write_document(dir.path(), "src: refs.json\npackage: mine=.\nfilter: mine:tagged");
    assert!(Document::open(&path, &mut env).await.is_ok());

    let path = write_document(dir.path(), "src: refs.json\npackage: https://example.org/p.zip");
    let err = Document::open(&path, &mut env).await.unwrap_err();
    assert!(matches!(err.root(), BibolamaziError::RemotePackagesDisabled(_)));
  }

  #[tokio::test]
  async fn test_set_config_text_reconfigures() {
    let dir = tempdir().unwrap();
    let mut env = environment(dir.path(), failing_package());
    let path = write_document(dir.path(), "src: refs.json");
    let mut doc = Document::open(&path, &mut env).await.unwrap();
    assert_eq!(doc.filters().count(), 0);

    doc.set_config_text("% src: refs.json\n% filter: firstseen", &mut env).await.unwrap();
    assert_eq!(doc.commands().len(), 2);
    doc.run().unwrap();
    assert!(doc.bibliography().get("a").unwrap().field("firstseen").is_some());
  }
}
