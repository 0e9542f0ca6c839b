//! User settings and the runtime context documents are opened in.
//!
//! Nothing in the engine is global. An [`Environment`] owns the filter registry (with its
//! resolution cache and default search path), the remote package manager, the known
//! bibliography formats and the interruption flag, and is handed to every [`Document`]
//! operation that needs them.
//!
//! Settings live in a TOML file, by default `<config dir>/bibolamazi/settings.toml`:
//!
//! ```toml
//! allow_remote_packages = true
//! filter_packages = ["myfilters=/home/me/bibfilters"]
//! cache_expiry_days = 14
//! ```

use super::*;

/// Name of the settings file inside the configuration directory.
pub const SETTINGS_FILE: &str = "settings.toml";

/// User settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  /// Whether `package:` commands may name remote locations
  pub allow_remote_packages:   bool,
  /// Extra filter packages, `name` or `name=dir`, searched before the built-in ones
  pub filter_packages:         Vec<String>,
  /// Lifetime of expiring cache entries, in days
  pub cache_expiry_days:       i64,
  /// Where remote packages are downloaded to
  pub package_cache_dir:       Option<PathBuf>,
  /// Window in which a downloaded package is reused without asking the remote, in minutes
  pub package_recheck_minutes: i64,
  /// Downloads older than this are discarded, in days
  pub package_max_age_days:    i64,
  /// GitHub API token for `github:` packages
  pub github_token:            Option<String>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      allow_remote_packages:   false,
      filter_packages:         Vec::new(),
      cache_expiry_days:       DEFAULT_CACHE_EXPIRY_DAYS,
      package_cache_dir:       None,
      package_recheck_minutes: 10,
      package_max_age_days:    365,
      github_token:            None,
    }
  }
}

impl Settings {
  /// The default settings file location.
  pub fn default_path() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("bibolamazi").join(SETTINGS_FILE)
  }

  /// Reads settings from `path`. A missing file yields the defaults.
  #[instrument(level = "debug")]
  pub fn load(path: &Path) -> Result<Self> {
    match std::fs::read_to_string(path) {
      Ok(content) => {
        let settings: Self = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
      },
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!("No settings file, using defaults");
        Ok(Self::default())
      },
      Err(e) => Err(e.into()),
    }
  }

  /// Fails if a duration setting is beyond what can be represented.
  pub fn validate(&self) -> Result<()> {
    let durations = [
      ("cache_expiry_days", Duration::try_days(self.cache_expiry_days)),
      ("package_recheck_minutes", Duration::try_minutes(self.package_recheck_minutes)),
      ("package_max_age_days", Duration::try_days(self.package_max_age_days)),
    ];
    match durations.iter().find(|(_, duration)| duration.is_none()) {
      Some((name, _)) => Err(BibolamaziError::Config(format!("setting {name} is out of range"))),
      None => Ok(()),
    }
  }

  /// Lifetime of expiring cache entries.
  pub fn cache_expiry(&self) -> Duration { days(self.cache_expiry_days) }

  /// `filter_packages` as `(name, directory)` bindings.
  pub fn package_bindings(&self) -> Result<Vec<(String, Option<PathBuf>)>> {
    self
      .filter_packages
      .iter()
      .map(|spec| {
        let (name, dir) = match spec.split_once('=') {
          Some((name, dir)) => (name.trim(), Some(PathBuf::from(dir.trim()))),
          None => (spec.trim(), None),
        };
        if name.is_empty() {
          return Err(BibolamaziError::Config(format!("invalid filter package setting \"{spec}\"")));
        }
        Ok((name.to_string(), dir))
      })
      .collect()
  }

  /// Settings for the package manager.
  pub fn package_config(&self) -> PackageManagerConfig {
    let defaults = PackageManagerConfig::default();
    PackageManagerConfig {
      cache_dir:    self.package_cache_dir.clone().unwrap_or(defaults.cache_dir),
      allow_remote: self.allow_remote_packages,
      recheck:      Duration::try_minutes(self.package_recheck_minutes.max(0))
        .unwrap_or_else(Duration::max_value),
      max_age:      days(self.package_max_age_days),
      github_token: self.github_token.clone(),
    }
  }
}

/// A non-negative number of days, saturating instead of overflowing.
fn days(n: i64) -> Duration { Duration::try_days(n.max(0)).unwrap_or_else(Duration::max_value) }

/// Everything documents need from the outside world.
#[derive(Debug)]
pub struct Environment {
  /// Active settings
  settings:      Settings,
  /// Filter packages, default search path and resolution cache
  pub registry:  FilterRegistry,
  /// Remote package resolution
  pub packages:  PackageProviderManager,
  /// Known bibliography formats
  pub formats:   FormatRegistry,
  /// Set to stop running filters
  pub interrupt: InterruptHandle,
}

impl Environment {
  /// Starts building an environment.
  pub fn builder() -> EnvironmentBuilder { EnvironmentBuilder::default() }

  /// The active settings.
  pub fn settings(&self) -> &Settings { &self.settings }

  /// Replaces the settings, rebuilding the default search path and clearing the resolution
  /// cache.
  pub fn apply_settings(&mut self, settings: Settings) -> Result<()> {
    settings.validate()?;
    let bindings = settings.package_bindings()?;
    self.registry.reset_default_search_path();
    for (name, dir) in bindings.into_iter().rev() {
      self.registry.prepend_default(name, dir);
    }
    self.packages.set_allow_remote(settings.allow_remote_packages);
    self.settings = settings;
    info!("Applied settings");
    Ok(())
  }
}

/// Builder for [`Environment`].
#[derive(Default)]
pub struct EnvironmentBuilder {
  /// Explicit settings, taking precedence over `settings_path`
  settings:      Option<Settings>,
  /// Settings file to read
  settings_path: Option<PathBuf>,
  /// Extra compiled-in filter packages
  packages:      Vec<Arc<dyn FilterPackage>>,
  /// Replacement remote package providers
  providers:     Option<Vec<Arc<dyn PackageProvider>>>,
  /// Clock for the package manager
  clock:         Option<Clock>,
  /// Extra bibliography formats
  formats:       Vec<Arc<dyn BibFormat>>,
  /// Shared interruption flag
  interrupt:     Option<InterruptHandle>,
}

impl EnvironmentBuilder {
  /// Uses these settings instead of reading a file.
  pub fn settings(mut self, settings: Settings) -> Self {
    self.settings = Some(settings);
    self
  }

  /// Reads settings from this file instead of the default location.
  pub fn settings_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.settings_path = Some(path.into());
    self
  }

  /// Registers an additional filter package.
  pub fn filter_package(mut self, package: Arc<dyn FilterPackage>) -> Self {
    self.packages.push(package);
    self
  }

  /// Replaces the remote package providers.
  pub fn providers(mut self, providers: Vec<Arc<dyn PackageProvider>>) -> Self {
    self.providers = Some(providers);
    self
  }

  /// Replaces the package manager's clock.
  pub fn clock(mut self, clock: Clock) -> Self {
    self.clock = Some(clock);
    self
  }

  /// Registers an additional bibliography format.
  pub fn format(mut self, format: Arc<dyn BibFormat>) -> Self {
    self.formats.push(format);
    self
  }

  /// Shares an existing interruption flag.
  pub fn interrupt(mut self, interrupt: InterruptHandle) -> Self {
    self.interrupt = Some(interrupt);
    self
  }

  /// Builds the environment, reading the settings file if no settings were given.
  pub fn build(self) -> Result<Environment> {
    let settings = match self.settings {
      Some(settings) => settings,
      None => Settings::load(&self.settings_path.unwrap_or_else(Settings::default_path))?,
    };

    let mut registry = FilterRegistry::new();
    for package in self.packages {
      registry.register_package(package);
    }

    let config = settings.package_config();
    let providers = self.providers.unwrap_or_else(|| default_providers(&config));
    let packages = match self.clock {
      Some(clock) => PackageProviderManager::with_clock(config, providers, clock),
      None => PackageProviderManager::with_providers(config, providers),
    };

    let mut formats = FormatRegistry::new();
    for format in self.formats {
      formats.register(format);
    }

    let mut env = Environment {
      settings: Settings::default(),
      registry,
      packages,
      formats,
      interrupt: self.interrupt.unwrap_or_default(),
    };
    env.apply_settings(settings)?;
    Ok(env)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[traced_test]
  #[test]
  fn test_missing_settings_file_gives_defaults() {
    let dir = tempdir().unwrap();
    let settings = Settings::load(&dir.path().join("nope.toml")).unwrap();
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.cache_expiry(), Duration::days(30));
  }

  #[test]
  fn test_partial_settings_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(SETTINGS_FILE);
    std::fs::write(&path, "allow_remote_packages = true\nfilter_packages = [\"mine=/x/y\", \"other\"]\n")
      .unwrap();
    let settings = Settings::load(&path).unwrap();
    assert!(settings.allow_remote_packages);
    assert_eq!(settings.package_recheck_minutes, 10);
    assert_eq!(settings.package_bindings().unwrap(), vec![
      ("mine".to_string(), Some(PathBuf::from("/x/y"))),
      ("other".to_string(), None),
    ]);
  }

  #[test]
  fn test_invalid_settings_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(SETTINGS_FILE);
    std::fs::write(&path, "allow_remote_packages = [").unwrap();
    assert!(matches!(Settings::load(&path), Err(BibolamaziError::TomlDe(_))));
  }

  #[test]
  fn test_out_of_range_durations() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(SETTINGS_FILE);
    std::fs::write(&path, "cache_expiry_days = 9000000000000000\n").unwrap();
    let err = Settings::load(&path).unwrap_err();
    assert!(matches!(err, BibolamaziError::Config(_)));
    assert!(err.to_string().contains("cache_expiry_days"));

    // settings built in code saturate instead of panicking
    let settings = Settings {
      cache_expiry_days: i64::MAX,
      package_recheck_minutes: i64::MAX,
      package_max_age_days: -5,
      ..Settings::default()
    };
    assert_eq!(settings.cache_expiry(), Duration::max_value());
    let config = settings.package_config();
    assert_eq!(config.recheck, Duration::max_value());
    assert_eq!(config.max_age, Duration::zero());
    assert!(Environment::builder().settings(settings).build().is_err());
  }

  #[traced_test]
  #[test]
  fn test_settings_shape_default_search_path() {
    let dir = tempdir().unwrap();
    let settings = Settings {
      filter_packages: vec!["first=/a".into(), "second=/b".into()],
      package_cache_dir: Some(dir.path().to_path_buf()),
      ..Settings::default()
    };
    let mut env = Environment::builder().settings(settings).build().unwrap();
    let names: Vec<_> = env.registry.default_search_path().names().map(str::to_string).collect();
    assert_eq!(names, vec!["first", "second", BUILTIN_PACKAGE]);

    env
      .apply_settings(Settings { package_cache_dir: Some(dir.path().to_path_buf()), ..Settings::default() })
      .unwrap();
    let names: Vec<_> = env.registry.default_search_path().names().collect();
    assert_eq!(names, vec![BUILTIN_PACKAGE]);
  }
}
