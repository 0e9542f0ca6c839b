//! Filter package locations: local directories and remote archives.
//!
//! A `package:` command names a package either by a local path or by a remote location such
//! as `github:owner/repo/filters` or `https://example.org/filters.zip`. The
//! [`PackageProviderManager`] turns any of these into a `(package name, parent directory)`
//! pair suitable for the [`SearchPath`].
//!
//! Remote packages are downloaded into a user cache directory. Each download lands in a fresh
//! directory with an opaque name (`pkg-<sha256>`), recorded in a JSON index together with the
//! source URL, timestamps and whatever the provider needs to detect staleness:
//!
//! ```json
//! {
//!   "pkg-3f2a…": {
//!     "url": "github:phfaist/bibolamazi-filters",
//!     "downloaded": "2024-03-01T10:00:00Z",
//!     "last_checked": "2024-03-02T08:30:00Z",
//!     "package_dir": "bibolamazi-filters",
//!     "metadata": { "sha": "9c1d…" }
//!   }
//! }
//! ```
//!
//! Repeated requests within a short window reuse the copy without contacting the remote. After
//! that, the provider is asked whether the copy is still current, and the package is fetched
//! again only if it is not.

use std::fs;

use sha2::{Digest, Sha256};

use super::*;

mod archive;
mod github;
mod http;

pub use archive::*;
pub use github::*;
pub use http::*;

/// Name of the index file inside the package cache directory.
pub const PACKAGE_INDEX_FILE: &str = "packages.json";

/// Prefix of package cache directory names.
pub const PACKAGE_DIR_PREFIX: &str = "pkg-";

/// What a provider reports after a successful download.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPackage {
  /// The package directory, relative to the download directory
  pub package_dir: String,
  /// Provider data used for later staleness checks
  pub metadata:    Value,
}

/// Record of one downloaded package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageCacheEntry {
  /// Location string the package was requested with
  pub url:          String,
  /// When it was downloaded
  pub downloaded:   DateTime<Utc>,
  /// When it was last confirmed current
  pub last_checked: DateTime<Utc>,
  /// Package directory relative to the cache directory of this entry
  pub package_dir:  String,
  /// Provider data, e.g. a commit SHA or HTTP validators
  #[serde(default)]
  pub metadata:     Value,
}

/// A source of remote packages for one location scheme.
#[async_trait]
pub trait PackageProvider: Debug + Send + Sync {
  /// Whether this provider handles `location`.
  fn handles(&self, location: &str) -> bool;

  /// Whether the cached copy described by `entry` still matches the remote.
  async fn is_current(&self, location: &str, entry: &PackageCacheEntry) -> Result<bool>;

  /// Downloads and extracts the package into the empty directory `target`.
  async fn fetch(&self, location: &str, target: &Path) -> Result<FetchedPackage>;
}

/// Settings of a [`PackageProviderManager`].
#[derive(Debug, Clone)]
pub struct PackageManagerConfig {
  /// Where downloads and the index live
  pub cache_dir:    PathBuf,
  /// Whether remote locations may be used at all
  pub allow_remote: bool,
  /// Within this window after a check, cached copies are reused without asking the remote
  pub recheck:      Duration,
  /// Copies downloaded longer ago than this are discarded at startup
  pub max_age:      Duration,
  /// Token for the GitHub API
  pub github_token: Option<String>,
}

impl Default for PackageManagerConfig {
  fn default() -> Self {
    Self {
      cache_dir:    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bibolamazi")
        .join("packages"),
      allow_remote: false,
      recheck:      Duration::minutes(10),
      max_age:      Duration::days(365),
      github_token: None,
    }
  }
}

/// Source of the current time, replaceable in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Resolves package locations to directories, downloading remote packages as needed.
pub struct PackageProviderManager {
  /// Settings
  config:    PackageManagerConfig,
  /// Remote providers, tried in order
  providers: Vec<Arc<dyn PackageProvider>>,
  /// Downloaded packages by cache directory name
  index:     BTreeMap<String, PackageCacheEntry>,
  /// Current time
  clock:     Clock,
}

impl Debug for PackageProviderManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PackageProviderManager")
      .field("config", &self.config)
      .field("providers", &self.providers)
      .field("index", &self.index)
      .finish()
  }
}

impl PackageProviderManager {
  /// A manager with the GitHub and HTTP archive providers.
  pub fn new(config: PackageManagerConfig) -> Self {
    let providers = default_providers(&config);
    Self::with_providers(config, providers)
  }

  /// A manager with custom providers.
  pub fn with_providers(config: PackageManagerConfig, providers: Vec<Arc<dyn PackageProvider>>) -> Self {
    Self::with_clock(config, providers, Arc::new(Utc::now))
  }

  /// A manager with custom providers and clock.
  ///
  /// Loads the index and sweeps expired or vanished downloads, as of `clock`.
  pub fn with_clock(
    config: PackageManagerConfig,
    providers: Vec<Arc<dyn PackageProvider>>,
    clock: Clock,
  ) -> Self {
    let index = load_index(&config.cache_dir);
    let mut manager = Self { config, providers, index, clock };
    manager.sweep();
    manager
  }

  /// Settings in use.
  pub fn config(&self) -> &PackageManagerConfig { &self.config }

  /// Allows or forbids remote locations.
  pub fn set_allow_remote(&mut self, allow: bool) { self.config.allow_remote = allow; }

  /// Downloaded packages by cache directory name.
  pub fn entries(&self) -> &BTreeMap<String, PackageCacheEntry> { &self.index }

  /// Removes downloads that are too old or whose directory disappeared.
  fn sweep(&mut self) {
    let now = (self.clock)();
    let cache_dir = self.config.cache_dir.clone();
    let max_age = self.config.max_age;
    let before = self.index.len();
    self.index.retain(|name, entry| {
      let dir = cache_dir.join(name);
      if !dir.is_dir() {
        debug!(dir = %name, url = %entry.url, "Dropping package whose directory vanished");
        return false;
      }
      if now.signed_duration_since(entry.downloaded) > max_age {
        debug!(dir = %name, url = %entry.url, "Dropping expired package");
        remove_dir(&dir);
        return false;
      }
      true
    });

    // leftovers of interrupted downloads
    if let Ok(listing) = fs::read_dir(&cache_dir) {
      for dir in listing.filter_map(|e| e.ok()) {
        let name = dir.file_name().to_string_lossy().to_string();
        if name.starts_with(PACKAGE_DIR_PREFIX) && !self.index.contains_key(&name) {
          debug!(dir = %name, "Removing unreferenced package directory");
          remove_dir(&dir.path());
        }
      }
    }

    if self.index.len() != before {
      self.save_index();
    }
  }

  /// Resolves a location into `(package name, directory containing the package)`.
  #[instrument(skip(self), level = "debug")]
  pub async fn resolve(&mut self, location: &str) -> Result<(String, PathBuf)> {
    if let Some(path) = local_path(location) {
      return split_package_path(&path, location);
    }
    if !self.config.allow_remote {
      return Err(BibolamaziError::RemotePackagesDisabled(location.to_string()));
    }
    let provider = self
      .providers
      .iter()
      .find(|p| p.handles(location))
      .cloned()
      .ok_or_else(|| BibolamaziError::InvalidLocation(location.to_string()))?;

    let now = (self.clock)();
    let cached = self.index.iter().find(|(_, e)| e.url == location).map(|(k, e)| (k.clone(), e.clone()));
    let Some((dir_name, entry)) = cached else {
      return self.fetch(location, provider.as_ref()).await;
    };

    if now.signed_duration_since(entry.last_checked) < self.config.recheck {
      trace!(dir = %dir_name, "Reusing recently checked package");
      return self.locate(&dir_name, &entry);
    }

    match provider.is_current(location, &entry).await {
      Ok(true) => {
        debug!(dir = %dir_name, "Cached package is current");
        if let Some(stored) = self.index.get_mut(&dir_name) {
          stored.last_checked = now;
        }
        self.save_index();
        self.locate(&dir_name, &entry)
      },
      Ok(false) => {
        info!(location, "Remote package changed, downloading it again");
        self.forget(&dir_name);
        self.fetch(location, provider.as_ref()).await
      },
      Err(check_error) => {
        warn!(location, error = %check_error, "Could not check remote package, downloading it again");
        match self.fetch(location, provider.as_ref()).await {
          Ok(located) => {
            self.forget(&dir_name);
            Ok(located)
          },
          Err(fetch_error) => {
            warn!(location, error = %fetch_error, "Download failed, using the cached copy");
            self.locate(&dir_name, &entry)
          },
        }
      },
    }
  }

  /// Downloads a package into a fresh directory and records it once complete.
  async fn fetch(&mut self, location: &str, provider: &dyn PackageProvider) -> Result<(String, PathBuf)> {
    let now = (self.clock)();
    let dir_name = package_dir_name(location, now);
    let target = self.config.cache_dir.join(&dir_name);
    fs::create_dir_all(&target)?;
    info!(location, dir = %dir_name, "Downloading filter package");

    let fetched = match provider.fetch(location, &target).await {
      Ok(fetched) => fetched,
      Err(e) => {
        remove_dir(&target);
        return Err(match e {
          e @ (BibolamaziError::RemotePackage { .. } | BibolamaziError::InvalidLocation(_)) => e,
          other => BibolamaziError::RemotePackage { location: location.to_string(), message: other.to_string() },
        });
      },
    };

    let entry = PackageCacheEntry {
      url:          location.to_string(),
      downloaded:   now,
      last_checked: now,
      package_dir:  fetched.package_dir,
      metadata:     fetched.metadata,
    };
    let located = match self.locate(&dir_name, &entry) {
      Ok(located) => located,
      Err(e) => {
        remove_dir(&target);
        return Err(e);
      },
    };
    self.index.insert(dir_name, entry);
    self.save_index();
    Ok(located)
  }

  /// Package name and parent directory of a recorded download.
  fn locate(&self, dir_name: &str, entry: &PackageCacheEntry) -> Result<(String, PathBuf)> {
    let path = self.config.cache_dir.join(dir_name).join(&entry.package_dir);
    if !path.is_dir() {
      return Err(BibolamaziError::RemotePackage {
        location: entry.url.clone(),
        message:  format!("package directory {} is missing", path.display()),
      });
    }
    split_package_path(&path, &entry.url)
  }

  /// Drops a download and its directory.
  fn forget(&mut self, dir_name: &str) {
    self.index.remove(dir_name);
    remove_dir(&self.config.cache_dir.join(dir_name));
    self.save_index();
  }

  /// Writes the index. Failures are logged and otherwise ignored.
  fn save_index(&self) {
    let path = self.config.cache_dir.join(PACKAGE_INDEX_FILE);
    let result = fs::create_dir_all(&self.config.cache_dir)
      .map_err(BibolamaziError::from)
      .and_then(|_| Ok(serde_json::to_vec_pretty(&self.index)?))
      .and_then(|bytes| Ok(fs::write(&path, bytes)?));
    if let Err(e) = result {
      debug!(error = %e, "Could not save package index");
    }
  }
}

/// The GitHub and HTTP archive providers.
pub fn default_providers(config: &PackageManagerConfig) -> Vec<Arc<dyn PackageProvider>> {
  let providers: Vec<Arc<dyn PackageProvider>> =
    vec![Arc::new(GithubProvider::new(config.github_token.clone())), Arc::new(HttpArchiveProvider::new())];
  providers
}

/// Reads the index, treating a missing or unreadable file as empty.
fn load_index(cache_dir: &Path) -> BTreeMap<String, PackageCacheEntry> {
  let path = cache_dir.join(PACKAGE_INDEX_FILE);
  match fs::read(&path).map_err(BibolamaziError::from).and_then(|b| Ok(serde_json::from_slice(&b)?)) {
    Ok(index) => index,
    Err(e) => {
      debug!(path = %path.display(), error = %e, "Starting with an empty package index");
      BTreeMap::new()
    },
  }
}

/// Removes a directory tree, logging failures.
fn remove_dir(path: &Path) {
  if let Err(e) = fs::remove_dir_all(path) {
    if e.kind() != std::io::ErrorKind::NotFound {
      debug!(path = %path.display(), error = %e, "Could not remove directory");
    }
  }
}

lazy_static! {
  static ref SCHEME: Regex = Regex::new(r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]+):").expect("valid regex");
}

/// The local path a location designates, or `None` for remote locations.
///
/// Locations without a scheme and `file:` locations are local. Single-letter schemes are
/// taken as drive letters.
pub fn local_path(location: &str) -> Option<PathBuf> {
  match SCHEME.captures(location) {
    None => Some(PathBuf::from(location)),
    Some(captures) if captures["scheme"].eq_ignore_ascii_case("file") => {
      let rest = &location[captures[0].len()..];
      Some(PathBuf::from(rest.strip_prefix("//").unwrap_or(rest)))
    },
    Some(_) => None,
  }
}

/// Splits a package directory into its name and parent.
fn split_package_path(path: &Path, location: &str) -> Result<(String, PathBuf)> {
  let name = path.file_name().and_then(|n| n.to_str()).filter(|n| !n.is_empty());
  match (name, path.parent()) {
    (Some(name), Some(parent)) => Ok((name.to_string(), parent.to_path_buf())),
    _ => Err(BibolamaziError::InvalidLocation(location.to_string())),
  }
}

/// Opaque directory name for a download of `location` at `time`.
///
/// Derived from a hash so that nothing user-controlled ends up in the path.
pub fn package_dir_name(location: &str, time: DateTime<Utc>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(location.as_bytes());
  hasher.update([0u8]);
  hasher.update(time.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
  let digest = format!("{:x}", hasher.finalize());
  format!("{PACKAGE_DIR_PREFIX}{}", &digest[..32])
}
