use std::sync::{
  atomic::{AtomicBool, AtomicUsize, Ordering},
  Mutex,
};

use async_trait::async_trait;
use bibolamazi::package::{
  Clock, FetchedPackage, PackageCacheEntry, PackageManagerConfig, PackageProvider,
  PackageProviderManager,
};
use chrono::{DateTime, Duration, Utc};

use super::*;

/// Provider serving `mock:` locations from memory and counting calls.
#[derive(Debug, Default)]
struct MockProvider {
  checks:      AtomicUsize,
  fetches:     AtomicUsize,
  changed:     AtomicBool,
  check_fails: AtomicBool,
  fetch_fails: AtomicBool,
}

#[async_trait]
impl PackageProvider for MockProvider {
  fn handles(&self, location: &str) -> bool { location.starts_with("mock:") }

  async fn is_current(
    &self,
    _location: &str,
    entry: &PackageCacheEntry,
  ) -> bibolamazi::error::Result<bool> {
    self.checks.fetch_add(1, Ordering::SeqCst);
    if self.check_fails.load(Ordering::SeqCst) {
      return Err(BibolamaziError::RemotePackage { location: "mock:".into(), message: "offline".into() });
    }
    Ok(!self.changed.load(Ordering::SeqCst) && entry.metadata["revision"] == 1)
  }

  async fn fetch(&self, _location: &str, target: &Path) -> bibolamazi::error::Result<FetchedPackage> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    let package = target.join("mine");
    std::fs::create_dir_all(&package)?;
    if self.fetch_fails.load(Ordering::SeqCst) {
      std::fs::write(package.join("partial.toml"), "filter = ")?;
      return Err(BibolamaziError::RemotePackage { location: "mock:".into(), message: "connection reset".into() });
    }
    std::fs::write(
      package.join("loud.toml"),
      "filter = \"bibolamazi_filters:fieldset\"\noptions = \"--field=loud --value=yes\"\n",
    )?;
    self.changed.store(false, Ordering::SeqCst);
    Ok(FetchedPackage { package_dir: "mine".into(), metadata: serde_json::json!({ "revision": 1 }) })
  }
}

/// A clock that only moves when told to.
fn manual_clock() -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
  let now = Arc::new(Mutex::new(Utc::now()));
  let shared = now.clone();
  let clock: Clock = Arc::new(move || *shared.lock().unwrap());
  (clock, now)
}

fn providers(provider: &Arc<MockProvider>) -> Vec<Arc<dyn PackageProvider>> {
  vec![provider.clone() as Arc<dyn PackageProvider>]
}

/// Names of the download directories present in the package cache.
fn download_dirs(dir: &Path) -> Vec<String> {
  std::fs::read_dir(dir.join("packages"))
    .map(|listing| {
      listing
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("pkg-"))
        .collect()
    })
    .unwrap_or_default()
}

fn config(dir: &Path) -> PackageManagerConfig {
  PackageManagerConfig {
    cache_dir:    dir.join("packages"),
    allow_remote: true,
    recheck:      Duration::minutes(10),
    max_age:      Duration::days(365),
    github_token: None,
  }
}

#[tokio::test]
async fn test_downloads_are_reused_and_rechecked() -> TestResult<()> {
  let dir = tempdir()?;
  let provider = Arc::new(MockProvider::default());
  let (clock, now) = manual_clock();
  let mut manager = PackageProviderManager::with_clock(config(dir.path()), providers(&provider), clock.clone());

  let (name, parent) = manager.resolve("mock:mine").await?;
  assert_eq!(name, "mine");
  assert!(parent.join("mine").join("loud.toml").is_file());
  assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

  // within the recheck window nothing is asked
  *now.lock().unwrap() += Duration::minutes(5);
  let (_, again) = manager.resolve("mock:mine").await?;
  assert_eq!(again, parent);
  assert_eq!(provider.checks.load(Ordering::SeqCst), 0);
  assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

  // past it, the remote is asked exactly once
  *now.lock().unwrap() += Duration::minutes(10);
  let (_, again) = manager.resolve("mock:mine").await?;
  assert_eq!(again, parent);
  assert_eq!(provider.checks.load(Ordering::SeqCst), 1);
  assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

  // the index survives a restart
  let mut restarted = PackageProviderManager::with_clock(config(dir.path()), providers(&provider), clock);
  assert_eq!(restarted.entries().len(), 1);
  let (_, again) = restarted.resolve("mock:mine").await?;
  assert_eq!(again, parent);
  assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
  Ok(())
}

#[tokio::test]
async fn test_changed_packages_are_downloaded_again() -> TestResult<()> {
  let dir = tempdir()?;
  let provider = Arc::new(MockProvider::default());
  let (clock, now) = manual_clock();
  let mut manager = PackageProviderManager::with_clock(config(dir.path()), providers(&provider), clock);

  let (_, first) = manager.resolve("mock:mine").await?;
  provider.changed.store(true, Ordering::SeqCst);
  *now.lock().unwrap() += Duration::hours(1);

  let (_, second) = manager.resolve("mock:mine").await?;
  assert_ne!(first, second);
  assert!(!first.exists());
  assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
  assert_eq!(manager.entries().len(), 1);
  Ok(())
}

#[tokio::test]
async fn test_failed_download_leaves_nothing_behind() -> TestResult<()> {
  let dir = tempdir()?;
  let provider = Arc::new(MockProvider::default());
  provider.fetch_fails.store(true, Ordering::SeqCst);
  let mut manager = PackageProviderManager::with_providers(config(dir.path()), providers(&provider));

  let err = manager.resolve("mock:mine").await.unwrap_err();
  assert!(matches!(err, BibolamaziError::RemotePackage { .. }));
  assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
  assert!(manager.entries().is_empty());
  assert!(download_dirs(dir.path()).is_empty());

  // nothing was recorded for the next run either
  let restarted = PackageProviderManager::with_providers(config(dir.path()), providers(&provider));
  assert!(restarted.entries().is_empty());
  Ok(())
}

#[tokio::test]
async fn test_unreachable_remote_falls_back_to_cached_copy() -> TestResult<()> {
  let dir = tempdir()?;
  let provider = Arc::new(MockProvider::default());
  let (clock, now) = manual_clock();
  let mut manager = PackageProviderManager::with_clock(config(dir.path()), providers(&provider), clock);

  let (_, cached) = manager.resolve("mock:mine").await?;
  provider.check_fails.store(true, Ordering::SeqCst);
  provider.fetch_fails.store(true, Ordering::SeqCst);
  *now.lock().unwrap() += Duration::hours(1);

  let (name, parent) = manager.resolve("mock:mine").await?;
  assert_eq!(name, "mine");
  assert_eq!(parent, cached);
  assert!(parent.join("mine").join("loud.toml").is_file());
  assert_eq!(provider.checks.load(Ordering::SeqCst), 1);
  assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
  assert_eq!(manager.entries().len(), 1);
  assert_eq!(download_dirs(dir.path()).len(), 1);
  Ok(())
}

#[tokio::test]
async fn test_documents_use_remote_packages() -> TestResult<()> {
  let dir = tempdir()?;
  let provider = Arc::new(MockProvider::default());
  let settings = Settings {
    package_cache_dir: Some(dir.path().join("packages")),
    allow_remote_packages: true,
    ..Settings::default()
  };
  let mut env = Environment::builder().settings(settings).providers(providers(&provider)).build()?;

  std::fs::write(dir.path().join("refs.json"), r#"{"a": {"title": "Alpha"}}"#)?;
  let path = write_document(dir.path(), &["src: refs.json", "package: mock:mine", "filter: loud"]);

  let mut doc = Document::open(&path, &mut env).await?;
  assert!(doc.search_path().contains("mine"));
  doc.run()?;
  assert_eq!(doc.bibliography().get("a").unwrap().field("loud"), Some("yes"));
  assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
  Ok(())
}
