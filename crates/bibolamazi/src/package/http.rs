//! Packages distributed as zip archives over HTTP(S).
//!
//! A location is the archive URL, optionally followed by `#path/inside/archive` naming the
//! package directory. Without a fragment, the package is named after the archive file.

use reqwest::header::{HeaderMap, HeaderName, ETAG, LAST_MODIFIED};

use super::*;

/// Fetches zip archives and detects changes through `ETag`/`Last-Modified` validators.
#[derive(Debug, Clone, Default)]
pub struct HttpArchiveProvider;

impl HttpArchiveProvider {
  /// A provider.
  pub fn new() -> Self { Self }
}

/// Splits a location into the archive URL, the directory the archive is extracted into and the
/// package directory below it.
fn split_location(location: &str) -> Result<(String, String, String)> {
  let (url, fragment) = match location.split_once('#') {
    Some((url, fragment)) => (url, Some(fragment.trim_matches('/'))),
    None => (location, None),
  };
  let invalid = || BibolamaziError::InvalidLocation(location.to_string());
  let file = url.rsplit('/').next().filter(|f| !f.is_empty()).ok_or_else(invalid)?;
  let stem = file.split(['?', '.']).next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
  if !stem.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
    return Err(invalid());
  }
  let package_dir = match fragment {
    Some(fragment) if !fragment.is_empty() => {
      if fragment.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(invalid());
      }
      format!("{stem}/{fragment}")
    },
    _ => stem.to_string(),
  };
  Ok((url.to_string(), stem.to_string(), package_dir))
}

/// Cache validators found in response headers.
fn validators(headers: &HeaderMap) -> Value {
  let get = |name: HeaderName| headers.get(&name).and_then(|v| v.to_str().ok());
  serde_json::json!({ "etag": get(ETAG), "last_modified": get(LAST_MODIFIED) })
}

/// Whether fresh validators describe the same content as recorded ones.
///
/// Without any recorded validator the copy is never considered current.
fn same_content(recorded: &Value, fresh: &Value) -> bool {
  for key in ["etag", "last_modified"] {
    if let Some(old) = recorded.get(key).and_then(Value::as_str) {
      return fresh.get(key).and_then(Value::as_str) == Some(old);
    }
  }
  false
}

#[async_trait]
impl PackageProvider for HttpArchiveProvider {
  fn handles(&self, location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
  }

  async fn is_current(&self, location: &str, entry: &PackageCacheEntry) -> Result<bool> {
    let (url, ..) = split_location(location)?;
    let client = reqwest::Client::new();
    let response = client.head(&url).send().await?;
    if !response.status().is_success() {
      return Err(BibolamaziError::RemotePackage {
        location: location.to_string(),
        message:  format!("freshness check failed: {}", response.status()),
      });
    }
    Ok(same_content(&entry.metadata, &validators(response.headers())))
  }

  async fn fetch(&self, location: &str, target: &Path) -> Result<FetchedPackage> {
    let (url, stem, package_dir) = split_location(location)?;
    let response = reqwest::get(&url).await?;
    if !response.status().is_success() {
      return Err(BibolamaziError::RemotePackage {
        location: location.to_string(),
        message:  format!("download failed: {}", response.status()),
      });
    }
    let metadata = validators(response.headers());
    let bytes = response.bytes().await?;
    extract_zip(&bytes, &target.join(&stem))?;
    debug!(location, "Fetched archive package");
    Ok(FetchedPackage { package_dir, metadata })
  }
}
