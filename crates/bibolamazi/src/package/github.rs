//! Packages hosted in GitHub repositories.
//!
//! Locations have the form `github:owner/repo[/path/to/package][@ref]`. Without a path the
//! repository root is the package directory. The ref defaults to the repository's default
//! branch.

use super::*;

/// Location scheme handled by [`GithubProvider`].
pub const GITHUB_SCHEME: &str = "github:";

/// Base of the GitHub REST API.
const GITHUB_API: &str = "https://api.github.com";

/// User agent sent with every request; GitHub rejects requests without one.
const USER_AGENT: &str = concat!("bibolamazi/", env!("CARGO_PKG_VERSION"));

/// A parsed `github:` location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubLocation {
  /// Repository owner
  pub owner:   String,
  /// Repository name
  pub repo:    String,
  /// Package directory inside the repository, empty for the root
  pub subdir:  String,
  /// Branch, tag or commit
  pub git_ref: Option<String>,
}

lazy_static! {
  static ref GITHUB_LOCATION: Regex = Regex::new(
    r"^github:(?P<owner>[\w.\-]+)/(?P<repo>[\w.\-]+)(?:/(?P<subdir>[\w.\-/]*?))?/?(?:@(?P<ref>[\w.\-/]+))?$"
  )
  .expect("valid regex");
}

impl GithubLocation {
  /// Parses a location, returning an error for anything malformed.
  pub fn parse(location: &str) -> Result<Self> {
    let captures =
      GITHUB_LOCATION.captures(location).ok_or_else(|| BibolamaziError::InvalidLocation(location.to_string()))?;
    let subdir = captures.name("subdir").map_or("", |m| m.as_str()).trim_matches('/');
    if subdir.split('/').any(|part| part == "..") {
      return Err(BibolamaziError::InvalidLocation(location.to_string()));
    }
    Ok(Self {
      owner:   captures["owner"].to_string(),
      repo:    captures["repo"].to_string(),
      subdir:  subdir.to_string(),
      git_ref: captures.name("ref").map(|m| m.as_str().to_string()),
    })
  }

  /// The package directory relative to the extraction directory.
  pub fn package_dir(&self) -> String {
    if self.subdir.is_empty() {
      self.repo.clone()
    } else {
      format!("{}/{}", self.repo, self.subdir)
    }
  }
}

/// Fetches `github:` packages through the GitHub API.
///
/// Staleness is decided by comparing the commit SHA of the requested ref with the one recorded
/// at download time.
#[derive(Debug, Clone, Default)]
pub struct GithubProvider {
  /// Token sent as a bearer credential, raising the API rate limit
  token: Option<String>,
}

impl GithubProvider {
  /// A provider, optionally authenticated.
  pub fn new(token: Option<String>) -> Self { Self { token } }

  /// Issues an authenticated GET request.
  async fn get(&self, url: &str, accept: &str) -> Result<reqwest::Response> {
    let client = reqwest::Client::new();
    let mut request =
      client.get(url).header(reqwest::header::USER_AGENT, USER_AGENT).header(reqwest::header::ACCEPT, accept);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    trace!(url, "Sending GitHub request");
    Ok(request.send().await?)
  }

  /// The commit SHA the location's ref currently points to.
  #[instrument(skip(self), level = "debug")]
  pub async fn commit_sha(&self, location: &GithubLocation) -> Result<String> {
    let url = format!(
      "{GITHUB_API}/repos/{}/{}/commits/{}",
      location.owner,
      location.repo,
      location.git_ref.as_deref().unwrap_or("HEAD")
    );
    let response = self.get(&url, "application/vnd.github.sha").await?;
    if !response.status().is_success() {
      return Err(BibolamaziError::RemotePackage {
        location: format!("github:{}/{}", location.owner, location.repo),
        message:  format!("commit lookup failed: {}", response.status()),
      });
    }
    Ok(response.text().await?.trim().to_string())
  }
}

#[async_trait]
impl PackageProvider for GithubProvider {
  fn handles(&self, location: &str) -> bool { location.starts_with(GITHUB_SCHEME) }

  async fn is_current(&self, location: &str, entry: &PackageCacheEntry) -> Result<bool> {
    let parsed = GithubLocation::parse(location)?;
    let sha = self.commit_sha(&parsed).await?;
    Ok(entry.metadata.get("sha").and_then(Value::as_str) == Some(sha.as_str()))
  }

  async fn fetch(&self, location: &str, target: &Path) -> Result<FetchedPackage> {
    let parsed = GithubLocation::parse(location)?;
    let sha = self.commit_sha(&parsed).await?;
    let url = format!("{GITHUB_API}/repos/{}/{}/zipball/{sha}", parsed.owner, parsed.repo);
    let response = self.get(&url, "application/vnd.github+json").await?;
    if !response.status().is_success() {
      return Err(BibolamaziError::RemotePackage {
        location: location.to_string(),
        message:  format!("archive download failed: {}", response.status()),
      });
    }
    let bytes = response.bytes().await?;
    extract_zip(&bytes, &target.join(&parsed.repo))?;
    debug!(location, sha = %sha, "Fetched GitHub package");
    Ok(FetchedPackage { package_dir: parsed.package_dir(), metadata: serde_json::json!({ "sha": sha }) })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_locations() {
    let plain = GithubLocation::parse("github:phfaist/bibolamazi-filters").unwrap();
    assert_eq!(plain.owner, "phfaist");
    assert_eq!(plain.repo, "bibolamazi-filters");
    assert_eq!(plain.subdir, "");
    assert_eq!(plain.git_ref, None);
    assert_eq!(plain.package_dir(), "bibolamazi-filters");

    let nested = GithubLocation::parse("github:owner/repo/src/myfilters@v1.2").unwrap();
    assert_eq!(nested.subdir, "src/myfilters");
    assert_eq!(nested.git_ref.as_deref(), Some("v1.2"));
    assert_eq!(nested.package_dir(), "repo/src/myfilters");
  }

  #[test]
  fn test_reject_malformed_locations() {
    assert!(GithubLocation::parse("github:onlyowner").is_err());
    assert!(GithubLocation::parse("github:o/r/../../etc").is_err());
    assert!(GithubLocation::parse("github:o/r with space").is_err());
  }

  #[test]
  fn test_handles_only_github() {
    let provider = GithubProvider::new(None);
    assert!(provider.handles("github:o/r"));
    assert!(!provider.handles("https://github.com/o/r"));
  }
}
