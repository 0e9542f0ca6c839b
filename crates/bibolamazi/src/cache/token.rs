//! Validity policies for cache entries.
//!
//! Every value stored in a cache dictionary carries a token computed by the dictionary's
//! [`TokenChecker`] at write time. When the dictionary is validated, a fresh token is compared
//! against the stored one and mismatching entries are dropped.

use sha2::{Digest, Sha256};

use super::*;

/// A validation token. Any JSON value; checkers decide how to compare them.
pub type Token = Value;

/// Computes and compares validation tokens for `(key, value)` pairs.
pub trait TokenChecker: Debug + Send + Sync {
  /// Token describing the current state of `key`/`value`.
  fn new_token(&self, key: &str, value: &Slot) -> Token;

  /// Whether a previously stored token is still valid for `key`/`value`.
  ///
  /// The default compares `old` with a freshly computed token for equality.
  fn cmp_tokens(&self, key: &str, value: &Slot, old: &Token) -> bool {
    self.new_token(key, value) == *old
  }
}

/// Accepts everything. Used by dictionaries without an explicit policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTokenChecker;

impl TokenChecker for IdentityTokenChecker {
  fn new_token(&self, _key: &str, _value: &Slot) -> Token { Value::Null }

  fn cmp_tokens(&self, _key: &str, _value: &Slot, _old: &Token) -> bool { true }
}

/// Expires entries older than a fixed age. The token is the write timestamp.
#[derive(Debug, Clone)]
pub struct DateExpiryTokenChecker {
  /// Maximum age before an entry is considered stale
  max_age: Duration,
}

impl DateExpiryTokenChecker {
  /// Creates a checker expiring entries after `max_age`.
  pub fn new(max_age: Duration) -> Self { Self { max_age } }

  /// The configured maximum age.
  pub fn max_age(&self) -> Duration { self.max_age }

  /// Whether a token written at `token` is still fresh at `now`.
  pub fn is_fresh_at(&self, token: &Token, now: DateTime<Utc>) -> bool {
    let Some(written) = token.as_i64().and_then(|ts| Utc.timestamp_opt(ts, 0).single()) else {
      return false;
    };
    now.signed_duration_since(written) < self.max_age
  }
}

impl TokenChecker for DateExpiryTokenChecker {
  fn new_token(&self, _key: &str, _value: &Slot) -> Token { Value::from(Utc::now().timestamp()) }

  fn cmp_tokens(&self, _key: &str, _value: &Slot, old: &Token) -> bool {
    self.is_fresh_at(old, Utc::now())
  }
}

/// Valid only while the stored version tag equals the current one.
#[derive(Debug, Clone)]
pub struct VersionTokenChecker {
  /// Current version tag
  version: String,
}

impl VersionTokenChecker {
  /// Creates a checker for the given version tag.
  pub fn new(version: impl Into<String>) -> Self { Self { version: version.into() } }
}

impl TokenChecker for VersionTokenChecker {
  fn new_token(&self, _key: &str, _value: &Slot) -> Token { Value::String(self.version.clone()) }
}

/// Ties cache entries keyed by citation key to the content of the matching bibliography entry.
///
/// The token is a SHA-256 fingerprint of the selected fields of the entry whose key equals the
/// cache key. Fingerprints are taken from a snapshot of the bibliography when the checker is
/// built; rebuild the checker with [`EntryFieldsTokenChecker::new`] after large edits.
#[derive(Debug, Clone)]
pub struct EntryFieldsTokenChecker {
  /// Fields covered by the fingerprint
  fields:       Vec<String>,
  /// Fingerprint per citation key
  fingerprints: BTreeMap<String, String>,
}

impl EntryFieldsTokenChecker {
  /// Fingerprints `fields` of every entry in `bibliography`.
  pub fn new(bibliography: &Bibliography, fields: &[String]) -> Self {
    let fingerprints =
      bibliography.iter().map(|entry| (entry.key.clone(), fingerprint(entry, fields))).collect();
    Self { fields: fields.to_vec(), fingerprints }
  }

  /// Fields covered by the fingerprint.
  pub fn fields(&self) -> &[String] { &self.fields }
}

impl TokenChecker for EntryFieldsTokenChecker {
  fn new_token(&self, key: &str, _value: &Slot) -> Token {
    self.fingerprints.get(key).map(|f| Value::String(f.clone())).unwrap_or(Value::Null)
  }
}

/// Hex SHA-256 over the entry type and the selected fields of an entry.
fn fingerprint(entry: &Entry, fields: &[String]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(entry.entry_type.as_bytes());
  for name in fields {
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    match entry.field(name) {
      Some(value) => {
        hasher.update([1u8]);
        hasher.update(value.as_bytes());
      },
      None => hasher.update([2u8]),
    }
  }
  format!("{:x}", hasher.finalize())
}

/// Conjunction of several checkers. The token is the list of sub-tokens.
#[derive(Debug, Clone, Default)]
pub struct CombineTokenChecker {
  /// Checkers that must all agree
  checkers: Vec<Arc<dyn TokenChecker>>,
}

impl CombineTokenChecker {
  /// Combines the given checkers.
  pub fn new(checkers: Vec<Arc<dyn TokenChecker>>) -> Self { Self { checkers } }
}

impl TokenChecker for CombineTokenChecker {
  fn new_token(&self, key: &str, value: &Slot) -> Token {
    Value::Array(self.checkers.iter().map(|c| c.new_token(key, value)).collect())
  }

  fn cmp_tokens(&self, key: &str, value: &Slot, old: &Token) -> bool {
    let Some(old) = old.as_array() else { return false };
    old.len() == self.checkers.len()
      && self.checkers.iter().zip(old).all(|(checker, token)| checker.cmp_tokens(key, value, token))
  }
}

/// Dispatches to a different checker per key; keys without a checker always validate.
#[derive(Debug, Clone, Default)]
pub struct PerKeyTokenChecker {
  /// Checker per key
  checkers: BTreeMap<String, Arc<dyn TokenChecker>>,
}

impl PerKeyTokenChecker {
  /// Creates a dispatcher without any registered key.
  pub fn new() -> Self { Self::default() }

  /// Registers (or replaces) the checker used for `key`.
  pub fn insert(&mut self, key: impl Into<String>, checker: Arc<dyn TokenChecker>) {
    self.checkers.insert(key.into(), checker);
  }

  /// Whether a checker is registered for `key`.
  pub fn contains_key(&self, key: &str) -> bool { self.checkers.contains_key(key) }
}

impl TokenChecker for PerKeyTokenChecker {
  fn new_token(&self, key: &str, value: &Slot) -> Token {
    self.checkers.get(key).map(|c| c.new_token(key, value)).unwrap_or(Value::Null)
  }

  fn cmp_tokens(&self, key: &str, value: &Slot, old: &Token) -> bool {
    self.checkers.get(key).map_or(true, |c| c.cmp_tokens(key, value, old))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn leaf() -> Slot { Slot::Value(Value::from(1)) }

  #[test]
  fn test_fresh_tokens_always_validate() {
    let bib: Bibliography =
      [Entry::new("a", "article").with_field("title", "T")].into_iter().collect();
    let checkers: Vec<Arc<dyn TokenChecker>> = vec![
      Arc::new(IdentityTokenChecker),
      Arc::new(DateExpiryTokenChecker::new(Duration::days(1))),
      Arc::new(VersionTokenChecker::new("1.0")),
      Arc::new(EntryFieldsTokenChecker::new(&bib, &["title".to_string()])),
      Arc::new(CombineTokenChecker::new(vec![
        Arc::new(VersionTokenChecker::new("1.0")),
        Arc::new(DateExpiryTokenChecker::new(Duration::days(1))),
      ])),
      Arc::new(PerKeyTokenChecker::new()),
    ];
    for checker in checkers {
      for key in ["a", "missing"] {
        let token = checker.new_token(key, &leaf());
        assert!(checker.cmp_tokens(key, &leaf(), &token), "{checker:?} rejected its own token");
      }
    }
  }

  #[test]
  fn test_date_expiry() {
    let checker = DateExpiryTokenChecker::new(Duration::hours(2));
    let now = Utc::now();
    let recent = Value::from((now - Duration::hours(1)).timestamp());
    let old = Value::from((now - Duration::hours(3)).timestamp());
    assert!(checker.is_fresh_at(&recent, now));
    assert!(!checker.is_fresh_at(&old, now));
    assert!(!checker.is_fresh_at(&Value::from("garbage"), now));
  }

  #[test]
  fn test_version_mismatch_invalidates() {
    let token = VersionTokenChecker::new("1").new_token("k", &leaf());
    assert!(!VersionTokenChecker::new("2").cmp_tokens("k", &leaf(), &token));
  }

  #[test]
  fn test_entry_fields_follow_selected_fields_only() {
    let fields = vec!["title".to_string()];
    let before: Bibliography =
      [Entry::new("a", "article").with_field("title", "T").with_field("note", "n")]
        .into_iter()
        .collect();
    let token = EntryFieldsTokenChecker::new(&before, &fields).new_token("a", &leaf());

    let note_changed: Bibliography =
      [Entry::new("a", "article").with_field("title", "T").with_field("note", "other")]
        .into_iter()
        .collect();
    assert!(EntryFieldsTokenChecker::new(&note_changed, &fields).cmp_tokens("a", &leaf(), &token));

    let title_changed: Bibliography =
      [Entry::new("a", "article").with_field("title", "U")].into_iter().collect();
    assert!(!EntryFieldsTokenChecker::new(&title_changed, &fields).cmp_tokens("a", &leaf(), &token));
  }

  #[test]
  fn test_combine_of_two_is_a_conjunction() {
    let now_ok = DateExpiryTokenChecker::new(Duration::days(1));
    let combined = CombineTokenChecker::new(vec![
      Arc::new(VersionTokenChecker::new("v1")),
      Arc::new(now_ok.clone()),
    ]);
    let fresh = Value::from(Utc::now().timestamp());
    let stale = Value::from((Utc::now() - Duration::days(2)).timestamp());

    let both_ok = Value::Array(vec![Value::from("v1"), fresh.clone()]);
    let version_bad = Value::Array(vec![Value::from("v0"), fresh]);
    let date_bad = Value::Array(vec![Value::from("v1"), stale]);

    assert!(combined.cmp_tokens("k", &leaf(), &both_ok));
    assert!(!combined.cmp_tokens("k", &leaf(), &version_bad));
    assert!(!combined.cmp_tokens("k", &leaf(), &date_bad));
    assert!(!combined.cmp_tokens("k", &leaf(), &Value::from("v1")));
  }

  #[test]
  fn test_combine_of_three_is_a_conjunction() {
    let fields = vec!["title".to_string()];
    let bib: Bibliography =
      [Entry::new("k", "article").with_field("title", "T")].into_iter().collect();
    let changed: Bibliography =
      [Entry::new("k", "article").with_field("title", "changed")].into_iter().collect();

    let make = |version: &str, bib: &Bibliography| {
      CombineTokenChecker::new(vec![
        Arc::new(VersionTokenChecker::new(version)),
        Arc::new(DateExpiryTokenChecker::new(Duration::days(1))),
        Arc::new(EntryFieldsTokenChecker::new(bib, &fields)),
      ])
    };
    let token = make("v1", &bib).new_token("k", &leaf());

    assert!(make("v1", &bib).cmp_tokens("k", &leaf(), &token));
    assert!(!make("v2", &bib).cmp_tokens("k", &leaf(), &token));
    assert!(!make("v1", &changed).cmp_tokens("k", &leaf(), &token));

    let mut expired = token.as_array().unwrap().clone();
    expired[1] = Value::from((Utc::now() - Duration::days(3)).timestamp());
    assert!(!make("v1", &bib).cmp_tokens("k", &leaf(), &Value::Array(expired)));
  }

  #[test]
  fn test_per_key_dispatch_defaults_to_pass_through() {
    let mut per_key = PerKeyTokenChecker::new();
    per_key.insert("versioned", Arc::new(VersionTokenChecker::new("new")));
    let stale = Value::from("old");
    assert!(!per_key.cmp_tokens("versioned", &leaf(), &stale));
    assert!(per_key.cmp_tokens("anything-else", &leaf(), &stale));
  }
}
