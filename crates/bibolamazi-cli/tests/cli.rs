//! Integration tests for the bibolamazi CLI commands.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

/// First line of the configuration block.
const BEGIN: &str = "%%%-BIBOLAMAZI-CONFIGURATION-BEGIN-%%%";
/// Last line of the configuration block.
const END: &str = "%%%-BIBOLAMAZI-CONFIGURATION-END-%%%";

// Helper function to create a command isolated from the user's settings
fn bibolamazi(dir: &Path) -> Command {
  let settings = dir.join("settings.toml");
  if !settings.exists() {
    std::fs::write(&settings, format!("package_cache_dir = {:?}\n", dir.join("packages"))).unwrap();
  }
  let mut command = Command::cargo_bin("bibolamazi").unwrap();
  command.arg("--settings").arg(settings).env_remove("RUST_LOG");
  command
}

// Helper writing a source and a document using it
fn document(dir: &Path, config: &[&str]) -> PathBuf {
  std::fs::write(
    dir.join("refs.json"),
    r#"{"a": {"title": "Alpha", "note": "n"}, "b": {"ENTRYTYPE": "book", "title": "Beta"}}"#,
  )
  .unwrap();
  let config: String = config.iter().map(|line| format!("% {line}\n")).collect();
  let path = dir.join("doc.bibolamazi.json");
  std::fs::write(&path, format!("{BEGIN}\n{config}{END}\n")).unwrap();
  path
}

#[test]
fn test_run_writes_document_back() {
  let dir = tempdir().unwrap();
  let path = document(dir.path(), &["src: refs.json", "filter: strip", "filter: fieldset --field=x --value=y"]);

  bibolamazi(dir.path())
    .arg("run")
    .arg(&path)
    .assert()
    .success()
    .stdout(predicate::str::contains("Loaded 2 entries"))
    .stdout(predicate::str::contains("Wrote"));

  let written = std::fs::read_to_string(&path).unwrap();
  assert!(written.starts_with(BEGIN));
  assert!(written.contains("\"x\": \"y\""));
  assert!(!written.contains("\"note\""));
  assert!(dir.path().join("doc.bibolamazi.json.bibolamazicache").exists());
}

#[test]
fn test_run_to_stdout_leaves_file_alone() {
  let dir = tempdir().unwrap();
  let path = document(dir.path(), &["src: refs.json"]);
  let before = std::fs::read_to_string(&path).unwrap();

  bibolamazi(dir.path())
    .arg("run")
    .arg("--stdout")
    .arg(&path)
    .assert()
    .success()
    .stdout(predicate::str::contains("\"Beta\""));

  assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
}

#[test]
fn test_check_reports_bad_filter_with_line() {
  let dir = tempdir().unwrap();
  let path = document(dir.path(), &["src: refs.json", "filter: nonexistent"]);

  bibolamazi(dir.path())
    .arg("check")
    .arg(&path)
    .assert()
    .failure()
    .stderr(predicate::str::contains("Line 3"))
    .stderr(predicate::str::contains("No such filter \"nonexistent\""));
}

#[test]
fn test_check_lists_filters() {
  let dir = tempdir().unwrap();
  let path = document(dir.path(), &["src: refs.json", "filter: strip -sFields=note"]);

  bibolamazi(dir.path())
    .arg("check")
    .arg(&path)
    .assert()
    .success()
    .stdout(predicate::str::contains("strip"))
    .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_filters_and_help() {
  let dir = tempdir().unwrap();

  bibolamazi(dir.path())
    .arg("filters")
    .assert()
    .success()
    .stdout(predicate::str::contains("bibolamazi_filters"))
    .stdout(predicate::str::contains("firstseen"));

  bibolamazi(dir.path())
    .arg("help-filter")
    .arg("fieldset")
    .assert()
    .success()
    .stdout(predicate::str::contains("--overwrite"))
    .stdout(predicate::str::contains("-dOverwrite"));

  bibolamazi(dir.path()).arg("help-filter").arg("nope").assert().failure();
}

#[test]
fn test_remote_packages_need_opt_in() {
  let dir = tempdir().unwrap();
  let path = document(dir.path(), &["src: refs.json", "package: github:owner/repo"]);

  bibolamazi(dir.path())
    .arg("check")
    .arg(&path)
    .assert()
    .failure()
    .stderr(predicate::str::contains("Remote filter packages are not allowed"));
}

#[test]
fn test_verbosity_raises_log_level() {
  let dir = tempdir().unwrap();
  let path = document(dir.path(), &["src: refs.json"]);

  bibolamazi(dir.path())
    .arg("check")
    .arg(&path)
    .assert()
    .success()
    .stderr(predicate::str::contains("INFO").not());

  bibolamazi(dir.path())
    .arg("-vv")
    .arg("check")
    .arg(&path)
    .assert()
    .success()
    .stderr(predicate::str::contains("DEBUG"))
    .stderr(predicate::str::contains("Loaded settings"));
}
