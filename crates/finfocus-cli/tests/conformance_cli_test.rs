//! End-to-end tests of the `finfocus` binary's argument handling and exit codes.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use finfocus_test_utils::{plugin_root, write_manifest, write_script};

/// A `finfocus` command isolated from the user's config and plugins.
fn finfocus(config_home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("finfocus"));
    cmd.env("XDG_CONFIG_HOME", config_home)
        .env_remove("FINFOCUS_PLUGIN_DIR")
        .env_remove("FINFOCUS_LOG_LEVEL")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn invalid_filter_regex_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    let script = write_script(home.path(), "plugin", "exit 0");
    finfocus(home.path())
        .args(["plugin", "conformance"])
        .arg(&script)
        .args(["--filter", "(unclosed"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("invalid --filter"));
}

#[test]
fn unknown_category_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    finfocus(home.path())
        .args(["plugin", "conformance", "./nowhere", "--category", "vibes"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("invalid category"));
}

#[test]
fn plugin_that_exits_immediately_is_an_infrastructure_failure() {
    let home = TempDir::new().unwrap();
    let script = write_script(home.path(), "plugin", "echo 'no config found' >&2\nexit 3");
    finfocus(home.path())
        .args(["plugin", "conformance", "--output", "json"])
        .arg(&script)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("suite_error"))
        .stdout(predicate::str::contains("plugin unavailable"));
}

#[test]
fn unwritable_output_file_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    let script = write_script(home.path(), "plugin", "exit 0");
    let target = home.path().join("missing-dir").join("report.xml");
    finfocus(home.path())
        .args(["plugin", "conformance", "--output", "junit", "--output-file"])
        .arg(&target)
        .arg(&script)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("cannot write report"));
    assert!(!target.exists());
}

#[test]
fn junit_report_goes_to_output_file() {
    let home = TempDir::new().unwrap();
    let script = write_script(home.path(), "plugin", "exit 1");
    let target = home.path().join("report.xml");
    finfocus(home.path())
        .args(["plugin", "conformance", "--output", "junit", "--output-file"])
        .arg(&target)
        .arg(&script)
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
    let xml = fs::read_to_string(&target).unwrap();
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("<testsuites"));
}

#[test]
fn empty_plugin_dir_lists_nothing() {
    let home = TempDir::new().unwrap();
    let root = plugin_root();
    finfocus(home.path())
        .args(["plugin", "list", "--plugin-dir"])
        .arg(root.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No plugins found"));
}

#[test]
fn list_shows_plugins_and_errors() {
    let home = TempDir::new().unwrap();
    let root = plugin_root();
    let dir = write_manifest(root.path(), "aws", "1.2.0", &["aws"]);
    write_script(&dir, "finfocus-plugin-aws", "exit 0");
    let broken = root.path().join("broken").join("0.1.0");
    fs::create_dir_all(&broken).unwrap();
    fs::write(broken.join("plugin.toml"), "name = [").unwrap();

    finfocus(home.path())
        .env("FINFOCUS_PLUGIN_DIR", root.path())
        .args(["plugin", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("aws"))
        .stdout(predicate::str::contains("1.2.0"))
        .stdout(predicate::str::contains("Errors:"));
}

#[test]
fn malformed_config_file_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    let config_dir = home.path().join("finfocus");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("config.toml"), "[plugins]\ndir = 42\n").unwrap();
    let root = plugin_root();

    finfocus(home.path())
        .args(["plugin", "list", "--plugin-dir"])
        .arg(root.path())
        .assert()
        .code(4)
        .stderr(predicate::str::contains("failed to parse config file"));
}

#[test]
fn help_exits_zero() {
    let home = TempDir::new().unwrap();
    finfocus(home.path())
        .args(["plugin", "conformance", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--case-timeout"));
}

#[test]
fn completions_are_generated() {
    let home = TempDir::new().unwrap();
    finfocus(home.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("finfocus"));
}
