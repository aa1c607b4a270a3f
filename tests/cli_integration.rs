//! Integration tests for CLI commands.
//!
//! These run without docker, audio hardware or a running supervisor; every
//! path the commands touch lives in a temporary directory.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

/// Get a Command for the supervisor binary
fn supervisor() -> Command {
    let mut cmd = Command::cargo_bin("birdnet-supervisor").unwrap();
    cmd.env_remove("BIRDNET_SUPERVISOR_CONFIG")
        .env_remove("ICECAST_PASSWORD")
        .env_remove("STREAM_BITRATE")
        .env("TZ", "UTC");
    cmd
}

/// Write a config whose state lives under `root`.
fn write_config(root: &Path) -> std::path::PathBuf {
    let path = root.join("config.toml");
    let contents = format!(
        r#"[repo]
dir = "{root}/repo"

[service]
user = "pi"

[signals]
dir = "{root}/signals"

[logging]
dir = "{root}/log"
"#,
        root = root.display()
    );
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_help_command() {
    supervisor()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("BirdNET display"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("install"))
        .stdout(predicate::str::contains("signal"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("reconfigure").not());
}

#[test]
fn test_version_command() {
    supervisor()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("birdnet-supervisor"));
}

#[test]
fn test_install_help() {
    supervisor()
        .args(["install", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--update"))
        .stdout(predicate::str::contains("--branch"))
        .stdout(predicate::str::contains("--no-reboot"))
        .stdout(predicate::str::contains("--skip-build"));
}

#[test]
fn test_config_show() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    supervisor()
        .args(["--config", config.to_str().unwrap(), "config", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[repo]"))
        .stdout(predicate::str::contains("poll_interval_secs = 5"))
        .stdout(predicate::str::contains("project = \"birdnet\""));
}

#[test]
fn test_config_rejects_root_user() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    fs::write(&config, "[service]\nuser = \"root\"\n").unwrap();
    supervisor()
        .args(["--config", config.to_str().unwrap(), "config", "--show"])
        .assert()
        .failure();
}

#[test]
fn test_config_path_from_env() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("absent.toml");
    supervisor()
        .env("BIRDNET_SUPERVISOR_CONFIG", &config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("absent.toml"))
        .stdout(predicate::str::contains("using defaults"));
}

#[test]
fn test_signal_update_with_branch() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    supervisor()
        .env("BIRDNET_SUPERVISOR_CONFIG", &config)
        .args(["signal", "update", "--branch", "beta"])
        .assert()
        .success()
        .stdout(predicate::str::contains("update-requested"));

    let payload = fs::read_to_string(dir.path().join("signals/update-requested")).unwrap();
    assert_eq!(payload, "beta");
}

#[test]
fn test_signal_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    supervisor()
        .args(["-c", config.to_str().unwrap(), "signal", "restart"])
        .assert()
        .success();
    assert!(dir.path().join("signals/restart-backend").exists());
}

#[test]
fn test_signal_unknown_kind() {
    supervisor()
        .args(["signal", "reboot"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_status_no_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    fs::create_dir_all(dir.path().join("signals")).unwrap();
    fs::write(dir.path().join("signals/update-requested"), "main").unwrap();

    supervisor()
        .args(["-c", config.to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"))
        .stdout(predicate::str::contains("update-requested pending main"))
        .stdout(predicate::str::contains("Update:     never"));
}
