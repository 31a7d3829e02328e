//! Integration tests for the configuration layer.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use procwatch::config::{ConfigError, ConfigLoader};
use procwatch::supervisor::SupervisorBuilder;

fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let path = dir.path().join("config.toml");
    fs::write(&path, contents).expect("write failed");
    (dir, path)
}

/// A full config file loads with every section applied.
#[test]
fn load_from_explicit_path() {
    let (_dir, path) = write_config(
        r#"
        [process]
        stop_timeout_ms = 250
        poll_interval_ms = 10
        force_kill = true

        [output]
        capture = true
        echo = true

        [env]
        FROM_CONFIG = "yes"
    "#,
    );

    let config = ConfigLoader::with_path(path).load().expect("load failed");
    assert_eq!(config.process.stop_timeout_ms, 250);
    assert_eq!(config.process.poll_interval_ms, 10);
    assert!(config.process.force_kill);
    assert!(config.output.capture);
    assert!(config.output.echo);
    assert_eq!(config.env.get("FROM_CONFIG").map(String::as_str), Some("yes"));
}

/// Loaded settings seed a builder and reach the built supervisor.
#[test]
fn loaded_config_seeds_builder() {
    let (_dir, path) = write_config(
        r#"
        [process]
        stop_timeout_ms = 250
    "#,
    );

    let config = ConfigLoader::with_path(path).load().expect("load failed");
    let supervisor = SupervisorBuilder::from_config("server", &config).build();
    assert_eq!(supervisor.stop_timeout(), Duration::from_millis(250));
}

/// An environment overlay from the config file is visible inside the child.
#[cfg(unix)]
#[test]
fn config_env_overlay_reaches_child() {
    let (_dir, path) = write_config(
        r#"
        [env]
        FROM_CONFIG = "loaded"
    "#,
    );

    let config = ConfigLoader::with_path(path).load().expect("load failed");
    let mut supervisor = SupervisorBuilder::from_config("sh", &config)
        .args(["-c", r#"echo "$FROM_CONFIG""#])
        .poll_interval(Duration::from_millis(5))
        .start()
        .expect("start failed");

    let line = supervisor.next_line().expect("read failed");
    assert_eq!(line.as_deref(), Some("loaded"));
}

/// A present but malformed file is an error, never silently defaulted.
#[test]
fn malformed_file_is_parse_error() {
    let (_dir, path) = write_config("[process\nstop_timeout_ms = not-a-number");

    let result = ConfigLoader::with_path(path).load();
    assert!(matches!(result, Err(ConfigError::ParseError { .. })));
}

/// An absent file is not an error; defaults apply.
#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let path = dir.path().join("does-not-exist.toml");

    let config = ConfigLoader::with_path(path).load().expect("load failed");
    assert_eq!(config.process.stop_timeout_ms, 1000);
    assert!(!config.process.force_kill);
}

/// `find_config_file` reports the first existing search path.
#[test]
fn find_config_file_reports_existing_path() {
    let (_dir, path) = write_config("");

    let loader = ConfigLoader::with_path(path.clone());
    assert_eq!(loader.find_config_file(), Some(path));
}
