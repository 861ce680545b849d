//! Loading configuration files from disk.

use std::io::Write;

use kraftsync_core::config::{BridgeConfig, PresenceMode};
use kraftsync_core::{Error, SourceKind};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_file() {
    let file = write_config(
        r#"
        source = "simulation"

        [cloud]
        api_url = "https://cloud.example.test/v1"
        site_id = "site-42"
        request_timeout_secs = 12

        [intervals]
        telemetry_secs = 20
        command_poll_secs = 3

        [mapping]
        grace_cycles = 5
        selection = ["easee_1", "sensor.ams_power"]

        [retry]
        max_attempts = 1
        initial_delay_ms = 50

        [simulation]
        seed = 7
        presence = "vacation"
        occupants = 2
        "#,
    );

    let config = BridgeConfig::load(file.path()).unwrap();
    assert_eq!(config.source, SourceKind::Simulation);
    assert_eq!(config.request_timeout().as_secs(), 12);
    assert_eq!(config.intervals.command_poll().as_secs(), 5);
    assert_eq!(config.mapping.grace_cycles, 5);
    assert_eq!(config.mapping.selection.len(), 2);
    assert_eq!(config.retry.max_attempts, 1);
    assert_eq!(config.retry.max_delay_ms, 10_000);
    assert_eq!(config.simulation.seed, 7);
    assert_eq!(config.simulation.presence, PresenceMode::Vacation);
}

#[test]
fn test_load_rejects_invalid_file() {
    let file = write_config("[cloud]\nsite_id = \"\"\napi_url = \"https://x.test\"\n");
    // KRAFTSYNC_SITE_ID in the environment would mask the empty value
    if std::env::var("KRAFTSYNC_SITE_ID").is_ok() {
        return;
    }
    let err = BridgeConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_load_reports_syntax_errors() {
    let file = write_config("[cloud\nsite_id = 1");
    assert!(matches!(
        BridgeConfig::load(file.path()),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_missing_file() {
    let err = BridgeConfig::load("/nonexistent/kraftsync.toml").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
