//! Coverage for config file loading and defaults.

use std::fs;
use std::time::Duration;

use whatsmux::config::{load_config, load_config_or_default};

#[test]
fn full_file_overrides_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
[server]
bind = "0.0.0.0:9000"
api_token_env = "MUX_TOKEN"

[database]
path = "/var/lib/whatsmux/data.db"

[cloud]
api_version = "v22.0"
default_template = "welcome"
template_language = "de"

[router]
send_timeout_secs = 10
event_buffer = 64

[reconnect]
initial_backoff_ms = 500
max_backoff_ms = 8000
jitter_ratio = 0.1
max_attempts = 12

[logging]
level = "debug"
"#,
    )
    .expect("write config");

    let config = load_config(&path).expect("config should load");

    assert_eq!(config.server.bind, "0.0.0.0:9000");
    assert_eq!(config.platform_credential_keys().api_token, "MUX_TOKEN");
    assert_eq!(
        config.database.path.as_deref(),
        Some(std::path::Path::new("/var/lib/whatsmux/data.db"))
    );
    assert_eq!(config.cloud.api_version, "v22.0");
    assert_eq!(config.cloud.api_base, "https://graph.facebook.com");
    assert_eq!(config.cloud.default_template, "welcome");
    assert_eq!(config.router.send_timeout(), Duration::from_secs(10));
    assert_eq!(config.router.event_buffer, 64);
    assert_eq!(config.reconnect.max_attempts, 12);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn zero_timeouts_are_raised_to_one_second() {
    let config: whatsmux::config::Config = toml::from_str(
        r#"
[router]
send_timeout_secs = 0

[bridge]
poll_timeout_secs = 0
"#,
    )
    .expect("should parse");

    assert_eq!(config.router.send_timeout(), Duration::from_secs(1));
    assert_eq!(config.bridge.poll_timeout(), Duration::from_secs(1));
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");

    let config = load_config_or_default(&path).expect("defaults");

    assert_eq!(config.server.bind, "127.0.0.1:8080");
    assert_eq!(config.bridge.base_url, "http://127.0.0.1:3001");
    assert!(load_config(&path).is_err());
}

#[test]
fn malformed_file_is_an_error_naming_the_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(&path, "[server\nbind = ").expect("write config");

    let err = load_config_or_default(&path).expect_err("should not parse");

    assert!(err.to_string().contains("config.toml"));
}

#[test]
fn wrong_value_types_are_rejected() {
    let parsed = toml::from_str::<whatsmux::config::Config>(
        r#"
[reconnect]
max_attempts = "many"
"#,
    );
    assert!(parsed.is_err());
}

#[test]
fn invalid_upstream_origin_fails_loading() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(&path, "[bridge]\nbase_url = \"not a url\"\n").expect("write config");

    let err = load_config(&path).expect_err("origin should be rejected");

    assert!(err.to_string().contains("bridge.base_url"));
}
