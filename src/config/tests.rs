//! Configuration tests
//!
//! File-layer parsing and default checks only; `from_env` reads the process
//! environment, which parallel tests can't safely mutate.

use super::*;

#[test]
fn file_config_parses_a_full_file() {
    let parsed: FileConfig = toml::from_str(
        r#"
        port = 9090
        host = "127.0.0.1"
        mongodb_uri = "mongodb://localhost:27017/parley"
        cors_origins = ["https://studies.example.org"]
        force_auth = true
        log_level = "debug"
        openai_base_url = "https://gateway.example.org"
        "#,
    )
    .unwrap();

    assert_eq!(parsed.port, Some(9090));
    assert_eq!(parsed.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(
        parsed.mongodb_uri.as_deref(),
        Some("mongodb://localhost:27017/parley")
    );
    assert_eq!(parsed.force_auth, Some(true));
    assert_eq!(
        parsed.cors_origins.as_deref(),
        Some(&["https://studies.example.org".to_string()][..])
    );
    assert_eq!(
        parsed.openai_base_url.as_deref(),
        Some("https://gateway.example.org")
    );
}

#[test]
fn file_config_tolerates_an_empty_file() {
    let parsed: FileConfig = toml::from_str("").unwrap();
    assert!(parsed.port.is_none());
    assert!(parsed.mongodb_uri.is_none());
}

#[test]
fn defaults_are_serverless_friendly() {
    let config = Config::default();
    assert_eq!(config.bind_addr.port(), 8080);
    assert!(config.mongodb_uri.is_none());
    assert!(config.cors_origins.is_empty());
    assert!(!config.force_auth);
}

#[test]
fn display_masks_credentials() {
    let mut config = Config::default();
    config.providers.anthropic_api_key = Some("sk-ant-secret".to_string());

    let shown = config.display();
    assert!(!shown.contains("sk-ant-secret"));
    assert!(shown.contains("anthropic_api_key = set"));
    assert!(shown.contains("openai_api_key = unset"));
}
