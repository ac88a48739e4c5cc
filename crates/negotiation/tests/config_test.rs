//! Integration tests for security options read from a configuration file

use negotiation::{Error, NegotiationConfig, SecurityContext};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_from_conf_security_section() {
    let temp_dir = TempDir::new().unwrap();
    let conf_path = temp_dir.path().join("config.ini");

    let conf_content = r#"
[global]
enable_auth = true

[security]
mandatory_auth = yes
super_users = admin,pegasus
sasl_mechanisms = HMAC-SHA256
client_mechanisms = HMAC-SHA256, GSSAPI
auth_legacy_peer_fallback = on
"#;
    fs::write(&conf_path, conf_content).unwrap();

    let config = NegotiationConfig::from_conf(conf_path.to_str().unwrap())
        .expect("Failed to load config");
    assert!(config.enable_auth);
    assert!(config.mandatory_auth);
    assert!(config.legacy_peer_fallback);
    assert!(config.is_superuser("admin"));
    assert_eq!(config.server_mechanisms, vec!["HMAC-SHA256".to_string()]);
    assert_eq!(
        config.client_mechanisms,
        vec!["HMAC-SHA256".to_string(), "GSSAPI".to_string()]
    );
    assert!(config.keyring.is_none());
}

#[test]
fn test_from_conf_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let conf_path = temp_dir.path().join("config.ini");
    fs::write(&conf_path, "[replication]\nmutation_2pc_min_replica_count = 2\n").unwrap();

    let config = NegotiationConfig::from_conf(conf_path.to_str().unwrap()).unwrap();
    assert!(config.enable_auth);
    assert!(!config.mandatory_auth);
    assert!(!config.legacy_peer_fallback);
    assert_eq!(config.client_mechanisms, vec!["GSSAPI".to_string()]);
}

#[test]
fn test_from_conf_rejects_inconsistent_policy() {
    let temp_dir = TempDir::new().unwrap();
    let conf_path = temp_dir.path().join("config.ini");
    fs::write(
        &conf_path,
        "[security]\nenable_auth = false\nmandatory_auth = true\n",
    )
    .unwrap();

    let err = NegotiationConfig::from_conf(conf_path.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("mandatory_auth"));
}

#[test]
fn test_from_conf_missing_file() {
    let err = NegotiationConfig::from_conf("/nonexistent/dsn/config.ini").unwrap_err();
    assert_eq!(err.category(), "Configuration");
}

#[tokio::test]
async fn test_context_loads_keyring() {
    let temp_dir = TempDir::new().unwrap();
    let keyring_path = temp_dir.path().join("keyring");
    fs::write(
        &keyring_path,
        "[client.admin]\nkey = c2VjcmV0LWtleS0xMjM0NTY=\n",
    )
    .unwrap();
    let conf_path = temp_dir.path().join("config.ini");
    fs::write(
        &conf_path,
        format!(
            "[security]\nsasl_mechanisms = HMAC-SHA256\nclient_mechanisms = HMAC-SHA256\nkeyring = {}\n",
            keyring_path.display()
        ),
    )
    .unwrap();

    let config = NegotiationConfig::from_conf(conf_path.to_str().unwrap()).unwrap();
    assert_eq!(config.keyring.as_deref(), Some(keyring_path.as_path()));

    let context = SecurityContext::from_config(config, "client.admin")
        .await
        .unwrap();
    assert!(context.mechanisms().supports("HMAC-SHA256"));
}

#[tokio::test]
async fn test_context_missing_keyring() {
    let config = NegotiationConfig {
        keyring: Some("/nonexistent/keyring".into()),
        ..NegotiationConfig::default().with_mechanisms(&["HMAC-SHA256"])
    };
    let err = SecurityContext::from_config(config, "client.admin")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
