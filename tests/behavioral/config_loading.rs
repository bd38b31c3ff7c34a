// ABOUTME: Behavioral tests for configuration loading and catalog overrides
// Verifies defaults, file parsing, environment overrides and validation errors

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use clustercast::config::{AppConfig, ConfigError};
use clustercast::transport::{AdmissionGate, BlockingMode, Component, TransportMetrics, Wait};

/// Test 1: Defaults are usable as-is
#[test]
fn test_default_config_is_valid() {
    let config = AppConfig::default();

    config.validate().expect("defaults should validate");
    assert_eq!(config.pool.max_size, 25);
    assert_eq!(config.pool.max_wait(), Wait::Bounded(Duration::from_millis(3000)));
    assert_eq!(config.gate.capacity, 10);
    assert!(config.heartbeat.is_multicast());
}

/// Test 2: A config file overrides only the values it names
#[test]
fn test_load_from_file_keeps_unnamed_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[pool]
max_size = 4
max_wait_millis = -1

[gate]
blocking_mode = "block_interruptible"
denied_status_code = 429

[messages]
"gate.atCapacity" = "Busy: {0} slots taken"
"#,
    )
    .unwrap();

    let config = AppConfig::load_from(&path).unwrap();

    assert_eq!(config.pool.max_size, 4);
    assert_eq!(config.pool.max_wait(), Wait::Forever);
    assert_eq!(config.gate.blocking_mode, BlockingMode::BlockInterruptible);
    assert_eq!(config.heartbeat, AppConfig::default().heartbeat);

    // Catalog overrides flow into the components built from this config
    let gate = AdmissionGate::with_parts(
        &config.gate,
        config.catalog().unwrap().shared(),
        Arc::new(TransportMetrics::new()),
    )
    .unwrap();
    let _permits: Vec<_> = (0..10).map(|_| gate.try_enter().unwrap()).collect();
    let denied = gate.try_enter().unwrap_err();
    assert_eq!(denied.to_string(), "Busy: 10 slots taken");
    assert_eq!(denied.status_code(), Some(429));
}

/// Test 3: A written default config reads back identically
#[test]
fn test_save_then_load_default() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    AppConfig::default().save_to(&path).unwrap();
    let loaded = AppConfig::load_from(&path).unwrap();

    assert_eq!(loaded, AppConfig::default());
}

/// Test 4: Environment variables override file values
#[test]
fn test_env_overrides_apply() {
    let mut config = AppConfig::default();
    let vars = [
        ("CLUSTERCAST_POOL_MAX_SIZE", "8"),
        ("CLUSTERCAST_GATE_BLOCKING_MODE", "reject_immediately"),
        ("CLUSTERCAST_HEARTBEAT_GROUP_ADDRESS", "239.1.2.3"),
        ("UNRELATED_VARIABLE", "ignored"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()));

    config.apply_env(vars).unwrap();

    assert_eq!(config.pool.max_size, 8);
    assert_eq!(config.gate.blocking_mode, BlockingMode::RejectImmediately);
    assert_eq!(config.heartbeat.group_address.to_string(), "239.1.2.3");
}

/// Test 5: Bad environment values and unknown variables are reported
#[test]
fn test_env_errors() {
    let mut config = AppConfig::default();
    let err = config
        .apply_env([("CLUSTERCAST_POOL_MAX_SIZE".to_string(), "many".to_string())])
        .unwrap_err();
    assert_eq!(
        err,
        ConfigError::InvalidEnv {
            key: "CLUSTERCAST_POOL_MAX_SIZE".to_string(),
            value: "many".to_string(),
        }
    );

    let err = config
        .apply_env([("CLUSTERCAST_POOL_COLOUR".to_string(), "blue".to_string())])
        .unwrap_err();
    assert_eq!(err, ConfigError::UnknownEnv("CLUSTERCAST_POOL_COLOUR".to_string()));
}

/// Test 6: Settings no component can run with fail validation
#[test]
fn test_validation_rejects_unusable_settings() {
    let mut config = AppConfig::default();
    config.pool.max_size = 0;
    assert_eq!(config.validate(), Err(ConfigError::ZeroPoolSize));

    let mut config = AppConfig::default();
    config.heartbeat.ttl = 300;
    assert_eq!(config.validate(), Err(ConfigError::TtlOutOfRange(300)));

    let mut config = AppConfig::default();
    config.messages = HashMap::from([("router.exhausted".to_string(), "x".to_string())]);
    assert!(matches!(config.validate(), Err(ConfigError::Catalog(_))));
    assert_eq!(Component::Pool.key(), "pool");
}
