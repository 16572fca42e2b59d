// Config loading and validation tests

use perfsync::config::AppConfig;
use std::time::Duration;

const VALID_CONFIG: &str = r#"
[server]
port = 8081
host = "0.0.0.0"

[database]
path = "data/perfsync.db"
max_pool_size = 4
retention_days = 14
vacuum_schedule = "0 0 3 * * *"

[sampling]
device_id = "desk-1"
tick_interval_ms = 1000

[batch]
max_batch_size = 300
max_batch_age_secs = 300
max_buffered_samples = 3600

[retry]
base_delay_ms = 1000
max_delay_ms = 30000
jitter = 0.2
max_attempts = 8

[pipeline]
connectivity_grace_secs = 30
shutdown_timeout_secs = 5

[identity]
user_id = "alice"
"#;

const MINIMAL_CONFIG: &str = r#"
[server]
port = 8081
host = "127.0.0.1"

[database]
path = "data/perfsync.db"
max_pool_size = 2

[sampling]
device_id = "desk-1"
"#;

#[test]
fn test_config_loads_from_str() {
    let config = AppConfig::load_from_str(VALID_CONFIG).expect("load_from_str");
    assert_eq!(config.server.port, 8081);
    assert_eq!(config.database.retention_days, 14);
    assert_eq!(config.database.vacuum_schedule.as_deref(), Some("0 0 3 * * *"));
    assert_eq!(config.sampling.device_id, "desk-1");
    assert_eq!(config.retry.max_attempts, Some(8));
    assert_eq!(config.identity.user_id.as_deref(), Some("alice"));
    assert_eq!(config.tick_interval(), Duration::from_secs(1));
}

#[test]
fn test_minimal_config_uses_defaults() {
    let config = AppConfig::load_from_str(MINIMAL_CONFIG).expect("load_from_str");
    let buffer = config.buffer_config();
    assert_eq!(buffer.max_batch_size, 300);
    assert_eq!(buffer.max_batch_age, Duration::from_secs(300));
    assert_eq!(buffer.max_buffered_samples, 3600);

    let retry = config.retry_policy();
    assert_eq!(retry.base_delay, Duration::from_secs(1));
    assert_eq!(retry.max_delay, Duration::from_secs(30));
    assert_eq!(retry.jitter, 0.2);
    assert_eq!(retry.max_attempts, None);

    assert_eq!(config.sampling.tick_interval_ms, 1000);
    assert_eq!(config.sampling.live_capacity, 60);
    assert!(!config.sampling.anomaly_flush);
    assert_eq!(config.pipeline.connectivity_grace_secs, 30);
    assert_eq!(config.pipeline.shutdown_timeout_secs, 5);
    assert!(config.database.vacuum_schedule.is_none());
    assert!(config.identity.user_id.is_none());
}

#[test]
fn test_config_validation_rejects_invalid_port() {
    let bad = VALID_CONFIG.replace("port = 8081", "port = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("server.port"));
}

#[test]
fn test_config_validation_rejects_empty_db_path() {
    let bad = VALID_CONFIG.replace("path = \"data/perfsync.db\"", "path = \"\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("database.path"));
}

#[test]
fn test_config_validation_rejects_empty_device_id() {
    let bad = VALID_CONFIG.replace("device_id = \"desk-1\"", "device_id = \"  \"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("sampling.device_id"));
}

#[test]
fn test_config_validation_rejects_zero_tick() {
    let bad = VALID_CONFIG.replace("tick_interval_ms = 1000", "tick_interval_ms = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("tick_interval_ms"));
}

#[test]
fn test_config_validation_rejects_ceiling_below_batch_size() {
    let bad = VALID_CONFIG.replace("max_buffered_samples = 3600", "max_buffered_samples = 100");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("max_buffered_samples"));
}

#[test]
fn test_config_validation_rejects_bad_jitter() {
    let bad = VALID_CONFIG.replace("jitter = 0.2", "jitter = 1.5");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("retry.jitter"));
}

#[test]
fn test_config_validation_rejects_base_delay_above_cap() {
    let bad = VALID_CONFIG.replace("base_delay_ms = 1000", "base_delay_ms = 60000");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("retry.base_delay_ms"));
}

#[test]
fn test_config_validation_rejects_zero_max_attempts() {
    let bad = VALID_CONFIG.replace("max_attempts = 8", "max_attempts = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("retry.max_attempts"));
}

#[test]
fn test_config_validation_rejects_bad_cron() {
    let bad = VALID_CONFIG.replace("\"0 0 3 * * *\"", "\"every night\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("vacuum_schedule"));
}

#[test]
fn test_config_validation_rejects_blank_user() {
    let bad = VALID_CONFIG.replace("user_id = \"alice\"", "user_id = \"\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("identity.user_id"));
}

#[test]
fn test_config_rejects_missing_section() {
    let bad = MINIMAL_CONFIG.replace("[sampling]\ndevice_id = \"desk-1\"\n", "");
    assert!(AppConfig::load_from_str(&bad).is_err());
}
