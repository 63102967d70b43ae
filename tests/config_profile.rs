use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use mqtt_loadtest::config::{load_profile, ConfigError, Profile};
use mqtt_loadtest::core::client::{ProtocolVersion, Qos};

fn write_profile(name: &str, body: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("mqtt-loadtest-{}-{name}.toml", std::process::id()));
    fs::write(&path, body).expect("write profile");
    path
}

#[test]
fn publish_profile_loads_from_file() {
    let path = write_profile(
        "publish",
        r#"
        [publish]
        url = "mqtts://broker.example.com"
        topic_prefix = "bench"
        topic_count = 4
        publisher_count = 8
        qos_type = 1
        protocol_version = 5
        message_rate = "250ms"
        connect_delay = 50
        prometheus_enabled = true
        listen_address = ":9100"
        "#,
    );

    let profile = load_profile(Some(&path)).expect("profile loads");
    fs::remove_file(&path).ok();

    let Profile::Publish(cfg) = profile else {
        panic!("expected publish profile");
    };
    assert_eq!(cfg.connection.broker.host, "broker.example.com");
    assert_eq!(cfg.connection.broker.port, 8883);
    assert!(cfg.connection.broker.tls);
    assert_eq!(cfg.connection.protocol, ProtocolVersion::V5);
    assert_eq!(cfg.topic_prefix, "bench");
    assert_eq!(cfg.topic_count, 4);
    assert_eq!(cfg.publisher_count, 8);
    assert_eq!(cfg.qos, Qos::AtLeastOnce);
    assert_eq!(cfg.message_rate, Duration::from_millis(250));
    assert_eq!(cfg.connect_delay, Duration::from_millis(50));
    assert!(cfg.metrics.enabled);
    assert_eq!(cfg.metrics.listen_addr.port(), 9100);
    assert_eq!(cfg.client_config(3).client_id, "mqtt-loadtest-pub3");
}

#[test]
fn invalid_profile_values_are_reported() {
    let path = write_profile(
        "invalid",
        r#"
        [subscribe]
        url = "localhost"
        topics_per_subscriber = 0
        "#,
    );

    let err = load_profile(Some(&path)).expect_err("zero topics rejected");
    fs::remove_file(&path).ok();
    assert!(matches!(err, ConfigError::ZeroCount("topics-per-subscriber")));
}

#[test]
fn missing_profile_file_is_an_io_error() {
    let path = std::env::temp_dir().join("mqtt-loadtest-does-not-exist.toml");
    assert!(matches!(load_profile(Some(&path)), Err(ConfigError::Io(_))));
}
