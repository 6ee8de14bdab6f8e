use filedrop_core::AppConfig;
use filedrop_core::config::{ACCEPT_TIMEOUT_ENV, CONFIG_DIR_ENV, get_config_dir};
use std::time::Duration;

// Environment variables are process-wide, so everything touching them runs
// in this one test.
#[test]
fn test_config_round_trip_and_env_overrides() {
    let temp_dir = tempfile::tempdir().unwrap();
    unsafe {
        std::env::set_var(CONFIG_DIR_ENV, temp_dir.path());
        std::env::remove_var(ACCEPT_TIMEOUT_ENV);
    }
    assert_eq!(get_config_dir(), Some(temp_dir.path().to_path_buf()));

    // Nothing on disk yet
    assert_eq!(AppConfig::load(), AppConfig::default());

    let config = AppConfig {
        download_path: temp_dir.path().join("downloads"),
        stun_servers: vec!["stun:stun.example.org:3478".to_string()],
        poll_interval_ms: 250,
        accept_timeout_secs: 12,
        session_ttl_secs: 60,
    };
    config.save().unwrap();
    assert!(temp_dir.path().join("config.json").exists());

    let loaded = AppConfig::load();
    assert_eq!(loaded, config);
    assert_eq!(loaded.poll_interval(), Duration::from_millis(250));
    assert_eq!(loaded.session_ttl(), Duration::from_secs(60));

    unsafe { std::env::set_var(ACCEPT_TIMEOUT_ENV, "3") };
    assert_eq!(AppConfig::load().accept_timeout(), Duration::from_secs(3));

    // Unparseable override is ignored
    unsafe { std::env::set_var(ACCEPT_TIMEOUT_ENV, "soon") };
    assert_eq!(AppConfig::load().accept_timeout_secs, 12);

    // A corrupt file falls back to defaults
    std::fs::write(temp_dir.path().join("config.json"), "{ not json").unwrap();
    unsafe { std::env::remove_var(ACCEPT_TIMEOUT_ENV) };
    assert_eq!(AppConfig::load(), AppConfig::default());

    unsafe { std::env::remove_var(CONFIG_DIR_ENV) };
}
