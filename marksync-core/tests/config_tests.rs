//! Config error-message, atomic-write-safety, and init integration tests.
//! Layout: ~/.marksync/config.yaml

use assert_fs::prelude::*;
use marksync_core::{config, Config, ConfigError};
use predicates::prelude::predicate;
use std::fs;

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".marksync/config.yaml")
        .write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"), "must contain file path, got: {err}");
}

#[test]
fn load_wrong_type_yaml_returns_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".marksync/config.yaml")
        .write_str("server:\n  relay_queue_capacity: lots\n")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
}

#[test]
fn load_overlapping_kind_groups_is_invalid() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".marksync/config.yaml")
        .write_str("server:\n  exclusive_kind_groups: [[3, 4], [4]]\n")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn save_cleans_up_tmp_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &Config::default()).expect("save");

    home.child(".marksync/config.yaml").assert(predicate::path::exists());
    home.child(".marksync/config.yaml.tmp")
        .assert(predicate::path::missing());
}

#[test]
fn save_refuses_invalid_config_and_leaves_file_untouched() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &Config::default()).expect("save");
    let before = fs::read_to_string(config::config_path_at(home.path())).expect("read");

    let mut broken = Config::default();
    broken.server.catchup_ack_timeout_ms = 0;
    assert!(config::save_at(home.path(), &broken).is_err());

    let after = fs::read_to_string(config::config_path_at(home.path())).expect("read");
    assert_eq!(before, after);
}

// ---------------------------------------------------------------------------
// 3. Init
// ---------------------------------------------------------------------------

#[test]
fn init_writes_loadable_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let written = config::init_at(home.path()).expect("init");

    home.child(".marksync/config.yaml")
        .assert(predicate::str::contains("relay_queue_capacity: 256"));
    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(written, loaded);
}

#[test]
fn init_keeps_existing_settings() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let mut custom = Config::default();
    custom.server.listen = "0.0.0.0:6000".to_string();
    config::save_at(home.path(), &custom).expect("save");

    let loaded = config::init_at(home.path()).expect("init");
    assert_eq!(loaded.server.listen, "0.0.0.0:6000");
}
