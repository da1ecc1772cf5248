/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use gastown_utils::Settings;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::tempdir;

#[test]
#[serial]
fn test_settings_from_file_and_env() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("test_config.toml");

    let test_config = r#"
        [operator]
        health_port = 9191
        resync_interval_seconds = 60
        rig_namespace = "rigs"

        [log]
        level = "info"
    "#;
    fs::write(&file_path, test_config).expect("Failed to write test config file");

    env::set_var("GASTOWN__LOG__LEVEL", "debug");

    let settings = Settings::new(Some(file_path.to_str().unwrap().to_string()))
        .expect("Failed to load settings");

    assert_eq!(settings.operator.health_port, 9191);
    assert_eq!(settings.operator.rig_namespace, "rigs");
    assert_eq!(settings.log.level, "debug");
    // Untouched sections keep their embedded defaults
    assert_eq!(settings.backoff.max_retries, 10);

    temp_dir.close().expect("Failed to remove temp dir");
    env::remove_var("GASTOWN__LOG__LEVEL");
}

#[test]
#[serial]
fn test_unused_operator_keys_are_ignored() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("legacy.toml");
    fs::write(
        &file_path,
        r#"
        [operator]
        rig_namespace = "legacy"
        field_manager = "gastown-operator"
    "#,
    )
    .expect("Failed to write test config file");

    let settings = Settings::new(Some(file_path.to_str().unwrap().to_string()))
        .expect("Failed to load settings");
    assert_eq!(settings.operator.rig_namespace, "legacy");
    assert_eq!(settings.operator.health_port, 8080);

    temp_dir.close().expect("Failed to remove temp dir");
}

#[test]
#[serial]
fn test_known_hosts_from_env_list() {
    env::set_var(
        "GASTOWN__SSH__KNOWN_HOSTS",
        "git.internal ssh-ed25519 AAAAC3Nza1;git.other ssh-ed25519 AAAAC3Nza2",
    );

    let settings = Settings::new(None).expect("Failed to load settings");
    assert_eq!(settings.ssh.known_hosts.len(), 2);
    assert!(settings.ssh.known_hosts[0].starts_with("git.internal "));

    env::remove_var("GASTOWN__SSH__KNOWN_HOSTS");
}

#[test]
#[serial]
fn test_settings_default() {
    let settings = Settings::new(None).expect("Failed to load default settings");

    assert_eq!(settings.log.format, "text");
    assert_eq!(settings.pod.metrics_port, 9090);
    assert_eq!(settings.tools.gt_path, "gt");
}
