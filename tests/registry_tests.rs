//! Tests for target definition loading and environment resolution
//!
//! These tests verify:
//! - Built-in definitions load and expose their contracts
//! - User definitions files merge over built-ins by id
//! - Load-time rejection of malformed definitions
//! - Mandatory variable reporting

use archtarget::{ArchiveError, ConfigError, EnvDefault, EnvOverrides, TargetRegistry};
use std::fs;

// =============================================================================
// Built-in Definitions
// =============================================================================

#[test]
fn test_builtin_contracts() {
    let registry = TargetRegistry::builtin().unwrap();
    assert_eq!(registry.len(), 2);

    let local = registry.get("local_rsync").unwrap();
    assert_eq!(local.env().required_names(), vec!["site_root"]);
    assert_eq!(
        local.env().get("command"),
        Some(&EnvDefault::Default("rsync".to_string()))
    );

    // Numeric defaults are stringified
    let rsyncd = registry.get("rsyncd").unwrap();
    assert_eq!(
        rsyncd.env().get("rsync_port"),
        Some(&EnvDefault::Default("873".to_string()))
    );
}

#[test]
fn test_missing_mandatory_variables_all_named() {
    let registry = TargetRegistry::builtin().unwrap();
    let rsyncd = registry.get("rsyncd").unwrap();

    let err = rsyncd
        .resolve_env(&EnvOverrides::new().set("site_root", "/farm"))
        .unwrap_err();
    assert_eq!(
        err,
        ConfigError::MissingVariables {
            target: "rsyncd".to_string(),
            names: vec!["host".to_string(), "site".to_string(), "user".to_string()],
        }
    );
}

#[test]
fn test_override_beats_default() {
    let registry = TargetRegistry::builtin().unwrap();
    let local = registry.get("local_rsync").unwrap();
    let env = local
        .resolve_env(
            &EnvOverrides::new()
                .set("site_root", "/farm")
                .set("command", "/opt/bin/rsync"),
        )
        .unwrap();
    assert_eq!(env.get("command"), Some("/opt/bin/rsync"));
    assert_eq!(env.get("site_root"), Some("/farm"));
    assert!(env.get("options").unwrap().contains("--remove-source-files"));
}

// =============================================================================
// User Definitions Files
// =============================================================================

const USER_DEFINITIONS: &str = r#"
target_definitions:
  rsyncd:
    env:
      site_root: null
      host: null
    disk_space_script: |
      ssh "${host}" df --output=target,avail "${site_root}"
    transfer_script: |
      scp "${source}" "${host}:${destination}"
    transfer_process_name: scp
    transfer_process_argument_prefix: "{host}:"
  nfs:
    env:
      mount: /mnt/nfs
    disk_space_statvfs: ["{mount}"]
    transfer_executable:
      program: mv
      args: ["{source}", "{destination}"]
    transfer_process_name: mv
    transfer_process_argument_prefix: "{mount}"
"#;

#[test]
fn test_user_file_overrides_builtin_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("targets.yaml");
    fs::write(&path, USER_DEFINITIONS).unwrap();

    let user = TargetRegistry::from_file(&path).unwrap();
    let merged = TargetRegistry::builtin().unwrap().merged_with(user);

    assert_eq!(
        merged.ids().collect::<Vec<_>>(),
        vec!["local_rsync", "rsyncd", "nfs"]
    );
    let rsyncd = merged.get("rsyncd").unwrap();
    assert_eq!(rsyncd.env().required_names(), vec!["host", "site_root"]);
    assert_eq!(rsyncd.transfer_process_name().source(), "scp");
}

#[test]
fn test_duplicate_id_in_one_file_rejected() {
    let yaml = r#"
target_definitions:
  twice:
    disk_space_script: echo "/a:1"
    transfer_script: cp "${source}" "${destination}"
    transfer_process_name: cp
    transfer_process_argument_prefix: /a
  twice:
    disk_space_script: echo "/b:1"
    transfer_script: cp "${source}" "${destination}"
    transfer_process_name: cp
    transfer_process_argument_prefix: /b
"#;
    let err = TargetRegistry::from_yaml_str(yaml, None).unwrap_err();
    assert!(matches!(
        err,
        ArchiveError::Config(ConfigError::DuplicateTarget { ref target }) if target == "twice"
    ));
}

#[test]
fn test_sequence_default_rejected() {
    let yaml = r#"
target_definitions:
  bad:
    env:
      hosts: [a, b]
    disk_space_script: echo "/a:1"
    transfer_script: cp "${source}" "${destination}"
    transfer_process_name: cp
    transfer_process_argument_prefix: /a
"#;
    let err = TargetRegistry::from_yaml_str(yaml, None).unwrap_err();
    assert!(matches!(err, ArchiveError::Yaml(_)));
}

#[test]
fn test_undeclared_placeholder_is_validation_error() {
    let yaml = r#"
target_definitions:
  bad:
    env:
      root: /a
    disk_space_script: echo "${root}:${size}"
    transfer_script: cp "${source}" "${destination}"
    transfer_process_name: cp
    transfer_process_argument_prefix: "{root}"
"#;
    let err = TargetRegistry::from_yaml_str(yaml, None).unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("size"), "{err}");
}

#[test]
fn test_argument_assignment_does_not_hide_undeclared_name() {
    let yaml = r#"
target_definitions:
  upload:
    env:
      root: null
    disk_space_script: |
      echo "${root}:1"
      echo ${dir}:2; dir=/x
    transfer_script: curl -T "${source}" -d token=${token} "https://x/${destination}"
    transfer_process_name: curl
    transfer_process_argument_prefix: "{root}"
"#;
    let err = TargetRegistry::from_yaml_str(yaml, None).unwrap_err();
    assert!(err.is_validation());
    let message = err.to_string();
    assert!(message.contains("token"), "{message}");
    assert!(message.contains("dir"), "{message}");
}

#[test]
fn test_missing_definitions_file() {
    let err = TargetRegistry::from_file("/nonexistent/targets.yaml").unwrap_err();
    assert!(matches!(err, ArchiveError::Io(_)));
}
