use std::collections::HashMap;
use std::path::PathBuf;

use ovfs::config::{MountConfig, ENV_CHECKPOINT_SECS, ENV_DIFF_WORKERS};
use ovfs::ignore::IgnorePolicy;
use ovfs::Error;
use tempfile::tempdir;

fn is_cli_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::Cli(_)))
}

#[test]
fn defaults_are_usable() {
    let config = MountConfig::default();
    assert_eq!(config.overlay_dir, PathBuf::from("overlay"));
    assert!(config.create_if_missing);
    assert_eq!(config.diff_workers, 4);
    assert_eq!(config.checkpoint_interval_secs, 30);
    assert!(config.ignore_patterns.is_empty());
    config.validate().unwrap();
}

#[test]
fn json_file_fills_missing_fields_with_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ovfs.json");
    std::fs::write(
        &path,
        r#"{ "overlay_dir": "/var/lib/ovfs/wc1", "ignore_patterns": ["*.tmp", "build/"] }"#,
    )
    .unwrap();

    let config = MountConfig::from_json_file(&path).unwrap();
    assert_eq!(config.overlay_dir, PathBuf::from("/var/lib/ovfs/wc1"));
    assert_eq!(config.diff_workers, 4);
    let ignore = config.ignore();
    assert!(ignore.is_ignored("a/b.tmp", false));
    assert!(ignore.is_ignored("build", true));
    assert!(!ignore.is_ignored("build", false));
}

#[test]
fn unknown_fields_are_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ovfs.json");
    std::fs::write(&path, r#"{ "overlay_dir": "x", "workers": 8 }"#).unwrap();
    let err = MountConfig::from_json_file(&path).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Serde(_))));
}

#[test]
fn missing_file_is_reported() {
    let dir = tempdir().unwrap();
    let err = MountConfig::from_json_file(&dir.path().join("absent.json")).unwrap_err();
    assert!(is_cli_error(&err), "{err:?}");
}

#[test]
fn overrides_take_precedence() {
    let env: HashMap<&str, &str> = [(ENV_DIFF_WORKERS, "12"), (ENV_CHECKPOINT_SECS, " 0 ")]
        .into_iter()
        .collect();
    let config = MountConfig::new("/tmp/ov")
        .with_overrides_from(|key| env.get(key).map(|v| v.to_string()))
        .unwrap();
    assert_eq!(config.diff_workers, 12);
    assert_eq!(config.checkpoint_interval_secs, 0);
    assert_eq!(config.overlay_dir, PathBuf::from("/tmp/ov"));
}

#[test]
fn bad_overrides_are_rejected() {
    let err = MountConfig::new("ov")
        .with_overrides_from(|key| (key == ENV_DIFF_WORKERS).then(|| "many".to_string()))
        .unwrap_err();
    assert!(is_cli_error(&err));

    let err = MountConfig::new("ov")
        .with_overrides_from(|key| (key == ENV_DIFF_WORKERS).then(|| "0".to_string()))
        .unwrap_err();
    assert!(is_cli_error(&err));
}

#[test]
fn empty_overlay_dir_is_invalid() {
    let config = MountConfig::new("");
    assert!(is_cli_error(&config.validate().unwrap_err()));
}

#[test]
fn load_applies_environment_over_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ovfs.json");
    std::fs::write(&path, r#"{ "overlay_dir": "ov", "checkpoint_interval_secs": 60 }"#).unwrap();

    // The only test in this binary that touches the process environment.
    std::env::set_var(ENV_CHECKPOINT_SECS, "7");
    let loaded = MountConfig::load(&path);
    std::env::remove_var(ENV_CHECKPOINT_SECS);

    let config = loaded.unwrap();
    assert_eq!(config.checkpoint_interval_secs, 7);
    assert_eq!(config.overlay_dir, PathBuf::from("ov"));
}
