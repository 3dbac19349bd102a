//! Configuration loading and environment overrides.
//!
//! Run with: cargo test -p vramcap-core --test config_test

use std::collections::HashMap;
use std::io::Write;

use vramcap_core::config::{ENFORCEMENT_ENV, FRACTION_ENV};
use vramcap_core::{CoreError, Enforcement, VramcapConfig};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn test_defaults() {
    let config = VramcapConfig::default();
    assert_eq!(config.quota.reserved_fraction, 0.5);
    assert_eq!(config.quota.enforcement, Enforcement::Advisory);
    assert!(config.policy().is_ok());
}

#[test]
fn test_load_full_file() {
    let file = write_config(
        r#"
[quota]
reserved_fraction = 0.25
enforcement = "strict"
"#,
    );
    let config = VramcapConfig::load(file.path().to_str().unwrap()).unwrap();
    let policy = config.policy().unwrap();
    assert_eq!(policy.reserved_fraction(), 0.25);
    assert_eq!(policy.enforcement(), Enforcement::Strict);
}

#[test]
fn test_missing_keys_take_defaults() {
    let file = write_config("[quota]\nenforcement = \"strict\"\n");
    let config = VramcapConfig::load(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.quota.reserved_fraction, 0.5);
    assert_eq!(config.quota.enforcement, Enforcement::Strict);

    let empty = write_config("");
    let config = VramcapConfig::load(empty.path().to_str().unwrap()).unwrap();
    assert_eq!(config.quota.reserved_fraction, 0.5);
}

#[test]
fn test_malformed_file_is_a_parse_error() {
    let file = write_config("[quota]\nenforcement = \"sometimes\"\n");
    match VramcapConfig::load(file.path().to_str().unwrap()) {
        Err(CoreError::Parse { path, .. }) => {
            assert_eq!(path, file.path().to_str().unwrap())
        }
        other => panic!("expected Parse error, got {:?}", other),
    }
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let path = path.to_str().unwrap();

    assert!(matches!(VramcapConfig::load(path), Err(CoreError::Io(_))));
    let config = VramcapConfig::load_or_default(path);
    assert_eq!(config.quota.reserved_fraction, 0.5);
}

#[test]
fn test_out_of_range_fraction_fails_validation() {
    let file = write_config("[quota]\nreserved_fraction = 1.0\n");
    let config = VramcapConfig::load(file.path().to_str().unwrap()).unwrap();
    assert!(matches!(config.policy(), Err(CoreError::InvalidFraction(_))));
}

#[test]
fn test_overrides_replace_file_values() {
    let mut config = VramcapConfig::default();
    config
        .apply_overrides(lookup_from(&[
            (FRACTION_ENV, " 0.75 "),
            (ENFORCEMENT_ENV, "STRICT"),
        ]))
        .unwrap();
    let policy = config.policy().unwrap();
    assert_eq!(policy.reserved_fraction(), 0.75);
    assert_eq!(policy.enforcement(), Enforcement::Strict);
}

#[test]
fn test_absent_overrides_change_nothing() {
    let mut config = VramcapConfig::default();
    config.apply_overrides(lookup_from(&[])).unwrap();
    assert_eq!(config.quota.reserved_fraction, 0.5);
    assert_eq!(config.quota.enforcement, Enforcement::Advisory);
}

#[test]
fn test_invalid_overrides() {
    let mut config = VramcapConfig::default();
    assert!(matches!(
        config.apply_overrides(lookup_from(&[(FRACTION_ENV, "half")])),
        Err(CoreError::ConfigError(_))
    ));
    assert!(matches!(
        config.apply_overrides(lookup_from(&[(ENFORCEMENT_ENV, "hard")])),
        Err(CoreError::InvalidEnforcement(_))
    ));
}
