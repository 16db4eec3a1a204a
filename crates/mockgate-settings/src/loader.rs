//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`MockSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `MOCKGATE_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{LogLevel, MockSettings};

const DEFAULT_SETTINGS_FILE: &str = "mockgate.json";

/// Resolve the settings file path: `MOCKGATE_SETTINGS` if set, otherwise
/// `mockgate.json` in the working directory.
pub fn settings_path() -> PathBuf {
    read_env_string("MOCKGATE_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE))
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<MockSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<MockSettings> {
    let defaults = serde_json::to_value(MockSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: MockSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and the file/default value is
/// kept.
pub fn apply_env_overrides(settings: &mut MockSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("MOCKGATE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("MOCKGATE_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_usize("MOCKGATE_MAX_SEND_QUEUE", 1, 65_536) {
        settings.server.max_send_queue = v;
    }
    if let Some(v) = read_env_u64("MOCKGATE_HEARTBEAT_INTERVAL_MS", 1000, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }

    // ── Manual mode ─────────────────────────────────────────────────
    if let Some(v) = read_env_u64("MOCKGATE_MANUAL_TIMEOUT_SECS", 1, 86_400) {
        settings.manual.timeout_secs = v;
    }
    if let Some(v) = read_env_u64("MOCKGATE_DISCONNECT_POLL_MS", 10, 60_000) {
        settings.manual.disconnect_poll_ms = v;
    }

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("MOCKGATE_PRESET_QUEUE_PATH") {
        settings.storage.preset_queue_path = v;
    }
    if let Some(v) = read_env_string("MOCKGATE_BYPASS_CONFIG_PATH") {
        settings.storage.bypass_config_path = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("MOCKGATE_LOG_LEVEL") {
        match serde_json::from_value::<LogLevel>(Value::String(v.to_lowercase())) {
            Ok(level) => settings.logging.level = level,
            Err(_) => tracing::warn!(key = "MOCKGATE_LOG_LEVEL", value = %v, "invalid log level, ignoring"),
        }
    }
    if let Some(v) = read_env_bool("MOCKGATE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "server": {"port": 8000, "host": "0.0.0.0"}
        });
        let source = serde_json::json!({
            "server": {"port": 9090}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4, 5]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4, 5]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let path = Path::new("/nonexistent/mockgate.json");
        let settings = load_settings_from_path(path).unwrap();
        assert_eq!(settings.manual.timeout_secs, 300);
        assert_eq!(settings.storage.preset_queue_path, "preset_queues.json");
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mockgate.json");
        std::fs::write(
            &path,
            r#"{"manual": {"timeoutSecs": 30}, "storage": {"persistMaxRetries": 5}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.manual.timeout_secs, 30);
        assert_eq!(settings.manual.disconnect_poll_ms, 1000);
        assert_eq!(settings.storage.persist_max_retries, 5);
        assert_eq!(settings.storage.bypass_config_path, "bypass_config.json");
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mockgate.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE", "On"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "off", "FALSE"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_u16_bounds() {
        assert_eq!(parse_u16_range("0", 0, 65535), Some(0));
        assert_eq!(parse_u16_range("8000", 1, 65535), Some(8000));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("99999", 1, 65535), None);
        assert_eq!(parse_u16_range("port", 1, 65535), None);
    }

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("300", 1, 86_400), Some(300));
        assert_eq!(parse_u64_range("0", 1, 86_400), None);
        assert_eq!(parse_u64_range("abc", 1, 86_400), None);
    }

    #[test]
    fn parse_usize_bounds() {
        assert_eq!(parse_usize_range("50", 1, 10_000), Some(50));
        assert_eq!(parse_usize_range("20000", 1, 10_000), None);
    }
}
