//! Settings loading with deep merge, environment overrides, and validation.
//!
//! Loading flow:
//! 1. Start with compiled [`HotlineSettings::default()`]
//! 2. If a settings file is given, deep-merge its values over the defaults
//! 3. Apply `HOTLINE_*` environment overrides (highest priority)
//! 4. [`validate`] the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::HotlineSettings;

/// Load settings, optionally from a file, with env var overrides applied.
///
/// A missing file is an error: the path was asked for explicitly.
pub fn load_settings(path: Option<&Path>) -> Result<HotlineSettings> {
    let defaults = serde_json::to_value(HotlineSettings::default())?;

    let merged = match path {
        Some(path) => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        None => defaults,
    };

    let mut settings: HotlineSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
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

/// Reject settings the server cannot run with.
pub fn validate(settings: &HotlineSettings) -> Result<()> {
    let channel = &settings.channel;
    if channel.ping_period_ms == 0 || channel.ping_period_ms >= channel.pong_wait_ms {
        return Err(SettingsError::InvalidValue(format!(
            "channel.pingPeriodMs ({}) must be non-zero and less than channel.pongWaitMs ({})",
            channel.ping_period_ms, channel.pong_wait_ms
        )));
    }
    if channel.write_wait_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "channel.writeWaitMs must be non-zero".into(),
        ));
    }
    if channel.outbound_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "channel.outboundCapacity must be non-zero".into(),
        ));
    }
    if settings.dispatcher.queue_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "dispatcher.queueCapacity must be non-zero".into(),
        ));
    }
    if !settings.server.ws_path.starts_with('/') || settings.server.ws_path.len() < 2 {
        return Err(SettingsError::InvalidValue(format!(
            "server.wsPath must be an absolute path, got {:?}",
            settings.server.ws_path
        )));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut HotlineSettings) {
    if let Some(v) = read_env_string("HOTLINE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u64("HOTLINE_PORT", 0, u64::from(u16::MAX)) {
        settings.server.port = v as u16;
    }
    if let Some(v) = read_env_string("HOTLINE_WS_PATH") {
        settings.server.ws_path = v;
    }
    if let Some(v) = read_env_u64("HOTLINE_OUTBOUND_CAPACITY", 1, 1_000_000) {
        settings.channel.outbound_capacity = v as usize;
    }
    if let Some(v) = read_env_u64("HOTLINE_PING_PERIOD_MS", 100, 3_600_000) {
        settings.channel.ping_period_ms = v;
    }
    if let Some(v) = read_env_u64("HOTLINE_PONG_WAIT_MS", 100, 3_600_000) {
        settings.channel.pong_wait_ms = v;
    }
    if let Some(v) = read_env_u64("HOTLINE_WRITE_WAIT_MS", 100, 3_600_000) {
        settings.channel.write_wait_ms = v;
    }
    if let Some(v) = read_env_string("HOTLINE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("HOTLINE_LOG_JSON") {
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

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

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

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
    }
    result
}
