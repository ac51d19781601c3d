//! # Task variables.
//!
//! Every knob of a task is looked up in a stack of JSON maps, first match wins:
//!
//! ```text
//! task/<path>/:task          data  (instance overrides)
//! meta/task/<def>/:taskdef   data  (definition defaults)
//! config/run                       (global overrides)
//! Config::vars                     (built-in defaults)
//! ```
//!
//! Numbers may be stored as JSON numbers or numeric strings.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::ConfigError;

/// A JSON object holding variables.
pub type VarMap = Map<String, Value>;

/// Resolved supervision knobs of one task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskVars {
    /// Lease TTL in seconds (`>= 1`).
    pub ttl: u32,
    /// Lease refreshes per TTL (`>= 1`).
    pub refresh: f64,
    /// First restart delay after an error (`0` = never retry).
    pub retry: Duration,
    /// Ceiling of the restart delay.
    pub max_retry: Duration,
    /// Restart delay after a success (`0` = finish).
    pub restart: Duration,
    /// Collectors stop after their first pass.
    pub one_shot: bool,
}

impl Default for TaskVars {
    /// `ttl = 30`, `refresh = 3`, `retry = 10s`, `max-retry = 600s`,
    /// `restart = 0`, `one-shot = false`.
    fn default() -> Self {
        Self {
            ttl: 30,
            refresh: 3.0,
            retry: Duration::from_secs(10),
            max_retry: Duration::from_secs(600),
            restart: Duration::ZERO,
            one_shot: false,
        }
    }
}

impl TaskVars {
    /// Resolves every knob through `layers`, falling back to `defaults`.
    pub fn resolve(layers: &[&VarMap], defaults: &TaskVars) -> Result<Self, ConfigError> {
        let mut vars = defaults.clone();
        if let Some(v) = lookup(layers, "ttl") {
            let n = number("ttl", v)?;
            if n < 1.0 || n > f64::from(u32::MAX) {
                return Err(invalid("ttl", v));
            }
            vars.ttl = n as u32;
        }
        if let Some(v) = lookup(layers, "refresh") {
            vars.refresh = number("refresh", v)?.max(1.0);
        }
        if let Some(v) = lookup(layers, "retry") {
            vars.retry = seconds("retry", v)?;
        }
        if let Some(v) = lookup(layers, "max-retry") {
            vars.max_retry = seconds("max-retry", v)?;
        }
        if let Some(v) = lookup(layers, "restart") {
            vars.restart = seconds("restart", v)?;
        }
        if let Some(v) = lookup(layers, "one-shot") {
            vars.one_shot = flag("one-shot", v)?;
        }
        Ok(vars)
    }

    /// Lease TTL.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.ttl))
    }

    /// Interval between lease refreshes: `ttl / (refresh + 0.1)`.
    pub fn refresh_interval(&self) -> Duration {
        self.lease_ttl().div_f64(self.refresh.max(1.0) + 0.1)
    }
}

/// First value for `key` in `layers`.
pub fn lookup<'a>(layers: &[&'a VarMap], key: &str) -> Option<&'a Value> {
    layers.iter().find_map(|m| m.get(key))
}

/// Overlays maps: later entries of `layers` override earlier ones.
pub fn merge(layers: &[&VarMap]) -> VarMap {
    let mut out = VarMap::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

/// Reads a non-negative duration in seconds.
pub fn seconds(key: &'static str, v: &Value) -> Result<Duration, ConfigError> {
    let n = number(key, v)?;
    if n < 0.0 {
        return Err(invalid(key, v));
    }
    Duration::try_from_secs_f64(n).map_err(|_| invalid(key, v))
}

fn number(key: &'static str, v: &Value) -> Result<f64, ConfigError> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite()).ok_or_else(|| invalid(key, v))
}

fn flag(key: &'static str, v: &Value) -> Result<bool, ConfigError> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|n| n != 0.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" | "" => Ok(false),
            _ => Err(invalid(key, v)),
        },
        _ => Err(invalid(key, v)),
    }
}

fn invalid(key: &'static str, v: &Value) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: v.to_string(),
    }
}
