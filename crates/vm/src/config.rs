//! VM configuration
//!
//! Parsed once at VM construction from a JSON document. Recognized keys are
//! typed; unknown keys are collected as non-fatal warnings (and logged), so
//! a host upgrading its config schema never breaks evaluation.

use std::fmt;
use std::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub eval_cache: EvalCacheConfig,
    /// Forwarded verbatim to the builtin context.
    pub capabilities: Option<serde_json::Value>,
    /// Byte budget for the nondeterministic-builtin cache. Zero is unbounded.
    pub ndb_cache_max_bytes: usize,
    /// Byte budget for the default inter-query cache. Zero is unbounded.
    pub interquery_cache_max_bytes: usize,
    /// Unrecognized keys seen while parsing.
    pub warnings: Vec<String>,
}

/// Whole-query result caching keyed by selected input subtrees.
#[derive(Clone, Debug, Default)]
pub struct EvalCacheConfig {
    pub enabled: bool,
    /// JSON pointers into the input document; only these subtrees key the
    /// cache.
    pub input_paths: Vec<String>,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ExpectedObject(&'static str),
    BadType {
        key: String,
        expected: &'static str,
    },
    BadDuration(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ExpectedObject(what) => write!(f, "{what} must be an object"),
            ConfigError::BadType { key, expected } => {
                write!(f, "configuration key {key:?} must be {expected}")
            }
            ConfigError::BadDuration(s) => write!(f, "bad duration {s:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_json(v: &serde_json::Value) -> Result<Config, ConfigError> {
        let mut cfg = Config::default();
        let Some(map) = v.as_object() else {
            return Err(ConfigError::ExpectedObject("configuration"));
        };
        for (key, val) in map {
            match key.as_str() {
                "eval_cache" => cfg.eval_cache = parse_eval_cache(val, &mut cfg.warnings)?,
                "capabilities" => cfg.capabilities = Some(val.clone()),
                "ndbcache" => {
                    cfg.ndb_cache_max_bytes = parse_max_size(key, val, &mut cfg.warnings)?;
                }
                "interquery_cache" => {
                    cfg.interquery_cache_max_bytes = parse_max_size(key, val, &mut cfg.warnings)?;
                }
                other => warn_unknown(&mut cfg.warnings, other),
            }
        }
        Ok(cfg)
    }
}

fn warn_unknown(warnings: &mut Vec<String>, key: &str) {
    tracing::warn!(key, "unrecognized configuration key");
    warnings.push(format!("unrecognized configuration key {key:?}"));
}

fn parse_eval_cache(
    v: &serde_json::Value,
    warnings: &mut Vec<String>,
) -> Result<EvalCacheConfig, ConfigError> {
    let Some(map) = v.as_object() else {
        return Err(ConfigError::ExpectedObject("eval_cache"));
    };
    let mut out = EvalCacheConfig::default();
    for (key, val) in map {
        match key.as_str() {
            "enabled" => {
                out.enabled = val.as_bool().ok_or(ConfigError::BadType {
                    key: "eval_cache.enabled".to_string(),
                    expected: "a boolean",
                })?;
            }
            "input_paths" => {
                let paths = val.as_array().ok_or(ConfigError::BadType {
                    key: "eval_cache.input_paths".to_string(),
                    expected: "an array of JSON pointers",
                })?;
                for p in paths {
                    let s = p.as_str().ok_or(ConfigError::BadType {
                        key: "eval_cache.input_paths".to_string(),
                        expected: "an array of JSON pointers",
                    })?;
                    out.input_paths.push(s.to_string());
                }
            }
            "ttl" => {
                let s = val.as_str().ok_or(ConfigError::BadType {
                    key: "eval_cache.ttl".to_string(),
                    expected: "a duration string",
                })?;
                out.ttl = parse_duration(s)?;
            }
            other => warn_unknown(warnings, &format!("eval_cache.{other}")),
        }
    }
    Ok(out)
}

fn parse_max_size(
    section: &str,
    v: &serde_json::Value,
    warnings: &mut Vec<String>,
) -> Result<usize, ConfigError> {
    let Some(map) = v.as_object() else {
        return Err(ConfigError::ExpectedObject("cache section"));
    };
    let mut out = 0usize;
    for (key, val) in map {
        match key.as_str() {
            "max_size_bytes" => {
                out = val
                    .as_u64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or(ConfigError::BadType {
                        key: format!("{section}.max_size_bytes"),
                        expected: "a non-negative integer",
                    })?;
            }
            other => warn_unknown(warnings, &format!("{section}.{other}")),
        }
    }
    Ok(out)
}

/// Parse `"250ms"`, `"5s"`, `"1.5m"`, `"2h"`. Fractions are allowed.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let (num, factor) = if let Some(n) = s.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60.0)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600.0)
    } else {
        return Err(ConfigError::BadDuration(s.to_string()));
    };
    let value: f64 = num
        .parse()
        .map_err(|_| ConfigError::BadDuration(s.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::BadDuration(s.to_string()));
    }
    Ok(Duration::from_secs_f64(value * factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_config() {
        let cfg = Config::from_json(&json!({
            "eval_cache": {
                "enabled": true,
                "input_paths": ["/key", "/tenant/id"],
                "ttl": "5s",
            },
            "capabilities": {"builtins": ["http.send"]},
            "ndbcache": {"max_size_bytes": 1024},
            "interquery_cache": {"max_size_bytes": 4096},
        }))
        .unwrap();
        assert!(cfg.eval_cache.enabled);
        assert_eq!(cfg.eval_cache.input_paths.len(), 2);
        assert_eq!(cfg.eval_cache.ttl, Duration::from_secs(5));
        assert_eq!(cfg.ndb_cache_max_bytes, 1024);
        assert_eq!(cfg.interquery_cache_max_bytes, 4096);
        assert!(cfg.warnings.is_empty());
    }

    #[test]
    fn test_unknown_keys_warn_not_fail() {
        let cfg = Config::from_json(&json!({
            "eval_cache": {"enabled": false, "frobnicate": 1},
            "telemetry": {},
        }))
        .unwrap();
        assert_eq!(cfg.warnings.len(), 2);
        assert!(cfg.warnings[0].contains("eval_cache.frobnicate"));
        assert!(cfg.warnings[1].contains("telemetry"));
    }

    #[test]
    fn test_bad_types_fail() {
        assert!(Config::from_json(&json!({"eval_cache": {"enabled": "yes"}})).is_err());
        assert!(Config::from_json(&json!([])).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("-1s").is_err());
    }
}
