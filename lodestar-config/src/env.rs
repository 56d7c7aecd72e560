//! Environment variable overlay

use serde_json::Value;
use std::collections::BTreeMap;

/// Environment variable loader.
///
/// Variables are matched by prefix and turned into nested keys: with prefix
/// `LODESTAR`, `LODESTAR_GATEWAY__MAX_RETRIES` becomes `gateway.max_retries`.
#[derive(Debug, Clone, Default)]
pub struct EnvLoader {
    prefix: Option<String>,
}

/// Separates nesting levels in a variable name
pub const NESTING: &str = "__";

impl EnvLoader {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Load matching variables from an explicit set of pairs
    pub fn load_from<I>(&self, vars: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = BTreeMap::new();

        for (key, value) in vars {
            let trimmed = match &self.prefix {
                Some(prefix) => match key.strip_prefix(prefix.as_str()) {
                    Some(rest) if rest.starts_with('_') => rest.trim_start_matches('_'),
                    _ => continue,
                },
                None => key.as_str(),
            };
            if trimmed.is_empty() {
                continue;
            }
            config.insert(trimmed.to_lowercase(), value);
        }

        config
    }

    /// Split a loaded key into its nested path
    pub fn key_path<'a>(&self, key: &'a str) -> Vec<&'a str> {
        key.split(NESTING)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Interpret a raw variable as the most specific JSON scalar it spells.
///
/// `"2"` becomes a number and `"true"` a boolean, so environment overrides
/// deserialize into the same typed fields as file values. Bracketed values
/// are tried as JSON arrays or objects.
pub fn parse_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    if let Ok(b) = trimmed.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = trimmed.parse::<u64>() {
        return Value::from(n);
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}
