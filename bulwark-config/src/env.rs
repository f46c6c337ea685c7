// Environment variable loading

use crate::{ConfigError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::env;

/// Separates the section from the field in override keys, as in
/// `BULWARK_AMQP__MAX_ATTEMPTS` or `BULWARK_DEFAULTS__TIMEOUT_MS`.
pub const SECTION_SEPARATOR: &str = "__";

/// Environment variable loader
#[derive(Debug, Clone)]
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Loader for `BULWARK_*` variables
    pub fn bulwark() -> Self {
        Self::new(Some("BULWARK".to_string()))
    }

    /// Load all environment variables under the prefix, keyed without it
    pub fn load(&self) -> Result<HashMap<String, String>> {
        let vars = env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.into_string().ok()?))
        });
        Ok(self.filter(vars))
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        let full_key = if let Some(ref prefix) = self.prefix {
            format!("{}_{}", prefix, key.to_uppercase())
        } else {
            key.to_uppercase()
        };

        env::var(&full_key).map_err(ConfigError::EnvError)
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }

    /// Keep the pairs under the prefix, stripped and lowercased.
    pub fn filter<I>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = HashMap::new();

        for (key, value) in vars {
            if let Some(ref prefix) = self.prefix {
                if let Some(rest) = key.strip_prefix(prefix.as_str()) {
                    config.insert(rest.trim_start_matches('_').to_lowercase(), value);
                }
            } else {
                config.insert(key.to_lowercase(), value);
            }
        }

        config
    }

    /// Apply the current environment onto a settings document.
    pub fn overlay(&self, document: &mut Value) -> Result<usize> {
        apply_overrides(document, self.load()?)
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Write `section__field = value` pairs into a settings document.
///
/// `defaults__field` lands in `defaults`; any other section names a
/// dependency. Keys without a separator are not overrides and are skipped.
/// Returns the number of overrides applied.
pub fn apply_overrides<I>(document: &mut Value, vars: I) -> Result<usize>
where
    I: IntoIterator<Item = (String, String)>,
{
    if !document.is_object() {
        *document = Value::Object(Map::new());
    }

    let mut applied = 0;
    for (key, raw) in vars {
        let Some((section, field)) = key.split_once(SECTION_SEPARATOR) else {
            continue;
        };
        if section.is_empty() || field.is_empty() {
            return Err(ConfigError::ParseError(format!(
                "Malformed override key: {}",
                key
            )));
        }

        let target = if section == "defaults" {
            entry(document, "defaults")?
        } else {
            let dependencies = entry(document, "dependencies")?;
            entry(dependencies, section)?
        };

        if let Value::Object(map) = target {
            map.insert(field.to_string(), parse_scalar(field, &raw));
            applied += 1;
        }
    }

    Ok(applied)
}

fn entry<'a>(value: &'a mut Value, key: &str) -> Result<&'a mut Value> {
    let Value::Object(map) = value else {
        return Err(ConfigError::ParseError(format!(
            "Expected a table around '{}'",
            key
        )));
    };

    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        return Err(ConfigError::ParseError(format!("'{}' must be a table", key)));
    }
    Ok(slot)
}

fn parse_scalar(field: &str, raw: &str) -> Value {
    let raw = raw.trim();

    if field == "retry_on" {
        return Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|kind| !kind.is_empty())
                .map(|kind| Value::String(kind.to_lowercase()))
                .collect(),
        );
    }

    if let Ok(flag) = raw.parse::<bool>() {
        Value::Bool(flag)
    } else if let Ok(int) = raw.parse::<u64>() {
        Value::from(int)
    } else if let Ok(float) = raw.parse::<f64>() {
        Value::from(float)
    } else {
        Value::String(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(vars: &[(&str, &str)]) -> Vec<(String, String)> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_loader_with_default() {
        let loader = EnvLoader::new(None);
        let value = loader.load_var_or("NONEXISTENT_VAR_12345", "default");

        assert_eq!(value, "default");
    }

    #[test]
    fn test_env_loader_missing_var() {
        let loader = EnvLoader::bulwark();
        let result = loader.load_var("MISSING_VAR_67890");

        assert!(matches!(result, Err(ConfigError::EnvError(_))));
    }

    #[test]
    fn test_filter_strips_prefix() {
        let loader = EnvLoader::bulwark();
        let vars = loader.filter(pairs(&[
            ("BULWARK_AMQP__MAX_ATTEMPTS", "5"),
            ("HOME", "/root"),
        ]));

        assert_eq!(vars.len(), 1);
        assert_eq!(vars["amqp__max_attempts"], "5");
    }

    #[test]
    fn test_apply_overrides() {
        let mut document = json!({
            "defaults": { "timeout_ms": 1000 },
            "dependencies": { "amqp": { "max_concurrent": 4 } }
        });

        let applied = apply_overrides(
            &mut document,
            pairs(&[
                ("defaults__jitter", "false"),
                ("amqp__max_attempts", "5"),
                ("llm__backoff_multiplier", "1.5"),
                ("llm__retry_on", "error_result, Timeout"),
                ("log_level", "debug"),
            ]),
        )
        .unwrap();

        assert_eq!(applied, 4);
        assert_eq!(document["defaults"]["jitter"], false);
        assert_eq!(document["defaults"]["timeout_ms"], 1000);
        assert_eq!(document["dependencies"]["amqp"]["max_attempts"], 5);
        assert_eq!(document["dependencies"]["amqp"]["max_concurrent"], 4);
        assert_eq!(document["dependencies"]["llm"]["backoff_multiplier"], 1.5);
        assert_eq!(
            document["dependencies"]["llm"]["retry_on"],
            json!(["error_result", "timeout"])
        );
    }

    #[test]
    fn test_malformed_override_key() {
        let mut document = json!({});
        let result = apply_overrides(&mut document, pairs(&[("__max_attempts", "5")]));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
