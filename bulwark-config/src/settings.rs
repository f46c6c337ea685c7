// Typed resilience settings

use crate::env::{apply_overrides, EnvLoader};
use crate::loader::{ConfigLoader, FileFormat};
use crate::validation::{ConfigValidator, Validate};
use crate::{ConfigError, Result};
use bulwark_core::{
    BulkheadConfig, CircuitBreakerConfig, Dependency, DependencyConfig, FailureKind,
    ResilienceCoordinator, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Protection settings for one dependency. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySettings {
    // Circuit breaker
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub reset_timeout_ms: Option<u64>,

    // Bulkhead
    pub max_concurrent: usize,
    pub max_waiting: usize,
    pub checkout_timeout_ms: u64,

    // Retry
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub retry_on: Vec<FailureKind>,
    pub retry_deadline_ms: Option<u64>,

    /// Per-attempt timeout
    pub timeout_ms: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        let breaker = CircuitBreakerConfig::default();
        let bulkhead = BulkheadConfig::default();
        let retry = RetryPolicy::default();
        let dependency = DependencyConfig::new("default");

        Self {
            failure_threshold: breaker.failure_threshold,
            success_threshold: breaker.success_threshold,
            open_timeout_ms: millis(breaker.open_timeout),
            reset_timeout_ms: breaker.reset_timeout.map(millis),
            max_concurrent: bulkhead.max_concurrent,
            max_waiting: bulkhead.max_waiting,
            checkout_timeout_ms: millis(bulkhead.checkout_timeout),
            max_attempts: retry.max_attempts,
            base_backoff_ms: millis(retry.base_backoff),
            max_backoff_ms: millis(retry.max_backoff),
            backoff_multiplier: retry.backoff_multiplier,
            jitter: retry.jitter,
            retry_on: FailureKind::ALL
                .into_iter()
                .filter(|kind| retry.retry_on.contains(kind))
                .collect(),
            retry_deadline_ms: retry.deadline.map(millis),
            timeout_ms: millis(dependency.timeout),
        }
    }
}

impl PolicySettings {
    /// Build the core configuration for dependency `name`.
    pub fn to_dependency_config(&self, name: &str) -> DependencyConfig {
        let mut breaker = CircuitBreakerConfig::new(name)
            .failure_threshold(self.failure_threshold)
            .success_threshold(self.success_threshold)
            .open_timeout(Duration::from_millis(self.open_timeout_ms));
        if let Some(reset) = self.reset_timeout_ms {
            breaker = breaker.reset_timeout(Duration::from_millis(reset));
        }

        let bulkhead = BulkheadConfig::new(name)
            .max_concurrent(self.max_concurrent)
            .max_waiting(self.max_waiting)
            .checkout_timeout(Duration::from_millis(self.checkout_timeout_ms));

        let mut retry = RetryPolicy::new(self.max_attempts)
            .base_backoff(Duration::from_millis(self.base_backoff_ms))
            .max_backoff(Duration::from_millis(self.max_backoff_ms))
            .backoff_multiplier(self.backoff_multiplier)
            .jitter(self.jitter)
            .retry_on(self.retry_on.iter().copied());
        if let Some(deadline) = self.retry_deadline_ms {
            retry = retry.deadline(Duration::from_millis(deadline));
        }

        DependencyConfig::new(name)
            .circuit_breaker(breaker)
            .bulkhead(bulkhead)
            .retry(retry)
            .timeout(Duration::from_millis(self.timeout_ms))
    }
}

impl Validate for PolicySettings {
    fn validate(&self) -> Result<()> {
        ConfigValidator::at_least(self.failure_threshold, 1, "failure_threshold")?;
        ConfigValidator::at_least(self.success_threshold, 1, "success_threshold")?;
        ConfigValidator::at_least(self.max_concurrent, 1, "max_concurrent")?;
        ConfigValidator::at_least(self.max_attempts, 1, "max_attempts")?;
        ConfigValidator::at_least(self.timeout_ms, 1, "timeout_ms")?;
        ConfigValidator::at_least(self.backoff_multiplier, 1.0, "backoff_multiplier")?;
        ConfigValidator::ordered(
            self.base_backoff_ms,
            self.max_backoff_ms,
            "base_backoff_ms",
            "max_backoff_ms",
        )?;
        Ok(())
    }
}

/// Settings for every dependency, with shared defaults.
///
/// In a document, `defaults` holds any subset of [`PolicySettings`] fields
/// and each entry under `dependencies` overrides a subset of them:
///
/// ```toml
/// [defaults]
/// timeout_ms = 2000
///
/// [dependencies.amqp]
/// max_concurrent = 8
/// retry_on = ["error_result", "timeout"]
///
/// [dependencies.llm]
/// timeout_ms = 30000
/// max_attempts = 2
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResilienceSettings {
    pub defaults: PolicySettings,
    /// Fully resolved settings per dependency.
    pub dependencies: BTreeMap<String, PolicySettings>,
}

impl ResilienceSettings {
    /// Resolve a settings document.
    pub fn from_value(document: Value) -> Result<Self> {
        let mut root = match document {
            Value::Object(root) => root,
            Value::Null => Map::new(),
            other => {
                return Err(ConfigError::ParseError(format!(
                    "Expected a table at the top level, got {}",
                    other
                )));
            }
        };

        let defaults_doc = root
            .remove("defaults")
            .unwrap_or_else(|| Value::Object(Map::new()));
        let dependencies_doc = root
            .remove("dependencies")
            .unwrap_or_else(|| Value::Object(Map::new()));

        if let Some(section) = root.keys().next() {
            return Err(ConfigError::ParseError(format!(
                "Unknown section: {}",
                section
            )));
        }

        let defaults: PolicySettings = serde_json::from_value(defaults_doc.clone())?;

        let Value::Object(entries) = dependencies_doc else {
            return Err(ConfigError::ParseError(
                "'dependencies' must be a table".to_string(),
            ));
        };

        let mut dependencies = BTreeMap::new();
        for (name, overrides) in entries {
            let merged = merge(defaults_doc.clone(), overrides, &name)?;
            let settings: PolicySettings = serde_json::from_value(merged).map_err(|e| {
                ConfigError::DeserializationError(format!("dependency '{}': {}", name, e))
            })?;
            dependencies.insert(name, settings);
        }

        Ok(Self {
            defaults,
            dependencies,
        })
    }

    /// Load a settings file. `.env` files are read as `BULWARK_*` overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let document = Self::read_document(path.as_ref())?;
        let settings = Self::from_value(document)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load an optional settings file, then apply environment overrides.
    pub fn load(path: Option<&Path>, env: &EnvLoader) -> Result<Self> {
        let mut document = match path {
            Some(path) => Self::read_document(path)?,
            None => Value::Object(Map::new()),
        };

        let applied = env.overlay(&mut document)?;
        debug!(overrides = applied, "Applied environment overrides");

        let settings = Self::from_value(document)?;
        settings.validate()?;

        info!(
            dependencies = settings.dependencies.len(),
            "Resilience settings loaded"
        );
        Ok(settings)
    }

    /// Core configuration for one dependency.
    pub fn dependency_config(&self, name: &str) -> Result<DependencyConfig> {
        self.dependencies
            .get(name)
            .map(|settings| settings.to_dependency_config(name))
            .ok_or_else(|| ConfigError::KeyNotFound(format!("dependencies.{}", name)))
    }

    /// Core configuration for every dependency, sorted by name.
    pub fn dependency_configs(&self) -> Vec<DependencyConfig> {
        self.dependencies
            .iter()
            .map(|(name, settings)| settings.to_dependency_config(name))
            .collect()
    }

    /// Validate, then register every configured dependency.
    pub fn register_all(&self, coordinator: &ResilienceCoordinator) -> Result<Vec<Dependency>> {
        self.validate()?;

        Ok(self
            .dependency_configs()
            .into_iter()
            .map(|config| coordinator.register(config))
            .collect())
    }

    fn read_document(path: &Path) -> Result<Value> {
        let loader = ConfigLoader::auto(path)?;
        let raw = loader.load_file(path)?;

        if loader.format() != FileFormat::Env {
            return Ok(raw);
        }

        let Value::Object(pairs) = raw else {
            return Ok(Value::Object(Map::new()));
        };
        let vars = pairs
            .into_iter()
            .filter_map(|(key, value)| value.as_str().map(|v| (key, v.to_string())));

        let mut document = Value::Object(Map::new());
        apply_overrides(&mut document, EnvLoader::bulwark().filter(vars))?;
        Ok(document)
    }
}

impl Validate for ResilienceSettings {
    fn validate(&self) -> Result<()> {
        self.defaults
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("defaults: {}", inner(e))))?;

        for (name, settings) in &self.dependencies {
            ConfigValidator::not_empty(name, "dependency name")?;
            settings
                .validate()
                .map_err(|e| ConfigError::ValidationError(format!("{}: {}", name, inner(e))))?;
        }
        Ok(())
    }
}

fn inner(err: ConfigError) -> String {
    match err {
        ConfigError::ValidationError(message) => message,
        other => other.to_string(),
    }
}

fn merge(base: Value, overrides: Value, name: &str) -> Result<Value> {
    let (Value::Object(mut base), Value::Object(overrides)) = (base, overrides) else {
        return Err(ConfigError::ParseError(format!(
            "Settings for '{}' must be a table",
            name
        )));
    };

    base.extend(overrides);
    Ok(Value::Object(base))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
