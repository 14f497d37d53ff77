//! Registry configuration.
//!
//! Built once at startup (defaults, JSON file, `beacon.*` property overrides)
//! and shared read-only with every subsystem.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{Service, DEFAULT_PRIORITY};
use crate::{Error, Result};

const PROPERTY_PREFIX: &str = "beacon.";

/// Configuration for a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root of every node the registry touches.
    /// Default: /beacon
    pub root: String,

    /// Directory under the root holding one status node per process.
    /// Default: _status
    pub status_dir: String,

    /// Directory under the root holding one config node per process.
    /// Default: _config
    pub config_dir: String,

    /// Fail `ready`/`reset` when the status node already exists.
    pub status_force: bool,

    /// Fail `ready`/`reset` when the config node already exists.
    pub config_force: bool,

    /// Reconciliation sweep period.
    /// Default: 10 s
    pub refresh_interval_ms: u64,

    /// Longest the retry worker blocks before re-checking shutdown.
    /// Default: 60 s
    pub retry_poll_interval_ms: u64,

    /// Delay before a failed subscription is attempted again.
    /// Default: 30 s
    pub reinstall_delay_ms: u64,

    /// Stop retrying a service after this many failed attempts.
    /// Default: unbounded
    pub reinstall_max_attempts: Option<u32>,

    /// Import enabled unless overridden per service.
    pub import_enabled: bool,

    /// Export enabled unless overridden per service.
    pub export_enabled: bool,

    /// Tag stamped on exported instances unless overridden per service.
    pub default_tag: String,

    /// Priority stamped on exported instances unless overridden per service.
    pub default_priority: u32,

    /// Overrides keyed by service name.
    pub services: BTreeMap<String, ServiceOverrides>,
}

/// Per-service policy; unset fields fall back to the registry defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOverrides {
    pub import: Option<bool>,
    pub export: Option<bool>,
    pub tag: Option<String>,
    pub priority: Option<u32>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: "/beacon".to_string(),
            status_dir: "_status".to_string(),
            config_dir: "_config".to_string(),
            status_force: false,
            config_force: false,
            refresh_interval_ms: 10_000,
            retry_poll_interval_ms: 60_000,
            reinstall_delay_ms: 30_000,
            reinstall_max_attempts: None,
            import_enabled: true,
            export_enabled: true,
            default_tag: String::new(),
            default_priority: DEFAULT_PRIORITY,
            services: BTreeMap::new(),
        }
    }
}

impl RegistryConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Applies `beacon.*` overrides, e.g. `beacon.root=/rpc` or
    /// `beacon.service.com.acme.Orders.priority=0`. Other keys are ignored.
    pub fn apply_properties<'a, I>(&mut self, properties: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in properties {
            let Some(key) = key.strip_prefix(PROPERTY_PREFIX) else {
                continue;
            };
            match key {
                "root" => self.root = value.to_string(),
                "status" => self.status_dir = value.to_string(),
                "config" => self.config_dir = value.to_string(),
                "status_force" => self.status_force = parse(key, value)?,
                "config_force" => self.config_force = parse(key, value)?,
                "refresh" => self.refresh_interval_ms = parse(key, value)?,
                "interval" => self.retry_poll_interval_ms = parse(key, value)?,
                "delay" => self.reinstall_delay_ms = parse(key, value)?,
                "max_attempts" => self.reinstall_max_attempts = Some(parse(key, value)?),
                "import" => self.import_enabled = parse(key, value)?,
                "export" => self.export_enabled = parse(key, value)?,
                "tag" => self.default_tag = value.to_string(),
                "priority" => self.default_priority = parse(key, value)?,
                _ => self.apply_service_property(key, value)?,
            }
        }
        self.validate()
    }

    fn apply_service_property(&mut self, key: &str, value: &str) -> Result<()> {
        let Some(rest) = key.strip_prefix("service.") else {
            return Err(Error::InvalidConfig(format!("unknown property {PROPERTY_PREFIX}{key}")));
        };
        // Service names contain dots, so the field is the last segment.
        let Some((name, field)) = rest.rsplit_once('.') else {
            return Err(Error::InvalidConfig(format!("missing field in {PROPERTY_PREFIX}{key}")));
        };
        let overrides = self.services.entry(name.to_string()).or_default();
        match field {
            "import" => overrides.import = Some(parse(key, value)?),
            "export" => overrides.export = Some(parse(key, value)?),
            "tag" => overrides.tag = Some(value.to_string()),
            "priority" => overrides.priority = Some(parse(key, value)?),
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "unknown service field {field} in {PROPERTY_PREFIX}{key}"
                )))
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.starts_with('/') || (self.root.len() > 1 && self.root.ends_with('/')) {
            return Err(Error::InvalidConfig(format!("root must be absolute: {}", self.root)));
        }
        for (name, dir) in [("status_dir", &self.status_dir), ("config_dir", &self.config_dir)] {
            if dir.is_empty() || dir.contains('/') {
                return Err(Error::InvalidConfig(format!("{name} must be a single segment: {dir}")));
            }
        }
        if self.refresh_interval_ms == 0 || self.retry_poll_interval_ms == 0 {
            return Err(Error::InvalidConfig("intervals must be positive".to_string()));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.retry_poll_interval_ms)
    }

    pub fn reinstall_delay(&self) -> Duration {
        Duration::from_millis(self.reinstall_delay_ms)
    }

    fn overrides(&self, service: &Service) -> Option<&ServiceOverrides> {
        self.services.get(&service.name)
    }

    pub fn import_enabled_for(&self, service: &Service) -> bool {
        self.overrides(service)
            .and_then(|o| o.import)
            .unwrap_or(self.import_enabled)
    }

    pub fn export_enabled_for(&self, service: &Service) -> bool {
        self.overrides(service)
            .and_then(|o| o.export)
            .unwrap_or(self.export_enabled)
    }

    pub fn tag_for(&self, service: &Service) -> String {
        self.overrides(service)
            .and_then(|o| o.tag.clone())
            .unwrap_or_else(|| self.default_tag.clone())
    }

    pub fn priority_for(&self, service: &Service) -> u32 {
        self.overrides(service)
            .and_then(|o| o.priority)
            .unwrap_or(self.default_priority)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("bad value for {key}: {value}")))
}

/// Effective configuration published in the config node, and the target of
/// configuration pushed back through it.
pub trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> BTreeMap<String, String>;
    fn apply(&self, pushed: BTreeMap<String, String>) -> Result<()>;
}

/// Key/value configuration held in memory; pushes merge over existing keys.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryConfig {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().ok().and_then(|v| v.get(key).cloned())
    }
}

impl ConfigSource for MemoryConfig {
    fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().map(|v| v.clone()).unwrap_or_default()
    }

    fn apply(&self, pushed: BTreeMap<String, String>) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::Poisoned("memory config"))?;
        values.extend(pushed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = RegistryConfig::default();
        assert_eq!(config.refresh_interval(), Duration::from_secs(10));
        assert_eq!(config.retry_poll_interval(), Duration::from_secs(60));
        assert_eq!(config.reinstall_delay(), Duration::from_secs(30));
        assert!(config.reinstall_max_attempts.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = RegistryConfig::from_json_str(
            r#"{"root":"/rpc","services":{"com.acme.Orders":{"import":false,"priority":1}}}"#,
        )
        .unwrap();
        assert_eq!(config.root, "/rpc");
        assert_eq!(config.status_dir, "_status");
        let orders = Service::new("com.acme.Orders", "1");
        assert!(!config.import_enabled_for(&orders));
        assert!(config.export_enabled_for(&orders));
        assert_eq!(config.priority_for(&orders), 1);
        assert_eq!(config.priority_for(&Service::new("other", "1")), DEFAULT_PRIORITY);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"refresh_interval_ms": 250, "default_tag": "blue"}}"#).unwrap();
        let config = RegistryConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.refresh_interval(), Duration::from_millis(250));
        assert_eq!(config.default_tag, "blue");
    }

    #[test]
    fn properties_override_fields_and_services() {
        let mut config = RegistryConfig::default();
        config
            .apply_properties([
                ("beacon.root", "/rpc"),
                ("beacon.delay", "500"),
                ("beacon.max_attempts", "3"),
                ("beacon.service.com.acme.Orders.tag", "gray"),
                ("beacon.service.com.acme.Orders.export", "false"),
                ("unrelated.key", "x"),
            ])
            .unwrap();
        assert_eq!(config.root, "/rpc");
        assert_eq!(config.reinstall_delay(), Duration::from_millis(500));
        assert_eq!(config.reinstall_max_attempts, Some(3));
        let orders = Service::new("com.acme.Orders", "1");
        assert_eq!(config.tag_for(&orders), "gray");
        assert!(!config.export_enabled_for(&orders));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = RegistryConfig::default();
        assert!(config.apply_properties([("beacon.refresh", "soon")]).is_err());
        let mut config = RegistryConfig::default();
        assert!(config.apply_properties([("beacon.root", "relative")]).is_err());
        let mut config = RegistryConfig::default();
        assert!(config.apply_properties([("beacon.bogus", "1")]).is_err());
    }

    #[test]
    fn memory_config_merges_pushes() {
        let config = MemoryConfig::new(BTreeMap::from([("a".to_string(), "1".to_string())]));
        config
            .apply(BTreeMap::from([("b".to_string(), "2".to_string())]))
            .unwrap();
        assert_eq!(config.snapshot().len(), 2);
        assert_eq!(config.get("b").as_deref(), Some("2"));
    }
}
