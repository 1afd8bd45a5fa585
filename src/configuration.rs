//! Typed key/value device configuration.
//!
//! Keys are ordered and may carry group prefixes separated by `/` (for example
//! `main/width`). On disk a configuration is a TOML document where every group becomes a
//! table. Descriptions are kept in memory only.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{Result, ScannerError};

/// A configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self.coerce_like(&ConfigValue::Bool(false))? {
            ConfigValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.coerce_like(&ConfigValue::Int(0))? {
            ConfigValue::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.coerce_like(&ConfigValue::Float(0.0))? {
            ConfigValue::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> String {
        self.to_string()
    }

    /// Convert to the variant of `target`. `None` when the value has no such representation.
    pub fn coerce_like(&self, target: &ConfigValue) -> Option<ConfigValue> {
        match target {
            ConfigValue::Bool(_) => match self {
                ConfigValue::Bool(b) => Some(ConfigValue::Bool(*b)),
                ConfigValue::Int(i) => Some(ConfigValue::Bool(*i != 0)),
                ConfigValue::Float(f) => Some(ConfigValue::Bool(*f != 0.0)),
                ConfigValue::Text(s) => {
                    let s = s.trim().to_ascii_lowercase();
                    Some(ConfigValue::Bool(!matches!(s.as_str(), "" | "0" | "false")))
                }
            },
            ConfigValue::Int(_) => match self {
                ConfigValue::Bool(b) => Some(ConfigValue::Int(*b as i64)),
                ConfigValue::Int(i) => Some(ConfigValue::Int(*i)),
                ConfigValue::Float(f) if f.is_finite() => Some(ConfigValue::Int(f.round() as i64)),
                ConfigValue::Float(_) => None,
                ConfigValue::Text(s) => s.trim().parse().ok().map(ConfigValue::Int),
            },
            ConfigValue::Float(_) => match self {
                ConfigValue::Bool(b) => Some(ConfigValue::Float(if *b { 1.0 } else { 0.0 })),
                ConfigValue::Int(i) => Some(ConfigValue::Float(*i as f64)),
                ConfigValue::Float(f) => Some(ConfigValue::Float(*f)),
                ConfigValue::Text(s) => s.trim().parse().ok().map(ConfigValue::Float),
            },
            ConfigValue::Text(_) => Some(ConfigValue::Text(self.to_string())),
        }
    }

    fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::Boolean(b) => Some(ConfigValue::Bool(*b)),
            toml::Value::Integer(i) => Some(ConfigValue::Int(*i)),
            toml::Value::Float(f) => Some(ConfigValue::Float(*f)),
            toml::Value::String(s) => Some(ConfigValue::Text(s.clone())),
            toml::Value::Datetime(d) => Some(ConfigValue::Text(d.to_string())),
            toml::Value::Array(_) | toml::Value::Table(_) => None,
        }
    }

    fn to_toml(&self) -> toml::Value {
        match self {
            ConfigValue::Bool(b) => toml::Value::Boolean(*b),
            ConfigValue::Int(i) => toml::Value::Integer(*i),
            ConfigValue::Float(f) => toml::Value::Float(*f),
            ConfigValue::Text(s) => toml::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Int(i) => write!(f, "{}", i),
            ConfigValue::Float(v) => write!(f, "{}", v),
            ConfigValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i32> for ConfigValue {
    fn from(value: i32) -> Self {
        ConfigValue::Int(value as i64)
    }
}

impl From<u32> for ConfigValue {
    fn from(value: u32) -> Self {
        ConfigValue::Int(value as i64)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Float(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Text(value)
    }
}

/// Value with a human-readable description
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigItem {
    pub value: ConfigValue,
    pub description: String,
}

impl ConfigItem {
    pub fn new(value: impl Into<ConfigValue>, description: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            description: description.into(),
        }
    }
}

/// Ordered configuration of one device
#[derive(Debug, Clone, Default)]
pub struct DeviceConfiguration {
    items: BTreeMap<String, ConfigItem>,
    prefix: Vec<String>,
}

impl DeviceConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix.join("/"), key)
        }
    }

    /// Prefix subsequent keys with `group/`
    pub fn begin_group(&mut self, group: &str) {
        self.prefix.push(group.to_string());
    }

    pub fn end_group(&mut self) {
        self.prefix.pop();
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ConfigValue>, description: &str) {
        let key = self.full_key(key);
        self.items.insert(key, ConfigItem::new(value, description));
    }

    pub fn item(&self, key: &str) -> Option<&ConfigItem> {
        self.items.get(&self.full_key(key))
    }

    pub fn value(&self, key: &str) -> Option<&ConfigValue> {
        let item = self.item(key);
        if item.is_none() {
            warn!("Key not found: {}", key);
        }
        item.map(|item| &item.value)
    }

    /// Set a value, keeping the description of an existing key
    pub fn set_value(&mut self, key: &str, value: impl Into<ConfigValue>) {
        let key = self.full_key(key);
        let value = value.into();
        match self.items.get_mut(&key) {
            Some(item) => item.value = value,
            None => {
                self.items.insert(key, ConfigItem::new(value, ""));
            }
        }
    }

    pub fn description(&self, key: &str) -> Option<&str> {
        self.item(key).map(|item| item.description.as_str())
    }

    pub fn all_keys(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.item(key)
            .and_then(|item| item.value.as_f64())
            .unwrap_or(default)
    }

    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.item(key)
            .and_then(|item| item.value.as_i64())
            .unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.item(key)
            .and_then(|item| item.value.as_bool())
            .unwrap_or(default)
    }

    /// Insert every item of `other`, overwriting existing keys
    pub fn merge(&mut self, other: &DeviceConfiguration) {
        for (key, item) in &other.items {
            self.items.insert(key.clone(), item.clone());
        }
    }

    /// Overwrite values of keys present in both configurations. Keys only present in
    /// `other` are ignored. With `preserve_types` incoming values are converted to the type
    /// of the value they replace; a value that cannot be converted is left untouched.
    pub fn replace_values(&mut self, other: &DeviceConfiguration, preserve_types: bool) {
        for (key, item) in self.items.iter_mut() {
            let Some(incoming) = other.items.get(key) else {
                continue;
            };

            if !preserve_types {
                item.value = incoming.value.clone();
                continue;
            }

            match incoming.value.coerce_like(&item.value) {
                Some(value) => item.value = value,
                None => warn!(
                    "Cannot convert value '{}' of key {} to the existing type",
                    incoming.value, key
                ),
            }
        }
    }

    /// Load from a TOML file. A missing file yields an empty configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut configuration = Self::new();
        if !path.exists() {
            warn!("Configuration file not found: {}", path.display());
            return Ok(configuration);
        }

        info!("Loading configuration from file: {}", path.display());
        let text = fs::read_to_string(path)?;
        let table: toml::Table = toml::from_str(&text)?;
        flatten(&table, "", &mut configuration.items);
        info!("Keys found: {}", configuration.items.len());
        Ok(configuration)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut root = toml::Table::new();
        for (key, item) in &self.items {
            let mut parts: Vec<&str> = key.split('/').collect();
            let leaf = parts.pop().unwrap_or_default();
            let mut table = &mut root;
            for part in parts {
                let entry = table
                    .entry(part.to_string())
                    .or_insert_with(|| toml::Value::Table(toml::Table::new()));
                table = match entry {
                    toml::Value::Table(inner) => inner,
                    _ => {
                        return Err(ScannerError::InvalidParameter(format!(
                            "configuration key {} conflicts with a value",
                            key
                        )))
                    }
                };
            }
            table.insert(leaf.to_string(), item.value.to_toml());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string(&root)?)?;
        Ok(())
    }
}

fn flatten(table: &toml::Table, prefix: &str, items: &mut BTreeMap<String, ConfigItem>) {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        match value {
            toml::Value::Table(inner) => flatten(inner, &key, items),
            other => match ConfigValue::from_toml(other) {
                Some(value) => {
                    items.insert(key, ConfigItem::new(value, ""));
                }
                None => warn!("Unsupported value type for key {}", key),
            },
        }
    }
}

impl PartialEq for DeviceConfiguration {
    /// Same keys with the same textual values. Descriptions are ignored.
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(other.items.iter())
                .all(|((lk, li), (rk, ri))| lk == rk && li.value.to_string() == ri.value.to_string())
    }
}

impl std::ops::AddAssign<&DeviceConfiguration> for DeviceConfiguration {
    fn add_assign(&mut self, other: &DeviceConfiguration) {
        self.merge(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> DeviceConfiguration {
        let mut config = DeviceConfiguration::new();
        config.begin_group("main");
        config.insert("width", 576, "Detector width, px");
        config.insert("pixel", 0.2, "Pixel size, mm");
        config.end_group();
        config.insert("enabled", true, "");
        config.insert("port", "COM3", "Serial port");
        config
    }

    #[test]
    fn groups_prefix_keys() {
        let config = sample();
        assert_eq!(
            config.all_keys(),
            vec!["enabled", "main/pixel", "main/width", "port"]
        );
        assert_eq!(config.value("main/width"), Some(&ConfigValue::Int(576)));
        assert_eq!(config.description("main/pixel"), Some("Pixel size, mm"));
        assert!(config.value("main/missing").is_none());
    }

    #[test]
    fn set_value_keeps_description() {
        let mut config = sample();
        config.set_value("port", "COM7");
        assert_eq!(config.description("port"), Some("Serial port"));
        assert_eq!(config.value("port").unwrap().as_text(), "COM7");
    }

    #[test]
    fn replace_values_coerces_and_ignores_unknown_keys() {
        let mut base = sample();
        let mut overlay = DeviceConfiguration::new();
        overlay.insert("main/width", "1024", "");
        overlay.insert("main/pixel", 1, "");
        overlay.insert("enabled", "false", "");
        overlay.insert("extra", 5, "");

        base.replace_values(&overlay, true);

        assert_eq!(base.value("main/width"), Some(&ConfigValue::Int(1024)));
        assert_eq!(base.value("main/pixel"), Some(&ConfigValue::Float(1.0)));
        assert_eq!(base.value("enabled"), Some(&ConfigValue::Bool(false)));
        assert!(base.item("extra").is_none());
        assert_eq!(base.description("main/width"), Some("Detector width, px"));
    }

    #[test]
    fn replace_values_keeps_value_on_failed_conversion() {
        let mut base = sample();
        let mut overlay = DeviceConfiguration::new();
        overlay.insert("main/width", "wide", "");
        base.replace_values(&overlay, true);
        assert_eq!(base.value("main/width"), Some(&ConfigValue::Int(576)));

        base.replace_values(&overlay, false);
        assert_eq!(base.value("main/width"), Some(&ConfigValue::from("wide")));
    }

    #[test]
    fn equality_ignores_descriptions_and_numeric_type() {
        let mut a = DeviceConfiguration::new();
        a.insert("value", 1, "one");
        let mut b = DeviceConfiguration::new();
        b.insert("value", 1.0, "");
        assert_eq!(a, b);

        b.set_value("value", 2);
        assert_ne!(a, b);
    }

    #[test]
    fn merge_inserts_every_key() {
        let mut a = sample();
        let mut b = DeviceConfiguration::new();
        b.insert("extra", 5, "");
        b.insert("port", "COM9", "");
        a += &b;
        assert_eq!(a.len(), 5);
        assert_eq!(a.value("port").unwrap().as_text(), "COM9");
    }

    #[test]
    fn save_and_load_through_toml_tables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Detector.toml");
        let config = sample();
        config.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("[main]"));

        let loaded = DeviceConfiguration::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let loaded = DeviceConfiguration::load(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn text_coercion_follows_variant_rules() {
        assert_eq!(ConfigValue::from("0").as_bool(), Some(false));
        assert_eq!(ConfigValue::from("yes").as_bool(), Some(true));
        assert_eq!(ConfigValue::from(" 42 ").as_i64(), Some(42));
        assert_eq!(ConfigValue::Float(2.6).as_i64(), Some(3));
        assert_eq!(ConfigValue::from("abc").as_f64(), None);
    }
}
