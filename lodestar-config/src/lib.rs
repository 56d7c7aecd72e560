//! Configuration management for Lodestar
//!
//! Values are layered: a TOML or JSON file first, then `LODESTAR_`-prefixed
//! environment variables on top. Typed sections are pulled out with
//! [`ConfigManager::section`] and checked with [`Validate`].
//!
//! ```
//! use lodestar_config::ConfigManager;
//!
//! let manager = ConfigManager::with_prefix("LODESTAR");
//! manager.set("registry.port", 8761).unwrap();
//! manager.load_env_from(vec![(
//!     "LODESTAR_REGISTRY__PORT".to_string(),
//!     "9000".to_string(),
//! )]);
//!
//! let port: u16 = manager.get("registry.port").unwrap();
//! assert_eq!(port, 9000);
//! ```

pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use env::{EnvLoader, parse_scalar};
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use validation::{ConfigValidator, Validate};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

/// Layered configuration store
#[derive(Clone, Debug)]
pub struct ConfigManager {
    root: Arc<RwLock<Value>>,
    env_prefix: Option<String>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RwLock::new(Value::Object(Map::new()))),
            env_prefix: None,
        }
    }

    /// Create with an environment variable prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            env_prefix: Some(prefix.into()),
            ..Self::new()
        }
    }

    /// Merge a file into the store, format taken from the extension
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = ConfigLoader::for_path(path)?.read(path)?;
        self.merge_value(data)
    }

    /// Overlay variables from the process environment
    pub fn load_env(&self) {
        self.load_env_from(std::env::vars());
    }

    /// Read a `.env` file into the process environment, then overlay it
    pub fn load_dotenv(&self, path: Option<&str>) -> Result<()> {
        match path {
            Some(path) => {
                dotenvy::from_path(path)?;
            }
            None => {
                // A missing .env is not an error
                dotenvy::dotenv().ok();
            }
        }
        self.load_env();
        Ok(())
    }

    /// Overlay an explicit set of variables
    pub fn load_env_from<I>(&self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let loader = EnvLoader::new(self.env_prefix.clone());
        let loaded = loader.load_from(vars);

        let mut root = self.root.write();
        for (key, raw) in loaded {
            let path = loader.key_path(&key);
            insert_path(&mut root, &path, parse_scalar(&raw));
        }
    }

    /// Set a value at a dotted key
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value = serde_json::to_value(value).map_err(|e| ConfigError::shape(key, e))?;

        let path: Vec<&str> = key.split('.').collect();
        insert_path(&mut self.root.write(), &path, json_value);
        Ok(())
    }

    /// Get a value at a dotted key
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let root = self.root.read();
        let value = lookup_path(&root, key).ok_or_else(|| ConfigError::Missing(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| ConfigError::shape(key, e))
    }

    pub fn has(&self, key: &str) -> bool {
        lookup_path(&self.root.read(), key).is_some()
    }

    /// Deserialize and validate a section.
    ///
    /// A missing section deserializes from an empty table, so a type whose
    /// fields all carry serde defaults loads cleanly from nothing.
    pub fn section<T: DeserializeOwned + Validate>(&self, key: &str) -> Result<T> {
        let value = lookup_path(&self.root.read(), key)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        let section: T = serde_json::from_value(value).map_err(|e| ConfigError::shape(key, e))?;
        section.validate()?;
        Ok(section)
    }

    /// Deserialize and validate the whole store
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let value = self.root.read().clone();
        let config: T = serde_json::from_value(value).map_err(|e| ConfigError::shape("", e))?;
        config.validate()?;
        Ok(config)
    }

    fn merge_value(&self, data: Value) -> Result<()> {
        if !data.is_object() {
            return Err(ConfigError::shape(
                "",
                serde::de::Error::custom("top level of a configuration file must be a table"),
            ));
        }
        merge(&mut self.root.write(), data);
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup_path<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(root, |node, segment| node.get(segment))
}

fn insert_path(root: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), value);
    }
}

/// Deep merge: tables merge key by key, anything else replaces.
fn merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}
