//! # PMOVideo Configuration Module
//!
//! This module provides configuration management for PMOVideo, including:
//! - Loading configuration from YAML files
//! - Merging with embedded default configuration
//! - Environment variable overrides
//! - Type-safe getters and setters for configuration values
//!
//! The configuration is an explicit value: the application context loads it
//! once and hands an `Arc<Config>` to whatever needs it.
//!
//! ## Usage
//!
//! ```no_run
//! use pmoconfig::Config;
//!
//! let config = Config::load_config("")?;
//!
//! // Access configuration values
//! let level = config.get_log_min_level()?;
//! let cache_dir = config.get_managed_dir(&["video_cache", "directory"], "cache_video")?;
//!
//! // Update configuration values
//! config.set_log_min_level("DEBUG".to_string())?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use dirs::home_dir;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Number, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::info;

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmovideo.yaml");

const ENV_CONFIG_DIR: &str = "PMOVIDEO_CONFIG";
const ENV_PREFIX: &str = "PMOVIDEO_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmovideo";

// Default values for configuration
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

/// Macro to generate getter/setter for bool values with default
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            match self.get_value($path) {
                Ok(Value::Bool(b)) => Ok(b),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Configuration manager for PMOVideo
///
/// This structure manages the application configuration, including:
/// - Loading configuration from YAML files
/// - Merging with default configuration
/// - Handling environment variable overrides
/// - Providing typed getters/setters for configuration values
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

// Implémentation manuelle de Clone
impl Clone for Config {
    fn clone(&self) -> Self {
        let data = self.data.lock().unwrap().clone();
        Self {
            config_dir: self.config_dir.clone(),
            path: self.path.clone(),
            data: Mutex::new(data),
        }
    }
}

impl Config {
    /// Premier répertoire de configuration candidat
    ///
    /// Ordre : argument explicite, variable `PMOVIDEO_CONFIG`, `.pmovideo`
    /// dans le répertoire courant puis dans le home.
    fn find_config_dir(directory: &str) -> String {
        if !directory.is_empty() {
            return directory.to_string();
        }

        if let Ok(from_env) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %from_env, "Config directory taken from environment");
            return from_env;
        }

        let local = PathBuf::from(CONFIG_DIR_NAME);
        let in_home = home_dir().map(|h| h.join(CONFIG_DIR_NAME));
        std::iter::once(local)
            .chain(in_home)
            .find(|candidate| candidate.is_dir())
            .map(|found| found.to_string_lossy().into_owned())
            .unwrap_or_else(|| CONFIG_DIR_NAME.to_string())
    }

    /// Crée le répertoire au besoin et vérifie qu'il est lisible et inscriptible
    fn validate_config_dir(path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .map_err(|e| anyhow!("Cannot create config directory {}: {}", path.display(), e))?;
        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", path.display()));
        }

        let probe = path.join(".pmovideo_probe");
        fs::write(&probe, b"probe")
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|e| anyhow!("Config directory {} is not writable: {}", path.display(), e))?;
        fs::read_dir(path)?;
        Ok(())
    }

    /// Determines and validates the configuration directory
    ///
    /// The directory is searched in the following order:
    /// 1. The provided `directory` parameter if not empty
    /// 2. The `PMOVIDEO_CONFIG` environment variable
    /// 3. `.pmovideo` in the current directory
    /// 4. `.pmovideo` in the user's home directory
    ///
    /// The directory is created if it doesn't exist, and validated for read/write permissions.
    pub fn config_dir(directory: &str) -> Result<String> {
        let dir_path = Self::find_config_dir(directory);
        Self::validate_config_dir(Path::new(&dir_path))?;
        Ok(dir_path)
    }

    /// Loads the configuration from the specified directory
    ///
    /// This method:
    /// 1. Determines the configuration directory
    /// 2. Loads the default embedded configuration
    /// 3. Merges it with the external config.yaml file if present
    /// 4. Applies environment variable overrides
    /// 5. Saves the merged configuration
    ///
    /// # Arguments
    ///
    /// * `directory` - The directory containing the config.yaml file, or empty to use defaults
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory)?;
        info!(config_dir = %config_dir, "Using config directory");

        let config_file_path = Path::new(&config_dir).join("config.yaml");
        let path = config_file_path.to_string_lossy().to_string();

        let mut default_value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        let yaml_data = if let Ok(data) = fs::read(&path) {
            info!(config_file = %path, "Loaded config file");
            data
        } else {
            info!(config_file = %path, "Config file not found, using default embedded config");
            DEFAULT_CONFIG.as_bytes().to_vec()
        };

        // Merger avec la config par défaut
        let external_value: Value = serde_yaml::from_slice(&yaml_data)?;
        merge_yaml(&mut default_value, &external_value);
        let mut config_value = Self::lower_keys_value(default_value);

        Self::apply_env_overrides(&mut config_value);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(config_value),
        };

        config.save()?;
        Ok(config)
    }

    /// Returns the directory holding `config.yaml`
    pub fn directory(&self) -> &str {
        &self.config_dir
    }

    /// Saves the current configuration to the config.yaml file
    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().unwrap();
        let yaml = serde_yaml::to_string(&*data)?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    /// Sets a configuration value at the specified path and saves it
    ///
    /// # Arguments
    ///
    /// * `path` - Array of keys representing the path (e.g., `&["video_cache", "max_entry_count"]`)
    /// * `value` - The YAML value to set
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        Self::set_value_internal(&mut data, path, value)?;
        drop(data);
        self.save()?;
        Ok(())
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        let Some((last, parents)) = path.split_last() else {
            *data = value;
            return Ok(());
        };

        let mut node = data;
        for key in parents {
            let Value::Mapping(map) = node else {
                return Err(anyhow!("Cannot set {}: {} is not a mapping", path.join("."), key));
            };
            node = map
                .entry(Value::String(key.to_lowercase()))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
        }

        match node {
            Value::Mapping(map) => {
                map.insert(Value::String(last.to_lowercase()), value);
                Ok(())
            }
            _ => Err(anyhow!("Cannot set {}: parent is not a mapping", path.join("."))),
        }
    }

    /// Gets a configuration value at the specified path
    ///
    /// Returns an error if the path doesn't exist.
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data.lock().unwrap();
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (depth, key) in path.iter().enumerate() {
            let Value::Mapping(map) = current else {
                return Err(anyhow!("Path {} is not a mapping", path[..depth].join(".")));
            };
            current = map
                .get(&Value::String(key.to_lowercase()))
                .ok_or_else(|| anyhow!("Path {} does not exist", path[..=depth].join(".")))?;
        }
        Ok(current.clone())
    }

    /// Gets an unsigned integer, accepting numbers and numeric strings
    ///
    /// Returns `default` when the path is missing or holds something else.
    pub fn get_u64(&self, path: &[&str], default: u64) -> u64 {
        match self.get_value(path) {
            Ok(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Ok(Value::String(s)) => s.trim().parse::<u64>().unwrap_or(default),
            _ => default,
        }
    }

    /// Sets an unsigned integer value
    pub fn set_u64(&self, path: &[&str], value: u64) -> Result<()> {
        self.set_value(path, Value::Number(Number::from(value)))
    }

    /// Deserializes the subtree at `path` into a typed value
    ///
    /// A missing path yields `T::default()`, so optional sections such as the
    /// catalog can simply be left out of `config.yaml`.
    pub fn get_typed<T>(&self, path: &[&str]) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.get_value(path) {
            Ok(Value::Null) | Err(_) => Ok(T::default()),
            Ok(value) => serde_yaml::from_value(value)
                .map_err(|e| anyhow!("Invalid value at {}: {}", path.join("."), e)),
        }
    }

    /// Applique les variables `PMOVIDEO_CONFIG__SECTION__KEY=value`
    fn apply_env_overrides(config: &mut Value) {
        for (name, raw) in env::vars() {
            let Some(stripped) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path: Vec<&str> = stripped.split("__").collect();
            if let Err(e) = Self::set_value_internal(config, &path, Self::convert_env_value(&raw)) {
                tracing::warn!(variable = %name, error = %e, "Ignoring config override");
            }
        }
    }

    /// Interprète la valeur comme du YAML, sinon comme une chaîne
    fn convert_env_value(value: &str) -> Value {
        serde_yaml::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
    }

    fn lower_keys_value(value: Value) -> Value {
        match value {
            Value::Mapping(map) => Value::Mapping(
                map.into_iter()
                    .map(|(k, v)| {
                        let k = match k {
                            Value::String(s) => Value::String(s.to_lowercase()),
                            other => other,
                        };
                        (k, Self::lower_keys_value(v))
                    })
                    .collect(),
            ),
            Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Self::lower_keys_value).collect())
            }
            other => other,
        }
    }

    /// Chemin absolu d'un répertoire géré, créé s'il n'existe pas
    fn resolve_and_create_dir(&self, dir_path: &str) -> Result<PathBuf> {
        let resolved = match Path::new(dir_path) {
            p if p.is_absolute() => p.to_path_buf(),
            p => Path::new(&self.config_dir).join(p),
        };

        if !resolved.is_dir() {
            fs::create_dir_all(&resolved)?;
            info!(directory = %resolved.display(), "Created managed directory");
        }
        Ok(resolved)
    }

    /// Gets a directory managed by the configuration
    ///
    /// The directory may be absolute or relative to the configuration
    /// directory. It is created if it does not exist, and the default is
    /// written back to the configuration when the key is missing.
    ///
    /// # Arguments
    ///
    /// * `path` - Path in the configuration tree (e.g. `&["video_cache", "directory"]`)
    /// * `default` - Directory name used when not configured
    pub fn get_managed_dir(&self, path: &[&str], default: &str) -> Result<PathBuf> {
        let dir_path = match self.get_value(path) {
            Ok(Value::String(s)) => s,
            _ => {
                self.set_managed_dir(path, default.to_string())?;
                default.to_string()
            }
        };
        self.resolve_and_create_dir(&dir_path)
    }

    /// Sets a directory managed by the configuration
    pub fn set_managed_dir(&self, path: &[&str], directory: String) -> Result<()> {
        self.set_value(path, Value::String(directory))
    }

    impl_bool_config!(
        get_log_enable_console,
        set_log_enable_console,
        &["host", "logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );

    /// Gets the minimum log level (`TRACE`, `DEBUG`, `INFO`, `WARN`, `ERROR`)
    pub fn get_log_min_level(&self) -> Result<String> {
        match self.get_value(&["host", "logger", "min_level"]) {
            Ok(Value::String(s)) => Ok(s),
            _ => Ok(DEFAULT_LOG_MIN_LEVEL.to_string()),
        }
    }

    /// Sets the minimum log level
    pub fn set_log_min_level(&self, level: String) -> Result<()> {
        self.set_value(&["host", "logger", "min_level"], Value::String(level))
    }
}

/// Fusionne `external` dans `default`
///
/// Les mappings sont fusionnés clé par clé, tout le reste est remplacé.
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                if let Some(existing) = base.get_mut(key) {
                    merge_yaml(existing, value);
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
        }
        (slot, replacement) => *slot = replacement.clone(),
    }
}
