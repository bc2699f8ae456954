//! Configuration (§11): a YAML file deserialized with `serde_yaml`, with
//! individual fields overridable by environment variables, generalizing
//! the teacher's `ServerConfig::from_env` pattern to the rest of the
//! service's settings.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "openparcel.sqlite3".to_string()
}

fn default_max_instances() -> usize {
    5
}

fn default_admission_timeout_secs() -> u64 {
    10
}

fn default_refresh_timeout_secs() -> u64 {
    600
}

fn default_proxy_test_workers() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    #[serde(default = "default_admission_timeout_secs")]
    pub admission_timeout_secs: u64,

    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,

    #[serde(default = "default_proxy_test_workers")]
    pub proxy_test_workers: usize,

    /// Secret feeding the request-bundle AES-256-CTR key (§18).
    #[serde(default)]
    pub request_bundle_key: String,

    /// Proxy-list provider name → API key (§17).
    #[serde(default)]
    pub proxy_api_keys: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            db_path: default_db_path(),
            max_instances: default_max_instances(),
            admission_timeout_secs: default_admission_timeout_secs(),
            refresh_timeout_secs: default_refresh_timeout_secs(),
            proxy_test_workers: default_proxy_test_workers(),
            request_bundle_key: String::new(),
            proxy_api_keys: HashMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl Config {
    /// Loads from `path` if it exists, otherwise starts from defaults; in
    /// either case environment variables take precedence field-by-field.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Resolves the config path from `OPENPARCEL_CONFIG`, defaulting to
    /// `config/config.yml`, and loads it.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = std::env::var("OPENPARCEL_CONFIG")
            .unwrap_or_else(|_| "config/config.yml".to_string());
        Self::load(Path::new(&path))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OPENPARCEL_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("OPENPARCEL_PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            }
        }
        if let Ok(v) = std::env::var("OPENPARCEL_DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = std::env::var("OPENPARCEL_MAX_INSTANCES") {
            if let Ok(n) = v.parse() {
                self.max_instances = n;
            }
        }
        if let Ok(v) = std::env::var("OPENPARCEL_ADMISSION_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.admission_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("OPENPARCEL_REFRESH_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.refresh_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("OPENPARCEL_REQUEST_BUNDLE_KEY") {
            self.request_bundle_key = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_instances, 5);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/config.yml")).unwrap();
        assert_eq!(config.db_path, "openparcel.sqlite3");
    }
}
