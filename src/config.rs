//! Configuration for panwatch.
//!
//! Settings come from a YAML file with environment-variable overrides.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use thiserror::Error;

/// Configuration error. Fatal at startup, before any worker runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Per-firewall monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Structural poll cadence in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Session sampler cadence in seconds.
    #[serde(default = "default_sample_interval")]
    pub session_sample_interval: f64,
}

/// Global settings shared by all targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_db_path")]
    pub database_path: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Oldest raw sample kept in memory, in seconds.
    #[serde(default = "default_buffer_max_age")]
    pub buffer_max_age_seconds: i64,
    /// Raw sample count cap per target/stream.
    #[serde(default = "default_buffer_max_samples")]
    pub buffer_max_samples: usize,
    /// Consecutive auth failures before a worker gives up.
    #[serde(default = "default_auth_failure_limit")]
    pub auth_failure_limit: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            http_port: default_http_port(),
            retention_days: default_retention_days(),
            cache_ttl_seconds: default_cache_ttl(),
            pool_size: default_pool_size(),
            buffer_max_age_seconds: default_buffer_max_age(),
            buffer_max_samples: default_buffer_max_samples(),
            auth_failure_limit: default_auth_failure_limit(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    60
}
fn default_sample_interval() -> f64 {
    1.0
}
fn default_db_path() -> String {
    "panwatch.db".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_retention_days() -> i64 {
    30
}
fn default_cache_ttl() -> u64 {
    30
}
fn default_pool_size() -> usize {
    10
}
fn default_buffer_max_age() -> i64 {
    7200
}
fn default_buffer_max_samples() -> usize {
    8192
}
fn default_auth_failure_limit() -> u32 {
    5
}

/// Top-level configuration: global settings plus a map of firewalls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub firewalls: BTreeMap<String, TargetConfig>,
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// Environment variables:
    /// - `PANWATCH_HTTP_PORT`: HTTP port
    /// - `PANWATCH_DB_PATH`: database file path
    /// - `PANWATCH_RETENTION_DAYS`: metric retention horizon
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path_str.clone(),
            source: e,
        })?;
        let mut cfg: Config = serde_yaml::from_str(&text).map_err(|e| ConfigError::Yaml {
            path: path_str,
            source: e,
        })?;

        // Map keys double as target names.
        for (name, fw) in cfg.firewalls.iter_mut() {
            if fw.name.is_empty() {
                fw.name = name.clone();
            }
        }

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port_str) = env::var("PANWATCH_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                self.global.http_port = port;
            }
        }
        if let Ok(db_path) = env::var("PANWATCH_DB_PATH") {
            self.global.database_path = db_path;
        }
        if let Ok(days) = env::var("PANWATCH_RETENTION_DAYS") {
            if let Ok(days) = days.parse() {
                self.global.retention_days = days;
            }
        }
    }

    /// Collect every configuration problem instead of failing on the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.global.pool_size == 0 {
            errors.push("global: pool_size must be >= 1".to_string());
        }
        if self.global.retention_days < 1 {
            errors.push("global: retention_days must be >= 1".to_string());
        }
        if self.global.buffer_max_samples == 0 {
            errors.push("global: buffer_max_samples must be >= 1".to_string());
        }

        for (name, fw) in &self.firewalls {
            if fw.host.is_empty() {
                errors.push(format!("firewall {}: host is required", name));
            }
            if fw.username.is_empty() || fw.password.is_empty() {
                errors.push(format!("firewall {}: username and password are required", name));
            }
            if fw.poll_interval < 1 {
                errors.push(format!("firewall {}: poll_interval must be >= 1", name));
            }
            if fw.session_sample_interval <= 0.0 {
                errors.push(format!("firewall {}: session_sample_interval must be > 0", name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Targets that should have a worker running.
    pub fn enabled_targets(&self) -> Vec<TargetConfig> {
        self.firewalls.values().filter(|fw| fw.enabled).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
global:
  database_path: "./data/metrics.db"
  http_port: 9090
  retention_days: 14
firewalls:
  datacenter_fw:
    host: "https://10.100.192.3"
    username: "admin"
    password: "secret"
    verify_ssl: false
    poll_interval: 30
  branch_fw:
    host: "192.168.1.1"
    username: "admin"
    password: "secret"
    enabled: false
"#;

    fn parse_sample() -> Config {
        let mut cfg: Config = serde_yaml::from_str(SAMPLE).unwrap();
        for (name, fw) in cfg.firewalls.iter_mut() {
            fw.name = name.clone();
        }
        cfg
    }

    #[test]
    fn test_parse_sample_config() {
        let cfg = parse_sample();
        assert_eq!(cfg.global.http_port, 9090);
        assert_eq!(cfg.global.retention_days, 14);
        assert_eq!(cfg.firewalls.len(), 2);

        let dc = &cfg.firewalls["datacenter_fw"];
        assert!(!dc.verify_ssl);
        assert_eq!(dc.poll_interval, 30);
        // Defaults fill in what the file omits.
        assert_eq!(dc.session_sample_interval, 1.0);
        assert_eq!(cfg.global.pool_size, 10);
    }

    #[test]
    fn test_enabled_targets_skips_disabled() {
        let enabled = parse_sample().enabled_targets();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "datacenter_fw");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let cfg: Config = serde_yaml::from_str(
            r#"
firewalls:
  bad_fw:
    host: ""
    username: ""
    password: ""
    poll_interval: 0
"#,
        )
        .unwrap();

        match cfg.validate() {
            Err(ConfigError::Invalid(errors)) => {
                assert_eq!(errors.len(), 3);
            }
            _ => panic!("expected ConfigError::Invalid"),
        }
    }

    #[test]
    fn test_default_global_config() {
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.database_path, "panwatch.db");
        assert_eq!(cfg.buffer_max_age_seconds, 7200);
    }
}
