//! Server configuration: YAML file plus overrides.
//!
//! Precedence is CLI flags > `DTS_*` environment variables > config file >
//! defaults. The flag and environment layers are handled by the server
//! binary (clap); this module owns the file format and the defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// The metadata database holding `migration_tasks`.
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
        }
    }
}

/// Metadata database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_user")]
    pub password: String,
    #[serde(default = "default_db_name")]
    pub dbname: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: default_db_user(),
            dbname: default_db_name(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// debug, info, warn or error.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// json or text.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// stdout or stderr.
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
        }
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_db_name() -> String {
    "postgres".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load from a YAML file, falling back to defaults when it is absent.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

impl MetadataConfig {
    /// Connection string for the metadata database.
    pub fn dsn(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.dbname
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID_YAML: &str = r#"
server:
  host: 127.0.0.1
  port: 9090

metadata:
  host: meta.db
  port: 5433
  user: dts
  password: secret
  dbname: dts_meta

log:
  level: debug
  format: text
"#;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.metadata.host, "localhost");
        assert_eq!(config.metadata.port, 5432);
        assert_eq!(config.metadata.dbname, "postgres");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "json");
        assert_eq!(config.log.output, "stdout");
    }

    #[test]
    fn test_from_yaml() {
        let config = Config::from_yaml(VALID_YAML).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.metadata.dsn(),
            "host=meta.db port=5433 user=dts password=secret dbname=dts_meta");
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "text");
        // unset field keeps the default
        assert_eq!(config.log.output, "stdout");
    }

    #[test]
    fn test_partial_yaml_falls_back_to_defaults() {
        let config = Config::from_yaml("server:\n  port: 1234\n").unwrap();
        assert_eq!(config.server.port, 1234);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.metadata.host, "localhost");
    }

    #[test]
    fn test_load_file() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        file.write_all(VALID_YAML.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9090);
    }

    #[test]
    fn test_load_or_default_with_missing_file() {
        let config = Config::load_or_default("/nonexistent/config.yaml").unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(Config::from_yaml("server: [not a map").is_err());
    }
}
