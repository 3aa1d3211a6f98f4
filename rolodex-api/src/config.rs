use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ApiConfig {
    pub cors: Option<CorsConfig>,
    pub server: Option<ServerConfig>,
    pub database: Option<DatabaseConfig>,
    pub import: Option<ImportConfig>,
    /// Extra header synonyms per canonical field, on top of the built-in sets
    pub field_synonyms: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ImportConfig {
    /// Normalization threads; 0 sizes the pool from the available cores
    pub worker_threads: usize,
    pub max_concurrent_writes: usize,
    pub row_write_timeout_ms: u64,
    pub index_retry_attempts: u32,
    pub index_retry_backoff_ms: u64,
    pub max_file_size_bytes: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            max_concurrent_writes: 4,
            row_write_timeout_ms: 5_000,
            index_retry_attempts: 3,
            index_retry_backoff_ms: 250,
            max_file_size_bytes: 10 * 1024 * 1024,
        }
    }
}

const DEFAULT_CONFIG: &str = r#"
[cors]
allowed_origins = ["http://localhost:3030"]

[server]
host = "127.0.0.1"
port = 8080

[database]
# path = "/var/lib/rolodex/rolodex.sqlite3"

[import]
worker_threads = 0
max_concurrent_writes = 4
row_write_timeout_ms = 5000
index_retry_attempts = 3
index_retry_backoff_ms = 250
max_file_size_bytes = 10485760

[field_synonyms]
# Extra CSV header names per canonical field
# email = ["courriel"]
# company = ["employer"]
"#;

impl ApiConfig {
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(get_config_path);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::Message(format!("Failed to create config directory: {e}"))
            })?;
        }

        if !config_path.exists() {
            std::fs::write(&config_path, DEFAULT_CONFIG).map_err(|e| {
                ConfigError::Message(format!("Failed to write default config: {e}"))
            })?;
        }

        let builder = Config::builder()
            .add_source(File::from(config_path.clone()))
            .build()?;

        let config: ApiConfig = builder.try_deserialize()?;

        Ok((config, config_path))
    }

    pub fn import_settings(&self) -> ImportConfig {
        self.import.clone().unwrap_or_default()
    }

    pub fn field_synonyms(&self) -> HashMap<String, Vec<String>> {
        self.field_synonyms.clone().unwrap_or_default()
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.database.as_ref().and_then(|d| d.path.clone())
    }
}

pub fn get_config_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        config_dir.join("rolodex").join("api.toml")
    } else {
        PathBuf::from("api.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writes_and_reads_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("api.toml");

        let (config, written) = ApiConfig::load(Some(&path)).unwrap();

        assert_eq!(written, path);
        assert!(path.exists());
        let server = config.server.as_ref().unwrap();
        assert_eq!(server.port, 8080);
        let import = config.import.as_ref().unwrap();
        assert_eq!(import.max_concurrent_writes, 4);
        assert_eq!(import.index_retry_attempts, 3);
        assert_eq!(config.database_path(), None);
    }

    #[test]
    fn test_partial_import_section_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("api.toml");
        std::fs::write(
            &path,
            r#"
[import]
max_concurrent_writes = 9

[field_synonyms]
company = ["employer", "organisation"]
"#,
        )
        .unwrap();

        let (config, _) = ApiConfig::load(Some(&path)).unwrap();

        let import = config.import_settings();
        assert_eq!(import.max_concurrent_writes, 9);
        assert_eq!(import.row_write_timeout_ms, 5_000);
        assert!(config.server.is_none());
        assert_eq!(
            config.field_synonyms()["company"],
            vec!["employer".to_string(), "organisation".to_string()]
        );
    }
}
