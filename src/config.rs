//! Service configuration.
//!
//! A JSON document on disk, path overridable via `KIFU_STUDIO_CONFIG`. A
//! missing file yields the defaults; a present-but-broken file is an error
//! (silently ignoring a typo'd engine registry would be worse).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::engine::EngineSettings;

pub const CONFIG_ENV: &str = "KIFU_STUDIO_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "kifu-studio.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// One registered engine binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEntry {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub listen_addr: String,
    pub db_path: PathBuf,
    pub engines: Vec<EngineEntry>,
    /// Engine settings used until the operator changes them.
    pub engine: EngineSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8712".to_string(),
            db_path: PathBuf::from("kifu-studio.db"),
            engines: Vec::new(),
            engine: EngineSettings::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Config, ConfigError> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Config::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            info!("no config at {:?}, using defaults", path);
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Engine id -> binary path lookup for the coordinator.
    pub fn engine_map(&self) -> HashMap<String, PathBuf> {
        self.engines
            .iter()
            .map(|entry| (entry.id.clone(), entry.path.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8712");
        assert!(config.engines.is_empty());
    }

    #[test]
    fn parses_engine_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "listenAddr": "127.0.0.1:9000",
                "dbPath": "/tmp/kifu.db",
                "engines": [{"id": "yaneuraou", "path": "/opt/engines/yaneuraou"}],
                "engine": {"engineId": "yaneuraou", "threads": 4, "hashMb": 1024, "multipv": 3}
            }"#,
        )
        .unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.engine.threads, 4);
        assert_eq!(
            config.engine_map().get("yaneuraou"),
            Some(&PathBuf::from("/opt/engines/yaneuraou"))
        );
    }

    #[test]
    fn broken_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
