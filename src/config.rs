//! Configuration for clinannot
//!
//! TOML file (path from `CLINANNOT_CONFIG`, default `clinannot.toml`)
//! with environment-variable overrides. Every field has a usable default
//! so the service starts with no configuration at all.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::services::consensus::ThirdOpinionPolicy;

fn default_listen_addr() -> String {
    "127.0.0.1:5810".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Root directory for image blobs (and the database, by default)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite database path; defaults to `<data_dir>/clinannot.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Rule applied to a third opinion on an already-paired image
    #[serde(default)]
    pub third_opinion_policy: ThirdOpinionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
            database_path: None,
            third_opinion_policy: ThirdOpinionPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration: TOML file if present, then environment
    /// overrides (`CLINANNOT_LISTEN_ADDR`, `CLINANNOT_DATA_DIR`,
    /// `CLINANNOT_THIRD_OPINION_POLICY`).
    pub fn load() -> Result<Self> {
        let path = std::env::var("CLINANNOT_CONFIG").unwrap_or_else(|_| "clinannot.toml".to_string());
        let mut config = Self::from_file(Path::new(&path))?;

        if let Ok(addr) = std::env::var("CLINANNOT_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(dir) = std::env::var("CLINANNOT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(policy) = std::env::var("CLINANNOT_THIRD_OPINION_POLICY") {
            config.third_opinion_policy = parse_policy(&policy)?;
        }

        Ok(config)
    }

    /// Read a TOML config file, falling back to defaults when absent.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Effective database path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("clinannot.db"))
    }
}

fn parse_policy(value: &str) -> Result<ThirdOpinionPolicy> {
    match value.trim() {
        "allow_on_disagreement" => Ok(ThirdOpinionPolicy::AllowOnDisagreement),
        "reject_always" => Ok(ThirdOpinionPolicy::RejectAlways),
        other => Err(Error::Config(format!(
            "unknown third_opinion_policy {:?} (expected allow_on_disagreement or reject_always)",
            other
        ))),
    }
}
