use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `hub.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Database file. One file per database instance.
    #[serde(default = "default_storage_path")]
    pub path: String,
    /// Page cache handed to the embedded engine, in bytes.
    #[serde(default = "default_cache_bytes")]
    pub memory_cache_bytes: usize,
    /// Commit the open write batch once this many dirty bytes accumulate.
    #[serde(default = "default_buffer_bytes")]
    pub auto_commit_buffer_bytes: u64,
    /// Commit the open write batch after this many seconds regardless of size.
    #[serde(default = "default_commit_period")]
    pub auto_commit_period_secs: u64,
    /// Compress stored values above a small threshold.
    #[serde(default)]
    pub compression: bool,
    /// Reject all mutations with 405.
    #[serde(default)]
    pub read_only: bool,
    /// Registration key distinguishing databases that share a deployment.
    #[serde(default)]
    pub database_num: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            memory_cache_bytes: default_cache_bytes(),
            auto_commit_buffer_bytes: default_buffer_bytes(),
            auto_commit_period_secs: default_commit_period(),
            compression: false,
            read_only: false,
            database_num: 0,
        }
    }
}

fn default_storage_path() -> String {
    "./sensorhub.db".to_string()
}

fn default_cache_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_buffer_bytes() -> u64 {
    1024 * 1024
}

fn default_commit_period() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            path_prefix: default_path_prefix(),
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_path_prefix() -> String {
    "/api/v1".to_string()
}

impl HubConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
