use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory holding the daily sample partitions.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Management database url. Defaults to `hostwatch.db` inside `data_dir`.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Cluster id stamped on rules created from seed documents.
    #[serde(default = "Uuid::nil")]
    pub cluster_id: Uuid,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_concurrent_hosts")]
    pub max_concurrent_hosts: usize,
    /// Upper bound on the sample history fetched for one rule.
    #[serde(default = "default_max_lookback_secs")]
    pub max_lookback_secs: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_concurrent_hosts: default_max_concurrent_hosts(),
            max_lookback_secs: default_max_lookback_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub json: bool,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_interval_secs() -> u64 {
    10
}

fn default_max_concurrent_hosts() -> usize {
    16
}

fn default_max_lookback_secs() -> u64 {
    3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_url: None,
            retention_days: default_retention_days(),
            cluster_id: Uuid::nil(),
            evaluation: EvaluationConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{path}': {e}"))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.evaluation.interval_secs == 0 {
            anyhow::bail!("evaluation.interval_secs must be greater than zero");
        }
        if self.evaluation.max_concurrent_hosts == 0 {
            anyhow::bail!("evaluation.max_concurrent_hosts must be greater than zero");
        }
        Ok(())
    }

    pub fn connection_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => {
                let path = PathBuf::from(&self.data_dir).join("hostwatch.db");
                format!("sqlite://{}?mode=rwc", path.display())
            }
        }
    }

    /// The url with any password replaced, for logging.
    pub fn redacted_url(&self) -> String {
        let url = self.connection_url();
        let Some((scheme, rest)) = url.split_once("://") else {
            return url;
        };
        match rest.split_once('@') {
            Some((credentials, host)) => {
                let user = credentials.split(':').next().unwrap_or_default();
                format!("{scheme}://{user}:***@{host}")
            }
            None => url,
        }
    }
}
