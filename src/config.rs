use serde::{Deserialize, Serialize};
use std::{fmt, fs::read_to_string, path::Path};
use url::Url;

use crate::{error::SweepersError, retry::RetryPolicy};

/// Largest page the registry will serve from a single search/scroll request.
pub const MAX_PAGE_SIZE: usize = 10_000;

pub const ENV_ENDPOINT: &str = "PROV_ENDPOINT";
pub const ENV_CREDENTIALS: &str = "PROV_CREDENTIALS";
pub const ENV_DEV_MODE: &str = "DEV_MODE";

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_certs: bool,
    /// Index holding product documents.
    pub index: String,
    /// Index holding collection membership documents.
    pub refs_index: String,
    /// Cross-cluster search remotes whose copies of both indices are read alongside the local
    /// ones. Writes always target the local index.
    pub remotes: Vec<String>,
    pub page_size: usize,
    pub scroll_keepalive_minutes: u32,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            endpoint: "https://localhost:9200".to_string(),
            username: None,
            password: None,
            verify_certs: true,
            index: "registry".to_string(),
            refs_index: "registry-refs".to_string(),
            remotes: vec![],
            page_size: MAX_PAGE_SIZE,
            scroll_keepalive_minutes: 10,
            request_timeout_secs: 90,
        }
    }
}

// Keep the password out of logs.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("has_password", &self.password.is_some())
            .field("verify_certs", &self.verify_certs)
            .field("index", &self.index)
            .field("refs_index", &self.refs_index)
            .field("remotes", &self.remotes)
            .field("page_size", &self.page_size)
            .field("scroll_keepalive_minutes", &self.scroll_keepalive_minutes)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl StoreConfig {
    /// Page size clamped to the store maximum.
    pub fn effective_page_size(&self) -> usize {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn endpoint_url(&self) -> Result<Url, SweepersError> {
        Ok(Url::parse(&self.endpoint)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub batch_max_count: usize,
    pub batch_max_bytes: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            batch_max_count: 5_000,
            batch_max_bytes: 30 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Per-page read retries.
    pub read: RetryPolicy,
    /// Whole-batch resubmission after a transport failure.
    pub batch: RetryPolicy,
    /// Individual retries of items that failed inside a batch.
    pub item: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            read: RetryPolicy::default(),
            batch: RetryPolicy::new(4, 2_000, 2.0),
            item: RetryPolicy::new(3, 1_000, 2.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the bounded queue between the compute and write stages.
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            queue_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepersConfig {
    pub store: StoreConfig,
    pub writer: WriterConfig,
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
}

impl SweepersConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, SweepersError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_toml_path<P: AsRef<Path>>(path: P) -> Result<Self, SweepersError> {
        tracing::debug!("Reading config from: {:?}", path.as_ref());
        let content = read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Applies `PROV_ENDPOINT`, `PROV_CREDENTIALS` and `DEV_MODE` from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, SweepersError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Same as [Self::with_env_overrides] with an injectable lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, SweepersError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENV_ENDPOINT).filter(|s| !s.trim().is_empty()) {
            self.store.endpoint = endpoint.trim().to_string();
        }

        if let Some(credentials) = lookup(ENV_CREDENTIALS) {
            let parsed: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&credentials).map_err(|err| {
                    SweepersError::Config(format!(
                        "Failed to parse username/password from {ENV_CREDENTIALS}: {err}"
                    ))
                })?;
            let (username, password) = parsed.into_iter().next().ok_or_else(|| {
                SweepersError::Config(format!("{ENV_CREDENTIALS} contains no credentials"))
            })?;
            let password = password.as_str().map(str::to_string).ok_or_else(|| {
                SweepersError::Config(format!("{ENV_CREDENTIALS} password must be a string"))
            })?;
            self.store.username = Some(username);
            self.store.password = Some(password);
        }

        let dev_mode = lookup(ENV_DEV_MODE)
            .map(|v| !matches!(v.trim().to_lowercase().as_str(), "" | "0" | "false" | "none"))
            .unwrap_or(false);
        if dev_mode {
            tracing::warn!("Operating in development mode - host verification disabled");
            self.store.verify_certs = false;
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SweepersError> {
        let url = self.store.endpoint_url()?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SweepersError::Config(format!(
                "Unsupported endpoint scheme '{}'",
                url.scheme()
            )));
        }
        if let Some(remote) = self
            .store
            .remotes
            .iter()
            .find(|r| r.is_empty() || r.contains([':', ',', '/', ' ']))
        {
            return Err(SweepersError::Config(format!(
                "invalid cross-cluster remote name '{remote}'"
            )));
        }
        if self.store.page_size == 0 {
            return Err(SweepersError::Config("store.page_size must be > 0".into()));
        }
        if self.store.page_size > MAX_PAGE_SIZE {
            tracing::warn!(
                "store.page_size {} exceeds store maximum, clamping to {MAX_PAGE_SIZE}",
                self.store.page_size
            );
        }
        if self.writer.batch_max_count == 0 || self.writer.batch_max_bytes == 0 {
            return Err(SweepersError::Config(
                "writer batch thresholds must be > 0".into(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(SweepersError::Config(
                "pipeline.queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}
