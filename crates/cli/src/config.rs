//! Runtime configuration.
//!
//! Loaded from a TOML file whose sections mirror the components they
//! configure. Every field is optional; omitted fields take the defaults the
//! components themselves use. Secrets never live in the file: the analysis
//! service key is read from `XAI_API_KEY` (or `GROK_KEY`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pipeline::{AdmissionConfig, InsightsError};
use processor::{AnalysisConfig, BatchConfig, EgressConfig};
use serde::Deserialize;
use thiserror::Error;

/// Looked for in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "insights.toml";

/// Environment variables consulted for the analysis service key, in order.
pub const API_KEY_VARS: [&str; 2] = ["XAI_API_KEY", "GROK_KEY"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] InsightsError),

    #[error("no analysis service key: set {} or {}", API_KEY_VARS[0], API_KEY_VARS[1])]
    MissingApiKey,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub admission: AdmissionSection,
    pub egress: EgressSection,
    pub analysis: AnalysisSection,
    pub batch: BatchSection,
    pub store: StoreSection,
    pub server: ServerSection,
    pub provider: ProviderSection,
}

/// `[admission]`: inbound rate limit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionSection {
    pub capacity: usize,
    pub window_ms: u64,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            capacity: 100,
            window_ms: 1_000,
        }
    }
}

/// `[egress]`: outbound concurrency and rate limit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EgressSection {
    pub concurrency: usize,
    pub capacity: usize,
    pub window_ms: u64,
}

impl Default for EgressSection {
    fn default() -> Self {
        Self {
            concurrency: 10,
            capacity: 10,
            window_ms: 1_000,
        }
    }
}

/// `[analysis]`: retry and call limits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisSection {
    pub max_attempts: u32,
    pub backoff_base: f64,
    pub max_backoff_secs: u64,
    pub call_timeout_secs: u64,
    pub temperature: f32,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
            max_backoff_secs: 60,
            call_timeout_secs: 30,
            temperature: 0.3,
        }
    }
}

/// `[batch]`: orchestration loop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSection {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub busy_delay_ms: u64,
    pub shutdown_grace_secs: u64,
    /// Period and threshold of the stale-claim sweep. `0` disables the
    /// periodic sweep; the startup requeue always runs.
    pub stale_after_secs: u64,
    pub complete_unreachable: bool,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval_ms: 5_000,
            busy_delay_ms: 1_000,
            shutdown_grace_secs: 10,
            stale_after_secs: 600,
            complete_unreachable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    /// Nothing survives a restart.
    Memory,
}

/// `[store]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from("insights.db"),
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

/// `[provider]`: analysis service endpoint. The key comes from the
/// environment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSection {
    pub base_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: llm::DEFAULT_BASE_URL.to_string(),
            model: llm::DEFAULT_MODEL.to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl AppConfig {
    /// Reads `path`, or [`DEFAULT_CONFIG_FILE`] when it exists, or falls
    /// back to defaults. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);
        let path = match path {
            Some(p) => Some(p),
            None if default_path.is_file() => Some(default_path),
            None => None,
        };
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), InsightsError> {
        let invalid = |message: &str| {
            Err(InsightsError::ConfigurationError {
                message: message.to_string(),
            })
        };
        if self.admission.capacity == 0 || self.admission.window_ms == 0 {
            return invalid("admission capacity and window_ms must be non-zero");
        }
        if self.egress.concurrency == 0 {
            return invalid("egress concurrency must be at least 1");
        }
        if self.egress.capacity == 0 || self.egress.window_ms == 0 {
            return invalid("egress capacity and window_ms must be non-zero");
        }
        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(InsightsError::ConfigurationError {
                message: format!("server bind {:?} is not host:port", self.server.bind),
            });
        }
        if self.provider.base_url.trim().is_empty() || self.provider.model.trim().is_empty() {
            return invalid("provider base_url and model must be set");
        }
        self.analysis().validate()?;
        self.batch().validate()
    }

    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            capacity: self.admission.capacity,
            window: Duration::from_millis(self.admission.window_ms),
        }
    }

    pub fn egress(&self) -> EgressConfig {
        EgressConfig {
            concurrency: self.egress.concurrency,
            capacity: self.egress.capacity,
            window: Duration::from_millis(self.egress.window_ms),
        }
    }

    pub fn analysis(&self) -> AnalysisConfig {
        let a = &self.analysis;
        AnalysisConfig {
            max_attempts: a.max_attempts,
            backoff_base: a.backoff_base,
            max_backoff: Duration::from_secs(a.max_backoff_secs),
            call_timeout: Duration::from_secs(a.call_timeout_secs),
            temperature: a.temperature,
        }
    }

    pub fn batch(&self) -> BatchConfig {
        let b = &self.batch;
        BatchConfig {
            batch_size: b.batch_size,
            poll_interval: Duration::from_millis(b.poll_interval_ms),
            busy_delay: Duration::from_millis(b.busy_delay_ms),
            shutdown_grace: Duration::from_secs(b.shutdown_grace_secs),
            stale_after: (b.stale_after_secs > 0).then(|| Duration::from_secs(b.stale_after_secs)),
            complete_unreachable: b.complete_unreachable,
        }
    }

    pub fn provider(&self, api_key: String) -> llm::ProviderConfig {
        llm::ProviderConfig {
            base_url: self.provider.base_url.clone(),
            model: self.provider.model.clone(),
            api_key,
            request_timeout: Duration::from_secs(self.provider.request_timeout_secs),
        }
    }
}

/// First non-blank value among [`API_KEY_VARS`].
pub fn api_key_from_env() -> Result<String, ConfigError> {
    resolve_api_key(|name| std::env::var(name).ok())
}

fn resolve_api_key(lookup: impl Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    API_KEY_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .ok_or(ConfigError::MissingApiKey)
}
