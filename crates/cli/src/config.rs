use anyhow::{Context, Result};
use ingest_coordinator::CoordinatorConfig;
use ingest_discovery::DiscoveryConfig;
use ingest_store::RetryPolicy;
use ingest_text_chunker::ChunkingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything the CLI can tune, loaded from an optional TOML file.
///
/// ```toml
/// [chunking]
/// min_chunk_size = 2000
///
/// [discovery.async_limits]
/// files = 50
///
/// [coordinator]
/// sync_max_files = 20
/// ```
///
/// `[chunking]` is authoritative: it replaces `discovery.chunking` on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub chunking: ChunkingConfig,
    pub discovery: DiscoveryConfig,
    pub entity_retry: RetryPolicy,
    pub coordinator: CoordinatorConfig,
}

impl IngestConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(config.normalized().with_env_overrides())
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        self.discovery.chunking = self.chunking.clone();
        self
    }

    /// Step sizes from `INGEST_STEP_*` apply to scheduled steps only.
    pub fn with_env_overrides(mut self) -> Self {
        self.discovery.async_limits = self.discovery.async_limits.with_env_overrides();
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()?;
        self.entity_retry
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [entity_retry]")?;
        self.coordinator
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [coordinator]")?;
        Ok(())
    }
}
