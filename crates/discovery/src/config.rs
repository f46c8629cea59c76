use crate::error::{DiscoveryError, Result};
use ingest_text_chunker::ChunkingConfig;
use serde::{Deserialize, Serialize};

/// Upper bound for any per-step batch size taken from the environment.
const MAX_STEP_ITEMS: usize = 1_000;

/// Batch size used by the synchronous driver; effectively "everything at once".
const SYNC_STEP_ITEMS: usize = 1_000_000;

pub const STEP_FILES_ENV: &str = "INGEST_STEP_FILES";
pub const STEP_CHUNKS_ENV: &str = "INGEST_STEP_CHUNKS";
pub const STEP_DIRECTORIES_ENV: &str = "INGEST_STEP_DIRECTORIES";

/// Maximum number of items a single discovery step may touch, per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepLimits {
    pub files: usize,
    pub chunks: usize,
    pub directories: usize,
}

impl Default for StepLimits {
    fn default() -> Self {
        Self {
            files: 100,
            chunks: 200,
            directories: 100,
        }
    }
}

impl StepLimits {
    pub const fn unbounded() -> Self {
        Self {
            files: SYNC_STEP_ITEMS,
            chunks: SYNC_STEP_ITEMS,
            directories: SYNC_STEP_ITEMS,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.files == 0 || self.chunks == 0 || self.directories == 0 {
            return Err(DiscoveryError::InvalidConfig(format!(
                "step limits must be positive (files={}, chunks={}, directories={})",
                self.files, self.chunks, self.directories
            )));
        }
        Ok(())
    }

    /// Apply `INGEST_STEP_FILES` / `INGEST_STEP_CHUNKS` / `INGEST_STEP_DIRECTORIES`.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            files: parse_step_limit(lookup(STEP_FILES_ENV).as_deref(), self.files),
            chunks: parse_step_limit(lookup(STEP_CHUNKS_ENV).as_deref(), self.chunks),
            directories: parse_step_limit(
                lookup(STEP_DIRECTORIES_ENV).as_deref(),
                self.directories,
            ),
        }
    }
}

fn parse_step_limit(raw: Option<&str>, default_value: usize) -> usize {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse::<usize>()
            .unwrap_or(default_value)
            .clamp(1, MAX_STEP_ITEMS),
        None => default_value,
    }
}

fn default_text_extensions() -> Vec<String> {
    ["md", "txt", "json", "xml", "csv", "html", "htm"]
        .iter()
        .map(|ext| (*ext).to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub chunking: ChunkingConfig,

    /// Lowercase extensions (without the dot) treated as text
    pub text_extensions: Vec<String>,

    /// Per-step limits when driven one step per scheduled trigger
    pub async_limits: StepLimits,

    /// Per-step limits of the synchronous driver
    pub sync_limits: StepLimits,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            text_extensions: default_text_extensions(),
            async_limits: StepLimits::default(),
            sync_limits: StepLimits::unbounded(),
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        self.async_limits.validate()?;
        self.sync_limits.validate()?;
        if self.text_extensions.is_empty() {
            return Err(DiscoveryError::InvalidConfig(
                "text_extensions must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_text_extension(&self, extension: &str) -> bool {
        self.text_extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_outbound_ceiling() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.async_limits.files, 100);
        assert_eq!(config.async_limits.chunks, 200);
        assert_eq!(config.async_limits.directories, 100);
        assert!(config.is_text_extension("MD"));
        assert!(!config.is_text_extension("pdf"));
        config.validate().unwrap();
    }

    #[test]
    fn parse_step_limit_defaults_and_clamps() {
        assert_eq!(parse_step_limit(None, 100), 100);
        assert_eq!(parse_step_limit(Some(""), 100), 100);
        assert_eq!(parse_step_limit(Some("   "), 100), 100);
        assert_eq!(parse_step_limit(Some("nope"), 100), 100);
        assert_eq!(parse_step_limit(Some("0"), 100), 1);
        assert_eq!(parse_step_limit(Some("25"), 100), 25);
        assert_eq!(parse_step_limit(Some(" 7 "), 100), 7);
        assert_eq!(parse_step_limit(Some("999999"), 100), MAX_STEP_ITEMS);
    }

    #[test]
    fn overrides_apply_per_field() {
        let env: HashMap<&str, &str> = HashMap::from([(STEP_CHUNKS_ENV, "50")]);
        let limits =
            StepLimits::default().with_overrides(|key| env.get(key).map(|v| (*v).to_string()));
        assert_eq!(
            limits,
            StepLimits {
                files: 100,
                chunks: 50,
                directories: 100
            }
        );
    }

    #[test]
    fn zero_limits_are_rejected() {
        let limits = StepLimits {
            files: 0,
            ..StepLimits::default()
        };
        assert!(limits.validate().is_err());
    }
}
