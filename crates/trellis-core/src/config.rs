//! Run configuration: strategy selection, incremental flags, and store
//! write policy. Loadable from TOML; validated before any graph mutation.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{TrellisError, TrellisResult};
use crate::store::database::WritePolicy;
use crate::query::guards::{
    clamp_batch, clamp_workers, MAX_RETRY_BACKOFF_MS, MAX_SHARD_COUNT, MAX_WRITE_RETRIES,
};

/// Interchangeable resolution strategies. All produce identical outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategyKind {
    #[default]
    Join,
    Hashmap,
    Sharded,
}

impl ResolutionStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategyKind::Join => "join",
            ResolutionStrategyKind::Hashmap => "hashmap",
            ResolutionStrategyKind::Sharded => "sharded",
        }
    }
}

impl fmt::Display for ResolutionStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategyKind {
    type Err = TrellisError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "join" => Ok(ResolutionStrategyKind::Join),
            "hashmap" => Ok(ResolutionStrategyKind::Hashmap),
            "sharded" => Ok(ResolutionStrategyKind::Sharded),
            other => Err(TrellisError::Config(format!(
                "unknown resolution strategy '{other}' (expected join, hashmap, or sharded)"
            ))),
        }
    }
}

/// Precedence between an import alias and a local binding with the same
/// name at one mention site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasPrecedence {
    #[default]
    LocalFirst,
    AliasFirst,
}

fn default_shard_count() -> i64 {
    4
}

fn default_workers() -> i64 {
    4
}

fn default_write_retry_attempts() -> i64 {
    5
}

fn default_write_retry_backoff_ms() -> i64 {
    10
}

fn default_busy_timeout_ms() -> i64 {
    5000
}

fn default_resolution_batch_size() -> i64 {
    1024
}

/// Options recognized by an indexing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    #[serde(deserialize_with = "deserialize_strategy")]
    pub resolution_strategy: ResolutionStrategyKind,
    /// Discard incremental state and reprocess every known file.
    pub full_reindex: bool,
    /// Resolve after each file merge instead of after the whole change set.
    pub immediate_resolution: bool,
    /// Shard workers for the sharded strategy.
    pub shard_count: i64,
    /// Extraction / merge pool size.
    pub workers: i64,
    pub alias_precedence: AliasPrecedence,
    pub write_retry_attempts: i64,
    pub write_retry_backoff_ms: i64,
    pub busy_timeout_ms: i64,
    pub resolution_batch_size: i64,
    /// Optional deadline for the whole run.
    pub timeout_ms: Option<u64>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            resolution_strategy: ResolutionStrategyKind::default(),
            full_reindex: false,
            immediate_resolution: false,
            shard_count: default_shard_count(),
            workers: default_workers(),
            alias_precedence: AliasPrecedence::default(),
            write_retry_attempts: default_write_retry_attempts(),
            write_retry_backoff_ms: default_write_retry_backoff_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            resolution_batch_size: default_resolution_batch_size(),
            timeout_ms: None,
        }
    }
}

/// Parse strategy names through `FromStr` so an unknown value surfaces as a
/// configuration error naming the accepted values.
fn deserialize_strategy<'de, D>(deserializer: D) -> Result<ResolutionStrategyKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl IndexConfig {
    pub fn from_toml_str(text: &str) -> TrellisResult<Self> {
        let config: IndexConfig =
            toml::from_str(text).map_err(|e| TrellisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> TrellisResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject invalid settings. Out-of-range pool and batch sizes are
    /// clamped later instead of rejected.
    pub fn validate(&self) -> TrellisResult<()> {
        if self.resolution_strategy == ResolutionStrategyKind::Sharded
            && !(1..=MAX_SHARD_COUNT).contains(&self.shard_count)
        {
            return Err(TrellisError::Config(format!(
                "shard_count must be between 1 and {MAX_SHARD_COUNT}, got {}",
                self.shard_count
            )));
        }
        if self.shard_count < 1 {
            return Err(TrellisError::Config(format!(
                "shard_count must be positive, got {}",
                self.shard_count
            )));
        }
        if !(1..=MAX_WRITE_RETRIES).contains(&self.write_retry_attempts) {
            return Err(TrellisError::Config(format!(
                "write_retry_attempts must be between 1 and {MAX_WRITE_RETRIES}, got {}",
                self.write_retry_attempts
            )));
        }
        if !(0..=MAX_RETRY_BACKOFF_MS).contains(&self.write_retry_backoff_ms) {
            return Err(TrellisError::Config(format!(
                "write_retry_backoff_ms must be between 0 and {MAX_RETRY_BACKOFF_MS}, got {}",
                self.write_retry_backoff_ms
            )));
        }
        if self.busy_timeout_ms < 0 {
            return Err(TrellisError::Config(format!(
                "busy_timeout_ms must not be negative, got {}",
                self.busy_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn effective_workers(&self) -> usize {
        clamp_workers(self.workers)
    }

    pub fn effective_batch_size(&self) -> usize {
        clamp_batch(self.resolution_batch_size)
    }

    pub fn effective_shard_count(&self) -> usize {
        self.shard_count.clamp(1, MAX_SHARD_COUNT) as usize
    }

    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            attempts: self.write_retry_attempts.clamp(1, MAX_WRITE_RETRIES) as u32,
            backoff_ms: self.write_retry_backoff_ms.clamp(0, MAX_RETRY_BACKOFF_MS) as u64,
            busy_timeout_ms: self.busy_timeout_ms.max(0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IndexConfig::default();
        assert_eq!(config.resolution_strategy, ResolutionStrategyKind::Join);
        assert!(!config.full_reindex);
        assert!(!config.immediate_resolution);
        assert_eq!(config.alias_precedence, AliasPrecedence::LocalFirst);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml() {
        let config = IndexConfig::from_toml_str(
            "resolution_strategy = \"sharded\"\nshard_count = 8\nimmediate_resolution = true\n",
        )
        .unwrap();
        assert_eq!(config.resolution_strategy, ResolutionStrategyKind::Sharded);
        assert_eq!(config.effective_shard_count(), 8);
        assert!(config.immediate_resolution);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_unknown_strategy_is_config_error() {
        let err = IndexConfig::from_toml_str("resolution_strategy = \"graphdb\"").unwrap_err();
        assert!(matches!(err, TrellisError::Config(_)));
        assert!(err.to_string().contains("graphdb"));
    }

    #[test]
    fn test_invalid_shard_count_rejected() {
        let config = IndexConfig {
            resolution_strategy: ResolutionStrategyKind::Sharded,
            shard_count: 0,
            ..IndexConfig::default()
        };
        assert!(matches!(config.validate(), Err(TrellisError::Config(_))));
        let config = IndexConfig {
            resolution_strategy: ResolutionStrategyKind::Sharded,
            shard_count: MAX_SHARD_COUNT + 1,
            ..IndexConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(IndexConfig::from_toml_str("strategy = \"join\"").is_err());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "HashMap".parse::<ResolutionStrategyKind>().unwrap(),
            ResolutionStrategyKind::Hashmap
        );
    }
}
