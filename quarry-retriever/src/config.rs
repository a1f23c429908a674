//! Engine configuration.
//!
//! Everything has a default, so an empty TOML document is a valid configuration:
//!
//! ```toml
//! [storage]
//! data_dir = "/var/lib/quarry"
//!
//! [pipeline]
//! workers = 8
//!
//! [search]
//! rrf_k = 40
//! ```

use anyhow::{Context, Result};
use quarry_embed::{GatewayConfig, HttpBackendConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::IndexError;
use crate::retrieval::chunking_strategy::ChunkingConfig;
use crate::retrieval::hybrid_search::SearchConfig;
use crate::retrieval::indexing_pipeline::PipelineConfig;
use crate::retrieval::sync_engine::SyncConfig;
use crate::telemetry::LoggingConfig;

/// Names of the two database files inside `data_dir`
pub const METADATA_DB: &str = "quarry.db";
pub const VECTOR_DB: &str = "vectors.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Keep both stores in memory; nothing survives the process
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".quarry"),
            in_memory: false,
        }
    }
}

impl StorageConfig {
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join(METADATA_DB)
    }

    pub fn vector_path(&self) -> PathBuf {
        self.data_dir.join(VECTOR_DB)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Larger files are recorded but not read
    pub max_file_size: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub reader: ReaderConfig,
    pub chunking: ChunkingConfig,
    pub embedding: GatewayConfig,
    pub backend: HttpBackendConfig,
    pub pipeline: PipelineConfig,
    pub sync: SyncConfig,
    pub search: SearchConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Defaults with stores under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.into(),
                in_memory: false,
            },
            ..Self::default()
        }
    }

    /// Defaults with both stores in memory.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig {
                in_memory: true,
                ..StorageConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_embedding(mut self, embedding: GatewayConfig) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_search(mut self, search: SearchConfig) -> Self {
        self.search = search;
        self
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.chunking.max_chunk_size == 0 {
            return Err(IndexError::invalid_config(
                "chunking.max_chunk_size must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.chunking.overlap_fraction) {
            return Err(IndexError::invalid_config(
                "chunking.overlap_fraction must be in [0, 1)",
            ));
        }
        if self.reader.max_file_size == 0 {
            return Err(IndexError::invalid_config(
                "reader.max_file_size must be positive",
            ));
        }
        if self.sync.scan_concurrency == 0 {
            return Err(IndexError::invalid_config(
                "sync.scan_concurrency must be at least 1",
            ));
        }
        if self.backend.dimension == 0 {
            return Err(IndexError::invalid_config("backend.dimension must be positive"));
        }
        self.embedding.validate()?;
        self.pipeline.validate()?;
        self.search.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_all_defaults() -> Result<()> {
        let config = EngineConfig::from_toml_str("")?;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.search.rrf_k, 60);
        assert_eq!(config.sync.debounce_ms, 500);
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.storage.metadata_path(), Path::new(".quarry/quarry.db"));
        Ok(())
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() -> Result<()> {
        let config = EngineConfig::from_toml_str(
            r#"
            [storage]
            data_dir = "/tmp/quarry-test"

            [search]
            rrf_k = 10
            single_list_fallback = false

            [pipeline]
            partial_policy = "require_complete"
            "#,
        )?;
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/quarry-test"));
        assert_eq!(config.search.rrf_k, 10);
        assert!(!config.search.single_list_fallback);
        assert_eq!(config.search.vector_weight, 1.0);
        assert_eq!(
            config.pipeline.partial_policy,
            crate::retrieval::indexing_pipeline::PartialIndexPolicy::RequireComplete
        );
        Ok(())
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(EngineConfig::from_toml_str("[search]\nrrf_k = 0").is_err());
        assert!(EngineConfig::from_toml_str("[pipeline]\nworkers = 0").is_err());
        assert!(EngineConfig::from_toml_str("[chunking]\noverlap_fraction = 1.0").is_err());
        assert!(EngineConfig::from_toml_str("[search]\nkeyword_weight = 2.0").is_err());
        assert!(EngineConfig::from_toml_str("not toml at all [").is_err());
    }

    #[test]
    fn test_load_reports_the_path() {
        let err = EngineConfig::load(Path::new("/no/such/quarry.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/no/such/quarry.toml"));
    }
}
