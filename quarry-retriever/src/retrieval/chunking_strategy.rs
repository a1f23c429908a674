use anyhow::Result;
use quarry_context::{
    CODE_DELIMITERS, DEFAULT_MARKDOWN_DELIMITERS, TextChunk, TextChunker, get_delimiters_for_path,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for chunking extracted text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum size of each chunk in bytes, overlap included
    pub max_chunk_size: usize,
    /// Share of `max_chunk_size` repeated from the previous chunk
    pub overlap_fraction: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1000,
            overlap_fraction: 0.1,
        }
    }
}

impl ChunkingConfig {
    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn with_overlap_fraction(mut self, overlap_fraction: f32) -> Self {
        self.overlap_fraction = overlap_fraction;
        self
    }
}

/// Picks delimiters by file type and delegates to quarry-context.
///
/// Chunkers are compiled once per delimiter family rather than per file.
#[derive(Debug, Clone)]
pub struct ChunkingStrategy {
    config: ChunkingConfig,
    text: TextChunker,
    markdown: TextChunker,
    code: TextChunker,
}

impl ChunkingStrategy {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        let build = |delimiters: &[&str]| {
            TextChunker::with_overlap_fraction(
                delimiters,
                config.max_chunk_size,
                config.overlap_fraction,
            )
        };
        Ok(Self {
            text: build(quarry_context::DEFAULT_TEXT_DELIMITERS)?,
            markdown: build(DEFAULT_MARKDOWN_DELIMITERS)?,
            code: build(CODE_DELIMITERS)?,
            config,
        })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    fn chunker_for(&self, file_path: &Path) -> &TextChunker {
        let delimiters = get_delimiters_for_path(file_path);
        if delimiters == CODE_DELIMITERS {
            &self.code
        } else if delimiters == DEFAULT_MARKDOWN_DELIMITERS {
            &self.markdown
        } else {
            &self.text
        }
    }

    /// Chunk a file's extracted text. Whitespace-only text yields no chunks, so the
    /// file is indexed by name alone.
    pub fn chunk_content(&self, file_path: &Path, content: &str) -> Vec<TextChunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        let chunks = self.chunker_for(file_path).get_chunks(content);

        tracing::debug!(
            "Chunked {} into {} chunks (max size: {})",
            file_path.display(),
            chunks.len(),
            self.config.max_chunk_size
        );

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_strategy() {
        let strategy = ChunkingStrategy::new(ChunkingConfig::default().with_max_chunk_size(120))
            .unwrap();

        let rust_content = r#"
use std::collections::HashMap;

pub struct Ledger {
    entries: HashMap<String, i64>,
}

impl Ledger {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn post(&mut self, account: &str, amount: i64) {
        *self.entries.entry(account.to_string()).or_default() += amount;
    }
}
"#;

        let chunks = strategy.chunk_content(Path::new("ledger.rs"), rust_content);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 120);
        }

        let rebuilt: String = chunks.iter().map(|c| c.core_text()).collect();
        assert_eq!(rebuilt, rust_content);
    }

    #[test]
    fn test_blank_content_has_no_chunks() {
        let strategy = ChunkingStrategy::new(ChunkingConfig::default()).unwrap();
        assert!(strategy.chunk_content(Path::new("empty.txt"), "").is_empty());
        assert!(strategy.chunk_content(Path::new("blank.md"), " \n\t\n").is_empty());
    }

    #[test]
    fn test_invalid_overlap_is_rejected() {
        let config = ChunkingConfig::default().with_overlap_fraction(1.5);
        assert!(ChunkingStrategy::new(config).is_err());

        // Overlap leaves no room for content
        let config = ChunkingConfig::default()
            .with_max_chunk_size(4)
            .with_overlap_fraction(0.5);
        assert!(ChunkingStrategy::new(config).is_err());
    }

    #[test]
    fn test_markdown_respects_size_cap() {
        let strategy = ChunkingStrategy::new(ChunkingConfig::default().with_max_chunk_size(60))
            .unwrap();
        let doc = "# Intro\nSome opening words here.\n\n# Usage\nRun the tool with care.\n";

        let chunks = strategy.chunk_content(Path::new("guide.md"), doc);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.text.len() <= 60));
        let rebuilt: String = chunks.iter().map(|c| c.core_text()).collect();
        assert_eq!(rebuilt, doc);
    }
}
