pub mod text;

// Re-export the main chunking entry points for external use
pub use text::{
    CODE_DELIMITERS, ChunkError, DEFAULT_MARKDOWN_DELIMITERS, DEFAULT_TEXT_DELIMITERS,
    MIN_CORE_LENGTH, TextChunk, TextChunker, chunk, chunker_for_path, get_delimiters_for_path,
};
