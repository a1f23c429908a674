//! Splits extracted file text into bounded, overlap-aware chunks with stable offsets.
//!
//! The chunker is a pure function of its input and parameters: running it twice over the
//! same text yields byte-identical boundaries and hashes, which lets the indexer detect
//! "nothing changed" cheaply by comparing chunk hashes.
//!
//! # Chunk geometry
//!
//! Every chunk owns a *core* byte range `start..end`. Core ranges are contiguous,
//! non-overlapping and strictly increasing, and together they cover the whole input.
//! Chunks after the first additionally carry up to `overlap` bytes of the preceding text
//! (`overlap_start..start`) so that context at a boundary is not lost when the chunk is
//! embedded on its own. The stored `text` is therefore `source[overlap_start..end]`, and
//! its length never exceeds `max_chunk_length`.
//!
//! ```text
//!   source:  |----------- core 0 -----------|--------- core 1 ---------|-- core 2 --|
//!   chunk 1:                       |overlap|--------- core 1 ---------|
//!   chunk 2:                                                |overlap|-- core 2 --|
//! ```
//!
//! # Splitting strategy
//!
//! The text is split recursively on an ordered list of delimiter patterns, most
//! significant first (paragraph breaks, then sentence ends, then line breaks, then
//! whitespace). A piece only descends to the next delimiter when it is still larger than
//! the core budget. Text with no usable breaks at all (dense OCR output, a single huge
//! token) falls back to fixed windows cut on UTF-8 character boundaries. The resulting
//! segments are then packed greedily into cores of at most `max_chunk_length - overlap`
//! bytes.
//!
//! Empty input produces exactly one empty chunk rather than an error.
//!
//! # Usage
//!
//! ```
//! use quarry_context::text::{TextChunker, DEFAULT_TEXT_DELIMITERS};
//!
//! let chunker = TextChunker::new(DEFAULT_TEXT_DELIMITERS, 64, 8).unwrap();
//! let text = "First sentence is short. Second sentence is a little longer. Third one.";
//! let chunks = chunker.get_chunks(text);
//!
//! assert!(chunks.iter().all(|c| c.text.len() <= 64));
//! let rebuilt: String = chunks.iter().map(|c| c.core_text()).collect();
//! assert_eq!(rebuilt, text);
//! ```
use regex::Regex;
use serde::Serialize;
use std::ops::Range;
use std::path::Path;

/// Smallest core budget the chunker accepts. Four bytes always fit one UTF-8 character,
/// so the fixed-window fallback can make progress.
pub const MIN_CORE_LENGTH: usize = 4;

/// Generic delimiters for prose and extracted document text.
///
/// - `\n\s*\n`: paragraph breaks (blank lines)
/// - sentence ends: `.`, `!` or `?`, optional closing quote/bracket, then whitespace
/// - `\n`: line breaks
/// - `[ \t]+`: runs of spaces and tabs
pub const DEFAULT_TEXT_DELIMITERS: &[&str] = &[
    r"\n\s*\n",
    r#"[.!?]["')\]]*\s+"#,
    r"\n",
    r"[ \t]+",
];

/// Delimiters for Markdown, ordered from most to least significant.
pub const DEFAULT_MARKDOWN_DELIMITERS: &[&str] = &[
    r"(?m)^#{1,6}[ \t]+.*$", // Headings
    r"```",                  // Code block fences
    r"\n\s*\n",              // Paragraphs
    r"(?m)^[ \t]*[-*+][ \t]+", // Unordered list items
    r"(?m)^[ \t]*\d+\.[ \t]+", // Ordered list items
    r#"[.!?]["')\]]*\s+"#,   // Sentence ends
    r"\n",                   // Line breaks
    r"[ \t]+",               // Spaces
];

/// Delimiters for source code
pub const CODE_DELIMITERS: &[&str] = &[
    r"(?m)^(pub\s+)?(struct|enum|trait|impl|fn|class|def|function|interface)\s+\w+", // Declarations
    r"(?m)^(import|use|from|#include)\s+", // Import statements
    r"\n\s*\n",                            // Paragraph breaks
    r"\n",                                 // Line breaks
    r"[ \t]+",                             // Spaces
];

/// Errors raised when a chunker is configured with unusable parameters.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("invalid delimiter pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error(
        "max chunk length {max_chunk_length} leaves no room for content after an overlap of {overlap}"
    )]
    InvalidSize {
        max_chunk_length: usize,
        overlap: usize,
    },

    #[error("overlap fraction must be within [0, 1), got {0}")]
    InvalidOverlapFraction(f32),
}

/// Pick delimiters suited to the file type.
///
/// Markdown and README-style files split on headings and list items, recognised source
/// files split on declarations, and everything else (plain text, extracted PDF or image
/// text) uses [`DEFAULT_TEXT_DELIMITERS`].
pub fn get_delimiters_for_path(path: &Path) -> &'static [&'static str] {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("md") | Some("markdown") => DEFAULT_MARKDOWN_DELIMITERS,
        Some("rs") | Some("py") | Some("js") | Some("ts") | Some("jsx") | Some("tsx")
        | Some("go") | Some("java") | Some("c") | Some("cpp") | Some("h") | Some("hpp") => {
            CODE_DELIMITERS
        }
        _ => {
            if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
                if filename.starts_with("README") || filename.starts_with("CHANGELOG") {
                    return DEFAULT_MARKDOWN_DELIMITERS;
                }
            }
            DEFAULT_TEXT_DELIMITERS
        }
    }
}

/// Build a chunker for `path` whose overlap is `overlap_fraction` of `max_chunk_length`.
pub fn chunker_for_path(
    path: &Path,
    max_chunk_length: usize,
    overlap_fraction: f32,
) -> Result<TextChunker, ChunkError> {
    TextChunker::with_overlap_fraction(
        get_delimiters_for_path(path),
        max_chunk_length,
        overlap_fraction,
    )
}

/// Chunk `text` with the generic delimiters.
///
/// This is the plain `chunk(text, maxChunkSize, overlap)` contract: an ordered list of
/// chunks with `(start, end, text)` offsets into `text`.
pub fn chunk(
    text: &str,
    max_chunk_length: usize,
    overlap: usize,
) -> Result<Vec<TextChunk>, ChunkError> {
    Ok(TextChunker::new(DEFAULT_TEXT_DELIMITERS, max_chunk_length, overlap)?.get_chunks(text))
}

/// Splits text into [`TextChunk`]s using a fixed set of delimiters and size limits.
#[derive(Debug, Clone)]
pub struct TextChunker {
    delimiters: Vec<Regex>,
    max_chunk_length: usize,
    overlap: usize,
}

/// One bounded span of the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    /// Position of this chunk within the file (0-indexed, gap-free).
    pub sequence: usize,
    /// Byte offset where this chunk's own content begins.
    pub start: usize,
    /// Byte offset one past the end of this chunk's content.
    pub end: usize,
    /// Byte offset where the leading overlap begins; equal to `start` for the first chunk.
    pub overlap_start: usize,
    /// `source[overlap_start..end]`
    pub text: String,
    /// Hex blake3 digest of `text`.
    pub hash: String,
}

impl TextChunk {
    fn new(sequence: usize, core: Range<usize>, overlap_start: usize, source: &str) -> Self {
        let text = source[overlap_start..core.end].to_string();
        let hash = blake3::hash(text.as_bytes()).to_hex().to_string();
        Self {
            sequence,
            start: core.start,
            end: core.end,
            overlap_start,
            text,
            hash,
        }
    }

    /// The chunk text without the leading overlap.
    pub fn core_text(&self) -> &str {
        &self.text[self.overlap_len()..]
    }

    /// Number of overlap bytes carried over from the previous chunk.
    pub fn overlap_len(&self) -> usize {
        self.start - self.overlap_start
    }

    pub fn byte_range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl TextChunker {
    /// Create a chunker from delimiter regexes, a hard size cap, and an overlap in bytes.
    ///
    /// `max_chunk_length` bounds the full chunk text, overlap included, so the content
    /// budget per chunk is `max_chunk_length - overlap`. That budget must be at least
    /// [`MIN_CORE_LENGTH`].
    pub fn new(
        delimiter_patterns: &[&str],
        max_chunk_length: usize,
        overlap: usize,
    ) -> Result<Self, ChunkError> {
        if max_chunk_length < overlap.saturating_add(MIN_CORE_LENGTH) {
            return Err(ChunkError::InvalidSize {
                max_chunk_length,
                overlap,
            });
        }

        let delimiters = delimiter_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            delimiters,
            max_chunk_length,
            overlap,
        })
    }

    /// Same as [`TextChunker::new`], with the overlap given as a fraction of the cap.
    pub fn with_overlap_fraction(
        delimiter_patterns: &[&str],
        max_chunk_length: usize,
        overlap_fraction: f32,
    ) -> Result<Self, ChunkError> {
        if !(0.0..1.0).contains(&overlap_fraction) {
            return Err(ChunkError::InvalidOverlapFraction(overlap_fraction));
        }
        let overlap = (max_chunk_length as f64 * f64::from(overlap_fraction)).floor() as usize;
        Self::new(delimiter_patterns, max_chunk_length, overlap)
    }

    pub fn max_chunk_length(&self) -> usize {
        self.max_chunk_length
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    fn core_budget(&self) -> usize {
        self.max_chunk_length - self.overlap
    }

    /// Split `text` into ordered chunks.
    ///
    /// Concatenating [`TextChunk::core_text`] over the result reconstructs `text`
    /// exactly. Each chunk's `text` is at most `max_chunk_length` bytes.
    pub fn get_chunks(&self, text: &str) -> Vec<TextChunk> {
        if text.is_empty() {
            return vec![TextChunk::new(0, 0..0, 0, text)];
        }

        let budget = self.core_budget();
        let segments = self.split_recursively_into_segments(text, 0, budget, 0);

        let mut cores: Vec<Range<usize>> = Vec::new();
        let mut chunk_start = 0;
        let mut chunk_end = 0;

        for segment in segments
            .into_iter()
            .flat_map(|segment| split_fixed(text, segment, budget))
        {
            if chunk_end - chunk_start + segment.len() > budget && chunk_start != chunk_end {
                cores.push(chunk_start..chunk_end);
                chunk_start = segment.start;
            } else if chunk_start == chunk_end {
                chunk_start = segment.start;
            }
            chunk_end = segment.end;
        }

        if chunk_start != chunk_end {
            cores.push(chunk_start..chunk_end);
        }

        cores
            .into_iter()
            .enumerate()
            .map(|(sequence, core)| {
                let overlap_start = if sequence == 0 {
                    core.start
                } else {
                    self.overlap_start(text, core.start)
                };
                TextChunk::new(sequence, core, overlap_start, text)
            })
            .collect()
    }

    // Walk back at most `overlap` bytes from `start`, then forward to a character
    // boundary, preferring to begin just after a whitespace character so the overlap does
    // not open mid-word.
    fn overlap_start(&self, text: &str, start: usize) -> usize {
        if self.overlap == 0 {
            return start;
        }
        let mut from = start.saturating_sub(self.overlap);
        while !text.is_char_boundary(from) {
            from += 1;
        }
        if let Some((pos, ch)) = text[from..start]
            .char_indices()
            .find(|(_, ch)| ch.is_whitespace())
        {
            let after = from + pos + ch.len_utf8();
            if after < start {
                from = after;
            }
        }
        from
    }

    // Recursively splits the text into segments based on delimiters.
    // Returns contiguous byte ranges (relative to the full source, via `current_offset`)
    // that are either delimiter matches or pieces no larger than `max_chunk_size`, unless
    // all delimiters are exhausted, in which case fixed windows are emitted.
    fn split_recursively_into_segments(
        &self,
        text: &str,
        delimiter_idx: usize,
        max_chunk_size: usize,
        current_offset: usize,
    ) -> Vec<Range<usize>> {
        let mut result_segments: Vec<Range<usize>> = Vec::new();

        if text.is_empty() {
            return result_segments;
        }

        if text.len() <= max_chunk_size {
            result_segments.push(current_offset..(current_offset + text.len()));
            return result_segments;
        }

        // Out of delimiters: fixed windows on character boundaries
        let Some(current_delimiter) = self.delimiters.get(delimiter_idx) else {
            return split_fixed(text, 0..text.len(), max_chunk_size)
                .into_iter()
                .map(|r| current_offset + r.start..current_offset + r.end)
                .collect();
        };

        let mut local_byte_start = 0;

        for mat in current_delimiter.find_iter(text) {
            if mat.start() == mat.end() {
                continue;
            }
            if mat.start() > local_byte_start {
                let sub_text = &text[local_byte_start..mat.start()];
                result_segments.extend(self.split_recursively_into_segments(
                    sub_text,
                    delimiter_idx + 1,
                    max_chunk_size,
                    current_offset + local_byte_start,
                ));
            }
            result_segments.push(current_offset + mat.start()..current_offset + mat.end());
            local_byte_start = mat.end();
        }

        if local_byte_start < text.len() {
            let sub_text = &text[local_byte_start..];
            result_segments.extend(self.split_recursively_into_segments(
                sub_text,
                delimiter_idx + 1,
                max_chunk_size,
                current_offset + local_byte_start,
            ));
        }

        result_segments
    }
}

/// Cut `range` of `text` into windows of at most `budget` bytes, never splitting a
/// UTF-8 character.
fn split_fixed(text: &str, range: Range<usize>, budget: usize) -> Vec<Range<usize>> {
    if range.len() <= budget {
        return vec![range];
    }

    let mut windows = Vec::with_capacity(range.len() / budget + 1);
    let mut start = range.start;
    while start < range.end {
        let mut end = (start + budget).min(range.end);
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
        windows.push(start..end);
        start = end;
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_well_formed(chunker: &TextChunker, text: &str, chunks: &[TextChunk]) {
        assert!(!chunks.is_empty());
        let mut expected_start = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i);
            assert_eq!(chunk.start, expected_start, "cores must be contiguous");
            assert!(chunk.end > chunk.start || text.is_empty());
            assert!(chunk.overlap_start <= chunk.start);
            assert!(chunk.overlap_len() <= chunker.overlap());
            assert!(
                chunk.text.len() <= chunker.max_chunk_length(),
                "chunk {i} is {} bytes",
                chunk.text.len()
            );
            assert_eq!(chunk.text, &text[chunk.overlap_start..chunk.end]);
            expected_start = chunk.end;
        }
        assert_eq!(expected_start, text.len());

        let rebuilt: String = chunks.iter().map(|c| c.core_text()).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_get_chunks_basic() {
        let file_content = (0..100)
            .map(|_| "This is a test sentence. ")
            .collect::<String>();
        let chunker = TextChunker::new(DEFAULT_TEXT_DELIMITERS, 500, 50).unwrap();
        let chunks = chunker.get_chunks(&file_content);

        assert!(chunks.len() >= file_content.len() / 450);
        assert!(chunks.len() <= file_content.len() / 450 + 2);
        assert_well_formed(&chunker, &file_content, &chunks);
    }

    #[test]
    fn test_single_small_input_is_one_chunk() {
        let chunker = TextChunker::new(DEFAULT_TEXT_DELIMITERS, 500, 50).unwrap();
        let chunks = chunker.get_chunks("A very short document.");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "A very short document.");
        assert_eq!(chunks[0].overlap_len(), 0);
    }

    #[test]
    fn test_empty_input_yields_single_empty_chunk() {
        let chunks = chunk("", 100, 10).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 0);
        assert!(chunks[0].text.is_empty());
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let p1 = "The first paragraph talks about storage engines and write ahead logs.";
        let p2 = "The second paragraph covers rank fusion and tie breaking rules.";
        let text = format!("{p1}\n\n{p2}");

        let chunker = TextChunker::new(DEFAULT_TEXT_DELIMITERS, 100, 0).unwrap();
        let chunks = chunker.get_chunks(&text);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, format!("{p1}\n\n"));
        assert_eq!(chunks[1].text, p2);
        assert_well_formed(&chunker, &text, &chunks);
    }

    #[test]
    fn test_sentence_ends_outrank_line_breaks() {
        let s1 = "The index keeps\nevery chunk offset stable.";
        let s2 = "Fusion merges\nboth ranked lists by rank.";
        let text = format!("{s1} {s2}");

        let chunker = TextChunker::new(DEFAULT_TEXT_DELIMITERS, 50, 0).unwrap();
        let chunks = chunker.get_chunks(&text);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].core_text(), format!("{s1} "));
        assert_eq!(chunks[1].core_text(), s2);
        assert_well_formed(&chunker, &text, &chunks);
    }

    #[test]
    fn test_prefers_sentence_boundaries() {
        let text = "Sentence number one is here. ".repeat(5);
        let chunker = TextChunker::new(DEFAULT_TEXT_DELIMITERS, 60, 0).unwrap();
        let chunks = chunker.get_chunks(&text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(
                chunk.core_text().ends_with(". "),
                "chunk {:?} does not end on a sentence",
                chunk.core_text()
            );
        }
        assert_well_formed(&chunker, &text, &chunks);
    }

    #[test]
    fn test_overlap_carries_previous_context() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu ".repeat(8);
        let chunker =
            TextChunker::with_overlap_fraction(DEFAULT_TEXT_DELIMITERS, 100, 0.2).unwrap();
        assert_eq!(chunker.overlap(), 20);

        let chunks = chunker.get_chunks(&text);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let next = &pair[1];
            assert!(next.overlap_len() > 0);
            assert!(pair[0].text.ends_with(&text[next.overlap_start..next.start]));
        }
        assert_well_formed(&chunker, &text, &chunks);
    }

    #[test]
    fn test_dense_text_falls_back_to_fixed_windows() {
        let text = "x".repeat(1050);
        let chunker = TextChunker::new(DEFAULT_TEXT_DELIMITERS, 100, 10).unwrap();
        let chunks = chunker.get_chunks(&text);

        assert_eq!(chunks.len(), 12);
        assert!(chunks[..11].iter().all(|c| c.end - c.start == 90));
        assert_well_formed(&chunker, &text, &chunks);
    }

    #[test]
    fn test_multibyte_text_never_splits_characters() {
        let text = "日本語のテキストには空白がありません".repeat(20) + "🦀🦀🦀";
        let chunker = TextChunker::new(DEFAULT_TEXT_DELIMITERS, 37, 7).unwrap();
        let chunks = chunker.get_chunks(&text);

        assert!(chunks.len() > 1);
        assert_well_formed(&chunker, &text, &chunks);
    }

    #[test]
    fn test_rechunking_is_idempotent() {
        let text = r#"
# Heading 1

This is a paragraph. It has two sentences.

## Heading 2

- List item 1
- List item 2

```rust
fn main() {
    println!("Hello, world!");
}
```

Another paragraph.
"#
        .repeat(4);
        let chunker =
            chunker_for_path(Path::new("notes/readme.md"), 120, 0.1).unwrap();

        let first = chunker.get_chunks(&text);
        let second = chunker.get_chunks(&text);

        assert_eq!(first, second);
        let hashes: Vec<_> = first.iter().map(|c| c.hash.clone()).collect();
        let again: Vec<_> = second.iter().map(|c| c.hash.clone()).collect();
        assert_eq!(hashes, again);
        assert_well_formed(&chunker, &text, &first);
    }

    #[test]
    fn test_whitespace_runs_larger_than_budget() {
        let text = format!("start{}end", " ".repeat(300));
        let chunker = TextChunker::new(DEFAULT_TEXT_DELIMITERS, 50, 5).unwrap();
        let chunks = chunker.get_chunks(&text);

        assert_well_formed(&chunker, &text, &chunks);
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        assert!(matches!(
            TextChunker::new(DEFAULT_TEXT_DELIMITERS, 10, 8),
            Err(ChunkError::InvalidSize { .. })
        ));
        assert!(matches!(
            TextChunker::with_overlap_fraction(DEFAULT_TEXT_DELIMITERS, 100, 1.0),
            Err(ChunkError::InvalidOverlapFraction(_))
        ));
        assert!(matches!(
            TextChunker::new(&["("], 100, 0),
            Err(ChunkError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_delimiters_follow_file_type() {
        assert_eq!(
            get_delimiters_for_path(Path::new("src/main.rs")),
            CODE_DELIMITERS
        );
        assert_eq!(
            get_delimiters_for_path(Path::new("docs/guide.md")),
            DEFAULT_MARKDOWN_DELIMITERS
        );
        assert_eq!(
            get_delimiters_for_path(Path::new("README")),
            DEFAULT_MARKDOWN_DELIMITERS
        );
        assert_eq!(
            get_delimiters_for_path(Path::new("scan.pdf")),
            DEFAULT_TEXT_DELIMITERS
        );
    }

    #[test]
    fn test_chunk_serializes_offsets() {
        let chunks = chunk("Hello there. General Kenobi.", 16, 0).unwrap();
        let json = serde_json::to_value(&chunks[0]).unwrap();

        assert_eq!(json["sequence"], 0);
        assert_eq!(json["start"], 0);
        assert_eq!(json["text"], chunks[0].text.as_str());
        assert_eq!(json["hash"].as_str().map(str::len), Some(64));
    }
}
