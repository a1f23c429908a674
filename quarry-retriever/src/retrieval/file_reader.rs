//! Text extraction behind a trait.
//!
//! The pipeline only needs "give me the text of this file"; how that happens (plain
//! UTF-8, PDF extraction, OCR) is the reader's business. [`LocalFileReader`] handles
//! text-like formats directly; [`MockFileReader`] serves canned content in tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Why a file could not be read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadFailure {
    #[error("unsupported file type")]
    Unsupported,
    #[error("corrupt content: {0}")]
    Corrupt(String),
    #[error("unreadable: {0}")]
    Unreadable(String),
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },
    #[error("file no longer exists")]
    Vanished,
    #[error("transient read failure: {0}")]
    Transient(String),
}

impl ReadFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, ReadFailure::Transient(_))
    }

    fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => ReadFailure::Vanished,
            ErrorKind::PermissionDenied => ReadFailure::Unreadable(err.to_string()),
            ErrorKind::InvalidData => ReadFailure::Corrupt(err.to_string()),
            _ => ReadFailure::Transient(err.to_string()),
        }
    }
}

#[async_trait]
pub trait FileReader: Send + Sync {
    /// Whether this reader can extract text from `path`. Unsupported files are still
    /// tracked and searchable by name.
    fn supports(&self, path: &Path) -> bool;

    /// Extract the text content of `path`.
    async fn read(&self, path: &Path) -> Result<String, ReadFailure>;
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "org", "log", "csv", "tsv", "json", "jsonl", "yaml", "yml",
    "toml", "ini", "cfg", "conf", "xml", "html", "htm", "css", "tex", "rs", "py", "js", "jsx",
    "ts", "tsx", "go", "java", "kt", "c", "h", "cpp", "hpp", "cs", "rb", "php", "swift", "sh",
    "bash", "zsh", "sql",
];

const EXTENSIONLESS_TEXT: &[&str] = &["README", "CHANGELOG", "LICENSE", "Makefile", "Dockerfile"];

// Bytes inspected for NUL when sniffing binary content
const SNIFF_LEN: usize = 8192;

/// Reads UTF-8 text files from the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileReader {
    max_file_size: u64,
}

impl LocalFileReader {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }
}

impl Default for LocalFileReader {
    fn default() -> Self {
        Self::new(10 * 1024 * 1024)
    }
}

#[async_trait]
impl FileReader for LocalFileReader {
    fn supports(&self, path: &Path) -> bool {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => TEXT_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext)),
            None => path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| EXTENSIONLESS_TEXT.contains(&name)),
        }
    }

    async fn read(&self, path: &Path) -> Result<String, ReadFailure> {
        if !self.supports(path) {
            return Err(ReadFailure::Unsupported);
        }

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(ReadFailure::from_io)?;
        if metadata.len() > self.max_file_size {
            return Err(ReadFailure::TooLarge {
                size: metadata.len(),
                limit: self.max_file_size,
            });
        }

        let bytes = tokio::fs::read(path).await.map_err(ReadFailure::from_io)?;
        if bytes[..bytes.len().min(SNIFF_LEN)].contains(&0) {
            return Err(ReadFailure::Corrupt("binary content".to_string()));
        }
        String::from_utf8(bytes).map_err(|e| ReadFailure::Corrupt(format!("invalid UTF-8: {e}")))
    }
}

#[derive(Debug, Default)]
struct MockReaderState {
    contents: HashMap<PathBuf, Result<String, ReadFailure>>,
    reads: HashMap<PathBuf, usize>,
    active: HashSet<PathBuf>,
    overlapping_reads: usize,
    delay: Option<Duration>,
}

/// In-memory reader for tests. Tracks how often each path is read and whether two
/// reads of the same path ever overlapped.
#[derive(Debug, Default)]
pub struct MockFileReader {
    state: Mutex<MockReaderState>,
    total_reads: AtomicUsize,
}

impl MockFileReader {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockReaderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.state()
            .contents
            .insert(path.into(), Ok(content.into()));
    }

    pub fn fail(&self, path: impl Into<PathBuf>, failure: ReadFailure) {
        self.state().contents.insert(path.into(), Err(failure));
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    pub fn reads_of(&self, path: &Path) -> usize {
        self.state().reads.get(path).copied().unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.total_reads.load(Ordering::SeqCst)
    }

    /// Times a read started while another read of the same path was running.
    pub fn overlapping_reads(&self) -> usize {
        self.state().overlapping_reads
    }
}

#[async_trait]
impl FileReader for MockFileReader {
    fn supports(&self, _path: &Path) -> bool {
        true
    }

    async fn read(&self, path: &Path) -> Result<String, ReadFailure> {
        self.total_reads.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut state = self.state();
            *state.reads.entry(path.to_path_buf()).or_default() += 1;
            if !state.active.insert(path.to_path_buf()) {
                state.overlapping_reads += 1;
            }
            state.delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let canned = {
            let mut state = self.state();
            state.active.remove(path);
            state.contents.get(path).cloned()
        };
        match canned {
            Some(result) => result,
            // Fall back to the real file so tests can mix disk and canned content
            None => tokio::fs::read_to_string(path)
                .await
                .map_err(ReadFailure::from_io),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_reader_reads_text() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.md");
        tokio::fs::write(&path, "# Notes\nquarterly numbers").await?;

        let reader = LocalFileReader::default();
        assert_eq!(reader.read(&path).await?, "# Notes\nquarterly numbers");
        Ok(())
    }

    #[tokio::test]
    async fn test_local_reader_classifies_failures() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let reader = LocalFileReader::new(16);

        let image = dir.path().join("photo.png");
        tokio::fs::write(&image, [0x89, b'P', b'N', b'G']).await?;
        assert_eq!(reader.read(&image).await, Err(ReadFailure::Unsupported));
        assert!(!reader.supports(&image));

        let big = dir.path().join("big.txt");
        tokio::fs::write(&big, "x".repeat(64)).await?;
        assert!(matches!(
            reader.read(&big).await,
            Err(ReadFailure::TooLarge { size: 64, limit: 16 })
        ));

        let binary = dir.path().join("blob.txt");
        tokio::fs::write(&binary, [b'a', 0, b'b']).await?;
        assert!(matches!(
            reader.read(&binary).await,
            Err(ReadFailure::Corrupt(_))
        ));

        let latin1 = dir.path().join("latin1.txt");
        tokio::fs::write(&latin1, [b'c', b'a', b'f', 0xe9]).await?;
        assert!(matches!(
            reader.read(&latin1).await,
            Err(ReadFailure::Corrupt(_))
        ));

        let gone = dir.path().join("gone.txt");
        assert_eq!(reader.read(&gone).await, Err(ReadFailure::Vanished));
        Ok(())
    }

    #[test]
    fn test_supports_extensionless_readme() {
        let reader = LocalFileReader::default();
        assert!(reader.supports(Path::new("/repo/README")));
        assert!(reader.supports(Path::new("/repo/notes.TXT")));
        assert!(!reader.supports(Path::new("/repo/archive")));
    }

    #[tokio::test]
    async fn test_mock_reader_tracks_reads() {
        let reader = MockFileReader::new();
        reader.insert("/virtual/a.txt", "alpha");
        reader.fail("/virtual/b.pdf", ReadFailure::Corrupt("bad xref".into()));

        assert_eq!(reader.read(Path::new("/virtual/a.txt")).await.unwrap(), "alpha");
        assert!(reader.read(Path::new("/virtual/b.pdf")).await.is_err());
        assert_eq!(reader.reads_of(Path::new("/virtual/a.txt")), 1);
        assert_eq!(reader.total_reads(), 2);
        assert_eq!(reader.overlapping_reads(), 0);
    }
}
