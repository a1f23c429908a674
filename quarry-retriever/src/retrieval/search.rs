use anyhow::Result;
use quarry_embed::EmbeddingGateway;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{Instrument, debug, info_span, warn};

use super::hybrid_search::{FusedHit, SearchConfig, dedupe_by_file, reciprocal_rank_fusion};
use crate::error::{ErrorKind, IndexError, error_kind};
use crate::storage::{
    ChunkId, ChunkRecord, Collection, FileId, FileRecord, FileStatus, KeywordIndex,
    MetadataStore, VectorIndex, file_id_from_vector_id, is_under,
};

/// Which indexes a query consults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Filename embeddings, falling back to path substring matches
    Filename,
    /// Content embeddings (plus keywords when configured)
    Content,
    /// Content embeddings and keywords, fused
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Filename => "filename",
            SearchMode::Content => "content",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "filename" | "file" | "name" => Ok(SearchMode::Filename),
            "content" | "semantic" => Ok(SearchMode::Content),
            "hybrid" | "combined" => Ok(SearchMode::Hybrid),
            _ => Err(format!(
                "Invalid search mode: '{s}'. Valid values are: filename, content, hybrid"
            )),
        }
    }
}

/// Whether results are collapsed to one per file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    File,
    Chunk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub mode: SearchMode,
    /// Only files under this path
    #[serde(default)]
    pub scope: Option<String>,
    /// 0 means the configured default
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub granularity: Granularity,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, mode: SearchMode) -> Self {
        Self {
            text: text.into(),
            mode,
            scope: None,
            limit: 0,
            offset: 0,
            granularity: Granularity::File,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }
}

/// Which retrieval path produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Vector,
    Keyword,
    Filename,
    PathSubstring,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMatch {
    pub chunk_id: ChunkId,
    pub chunk_index: i64,
    pub start_offset: i64,
    pub end_offset: i64,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub file_id: FileId,
    pub path: String,
    pub filename: String,
    /// Absent for filename matches
    pub chunk: Option<ChunkMatch>,
    /// Fused RRF score, or cosine similarity for filename matches
    pub score: f64,
    /// `score` on a 0-100 scale
    pub display_score: f64,
    pub matched: Vec<MatchSource>,
    /// Share of the file's chunks that are embedded, as a percentage
    pub completeness: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub mode: SearchMode,
    pub results: Vec<SearchResult>,
    pub has_more: bool,
    /// The embedding backend was unavailable and results come from keywords or paths only
    pub degraded: bool,
}

/// Trim `text` to at most `max` bytes on a character boundary.
fn snippet(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Vector candidates, or `None` when the backend could not embed the query.
type VectorCandidates = Option<Vec<ChunkId>>;

/// Answers queries against the three stores. Read-only; safe to run alongside indexing.
pub struct SearchService {
    store: Arc<dyn MetadataStore>,
    keyword: Arc<dyn KeywordIndex>,
    vectors: Arc<dyn VectorIndex>,
    gateway: Arc<EmbeddingGateway>,
    config: SearchConfig,
}

impl SearchService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        keyword: Arc<dyn KeywordIndex>,
        vectors: Arc<dyn VectorIndex>,
        gateway: Arc<EmbeddingGateway>,
        config: SearchConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            keyword,
            vectors,
            gateway,
            config,
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(IndexError::InvalidQuery {
                message: "search text is empty".to_string(),
            }
            .into());
        }
        let limit = match query.limit {
            0 => self.config.default_limit,
            n => n.min(self.config.max_limit),
        };
        let scope = query.scope.as_deref();
        let wanted = query.offset + limit;

        let span = info_span!("search", mode = %query.mode, limit);
        let (mut results, degraded) = async {
            match query.mode {
                SearchMode::Filename => self.search_filenames(text, scope, wanted).await,
                SearchMode::Content | SearchMode::Hybrid => {
                    self.search_content(text, query.mode, scope, wanted, query.granularity)
                        .await
                }
            }
        }
        .instrument(span)
        .await?;

        let has_more = results.len() > wanted;
        results.truncate(wanted);
        let results: Vec<SearchResult> = results.into_iter().skip(query.offset).collect();

        if let Err(e) = self
            .store
            .record_search(text, query.mode.as_str(), results.len())
            .await
        {
            warn!("Failed to record search history: {e:#}");
        }
        debug!(
            "Search '{text}' ({}) returned {} results{}",
            query.mode,
            results.len(),
            if degraded { " (degraded)" } else { "" }
        );

        Ok(SearchResponse {
            query: text.to_string(),
            mode: query.mode,
            results,
            has_more,
            degraded,
        })
    }

    /// Embed the query, or report that the backend is down.
    async fn embed_query(&self, text: &str) -> Result<Option<Vec<half::f16>>> {
        match self.gateway.embed_one(text).await {
            Ok(vector) => Ok(Some(vector)),
            Err(e) => {
                let err = IndexError::from(e);
                if err.kind() == ErrorKind::BackendUnavailable {
                    warn!("Query embedding unavailable, degrading: {err}");
                    Ok(None)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    fn candidates(&self, wanted: usize) -> usize {
        wanted.saturating_mul(self.config.candidate_multiplier).max(wanted + 1)
    }

    async fn search_filenames(
        &self,
        text: &str,
        scope: Option<&str>,
        wanted: usize,
    ) -> Result<(Vec<SearchResult>, bool)> {
        let fetch = wanted + 1;
        let Some(embedding) = self.embed_query(text).await? else {
            return Ok((self.path_substring(text, scope, fetch).await?, true));
        };

        let hits = self
            .vectors
            .search(
                &embedding,
                self.candidates(fetch),
                Collection::Filenames,
                self.gateway.model().model_id().as_str(),
            )
            .await?;
        let similarity: Vec<(FileId, f64)> = hits
            .iter()
            .filter_map(|hit| {
                let sim = 1.0 - f64::from(hit.distance);
                let file_id = file_id_from_vector_id(&hit.vector_id)?;
                (sim >= f64::from(self.config.min_filename_similarity)).then_some((file_id, sim))
            })
            .collect();

        let ids: Vec<FileId> = similarity.iter().map(|(id, _)| *id).collect();
        let files = self.live_files(&ids, scope).await?;
        let results: Vec<SearchResult> = similarity
            .into_iter()
            .filter_map(|(id, sim)| {
                let file = files.get(&id)?;
                Some(SearchResult {
                    file_id: id,
                    path: file.path.clone(),
                    filename: file.filename.clone(),
                    chunk: None,
                    score: sim,
                    display_score: (sim * 100.0).clamp(0.0, 100.0),
                    matched: vec![MatchSource::Filename],
                    completeness: file.completeness(),
                })
            })
            .take(fetch)
            .collect();

        if results.is_empty() {
            debug!("No filename embedding above threshold for '{text}', matching paths");
            return Ok((self.path_substring(text, scope, fetch).await?, false));
        }
        Ok((results, false))
    }

    async fn path_substring(
        &self,
        text: &str,
        scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let k = f64::from(self.config.rrf_k);
        let files = self.store.find_by_path_substring(text, scope, limit).await?;
        Ok(files
            .into_iter()
            .enumerate()
            .map(|(position, file)| {
                let score = 1.0 / (k + position as f64 + 1.0);
                SearchResult {
                    file_id: file.id,
                    completeness: file.completeness(),
                    path: file.path,
                    filename: file.filename,
                    chunk: None,
                    score,
                    display_score: self.config.display_score(score),
                    matched: vec![MatchSource::PathSubstring],
                }
            })
            .collect())
    }

    async fn search_content(
        &self,
        text: &str,
        mode: SearchMode,
        scope: Option<&str>,
        wanted: usize,
        granularity: Granularity,
    ) -> Result<(Vec<SearchResult>, bool)> {
        let fetch = self.candidates(wanted + 1);
        let use_keyword = mode == SearchMode::Hybrid || self.config.content_uses_keyword;

        let (vector, keyword) = tokio::join!(
            self.vector_candidates(text, scope, fetch),
            async {
                if use_keyword {
                    self.keyword.search(text, fetch, scope).await
                } else {
                    Ok(Vec::new())
                }
            }
        );
        let vector = vector?;
        let degraded = vector.is_none();
        let keyword: Vec<ChunkId> = match keyword {
            Ok(hits) => hits.into_iter().map(|hit| hit.chunk_id).collect(),
            // A broken keyword index only costs the keyword half while vectors work
            Err(e) if vector.is_some() && error_kind(&e) != ErrorKind::StoreUnavailable => {
                warn!("Keyword search failed, using vectors only: {e:#}");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let vector = match vector {
            Some(ids) => ids,
            None if use_keyword => Vec::new(),
            // Content mode without keywords has nothing left to rank
            None => return Ok((Vec::new(), true)),
        };

        if mode == SearchMode::Hybrid
            && !degraded
            && !self.config.single_list_fallback
            && (vector.is_empty() || keyword.is_empty())
        {
            return Ok((Vec::new(), false));
        }

        let fused = reciprocal_rank_fusion(&vector, &keyword, &self.config);
        let results = self.materialize(fused, scope).await?;
        let results = match granularity {
            Granularity::File => dedupe_by_file(results, |r| r.file_id, |r| r.score),
            Granularity::Chunk => results,
        };
        Ok((results, degraded))
    }

    /// Chunks whose content vectors are nearest to the query, in vector rank order.
    async fn vector_candidates(
        &self,
        text: &str,
        scope: Option<&str>,
        fetch: usize,
    ) -> Result<VectorCandidates> {
        let Some(embedding) = self.embed_query(text).await? else {
            return Ok(None);
        };
        let hits = self
            .vectors
            .search(
                &embedding,
                fetch,
                Collection::Contents,
                self.gateway.model().model_id().as_str(),
            )
            .await?;
        if hits.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let rank: HashMap<&str, usize> = hits
            .iter()
            .enumerate()
            .map(|(position, hit)| (hit.vector_id.as_str(), position))
            .collect();
        let vector_ids: Vec<String> = hits.iter().map(|hit| hit.vector_id.clone()).collect();
        let mut chunks = self.store.chunks_by_vector_ids(&vector_ids).await?;

        // One vector can back chunks in several files
        let file_ids: Vec<FileId> = chunks.iter().map(|c| c.file_id).collect();
        let files = self.live_files(&file_ids, scope).await?;
        chunks.retain(|chunk| files.contains_key(&chunk.file_id));
        chunks.sort_by_key(|chunk| {
            let position = chunk
                .vector_id
                .as_deref()
                .and_then(|id| rank.get(id).copied())
                .unwrap_or(usize::MAX);
            (position, chunk.id)
        });
        Ok(Some(chunks.into_iter().map(|chunk| chunk.id).collect()))
    }

    /// Non-deleted files among `ids` that fall inside `scope`.
    async fn live_files(
        &self,
        ids: &[FileId],
        scope: Option<&str>,
    ) -> Result<HashMap<FileId, FileRecord>> {
        let unique: Vec<FileId> = ids
            .iter()
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self
            .store
            .files_by_ids(&unique)
            .await?
            .into_iter()
            .filter(|file| file.status != FileStatus::Deleted)
            .filter(|file| scope.is_none_or(|scope| is_under(&file.path, scope)))
            .map(|file| (file.id, file))
            .collect())
    }

    async fn materialize(
        &self,
        fused: Vec<FusedHit<ChunkId>>,
        scope: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let chunk_ids: Vec<ChunkId> = fused.iter().map(|hit| hit.key).collect();
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let chunks: HashMap<ChunkId, ChunkRecord> = self
            .store
            .chunks_by_ids(&chunk_ids)
            .await?
            .into_iter()
            .map(|chunk| (chunk.id, chunk))
            .collect();
        let file_ids: Vec<FileId> = chunks.values().map(|c| c.file_id).collect();
        let files = self.live_files(&file_ids, scope).await?;

        Ok(fused
            .into_iter()
            .filter_map(|hit| {
                // Chunks replaced by a concurrent re-index simply drop out
                let chunk = chunks.get(&hit.key)?;
                let file = files.get(&chunk.file_id)?;
                let mut matched = Vec::with_capacity(2);
                if hit.vector_rank.is_some() {
                    matched.push(MatchSource::Vector);
                }
                if hit.keyword_rank.is_some() {
                    matched.push(MatchSource::Keyword);
                }
                Some(SearchResult {
                    file_id: file.id,
                    path: file.path.clone(),
                    filename: file.filename.clone(),
                    chunk: Some(ChunkMatch {
                        chunk_id: chunk.id,
                        chunk_index: chunk.chunk_index,
                        start_offset: chunk.start_offset,
                        end_offset: chunk.end_offset,
                        snippet: snippet(&chunk.text, self.config.snippet_length),
                    }),
                    score: hit.score,
                    display_score: self.config.display_score(hit.score),
                    matched,
                    completeness: file.completeness(),
                })
            })
            .collect())
    }
}
