//! quarry-retriever: offline file indexing and hybrid retrieval
//!
//! Registered folders are scanned and watched; every text file is chunked, embedded
//! through [`quarry_embed`], and stored in two SQLite databases: a metadata store with
//! an FTS5 keyword index, and a vector store holding `filenames` and `contents`
//! collections. Queries run the vector and keyword searches side by side and fuse them
//! with reciprocal rank fusion.
//!
//! ## Key Modules
//!
//! - **[`engine`]**: the query API (`index_folder`, `remove_folder`, `search`,
//!   `get_indexing_status`) and the engine lifecycle
//! - **[`retrieval`]**: chunking, the indexing pipeline, file sync and hybrid search
//! - **[`storage`]**: store contracts with SQLite implementations
//! - **[`status`]**: progress, health and consistency reports
//! - **[`error`]**: the error taxonomy shared by every layer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quarry_retriever::{Engine, EngineConfig, FolderSettings, SearchMode, SearchQuery};
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = Engine::open_with_defaults(EngineConfig::new(".quarry")).await?;
//! engine.index_folder(Path::new("notes"), FolderSettings::default()).await?;
//!
//! let response = engine.search(&SearchQuery::new("circuit breaker", SearchMode::Hybrid)).await?;
//! for hit in &response.results {
//!     println!("{:5.1} {}", hit.display_score, hit.path);
//! }
//! engine.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Watcher → SyncEngine → TaskQueue → IndexingPipeline → Chunking → Embeddings
//!                                            ↓
//!                          quarry.db (files, chunks, FTS5) + vectors.db
//!                                            ↓
//!                       SearchService (vector ∥ keyword → RRF) → Engine
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod retrieval;
pub mod status;
pub mod storage;
pub mod telemetry;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ErrorKind, IndexError, error_kind};
pub use retrieval::search::{Granularity, SearchMode, SearchQuery, SearchResponse, SearchResult};
pub use retrieval::sync_engine::{FsEvent, FsEventKind, ScanReport};
pub use status::{IndexingProgress, RemoveFolderReport};
pub use storage::{FileStatus, FolderSettings};
pub use telemetry::{LoggingConfig, init_tracing};
