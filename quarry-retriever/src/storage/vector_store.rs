//! SQLite-backed vector index with brute-force cosine search.
//!
//! Embeddings are stored as little-endian `f16` blobs in their own database so the
//! metadata store can be rebuilt or inspected without touching them. Each collection
//! records the model it was built with; opening the store with a different model or
//! dimension clears that collection and reports it through [`SqliteVectorStore::invalidated`].
//!
//! Vectors are mirrored in memory on open and kept in sync write-through, so a search
//! never reads blobs from disk.

use super::{Collection, VectorHit, VectorIndex};
use crate::error::IndexError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use half::f16;
use quarry_embed::ModelInfo;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type CollectionMap = HashMap<Collection, HashMap<String, Vec<f16>>>;

#[derive(Debug)]
pub struct SqliteVectorStore {
    pool: SqlitePool,
    model: ModelInfo,
    model_id: String,
    cache: RwLock<CollectionMap>,
    invalidated: Vec<Collection>,
}

impl SqliteVectorStore {
    pub async fn open(db_path: &Path, model: &ModelInfo) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(Duration::from_secs(5))
                    .create_if_missing(true),
            )
            .await
            .map_err(|e| IndexError::StoreUnavailable {
                message: format!("cannot open {}: {e}", db_path.display()),
            })?;

        Self::new_with_pool(pool, model).await
    }

    pub async fn open_memory(model: &ModelInfo) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;
        Self::new_with_pool(pool, model).await
    }

    async fn new_with_pool(pool: SqlitePool, model: &ModelInfo) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                model_json TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                metric TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                collection TEXT NOT NULL,
                vector_id TEXT NOT NULL,
                embedding BLOB NOT NULL,
                PRIMARY KEY (collection, vector_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let model_id = model.model_id();
        let mut invalidated = Vec::new();
        for collection in Collection::ALL {
            if Self::ensure_collection(&pool, collection, model, &model_id).await? {
                invalidated.push(collection);
            }
        }

        let cache = Self::load_cache(&pool).await?;
        Ok(Self {
            pool,
            model: model.clone(),
            model_id,
            cache: RwLock::new(cache),
            invalidated,
        })
    }

    /// Registers the collection for `model`; returns true if existing vectors were
    /// dropped because they came from a different model.
    async fn ensure_collection(
        pool: &SqlitePool,
        collection: Collection,
        model: &ModelInfo,
        model_id: &str,
    ) -> Result<bool> {
        let existing = sqlx::query("SELECT model_id, dimension FROM collections WHERE name = ?1")
            .bind(collection.as_str())
            .fetch_optional(pool)
            .await?;

        let stale = match &existing {
            None => false,
            Some(row) => {
                let stored_model: String = row.try_get("model_id")?;
                let stored_dimension: i64 = row.try_get("dimension")?;
                if stored_model == model_id && stored_dimension == model.dimension as i64 {
                    return Ok(false);
                }
                warn!(
                    "Collection {} was built with {} (dim {}), now using {} (dim {}); clearing it",
                    collection, stored_model, stored_dimension, model_id, model.dimension
                );
                true
            }
        };

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM vectors WHERE collection = ?1")
            .bind(collection.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO collections (name, model_id, model_json, dimension, metric, created_at)
            VALUES (?1, ?2, ?3, ?4, 'cosine', ?5)
            ON CONFLICT(name) DO UPDATE SET
                model_id = excluded.model_id,
                model_json = excluded.model_json,
                dimension = excluded.dimension,
                created_at = excluded.created_at
            "#,
        )
        .bind(collection.as_str())
        .bind(model_id)
        .bind(serde_json::to_string(model)?)
        .bind(model.dimension as i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if !stale {
            info!("Created vector collection {collection} for {model_id}");
        }
        Ok(stale)
    }

    async fn load_cache(pool: &SqlitePool) -> Result<CollectionMap> {
        let rows = sqlx::query("SELECT collection, vector_id, embedding FROM vectors")
            .fetch_all(pool)
            .await?;

        let mut cache: CollectionMap = Collection::ALL
            .into_iter()
            .map(|c| (c, HashMap::new()))
            .collect();
        for row in &rows {
            let name: String = row.try_get("collection")?;
            let collection = match name.as_str() {
                "filenames" => Collection::Filenames,
                "contents" => Collection::Contents,
                other => {
                    warn!("Skipping vectors of unknown collection {other}");
                    continue;
                }
            };
            let bytes: Vec<u8> = row.try_get("embedding")?;
            cache
                .entry(collection)
                .or_default()
                .insert(row.try_get("vector_id")?, decode_embedding(&bytes));
        }
        debug!("Loaded {} vectors into memory", rows.len());
        Ok(cache)
    }

    /// Collections that were cleared on open because the model changed.
    pub fn invalidated(&self) -> &[Collection] {
        &self.invalidated
    }

    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn check_dimension(&self, embedding: &[f16]) -> Result<()> {
        if embedding.len() != self.model.dimension {
            return Err(IndexError::mismatch(format!(
                "vector has dimension {}, collection expects {}",
                embedding.len(),
                self.model.dimension
            ))
            .into());
        }
        Ok(())
    }
}

fn decode_embedding(bytes: &[u8]) -> Vec<f16> {
    // Blobs may not be 2-byte aligned, so read them out rather than casting in place
    bytes
        .chunks_exact(2)
        .map(|pair| f16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn encode_embedding(embedding: &[f16]) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        bytemuck::cast_slice::<f16, u8>(embedding).to_vec()
    } else {
        embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// Cosine similarity between two f16 vectors, 0.0 on length mismatch or zero norm.
pub fn cosine_similarity(a: &[f16], b: &[f16]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (x.to_f32(), y.to_f32());
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a.sqrt() * norm_b.sqrt())
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorStore {
    async fn upsert(&self, vector_id: &str, embedding: &[f16], collection: Collection) -> Result<()> {
        self.upsert_many(&[(vector_id.to_string(), embedding.to_vec())], collection)
            .await
    }

    async fn upsert_many(
        &self,
        entries: &[(String, Vec<f16>)],
        collection: Collection,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for (_, embedding) in entries {
            self.check_dimension(embedding)?;
        }

        // Held across the commit so the cache applies writes in commit order
        let mut cache = self.cache.write().await;
        let mut tx = self.pool.begin().await?;
        for (vector_id, embedding) in entries {
            sqlx::query(
                r#"
                INSERT INTO vectors (collection, vector_id, embedding) VALUES (?1, ?2, ?3)
                ON CONFLICT(collection, vector_id) DO UPDATE SET embedding = excluded.embedding
                "#,
            )
            .bind(collection.as_str())
            .bind(vector_id)
            .bind(encode_embedding(embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let vectors = cache.entry(collection).or_default();
        for (vector_id, embedding) in entries {
            vectors.insert(vector_id.clone(), embedding.clone());
        }
        Ok(())
    }

    async fn delete(&self, vector_id: &str) -> Result<()> {
        self.delete_many(&[vector_id.to_string()]).await
    }

    async fn delete_many(&self, vector_ids: &[String]) -> Result<()> {
        if vector_ids.is_empty() {
            return Ok(());
        }

        let mut cache = self.cache.write().await;
        let mut tx = self.pool.begin().await?;
        for vector_id in vector_ids {
            sqlx::query("DELETE FROM vectors WHERE vector_id = ?1")
                .bind(vector_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        for vectors in cache.values_mut() {
            for vector_id in vector_ids {
                vectors.remove(vector_id);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f16],
        k: usize,
        collection: Collection,
        model_id: &str,
    ) -> Result<Vec<VectorHit>> {
        if model_id != self.model_id {
            return Err(IndexError::mismatch(format!(
                "query embedded with {model_id}, collection {collection} holds {}",
                self.model_id
            ))
            .into());
        }
        self.check_dimension(query)?;

        let cache = self.cache.read().await;
        let Some(vectors) = cache.get(&collection) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<VectorHit> = vectors
            .iter()
            .map(|(vector_id, embedding)| VectorHit {
                vector_id: vector_id.clone(),
                distance: 1.0 - cosine_similarity(query, embedding),
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.vector_id.cmp(&b.vector_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn missing(&self, vector_ids: &[String], collection: Collection) -> Result<Vec<String>> {
        let cache = self.cache.read().await;
        let present = cache.get(&collection);
        Ok(vector_ids
            .iter()
            .filter(|id| !present.is_some_and(|vectors| vectors.contains_key(id.as_str())))
            .cloned()
            .collect())
    }

    async fn count(&self, collection: Collection) -> Result<usize> {
        Ok(self
            .cache
            .read()
            .await
            .get(&collection)
            .map_or(0, HashMap::len))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, error_kind};
    use tempfile::tempdir;

    fn vector(values: &[f32]) -> Vec<f16> {
        values.iter().map(|v| f16::from_f32(*v)).collect()
    }

    fn model(dimension: usize) -> ModelInfo {
        ModelInfo::new("mock-hash", "1", dimension)
    }

    #[tokio::test]
    async fn test_search_orders_by_distance() -> anyhow::Result<()> {
        let store = SqliteVectorStore::open_memory(&model(3)).await?;
        store
            .upsert_many(
                &[
                    ("content:a".into(), vector(&[1.0, 0.0, 0.0])),
                    ("content:b".into(), vector(&[0.7, 0.7, 0.0])),
                    ("content:c".into(), vector(&[0.0, 0.0, 1.0])),
                ],
                Collection::Contents,
            )
            .await?;

        let hits = store
            .search(&vector(&[1.0, 0.1, 0.0]), 2, Collection::Contents, store.model_id())
            .await?;
        let ids: Vec<_> = hits.iter().map(|h| h.vector_id.as_str()).collect();
        assert_eq!(ids, vec!["content:a", "content:b"]);
        assert!(hits[0].distance < hits[1].distance);

        // Collections are isolated
        assert!(store
            .search(&vector(&[1.0, 0.0, 0.0]), 5, Collection::Filenames, store.model_id())
            .await?
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_foreign_model_and_dimension() -> anyhow::Result<()> {
        let store = SqliteVectorStore::open_memory(&model(3)).await?;

        let err = store
            .search(&vector(&[1.0, 0.0, 0.0]), 5, Collection::Contents, "other:1:3:norm")
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::ConfigurationMismatch);

        let err = store
            .upsert("content:x", &vector(&[1.0, 0.0]), Collection::Contents)
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::ConfigurationMismatch);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_and_missing() -> anyhow::Result<()> {
        let store = SqliteVectorStore::open_memory(&model(2)).await?;
        store
            .upsert("content:a", &vector(&[1.0, 0.0]), Collection::Contents)
            .await?;
        store
            .upsert("filename:1", &vector(&[0.0, 1.0]), Collection::Filenames)
            .await?;

        let missing = store
            .missing(
                &["content:a".to_string(), "content:b".to_string()],
                Collection::Contents,
            )
            .await?;
        assert_eq!(missing, vec!["content:b".to_string()]);

        store
            .delete_many(&["content:a".to_string(), "filename:1".to_string()])
            .await?;
        assert_eq!(store.count(Collection::Contents).await?, 0);
        assert_eq!(store.count(Collection::Filenames).await?, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cache_matches_disk_after_racing_writes() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let db_path = dir.path().join("vectors.db");
        let store = std::sync::Arc::new(SqliteVectorStore::open(&db_path, &model(2)).await?);

        let ids: Vec<String> = (0..40).map(|i| format!("content:{i}")).collect();
        let mut tasks = Vec::new();
        for id in &ids {
            let writer = store.clone();
            let upsert_id = id.clone();
            tasks.push(tokio::spawn(async move {
                writer
                    .upsert(&upsert_id, &vector(&[1.0, 0.0]), Collection::Contents)
                    .await
            }));
            let remover = store.clone();
            let delete_id = id.clone();
            tasks.push(tokio::spawn(async move { remover.delete(&delete_id).await }));
        }
        for task in tasks {
            task.await??;
        }

        let cached_missing = store.missing(&ids, Collection::Contents).await?;
        let cached_count = store.count(Collection::Contents).await?;
        store.close().await;

        let reopened = SqliteVectorStore::open(&db_path, &model(2)).await?;
        assert_eq!(reopened.missing(&ids, Collection::Contents).await?, cached_missing);
        assert_eq!(reopened.count(Collection::Contents).await?, cached_count);
        Ok(())
    }

    #[tokio::test]
    async fn test_model_change_clears_collections() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("vectors.db");
        {
            let store = SqliteVectorStore::open(&path, &model(2)).await?;
            assert!(store.invalidated().is_empty());
            store
                .upsert("content:a", &vector(&[1.0, 0.0]), Collection::Contents)
                .await?;
            store.close().await;
        }
        {
            // Same model: vectors survive a restart
            let store = SqliteVectorStore::open(&path, &model(2)).await?;
            assert!(store.invalidated().is_empty());
            assert_eq!(store.count(Collection::Contents).await?, 1);
            store.close().await;
        }

        let store = SqliteVectorStore::open(&path, &model(4)).await?;
        assert_eq!(
            store.invalidated(),
            &[Collection::Filenames, Collection::Contents]
        );
        assert_eq!(store.count(Collection::Contents).await?, 0);
        Ok(())
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vector(&[1.0, 0.0]);
        let b = vector(&[0.0, 1.0]);
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-3);
        assert!(cosine_similarity(&a, &b).abs() < 1e-3);
        assert_eq!(cosine_similarity(&a, &vector(&[1.0])), 0.0);
        assert_eq!(cosine_similarity(&a, &vector(&[0.0, 0.0])), 0.0);
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let original = vector(&[0.5, -0.25, 1.0]);
        assert_eq!(decode_embedding(&encode_embedding(&original)), original);
    }
}
