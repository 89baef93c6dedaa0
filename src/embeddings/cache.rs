//! Content-addressed embedding cache.
//!
//! Keyed by (chunk id, model id): chunk ids are content hashes, so a cache
//! hit is exactly "this text was already embedded under this model". The
//! cache is engine-lifetime state shared across dataset reloads and has no
//! eviction; it is bounded by dataset size, not by a memory ceiling.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::types::RagError;

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
struct CacheKey {
    chunk_id: String,
    model: String,
}

/// A cached embedding vector with its provenance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub vector: Vec<f32>,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    chunk_id: String,
    model: String,
    vector: Vec<f32>,
    created_at: DateTime<Utc>,
}

/// Process-wide vector cache with concurrent readers and writers.
///
/// Writes are idempotent (identical key ⇒ identical content-derived value),
/// so racing indexing workers can overwrite each other without observable
/// effect.
#[derive(Debug, Default)]
pub struct EmbeddingCache {
    records: RwLock<HashMap<CacheKey, EmbeddingRecord>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached vector for `(chunk_id, model)`, if any.
    pub fn get(&self, chunk_id: &str, model: &str) -> Option<Vec<f32>> {
        let key = CacheKey {
            chunk_id: chunk_id.to_string(),
            model: model.to_string(),
        };
        self.records.read().get(&key).map(|record| record.vector.clone())
    }

    /// Stores a vector, overwriting any previous record for the same key.
    pub fn put(&self, chunk_id: impl Into<String>, model: impl Into<String>, vector: Vec<f32>) {
        let model = model.into();
        let key = CacheKey {
            chunk_id: chunk_id.into(),
            model: model.clone(),
        };
        let record = EmbeddingRecord {
            vector,
            model,
            created_at: Utc::now(),
        };
        self.records.write().insert(key, record);
    }

    /// Drops every record for `model`; returns how many were removed.
    ///
    /// Used when the embedding model configuration changes, which makes all
    /// of that model's vectors stale at once.
    pub fn invalidate_model(&self, model: &str) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|key, _| key.model != model);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Writes the cache as a JSON snapshot.
    ///
    /// Persistence is optional; a snapshot is keyed exactly like the live
    /// cache, so reloading it in a new process yields the same hit set.
    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<(), RagError> {
        let entries: Vec<SnapshotEntry> = {
            let records = self.records.read();
            records
                .iter()
                .map(|(key, record)| SnapshotEntry {
                    chunk_id: key.chunk_id.clone(),
                    model: key.model.clone(),
                    vector: record.vector.clone(),
                    created_at: record.created_at,
                })
                .collect()
        };
        let serialized =
            serde_json::to_string(&entries).map_err(|err| RagError::Io(err.to_string()))?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, serialized).await?;
        Ok(())
    }

    /// Replaces the cache contents from a snapshot written by [`persist`].
    ///
    /// A missing file is not an error; the cache is simply left empty.
    ///
    /// [`persist`]: EmbeddingCache::persist
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<(), RagError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let data = fs::read_to_string(path).await?;
        let entries: Vec<SnapshotEntry> =
            serde_json::from_str(&data).map_err(|err| RagError::Io(err.to_string()))?;
        let mut records = self.records.write();
        records.clear();
        for entry in entries {
            records.insert(
                CacheKey {
                    chunk_id: entry.chunk_id,
                    model: entry.model.clone(),
                },
                EmbeddingRecord {
                    vector: entry.vector,
                    model: entry.model,
                    created_at: entry.created_at,
                },
            );
        }
        Ok(())
    }
}
