//! SQL realization of the vector backend.
//!
//! Records live in a single SQLite database; embeddings are stored as
//! little-endian f32 blobs and scored with an exact in-process scan
//! (recall 1.0). Connections are opened per operation and serialize on
//! SQLite's own locking.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::health::HealthStatus;
use crate::similarity::{cosine_distance, distance_to_score};
use crate::text::unique_terms;

use super::{BackendHealth, Metadata, MetadataFilter, SearchHit, VectorBackend, VectorRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    document TEXT NOT NULL,
    metadata TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection);
";

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for x in v {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn decode_metadata(raw: &str) -> Metadata {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

/// SQLite-backed vector store.
pub struct SqliteStore {
    path: PathBuf,
    closed: Arc<AtomicBool>,
}

impl SqliteStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or the schema
    /// cannot be applied.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            path,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotInitialized("sqlite store is closed".to_string()));
        }
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        self.ensure_open()?;
        open_connection(&self.path)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

impl super::VectorStore for SqliteStore {
    fn create_collection(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM collections WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(Error::CollectionExists(name.to_string()));
        }
        conn.execute(
            "INSERT INTO collections (name, created_at) VALUES (?1, ?2)",
            params![name, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn collection(&self, name: &str) -> Result<Arc<dyn VectorBackend>> {
        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM collections WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        Ok(Arc::new(SqliteCollection {
            path: self.path.clone(),
            name: name.to_string(),
            closed: Arc::clone(&self.closed),
        }))
    }

    fn get_or_create_collection(&self, name: &str) -> Result<Arc<dyn VectorBackend>> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?1, ?2)",
            params![name, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(Arc::new(SqliteCollection {
            path: self.path.clone(),
            name: name.to_string(),
            closed: Arc::clone(&self.closed),
        }))
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM collections WHERE name = ?1", params![name])?;
        if removed == 0 {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        conn.execute(
            "DELETE FROM records WHERE collection = ?1",
            params![name],
        )?;
        Ok(())
    }

    fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// One collection inside a [`SqliteStore`].
pub struct SqliteCollection {
    path: PathBuf,
    name: String,
    closed: Arc<AtomicBool>,
}

impl SqliteCollection {
    fn conn(&self) -> Result<Connection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotInitialized(format!(
                "store for collection '{}' is closed",
                self.name
            )));
        }
        open_connection(&self.path)
    }

    fn established_dimension(&self, conn: &Connection) -> Result<Option<usize>> {
        let bytes: Option<i64> = conn
            .query_row(
                "SELECT length(embedding) FROM records WHERE collection = ?1 LIMIT 1",
                params![self.name],
                |row| row.get(0),
            )
            .optional()?;
        #[allow(clippy::cast_sign_loss)]
        Ok(bytes.map(|b| b as usize / 4))
    }

    fn scan<T>(
        &self,
        conn: &Connection,
        mut score: impl FnMut(&str, &[u8], &str, Metadata) -> Option<T>,
    ) -> Result<Vec<T>> {
        let mut stmt = conn.prepare(
            "SELECT id, embedding, document, metadata FROM records WHERE collection = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![self.name])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let embedding: Vec<u8> = row.get(1)?;
            let document: String = row.get(2)?;
            let metadata: String = row.get(3)?;
            if let Some(item) = score(&id, &embedding, &document, decode_metadata(&metadata)) {
                out.push(item);
            }
        }
        Ok(out)
    }
}

impl VectorBackend for SqliteCollection {
    fn add(
        &self,
        ids: &[String],
        embeddings: &[Vec<f32>],
        documents: &[String],
        metadatas: &[Metadata],
    ) -> Result<()> {
        if ids.len() != embeddings.len()
            || ids.len() != documents.len()
            || ids.len() != metadatas.len()
        {
            return Err(Error::InvalidInput(format!(
                "mismatched lengths: {} ids, {} embeddings, {} documents, {} metadatas",
                ids.len(),
                embeddings.len(),
                documents.len(),
                metadatas.len()
            )));
        }

        let mut conn = self.conn()?;
        let mut expected = self.established_dimension(&conn)?;
        for embedding in embeddings {
            match expected {
                None => expected = Some(embedding.len()),
                Some(dim) if dim != embedding.len() => {
                    return Err(Error::DimensionMismatch {
                        expected: dim,
                        actual: embedding.len(),
                    });
                }
                Some(_) => {}
            }
        }

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO records (collection, id, embedding, document, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (((id, embedding), document), metadata) in
                ids.iter().zip(embeddings).zip(documents).zip(metadatas)
            {
                stmt.execute(params![
                    self.name,
                    id,
                    encode_embedding(embedding),
                    document,
                    serde_json::Value::Object(metadata.clone()).to_string(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query_vector(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        let conn = self.conn()?;
        if let Some(expected) = self.established_dimension(&conn)? {
            if expected != query.len() {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }

        let mut hits = self.scan(&conn, |id, embedding_bytes, _document, metadata| {
            if !filter.is_none_or(|f| f.matches(&metadata)) {
                return None;
            }
            let embedding = decode_embedding(embedding_bytes);
            Some(SearchHit {
                id: id.to_string(),
                score: distance_to_score(cosine_distance(query, &embedding)),
                metadata,
            })
        })?;

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }

    fn query_keyword(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        let query_terms = unique_terms(text);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn()?;
        let mut hits = self.scan(&conn, |id, _embedding, document, metadata| {
            if !filter.is_none_or(|f| f.matches(&metadata)) {
                return None;
            }
            let terms = unique_terms(document);
            let matched = query_terms.iter().filter(|t| terms.contains(*t)).count();
            if matched == 0 {
                return None;
            }
            #[allow(clippy::cast_precision_loss)]
            Some(SearchHit {
                id: id.to_string(),
                score: matched as f32,
                metadata,
            })
        })?;

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }

    fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        let conn = self.conn()?;
        if ids.is_empty() {
            return self.scan(&conn, |id, embedding, document, metadata| {
                Some(VectorRecord {
                    id: id.to_string(),
                    embedding: decode_embedding(embedding),
                    document: document.to_string(),
                    metadata,
                })
            });
        }

        let mut stmt = conn.prepare(
            "SELECT embedding, document, metadata FROM records
             WHERE collection = ?1 AND id = ?2",
        )?;
        let mut out = Vec::new();
        for id in ids {
            let row = stmt
                .query_row(params![self.name, id], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .optional()?;
            if let Some((embedding, document, metadata)) = row {
                out.push(VectorRecord {
                    id: id.clone(),
                    embedding: decode_embedding(&embedding),
                    document,
                    metadata: decode_metadata(&metadata),
                });
            }
        }
        Ok(out)
    }

    fn delete(&self, ids: Option<&[String]>, filter: Option<&MetadataFilter>) -> Result<usize> {
        if ids.is_none() && filter.is_none() {
            return Err(Error::InvalidInput(
                "delete requires ids or a metadata filter".to_string(),
            ));
        }

        let conn = self.conn()?;
        let victims: Vec<String> = match (ids, filter) {
            (Some(ids), None) => ids.to_vec(),
            (ids, Some(f)) => {
                let matching = self.scan(&conn, |id, _e, _d, metadata| {
                    f.matches(&metadata).then(|| id.to_string())
                })?;
                match ids {
                    Some(ids) => matching.into_iter().filter(|id| ids.contains(id)).collect(),
                    None => matching,
                }
            }
            (None, None) => unreachable!(),
        };

        let mut removed = 0;
        let mut stmt =
            conn.prepare("DELETE FROM records WHERE collection = ?1 AND id = ?2")?;
        for id in &victims {
            removed += stmt.execute(params![self.name, id])?;
        }
        Ok(removed)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![self.name],
            |row| row.get(0),
        )?;
        #[allow(clippy::cast_sign_loss)]
        Ok(count as usize)
    }

    fn health(&self) -> BackendHealth {
        match self.count() {
            Ok(documents) => BackendHealth {
                status: HealthStatus::Healthy,
                collection: self.name.clone(),
                documents: Some(documents),
                details: format!("sqlite store at {}", self.path.display()),
            },
            Err(e) => BackendHealth {
                status: HealthStatus::Unhealthy,
                collection: self.name.clone(),
                documents: None,
                details: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VectorStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("vectors.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)), v);
    }

    #[test]
    fn test_add_query_and_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let collection = store.get_or_create_collection("kb").unwrap();
            collection
                .add(
                    &["a".into(), "b".into()],
                    &[vec![1.0, 0.0], vec![0.0, 1.0]],
                    &["alpha doc".into(), "beta doc".into()],
                    &[meta(json!({"k": "x"})), meta(json!({"k": "y"}))],
                )
                .unwrap();
        }

        // Reopen: records survived.
        let store = SqliteStore::open(&path).unwrap();
        let collection = store.collection("kb").unwrap();
        assert_eq!(collection.count().unwrap(), 2);

        let hits = collection.query_vector(&[1.0, 0.0], 1, None).unwrap();
        assert_eq!(hits[0].id, "a");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_keyword_and_filter() {
        let (_dir, store) = open_store();
        let collection = store.get_or_create_collection("kb").unwrap();
        collection
            .add(
                &["a".into(), "b".into()],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
                &["rust systems language".into(), "python scripting".into()],
                &[meta(json!({"k": "x"})), meta(json!({"k": "y"}))],
            )
            .unwrap();

        let hits = collection.query_keyword("rust language", 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
        assert!((hits[0].score - 2.0).abs() < f32::EPSILON);

        let filter = MetadataFilter::new().equals("k", "y");
        let hits = collection
            .query_vector(&[1.0, 0.0], 10, Some(&filter))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let (_dir, store) = open_store();
        let collection = store.get_or_create_collection("kb").unwrap();
        collection
            .add(
                &["a".into()],
                &[vec![1.0, 0.0, 0.0]],
                &["doc".into()],
                &[Metadata::new()],
            )
            .unwrap();

        let err = collection.query_vector(&[1.0, 0.0], 1, None).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn test_delete_and_collection_cascade() {
        let (_dir, store) = open_store();
        let collection = store.get_or_create_collection("kb").unwrap();
        collection
            .add(
                &["a".into(), "b".into()],
                &[vec![1.0], vec![2.0]],
                &["x".into(), "y".into()],
                &[Metadata::new(), Metadata::new()],
            )
            .unwrap();

        assert_eq!(collection.delete(Some(&["a".into()]), None).unwrap(), 1);
        assert_eq!(collection.count().unwrap(), 1);

        store.delete_collection("kb").unwrap();
        assert!(store.collection("kb").is_err());
        // Records removed with the collection.
        let readback = store.get_or_create_collection("kb").unwrap();
        assert_eq!(readback.count().unwrap(), 0);
    }

    #[test]
    fn test_closed_store_fails_not_initialized() {
        let (_dir, store) = open_store();
        let collection = store.get_or_create_collection("kb").unwrap();
        store.close();
        let err = collection.count().unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
    }
}
