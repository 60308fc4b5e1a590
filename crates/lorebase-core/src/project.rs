//! Multi-project isolation and lifecycle management.
//!
//! Each project owns a vector-backend collection (`kb_project_<id>`), a
//! query cache, and a metadata row in a small SQLite database. The manager
//! serializes metadata mutations on one reentrant lock; the pooled backend
//! client and the collection cache use independent locks so the query path
//! never nests them.

use dashmap::DashMap;
use parking_lot::{ReentrantMutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{EmbeddedStore, Metadata, SearchHit, VectorBackend, VectorStore};
use crate::cache::LruCache;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Export bundle format version.
const BUNDLE_VERSION: &str = "2.3.0";

/// Bundle versions accepted on import.
const ACCEPTED_BUNDLE_VERSIONS: &[&str] = &["1.0", "2.3.0"];

/// Project metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Immutable UUID-v4 identifier.
    pub project_id: String,
    /// Human-readable name, unique across live projects.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Backend collection name, derived as `kb_project_<project_id>`.
    pub collection_name: String,
    /// Embedding model identifier.
    pub embedding_model: String,
    /// RFC3339 UTC creation timestamp.
    pub created_at: String,
    /// RFC3339 UTC last-update timestamp.
    pub updated_at: String,
    /// Additional metadata.
    pub metadata: Metadata,
}

impl Project {
    /// Derives the collection name for a project id.
    #[must_use]
    pub fn collection_name_for(project_id: &str) -> String {
        format!("kb_project_{project_id}")
    }
}

/// Partial update for [`ProjectManager::update`].
#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    /// New name; uniqueness is re-checked.
    pub name: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New embedding model. Changing this on a non-empty project invalidates
    /// its existing embeddings; the manager clears the project's query cache
    /// but re-embedding is the caller's responsibility.
    pub embedding_model: Option<String>,
    /// Replacement metadata object.
    pub metadata: Option<Metadata>,
}

/// Aggregate manager statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Number of live projects.
    pub total_projects: usize,
    /// Entries across all per-project query caches.
    pub total_cache_entries: usize,
    /// Capacity of each per-project cache.
    pub cache_capacity_per_project: usize,
    /// Metadata database location.
    pub storage_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BundleManifest {
    version: String,
    exported_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportedDocument {
    id: String,
    content: String,
    metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportBundle {
    manifest: BundleManifest,
    project: Project,
    documents: Vec<ExportedDocument>,
    embeddings: Vec<Vec<f32>>,
}

type StoreFactory = Box<dyn Fn() -> Result<Arc<dyn VectorStore>> + Send + Sync>;

/// Thread-safe project lifecycle manager.
///
/// Isolation guarantees: no project's cache entries are readable from
/// another project's cache, each project queries only its own collection,
/// and deleting one project leaves every other project's data and caches
/// untouched.
pub struct ProjectManager {
    storage_path: PathBuf,
    cache_capacity: usize,
    /// Serializes metadata mutations. Reentrant so nested helper calls from
    /// inside a mutation cannot deadlock.
    mutation_lock: ReentrantMutex<()>,
    /// Lazily initialized pooled backend client (double-checked).
    store: RwLock<Option<Arc<dyn VectorStore>>>,
    store_factory: StoreFactory,
    /// project_id -> collection handle.
    collection_cache: DashMap<String, Arc<dyn VectorBackend>>,
    /// project_id -> query cache.
    project_caches: DashMap<String, Arc<LruCache<String, Vec<SearchHit>>>>,
}

impl ProjectManager {
    /// Opens a manager backed by the default in-process vector store.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata database cannot be initialized.
    pub fn new<P: AsRef<Path>>(storage_path: P, cache_capacity: usize) -> Result<Self> {
        Self::with_store_factory(storage_path, cache_capacity, || {
            Ok(Arc::new(EmbeddedStore::new()))
        })
    }

    /// Opens a manager with a custom backend-client factory. The factory
    /// runs at most once, on first collection access.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata database cannot be initialized.
    pub fn with_store_factory<P, F>(
        storage_path: P,
        cache_capacity: usize,
        factory: F,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn() -> Result<Arc<dyn VectorStore>> + Send + Sync + 'static,
    {
        if cache_capacity == 0 {
            return Err(Error::config("cache_capacity", "must be positive"));
        }

        let storage_path = storage_path.as_ref().to_path_buf();
        if let Some(parent) = storage_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = Self {
            storage_path,
            cache_capacity,
            mutation_lock: ReentrantMutex::new(()),
            store: RwLock::new(None),
            store_factory: Box::new(factory),
            collection_cache: DashMap::new(),
            project_caches: DashMap::new(),
        };
        manager.init_database()?;
        info!(storage = %manager.storage_path.display(), "project manager initialized");
        Ok(manager)
    }

    fn init_database(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                project_id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                collection_name TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_project_name ON projects(name);",
        )?;
        Ok(())
    }

    /// Connections are opened per operation and closed on drop; concurrent
    /// writers serialize on SQLite's own locking.
    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.storage_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// The pooled backend client, lazily initialized under a double-checked
    /// lock.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error; initialization is retried on the next
    /// call.
    pub fn store(&self) -> Result<Arc<dyn VectorStore>> {
        if let Some(store) = self.store.read().as_ref() {
            return Ok(Arc::clone(store));
        }
        let mut slot = self.store.write();
        if let Some(store) = slot.as_ref() {
            return Ok(Arc::clone(store));
        }
        let store = (self.store_factory)()?;
        *slot = Some(Arc::clone(&store));
        debug!("backend client initialized");
        Ok(store)
    }

    /// Creates a project with isolated resources.
    ///
    /// The metadata insert is all-or-nothing; backend collection creation is
    /// best-effort and logged on failure.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateName`] if the name is taken.
    /// - Metadata store failures are surfaced.
    pub fn create(
        &self,
        name: &str,
        description: &str,
        embedding_model: &str,
        metadata: Option<Metadata>,
    ) -> Result<Project> {
        let _guard = self.mutation_lock.lock();

        let project_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let project = Project {
            collection_name: Project::collection_name_for(&project_id),
            project_id,
            name: name.to_string(),
            description: description.to_string(),
            embedding_model: embedding_model.to_string(),
            created_at: now.clone(),
            updated_at: now,
            metadata: metadata.unwrap_or_default(),
        };

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO projects
             (project_id, name, description, collection_name, embedding_model,
              created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                project.project_id,
                project.name,
                project.description,
                project.collection_name,
                project.embedding_model,
                project.created_at,
                project.updated_at,
                serde_json::Value::Object(project.metadata.clone()).to_string(),
            ],
        )?;
        if inserted == 0 {
            return Err(Error::DuplicateName(name.to_string()));
        }

        self.project_caches.insert(
            project.project_id.clone(),
            Arc::new(LruCache::new(self.cache_capacity)),
        );

        match self.store() {
            Ok(store) => match store.get_or_create_collection(&project.collection_name) {
                Ok(collection) => {
                    self.collection_cache
                        .insert(project.project_id.clone(), collection);
                }
                Err(e) => warn!(project = %project.project_id, "collection creation failed: {e}"),
            },
            Err(e) => warn!("backend client unavailable during create: {e}"),
        }

        info!(project = %project.project_id, name = %project.name, "created project");
        Ok(project)
    }

    /// Fetches a project by id.
    ///
    /// # Errors
    ///
    /// Metadata store failures are surfaced.
    pub fn get(&self, project_id: &str) -> Result<Option<Project>> {
        let conn = self.conn()?;
        let project = conn
            .query_row(
                "SELECT project_id, name, description, collection_name, embedding_model,
                        created_at, updated_at, metadata
                 FROM projects WHERE project_id = ?1",
                params![project_id],
                row_to_project,
            )
            .optional()?;
        Ok(project)
    }

    /// Fetches a project by name.
    ///
    /// # Errors
    ///
    /// Metadata store failures are surfaced.
    pub fn get_by_name(&self, name: &str) -> Result<Option<Project>> {
        let conn = self.conn()?;
        let project = conn
            .query_row(
                "SELECT project_id, name, description, collection_name, embedding_model,
                        created_at, updated_at, metadata
                 FROM projects WHERE name = ?1",
                params![name],
                row_to_project,
            )
            .optional()?;
        Ok(project)
    }

    /// Lists projects, newest first.
    ///
    /// # Errors
    ///
    /// Metadata store failures are surfaced.
    pub fn list(&self) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT project_id, name, description, collection_name, embedding_model,
                    created_at, updated_at, metadata
             FROM projects ORDER BY created_at DESC, project_id",
        )?;
        let projects = stmt
            .query_map([], row_to_project)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    /// Applies a partial update and bumps `updated_at`.
    ///
    /// # Errors
    ///
    /// - [`Error::ProjectNotFound`] if the project is missing.
    /// - [`Error::DuplicateName`] if a renamed name is taken.
    pub fn update(&self, project_id: &str, update: ProjectUpdate) -> Result<Project> {
        let _guard = self.mutation_lock.lock();

        let mut project = self
            .get(project_id)?
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))?;

        if let Some(name) = update.name {
            if let Some(existing) = self.get_by_name(&name)? {
                if existing.project_id != project_id {
                    return Err(Error::DuplicateName(name));
                }
            }
            project.name = name;
        }
        if let Some(description) = update.description {
            project.description = description;
        }
        if let Some(embedding_model) = update.embedding_model {
            if embedding_model != project.embedding_model {
                warn!(
                    project = %project_id,
                    "embedding model changed; existing embeddings are invalidated"
                );
                if let Some(cache) = self.project_caches.get(project_id) {
                    cache.clear();
                }
            }
            project.embedding_model = embedding_model;
        }
        if let Some(metadata) = update.metadata {
            project.metadata = metadata;
        }
        project.updated_at = chrono::Utc::now().to_rfc3339();

        let conn = self.conn()?;
        conn.execute(
            "UPDATE projects
             SET name = ?1, description = ?2, embedding_model = ?3,
                 updated_at = ?4, metadata = ?5
             WHERE project_id = ?6",
            params![
                project.name,
                project.description,
                project.embedding_model,
                project.updated_at,
                serde_json::Value::Object(project.metadata.clone()).to_string(),
                project_id,
            ],
        )?;

        info!(project = %project_id, "updated project");
        Ok(project)
    }

    /// Deletes a project, cascading to its query cache and backend
    /// collection. Returns whether a project row was removed.
    ///
    /// Collection deletion failures are logged, not fatal.
    ///
    /// # Errors
    ///
    /// Metadata store failures are surfaced.
    pub fn delete(&self, project_id: &str) -> Result<bool> {
        let _guard = self.mutation_lock.lock();

        let Some(project) = self.get(project_id)? else {
            return Ok(false);
        };

        if let Some((_, cache)) = self.project_caches.remove(project_id) {
            cache.clear();
        }
        self.collection_cache.remove(project_id);

        match self.store() {
            Ok(store) => {
                if let Err(e) = store.delete_collection(&project.collection_name) {
                    warn!(project = %project_id, "collection deletion failed: {e}");
                }
            }
            Err(e) => warn!("backend client unavailable during delete: {e}"),
        }

        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM projects WHERE project_id = ?1",
            params![project_id],
        )?;

        info!(project = %project_id, "deleted project");
        Ok(removed > 0)
    }

    /// The project's query cache, created on first access for existing
    /// projects. `None` when the project does not exist.
    ///
    /// # Errors
    ///
    /// Metadata store failures are surfaced.
    pub fn project_cache(
        &self,
        project_id: &str,
    ) -> Result<Option<Arc<LruCache<String, Vec<SearchHit>>>>> {
        if let Some(cache) = self.project_caches.get(project_id) {
            return Ok(Some(Arc::clone(cache.value())));
        }
        if self.get(project_id)?.is_none() {
            return Ok(None);
        }
        let cache = self
            .project_caches
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(LruCache::new(self.cache_capacity)));
        Ok(Some(Arc::clone(cache.value())))
    }

    /// The project's backend collection, cached after first access. `None`
    /// when the project does not exist.
    ///
    /// # Errors
    ///
    /// Backend client or metadata store failures are surfaced.
    pub fn collection(&self, project_id: &str) -> Result<Option<Arc<dyn VectorBackend>>> {
        if let Some(collection) = self.collection_cache.get(project_id) {
            return Ok(Some(Arc::clone(collection.value())));
        }
        let Some(project) = self.get(project_id)? else {
            return Ok(None);
        };
        let collection = self
            .store()?
            .get_or_create_collection(&project.collection_name)?;
        self.collection_cache
            .insert(project_id.to_string(), Arc::clone(&collection));
        Ok(Some(collection))
    }

    /// Drops the cached collection handle (e.g. after external deletion).
    pub fn invalidate_collection_cache(&self, project_id: &str) {
        self.collection_cache.remove(project_id);
    }

    /// Clears the project's query cache. Returns false for unknown projects.
    ///
    /// # Errors
    ///
    /// Metadata store failures are surfaced.
    pub fn clear_project_cache(&self, project_id: &str) -> Result<bool> {
        match self.project_cache(project_id)? {
            Some(cache) => {
                cache.clear();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Serializes a project (metadata, documents, embeddings) to a JSON
    /// bundle at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::ProjectNotFound`] if the project is missing.
    /// - Backend and filesystem failures are surfaced.
    pub fn export_project<P: AsRef<Path>>(&self, project_id: &str, path: P) -> Result<()> {
        let project = self
            .get(project_id)?
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))?;
        let collection = self
            .collection(project_id)?
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))?;

        let records = collection.get(&[])?;
        let mut documents = Vec::with_capacity(records.len());
        let mut embeddings = Vec::with_capacity(records.len());
        for record in records {
            documents.push(ExportedDocument {
                id: record.id,
                content: record.document,
                metadata: record.metadata,
            });
            embeddings.push(record.embedding);
        }

        let bundle = ExportBundle {
            manifest: BundleManifest {
                version: BUNDLE_VERSION.to_string(),
                exported_at: chrono::Utc::now().to_rfc3339(),
            },
            project,
            documents,
            embeddings,
        };

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(&bundle)?)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)?;

        info!(project = %project_id, path = %path.display(), "exported project");
        Ok(())
    }

    /// Restores a project from a bundle written by [`Self::export_project`].
    ///
    /// `new_name` overrides the bundled name. With `overwrite` false a name
    /// conflict fails; with `overwrite` true the existing project is deleted
    /// first.
    ///
    /// # Errors
    ///
    /// - [`Error::Serialization`] for an unreadable bundle.
    /// - [`Error::InvalidInput`] for an unsupported bundle version.
    /// - [`Error::DuplicateName`] on conflict without `overwrite`.
    pub fn import_project<P: AsRef<Path>>(
        &self,
        path: P,
        new_name: Option<&str>,
        overwrite: bool,
    ) -> Result<Project> {
        let bytes = std::fs::read(path.as_ref())?;
        let bundle: ExportBundle = serde_json::from_slice(&bytes)?;

        if !ACCEPTED_BUNDLE_VERSIONS.contains(&bundle.manifest.version.as_str()) {
            return Err(Error::InvalidInput(format!(
                "unsupported bundle version '{}'",
                bundle.manifest.version
            )));
        }
        if bundle.documents.len() != bundle.embeddings.len() {
            return Err(Error::InvalidInput(format!(
                "bundle has {} documents but {} embeddings",
                bundle.documents.len(),
                bundle.embeddings.len()
            )));
        }

        let _guard = self.mutation_lock.lock();

        let name = new_name.unwrap_or(&bundle.project.name).to_string();
        if let Some(existing) = self.get_by_name(&name)? {
            if overwrite {
                self.delete(&existing.project_id)?;
            } else {
                return Err(Error::DuplicateName(name));
            }
        }

        let project = self.create(
            &name,
            &bundle.project.description,
            &bundle.project.embedding_model,
            Some(bundle.project.metadata.clone()),
        )?;

        if !bundle.documents.is_empty() {
            let collection = self
                .collection(&project.project_id)?
                .ok_or_else(|| Error::ProjectNotFound(project.project_id.clone()))?;
            let ids: Vec<String> = bundle.documents.iter().map(|d| d.id.clone()).collect();
            let contents: Vec<String> = bundle.documents.iter().map(|d| d.content.clone()).collect();
            let metadatas: Vec<Metadata> =
                bundle.documents.iter().map(|d| d.metadata.clone()).collect();
            collection.add(&ids, &bundle.embeddings, &contents, &metadatas)?;
        }

        info!(project = %project.project_id, name = %project.name, "imported project");
        Ok(project)
    }

    /// Aggregate statistics.
    ///
    /// # Errors
    ///
    /// Metadata store failures are surfaced.
    pub fn stats(&self) -> Result<ManagerStats> {
        let total_projects = self.list()?.len();
        let total_cache_entries = self
            .project_caches
            .iter()
            .map(|entry| entry.value().len())
            .sum();
        Ok(ManagerStats {
            total_projects,
            total_cache_entries,
            cache_capacity_per_project: self.cache_capacity,
            storage_path: self.storage_path.display().to_string(),
        })
    }

    /// Clears all caches and releases the backend client. The manager can
    /// keep serving metadata reads afterwards; collection access
    /// re-initializes the client.
    pub fn close(&self) {
        self.project_caches.clear();
        self.collection_cache.clear();
        if let Some(store) = self.store.write().take() {
            store.close();
        }
        info!("project manager closed");
    }
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    let metadata_json: Option<String> = row.get(7)?;
    let metadata = metadata_json
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();

    Ok(Project {
        project_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        collection_name: row.get(3)?,
        embedding_model: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        metadata,
    })
}
