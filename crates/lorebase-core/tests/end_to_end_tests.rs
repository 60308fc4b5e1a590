//! End-to-end lifecycle scenarios: create, ingest, query, snapshot
//! handling, export/import, delete.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lorebase_core::{
    DocumentInput, HealthMonitor, KnowledgeBase, KnowledgeConfig, Metadata, Project,
    ProjectManager, SearchMode, SqliteStore, VectorStore,
};

fn doc(id: &str, content: &str) -> DocumentInput {
    DocumentInput {
        id: id.to_string(),
        name: id.to_string(),
        content: content.to_string(),
        metadata: Metadata::new(),
    }
}

fn base_config(dir: &std::path::Path) -> KnowledgeConfig {
    KnowledgeConfig {
        knowledge_dirs: vec![dir.join("kb")],
        cache_file: dir.join("cache.json"),
        auto_warm: false,
        ..KnowledgeConfig::default()
    }
}

/// Scenario: create a project, ingest three documents, query, delete.
#[test]
fn test_create_ingest_query_delete() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ProjectManager::new(dir.path().join("projects.db"), 16).unwrap());
    let project = manager.create("P1", "", "all-MiniLM-L6-v2", None).unwrap();
    let project_id = project.project_id.clone();
    let collection_name = project.collection_name.clone();

    let kb = KnowledgeBase::open(
        base_config(dir.path()),
        project,
        &manager,
        Arc::new(HealthMonitor::new()),
    )
    .unwrap();

    kb.ingest_documents(&[
        doc("d1", "Python programming language"),
        doc("d2", "JavaScript web"),
        doc("d3", "Machine learning data"),
    ])
    .unwrap();

    let hits = kb
        .query("machine learning", Some(SearchMode::Hybrid), 2, None, true)
        .unwrap();
    assert_eq!(hits[0].id, "d3");

    assert!(manager.delete(&project_id).unwrap());
    assert!(manager.get(&project_id).unwrap().is_none());
    assert!(manager.store().unwrap().collection(&collection_name).is_err());
}

/// Scenario: hybrid search must surface exact lexical matches that pure
/// vector search may miss.
#[test]
fn test_hybrid_vs_pure_modes() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ProjectManager::new(dir.path().join("projects.db"), 16).unwrap());
    let project = manager.create("modes", "", "all-MiniLM-L6-v2", None).unwrap();
    let kb = KnowledgeBase::open(
        base_config(dir.path()),
        project,
        &manager,
        Arc::new(HealthMonitor::new()),
    )
    .unwrap();

    kb.ingest_documents(&[
        doc("d1", "python programming language"),
        doc("d2", "javascript web"),
        doc("d3", "machine learning data"),
    ])
    .unwrap();

    let keyword = kb
        .query("python", Some(SearchMode::Keyword), 5, None, false)
        .unwrap();
    assert_eq!(keyword[0].id, "d1");

    // Vector mode may or may not surface d1 for unrelated phrasing; hybrid
    // with an exact lexical hit must put it first.
    let hybrid = kb
        .query("python", Some(SearchMode::Hybrid), 5, Some(0.5), false)
        .unwrap();
    assert_eq!(hybrid[0].id, "d1");
}

/// Scenario: a source file modified after the snapshot was written forces a
/// rebuild on the next open, and the updated content is observed.
#[test]
fn test_stale_snapshot_triggers_rebuild_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let kb_dir = dir.path().join("kb");
    std::fs::create_dir_all(&kb_dir).unwrap();
    let source = kb_dir.join("notes.md");
    std::fs::write(&source, "original zanzibar content").unwrap();

    let manager = Arc::new(ProjectManager::new(dir.path().join("projects.db"), 16).unwrap());
    let monitor = Arc::new(HealthMonitor::new());

    let project = manager.create("stale", "", "all-MiniLM-L6-v2", None).unwrap();
    {
        let kb = KnowledgeBase::open(
            base_config(dir.path()),
            project.clone(),
            &manager,
            Arc::clone(&monitor),
        )
        .unwrap();
        kb.ingest_all().unwrap();
        let hits = kb
            .query("zanzibar", Some(SearchMode::Keyword), 5, None, false)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    // Touch the source forward in time and change its content.
    std::fs::write(&source, "replacement quixotic content").unwrap();
    let file = std::fs::File::options().append(true).open(&source).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(120)).unwrap();

    let kb = KnowledgeBase::open(base_config(dir.path()), project, &manager, monitor).unwrap();
    kb.ingest_all().unwrap();

    let stale = kb
        .query("zanzibar", Some(SearchMode::Keyword), 5, None, false)
        .unwrap();
    assert!(stale.is_empty(), "old content must be gone after rebuild");
    let fresh = kb
        .query("quixotic", Some(SearchMode::Keyword), 5, None, false)
        .unwrap();
    assert_eq!(fresh.len(), 1);
}

/// Scenario: a legacy binary snapshot is refused without surfacing an
/// error; the index is rebuilt and the snapshot rewritten as JSON.
#[test]
fn test_legacy_binary_snapshot_refused() {
    let dir = tempfile::tempdir().unwrap();
    let kb_dir = dir.path().join("kb");
    std::fs::create_dir_all(&kb_dir).unwrap();
    std::fs::write(kb_dir.join("a.md"), "some markdown body").unwrap();

    let cache = dir.path().join("cache.json");
    std::fs::write(&cache, b"\x80\x04\x95\x1a\x00\x00\x00").unwrap();
    let file = std::fs::File::options().append(true).open(&cache).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(120)).unwrap();

    let manager = Arc::new(ProjectManager::new(dir.path().join("projects.db"), 16).unwrap());
    let project = manager.create("legacy", "", "all-MiniLM-L6-v2", None).unwrap();
    let kb = KnowledgeBase::open(
        base_config(dir.path()),
        project,
        &manager,
        Arc::new(HealthMonitor::new()),
    )
    .unwrap();

    kb.ingest_all().unwrap();
    let hits = kb
        .query("markdown", Some(SearchMode::Keyword), 5, None, false)
        .unwrap();
    assert_eq!(hits.len(), 1);

    let rewritten = std::fs::read_to_string(&cache).unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&rewritten).is_ok());
}

/// Law: re-ingesting the same documents after a forced rebuild leaves the
/// same document set and index.
#[test]
fn test_reingest_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let kb_dir = dir.path().join("kb");
    std::fs::create_dir_all(&kb_dir).unwrap();
    std::fs::write(kb_dir.join("a.md"), "alpha beta gamma").unwrap();
    std::fs::write(kb_dir.join("b.md"), "delta epsilon").unwrap();

    let manager = Arc::new(ProjectManager::new(dir.path().join("projects.db"), 16).unwrap());
    let project = manager.create("idem", "", "all-MiniLM-L6-v2", None).unwrap();
    let kb = KnowledgeBase::open(
        base_config(dir.path()),
        project,
        &manager,
        Arc::new(HealthMonitor::new()),
    )
    .unwrap();

    kb.ingest_all().unwrap();
    let first = kb.get_stats();

    kb.rebuild_index().unwrap();
    kb.ingest_all().unwrap();
    let second = kb.get_stats();

    assert_eq!(first.documents, second.documents);
    assert_eq!(first.terms, second.terms);
    assert_eq!(first.backend_documents, second.backend_documents);
}

/// Law: export then import yields a project with the same document set.
#[test]
fn test_export_import_document_set_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ProjectManager::new(dir.path().join("projects.db"), 16).unwrap());
    let project = manager.create("exporter", "", "all-MiniLM-L6-v2", None).unwrap();
    let kb = KnowledgeBase::open(
        base_config(dir.path()),
        project.clone(),
        &manager,
        Arc::new(HealthMonitor::new()),
    )
    .unwrap();
    kb.ingest_documents(&[
        doc("d1", "first body"),
        doc("d2", "second body"),
        doc("d3", "third body"),
    ])
    .unwrap();

    let bundle = dir.path().join("export.json");
    manager.export_project(&project.project_id, &bundle).unwrap();
    let imported = manager.import_project(&bundle, Some("importer"), false).unwrap();

    let source = manager.collection(&project.project_id).unwrap().unwrap();
    let copy = manager.collection(&imported.project_id).unwrap().unwrap();
    assert_eq!(source.count().unwrap(), copy.count().unwrap());

    let mut source_ids: Vec<String> =
        source.get(&[]).unwrap().into_iter().map(|r| r.id).collect();
    let mut copy_ids: Vec<String> = copy.get(&[]).unwrap().into_iter().map(|r| r.id).collect();
    source_ids.sort();
    copy_ids.sort();
    assert_eq!(source_ids, copy_ids);
}

/// Law: names become reusable after deletion.
#[test]
fn test_name_reuse_after_delete() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ProjectManager::new(dir.path().join("projects.db"), 16).unwrap();
    let first = manager.create("reuse", "", "all-MiniLM-L6-v2", None).unwrap();
    assert!(manager.delete(&first.project_id).unwrap());
    let second = manager.create("reuse", "", "all-MiniLM-L6-v2", None).unwrap();
    assert_ne!(first.project_id, second.project_id);
}

/// The whole flow also works on the SQL store realization.
#[test]
fn test_end_to_end_on_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let vectors = dir.path().join("vectors.db");
    let manager = Arc::new(
        ProjectManager::with_store_factory(dir.path().join("projects.db"), 16, move || {
            Ok(Arc::new(SqliteStore::open(&vectors)?) as Arc<dyn VectorStore>)
        })
        .unwrap(),
    );

    let project = manager.create("sql", "", "all-MiniLM-L6-v2", None).unwrap();
    let kb = KnowledgeBase::open(
        base_config(dir.path()),
        project.clone(),
        &manager,
        Arc::new(HealthMonitor::new()),
    )
    .unwrap();

    kb.ingest_documents(&[
        doc("d1", "python programming language"),
        doc("d2", "javascript web"),
        doc("d3", "machine learning data"),
    ])
    .unwrap();

    let hits = kb
        .query("machine learning", Some(SearchMode::Hybrid), 2, None, true)
        .unwrap();
    assert_eq!(hits[0].id, "d3");

    let name = Project::collection_name_for(&project.project_id);
    assert!(manager.delete(&project.project_id).unwrap());
    assert!(manager.store().unwrap().collection(&name).is_err());
}
