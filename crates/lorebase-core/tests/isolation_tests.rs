//! Cross-project isolation guarantees: data, collections, and caches.

use std::sync::Arc;

use lorebase_core::{
    DocumentInput, HealthMonitor, KnowledgeBase, KnowledgeConfig, Metadata, ProjectManager,
    SearchMode,
};

fn open_kb(
    dir: &std::path::Path,
    manager: &Arc<ProjectManager>,
    name: &str,
) -> KnowledgeBase {
    let project = manager.create(name, "", "all-MiniLM-L6-v2", None).unwrap();
    let config = KnowledgeConfig {
        knowledge_dirs: vec![dir.join(format!("{name}-kb"))],
        cache_file: dir.join(format!("{name}-cache.json")),
        auto_warm: false,
        ..KnowledgeConfig::default()
    };
    KnowledgeBase::open(config, project, manager, Arc::new(HealthMonitor::new())).unwrap()
}

fn doc(id: &str, content: &str) -> DocumentInput {
    DocumentInput {
        id: id.to_string(),
        name: id.to_string(),
        content: content.to_string(),
        metadata: Metadata::new(),
    }
}

/// Two projects each holding a document with the same id but different
/// content: queries against one project never surface the other's data.
#[test]
fn test_same_id_different_projects() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ProjectManager::new(dir.path().join("projects.db"), 16).unwrap());

    let kb_a = open_kb(dir.path(), &manager, "alpha");
    let kb_b = open_kb(dir.path(), &manager, "beta");

    kb_a.ingest_documents(&[doc("doc1", "zephyrine turbine manual")]).unwrap();
    kb_b.ingest_documents(&[doc("doc1", "completely unrelated cooking notes")])
        .unwrap();

    // A's unique term resolves in A...
    let hits = kb_a
        .query("zephyrine", Some(SearchMode::Keyword), 10, None, false)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "doc1");

    // ...and is invisible in B.
    let hits = kb_b
        .query("zephyrine", Some(SearchMode::Keyword), 10, None, false)
        .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn test_vector_results_never_cross_projects() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ProjectManager::new(dir.path().join("projects.db"), 16).unwrap());

    let kb_a = open_kb(dir.path(), &manager, "a");
    let kb_b = open_kb(dir.path(), &manager, "b");

    kb_a.ingest_documents(&[doc("a-doc", "alpha only content")]).unwrap();
    kb_b.ingest_documents(&[doc("b-doc", "beta only content")]).unwrap();

    for query in ["alpha only content", "beta only content", "content"] {
        let hits_a = kb_a.query(query, Some(SearchMode::Vector), 10, None, false).unwrap();
        assert!(hits_a.iter().all(|h| h.id == "a-doc"));

        let hits_b = kb_b.query(query, Some(SearchMode::Vector), 10, None, false).unwrap();
        assert!(hits_b.iter().all(|h| h.id == "b-doc"));
    }
}

#[test]
fn test_cache_entries_do_not_leak() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ProjectManager::new(dir.path().join("projects.db"), 16).unwrap());

    let a = manager.create("cache-a", "", "all-MiniLM-L6-v2", None).unwrap();
    let b = manager.create("cache-b", "", "all-MiniLM-L6-v2", None).unwrap();

    let cache_a = manager.project_cache(&a.project_id).unwrap().unwrap();
    let cache_b = manager.project_cache(&b.project_id).unwrap().unwrap();

    cache_a.put("shared-looking-key".to_string(), Vec::new());
    assert!(cache_a.get(&"shared-looking-key".to_string()).is_some());
    assert!(cache_b.get(&"shared-looking-key".to_string()).is_none());
}

/// Deleting one project leaves the other's data and caches intact.
#[test]
fn test_delete_does_not_affect_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ProjectManager::new(dir.path().join("projects.db"), 16).unwrap());

    let kb_a = open_kb(dir.path(), &manager, "keep");
    let kb_b = open_kb(dir.path(), &manager, "drop");

    kb_a.ingest_documents(&[doc("d", "survivor data")]).unwrap();
    kb_b.ingest_documents(&[doc("d", "doomed data")]).unwrap();

    let drop_id = kb_b.project().project_id.clone();
    assert!(manager.delete(&drop_id).unwrap());

    // Sibling still queries fine.
    let hits = kb_a
        .query("survivor", Some(SearchMode::Keyword), 5, None, false)
        .unwrap();
    assert_eq!(hits.len(), 1);

    // Dropped project is gone from metadata and backend.
    assert!(manager.get(&drop_id).unwrap().is_none());
    let store = manager.store().unwrap();
    assert!(store
        .collection(&lorebase_core::Project::collection_name_for(&drop_id))
        .is_err());
}
