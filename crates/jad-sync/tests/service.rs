use std::path::{Path, PathBuf};
use std::sync::Arc;

use jad_storage::MemoryStore;
use jad_sync::{AggregationReport, JadService, SyncConfig};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn service(reports_dir: &Path, store: &MemoryStore) -> JadService {
    let root = workspace_root();
    let config = SyncConfig::from_lookup(|key| match key {
        "JAD_WORKSPACE" => Some(root.display().to_string()),
        "JAD_REPORTS_DIR" => Some(reports_dir.display().to_string()),
        _ => None,
    });
    JadService::new(config, Arc::new(store.clone())).unwrap()
}

#[tokio::test]
async fn aggregate_once_writes_a_run_summary() {
    let dir = tempfile::tempdir().unwrap();
    let reports = dir.path().join("reports");
    let store = MemoryStore::new();

    let report = service(&reports, &store).aggregate_once().await.unwrap();
    assert_eq!(report.per_source["sample"].new_count, 2);

    let path = reports.join("runs").join(format!("{}.json", report.run_id));
    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(written["per_source"]["sample"]["new_count"], 2);
}

#[tokio::test]
async fn unwritable_reports_dir_still_returns_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("reports");
    std::fs::write(&blocker, "not a directory").unwrap();
    let store = MemoryStore::new();

    let report: AggregationReport = service(&blocker, &store).aggregate_once().await.unwrap();
    assert_eq!(report.per_source["sample"].new_count, 2);
    assert_eq!(report.per_source["sample"].malformed_count, 1);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn missing_registry_fails_before_any_source_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig::from_lookup(|key| match key {
        "JAD_WORKSPACE" => Some(dir.path().display().to_string()),
        _ => None,
    });
    let store = MemoryStore::new();
    let service = JadService::new(config, Arc::new(store.clone())).unwrap();

    assert!(service.aggregate_once().await.is_err());
    assert!(store.is_empty().await);
}
