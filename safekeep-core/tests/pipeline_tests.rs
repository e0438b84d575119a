/*!
End-to-end tests for the safekeep pipeline.
These tests drive backups and restores against a real SQLite live store and
a JSON-file catalog, the way a deployment runs them.
*/

#![cfg(feature = "sqlite")]

use rusqlite::Connection;
use safekeep_core::{
    BackupError, BackupFilter, BackupOptions, BackupOrchestrator, BackupRecord, BackupType,
    Catalog, ErrorKind, JsonFileCatalog, KeyProvider, OperationOutcome, PipelineConfig,
    RecordStatus, RestoreOptions, RestoreOrchestrator,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const SECRET: &str = "correct horse battery staple";

struct Deployment {
    _root: TempDir,
    settings: PipelineConfig,
    catalog: Arc<JsonFileCatalog>,
    backups: Arc<BackupOrchestrator>,
    restores: RestoreOrchestrator,
}

async fn deployment() -> Deployment {
    let root = TempDir::new().unwrap();
    let settings = PipelineConfig::with_root(root.path());
    std::fs::create_dir_all(settings.database_path.parent().unwrap()).unwrap();
    seed_store(&settings.database_path);

    let catalog = Arc::new(JsonFileCatalog::open(&settings.catalog_path).await.unwrap());
    catalog.add_admin("admin-1").await.unwrap();
    let backups = Arc::new(BackupOrchestrator::new(
        settings.clone(),
        catalog.clone(),
        KeyProvider::from_secret(SECRET),
    ));
    let restores = RestoreOrchestrator::new(backups.clone());

    Deployment {
        _root: root,
        settings,
        catalog,
        backups,
        restores,
    }
}

fn seed_store(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE "Student" (id TEXT PRIMARY KEY, name TEXT, "updatedAt" INTEGER);
        CREATE TABLE "FeePayment" (id INTEGER PRIMARY KEY, student TEXT, amount INTEGER);
        INSERT INTO "Student" VALUES ('s1', 'Asha', 1577836800000);
        INSERT INTO "Student" VALUES ('s2', 'Ravi', 1577836800000);
        INSERT INTO "FeePayment" VALUES (1, 's1', 12000);
        "#,
    )
    .unwrap();
}

fn student_names(path: &Path) -> Vec<String> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare(r#"SELECT name FROM "Student" ORDER BY id"#)
        .unwrap();
    stmt.query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap()
}

fn add_student(path: &Path, id: &str, name: &str, updated_at_ms: i64) {
    let conn = Connection::open(path).unwrap();
    conn.execute(
        r#"INSERT INTO "Student" VALUES (?1, ?2, ?3)"#,
        rusqlite::params![id, name, updated_at_ms],
    )
    .unwrap();
}

async fn full_backup(d: &Deployment, options: BackupOptions) -> BackupRecord {
    d.backups
        .create_backup(BackupType::Full, "admin-1", None, options)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_encrypted_backup_restores_into_empty_store() {
    let d = deployment().await;
    let record = full_backup(&d, BackupOptions::new().encrypt(true).compress(true)).await;

    assert_eq!(record.status, RecordStatus::Completed);
    assert!(record.is_encrypted && record.is_compressed);
    assert_eq!(record.record_count, 3);
    let path = record.file_path.clone().unwrap();
    assert!(path.to_string_lossy().ends_with(".db.gz.encrypted"));
    assert!(path.exists());

    std::fs::remove_file(&d.settings.database_path).unwrap();
    d.restores
        .restore_from_backup(&record.id, "admin-1", RestoreOptions::default())
        .await
        .unwrap();

    assert_eq!(student_names(&d.settings.database_path), vec!["Asha", "Ravi"]);
}

#[tokio::test]
async fn test_restore_with_deleted_artifact_fails() {
    let d = deployment().await;
    let record = full_backup(&d, BackupOptions::new()).await;
    std::fs::remove_file(record.file_path.as_ref().unwrap()).unwrap();

    let result = d
        .restores
        .restore_from_backup(&record.id, "admin-1", RestoreOptions::default())
        .await;
    let outcome = OperationOutcome::from_result(&result, "Restore completed");
    assert!(!outcome.success);
    assert!(outcome.message.contains("not found"));
    assert!(matches!(result, Err(BackupError::ArtifactMissing(_))));

    let restores = d.catalog.list_restores().await.unwrap();
    assert_eq!(restores.len(), 1);
    assert_eq!(restores[0].status, RecordStatus::Failed);
}

#[tokio::test]
async fn test_safety_backup_created_before_overwrite() {
    let d = deployment().await;
    let record = full_backup(&d, BackupOptions::new()).await;
    add_student(&d.settings.database_path, "s3", "Meera", 1577836800000);

    let restore = d
        .restores
        .restore_from_backup(&record.id, "admin-1", RestoreOptions::default())
        .await
        .unwrap();

    let manual = d
        .backups
        .list_backups(&BackupFilter {
            backup_type: Some(BackupType::Manual),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(manual.len(), 1);
    assert_eq!(manual[0].name, "Pre-Restore Safety Backup");
    assert_eq!(restore.pre_restore_backup_id.as_deref(), Some(manual[0].id.as_str()));
    assert!(manual[0].completed_at.unwrap() <= restore.completed_at.unwrap());

    // Live store is back to the backup; the safety backup still holds Meera
    assert_eq!(student_names(&d.settings.database_path), vec!["Asha", "Ravi"]);
    d.restores
        .restore_from_backup(&manual[0].id, "admin-1", RestoreOptions::without_safety_backup())
        .await
        .unwrap();
    assert_eq!(
        student_names(&d.settings.database_path),
        vec!["Asha", "Ravi", "Meera"]
    );
}

#[tokio::test]
async fn test_corrupted_artifact_is_rejected_and_store_unchanged() {
    let d = deployment().await;
    let record = full_backup(&d, BackupOptions::new().encrypt(true)).await;
    add_student(&d.settings.database_path, "s3", "Meera", 1577836800000);
    let before = std::fs::read(&d.settings.database_path).unwrap();

    let path = record.file_path.clone().unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x40;
    std::fs::write(&path, bytes).unwrap();

    let err = d
        .restores
        .restore_from_backup(&record.id, "admin-1", RestoreOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    assert_eq!(std::fs::read(&d.settings.database_path).unwrap(), before);
    assert_eq!(
        d.backups
            .verify_backup(&record.id)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::ChecksumMismatch
    );
}

#[tokio::test]
async fn test_incremental_backup_exports_changed_rows() {
    let d = deployment().await;
    full_backup(&d, BackupOptions::new()).await;

    let future_ms = chrono::Utc::now().timestamp_millis() + 60_000;
    add_student(&d.settings.database_path, "s3", "Meera", future_ms);

    let record = d
        .backups
        .create_backup(
            BackupType::Incremental,
            "admin-1",
            None,
            BackupOptions::new().compress(false),
        )
        .await
        .unwrap();

    let path = record.file_path.clone().unwrap();
    assert!(path.to_string_lossy().ends_with(".json"));
    let document: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

    // Student has an update column: only the new row; FeePayment has none: all rows
    let students = document["Student"].as_array().unwrap();
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["name"], "Meera");
    assert_eq!(document["FeePayment"].as_array().unwrap().len(), 1);
    assert_eq!(record.record_count, 2);
}

#[tokio::test]
async fn test_catalog_survives_reopen() {
    let d = deployment().await;
    let record = full_backup(&d, BackupOptions::new()).await;

    let reopened = Arc::new(JsonFileCatalog::open(&d.settings.catalog_path).await.unwrap());
    let backups = BackupOrchestrator::new(
        d.settings.clone(),
        reopened.clone(),
        KeyProvider::from_secret(SECRET),
    );

    let stored = backups.get_backup(&record.id).await.unwrap();
    assert_eq!(stored.status, RecordStatus::Completed);
    assert_eq!(stored.checksum, record.checksum);
    assert_eq!(stored.file_path, record.file_path);
    assert_eq!(stored.completed_at, record.completed_at);
    backups.verify_backup(&record.id).await.unwrap();
    assert_eq!(reopened.first_admin().await.unwrap().as_deref(), Some("admin-1"));
    let stats = backups.get_stats().await.unwrap();
    assert_eq!(stats.completed_backups, 1);
    assert_eq!(stats.last_backup.unwrap().id, record.id);
}

#[tokio::test]
async fn test_records_never_stay_in_progress() {
    let d = deployment().await;
    full_backup(&d, BackupOptions::new()).await;

    let keyless = BackupOrchestrator::new(
        d.settings.clone(),
        d.catalog.clone(),
        KeyProvider::empty(),
    );
    assert!(keyless
        .create_backup(
            BackupType::Full,
            "admin-1",
            None,
            BackupOptions::new().encrypt(true)
        )
        .await
        .is_err());

    let records = d.catalog.list_backups().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status.is_terminal()));
}
