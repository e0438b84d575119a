/*!
Incremental exporter.

Serialises record collections from the live store into one JSON document
keyed by collection name. Rows are read through the [`RecordSource`] port so
the exporter does not depend on a particular database driver.

Collections that carry an update timestamp column (`updatedAt` or
`updated_at`) are exported as a true delta: only rows changed at or after
`since`. Collections without such a column are exported in full.
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::checksum::hash_file_async;
use crate::model::{artifact_file_name, BackupType};
use crate::{BackupError, Result};

/// Column names recognised as per-row update timestamps
pub const UPDATE_COLUMNS: [&str; 2] = ["updatedAt", "updated_at"];

/// Exported rows keyed by collection name
pub type RecordSet = BTreeMap<String, Vec<Value>>;

/// Read access to record collections in the live store
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Names of every known collection
    async fn collections(&self) -> Result<Vec<String>>;

    /// Rows of `collection` changed at or after `since`; all rows when
    /// `since` is `None` or the collection has no update timestamp
    async fn fetch_changed(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>>;

    /// Total rows across all collections
    async fn count_records(&self) -> Result<u64> {
        let mut total = 0u64;
        for collection in self.collections().await? {
            total += self.fetch_changed(&collection, None).await?.len() as u64;
        }
        Ok(total)
    }
}

/// In-memory export result
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedRecords {
    pub data: RecordSet,
    pub record_count: u64,
}

/// JSON export written to disk
#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub checksum: String,
    pub record_count: u64,
}

/// Exporter over a shared [`RecordSource`]
#[derive(Clone)]
pub struct IncrementalExporter {
    source: Arc<dyn RecordSource>,
}

impl IncrementalExporter {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self { source }
    }

    /// Collect rows changed since `since` from every collection
    ///
    /// A failing collection fails the whole export rather than producing a
    /// document with silent gaps.
    pub async fn export_changed_records(&self, since: DateTime<Utc>) -> Result<ExportedRecords> {
        let mut data = RecordSet::new();
        let mut record_count = 0u64;

        for collection in self.source.collections().await? {
            let rows = self
                .source
                .fetch_changed(&collection, Some(since))
                .await
                .map_err(|e| BackupError::source(format!("{collection}: {e}")))?;
            debug!(collection = %collection, rows = rows.len(), "Exported collection");
            record_count += rows.len() as u64;
            data.insert(collection, rows);
        }

        Ok(ExportedRecords { data, record_count })
    }

    /// Export and write the document as `backup-incremental-<ts>.json` in
    /// `destination_dir`
    pub async fn write_export<P: AsRef<Path>>(
        &self,
        destination_dir: P,
        since: DateTime<Utc>,
    ) -> Result<ExportArtifact> {
        let destination_dir = destination_dir.as_ref();
        let exported = self.export_changed_records(since).await?;

        tokio::fs::create_dir_all(destination_dir).await?;
        let file_path =
            destination_dir.join(artifact_file_name(BackupType::Incremental, Utc::now(), "json"));
        let document = serde_json::to_vec_pretty(&exported.data)?;
        tokio::fs::write(&file_path, &document).await?;

        let checksum = hash_file_async(file_path.clone()).await?;
        info!(
            path = %file_path.display(),
            record_count = exported.record_count,
            since = %since,
            "Incremental export written"
        );

        Ok(ExportArtifact {
            file_path,
            file_size: document.len() as u64,
            checksum,
            record_count: exported.record_count,
        })
    }

    /// Total row count of the underlying store
    pub async fn count_records(&self) -> Result<u64> {
        self.source.count_records().await
    }
}

fn has_update_column(row: &Value) -> bool {
    row.as_object()
        .is_some_and(|object| UPDATE_COLUMNS.iter().any(|c| object.contains_key(*c)))
}

/// Row timestamp from the first recognised update column, if any
///
/// A row whose update column is null or unparseable has no timestamp and is
/// left out of incremental exports.
fn row_updated_at(row: &Value) -> Option<DateTime<Utc>> {
    let object = row.as_object()?;
    UPDATE_COLUMNS.iter().find_map(|column| match object.get(*column)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    })
}

/// Record source backed by in-memory collections
#[derive(Debug, Default)]
pub struct MemoryRecordSource {
    collections: RwLock<RecordSet>,
}

impl MemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection, replacing any existing rows under that name
    pub fn with_collection<S: Into<String>>(self, name: S, rows: Vec<Value>) -> Self {
        if let Ok(mut collections) = self.collections.write() {
            collections.insert(name.into(), rows);
        }
        self
    }

    /// Append a row to `collection`, creating it if needed
    pub fn insert<S: Into<String>>(&self, collection: S, row: Value) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| BackupError::source("record source lock poisoned"))?;
        collections.entry(collection.into()).or_default().push(row);
        Ok(())
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn collections(&self) -> Result<Vec<String>> {
        let collections = self
            .collections
            .read()
            .map_err(|_| BackupError::source("record source lock poisoned"))?;
        Ok(collections.keys().cloned().collect())
    }

    async fn fetch_changed(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>> {
        let collections = self
            .collections
            .read()
            .map_err(|_| BackupError::source("record source lock poisoned"))?;
        let rows = collections
            .get(collection)
            .ok_or_else(|| BackupError::source(format!("unknown collection '{collection}'")))?;

        Ok(rows
            .iter()
            .filter(|row| match since {
                Some(since) if has_update_column(row) => {
                    row_updated_at(row).is_some_and(|updated| updated >= since)
                }
                _ => true,
            })
            .cloned()
            .collect())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRecordSource;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use chrono::SecondsFormat;
    use rusqlite::types::ValueRef;
    use rusqlite::{Connection, OpenFlags};
    use serde_json::Map;

    /// Record source reading tables of a SQLite store
    ///
    /// Each call opens a read-only connection on the blocking pool. SQLite
    /// internals and migration bookkeeping tables are skipped.
    #[derive(Debug, Clone)]
    pub struct SqliteRecordSource {
        database_path: PathBuf,
    }

    impl SqliteRecordSource {
        pub fn new<P: Into<PathBuf>>(database_path: P) -> Self {
            Self {
                database_path: database_path.into(),
            }
        }

        async fn with_connection<T, F>(&self, f: F) -> Result<T>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        {
            let path = self.database_path.clone();
            tokio::task::spawn_blocking(move || {
                if !path.exists() {
                    return Err(BackupError::SourceNotFound(path));
                }
                let conn = Connection::open_with_flags(
                    &path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|e| BackupError::source(format!("Failed to open store: {e}")))?;
                f(&conn).map_err(|e| BackupError::source(e.to_string()))
            })
            .await
            .map_err(|e| BackupError::source(format!("Export task failed: {e}")))?
        }
    }

    fn quote_ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_prisma%' \
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    fn update_column(conn: &Connection, table: &str) -> rusqlite::Result<Option<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(UPDATE_COLUMNS
            .iter()
            .find(|candidate| columns.iter().any(|c| c == *candidate))
            .map(|c| c.to_string()))
    }

    fn to_json(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::from(i),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::String(hex::encode(b)),
        }
    }

    fn collect_rows(
        stmt: &mut rusqlite::Statement<'_>,
        params: &[&dyn rusqlite::ToSql],
    ) -> rusqlite::Result<Vec<Value>> {
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut out = Vec::new();
        let mut rows = stmt.query(params)?;
        while let Some(row) = rows.next()? {
            let mut object = Map::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                object.insert(name.clone(), to_json(row.get_ref(i)?));
            }
            out.push(Value::Object(object));
        }
        Ok(out)
    }

    fn read_rows(
        conn: &Connection,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> rusqlite::Result<Vec<Value>> {
        let table_ident = quote_ident(table);
        let filter = match since {
            Some(since) => update_column(conn, table)?.map(|column| (column, since)),
            None => None,
        };

        match filter {
            Some((column, since)) => {
                // Prisma stores DateTime as epoch milliseconds; raw SQL often uses text
                // NULL or unparseable timestamps make the CASE NULL, so the row is skipped
                let column = quote_ident(&column);
                let sql = format!(
                    "SELECT * FROM {table_ident} WHERE CASE \
                     WHEN typeof({column}) IN ('integer', 'real') THEN {column} >= ?1 \
                     ELSE datetime({column}) >= datetime(?2) END"
                );
                let mut stmt = conn.prepare(&sql)?;
                let millis = since.timestamp_millis();
                let iso = since.to_rfc3339_opts(SecondsFormat::Secs, true);
                let params: [&dyn rusqlite::ToSql; 2] = [&millis, &iso];
                collect_rows(&mut stmt, &params)
            }
            None => {
                let mut stmt = conn.prepare(&format!("SELECT * FROM {table_ident}"))?;
                collect_rows(&mut stmt, &[])
            }
        }
    }

    #[async_trait]
    impl RecordSource for SqliteRecordSource {
        async fn collections(&self) -> Result<Vec<String>> {
            self.with_connection(list_tables).await
        }

        async fn fetch_changed(
            &self,
            collection: &str,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<Value>> {
            let table = collection.to_string();
            self.with_connection(move |conn| read_rows(conn, &table, since))
                .await
        }

        async fn count_records(&self) -> Result<u64> {
            self.with_connection(|conn| {
                let mut total = 0u64;
                for table in list_tables(conn)? {
                    let count: i64 = conn.query_row(
                        &format!("SELECT COUNT(*) FROM {}", quote_ident(&table)),
                        [],
                        |row| row.get(0),
                    )?;
                    total += count.max(0) as u64;
                }
                Ok(total)
            })
            .await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::TimeZone;
        use tempfile::TempDir;

        fn seed(path: &Path) {
            let conn = Connection::open(path).unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE "Student" (id TEXT PRIMARY KEY, name TEXT, "updatedAt" INTEGER);
                CREATE TABLE "Notice" (id INTEGER PRIMARY KEY, title TEXT, updated_at TEXT);
                CREATE TABLE "Setting" (key TEXT PRIMARY KEY, value BLOB);
                CREATE TABLE "_prisma_migrations" (id TEXT);
                INSERT INTO "Student" VALUES ('s1', 'Asha', 1704067200000);
                INSERT INTO "Student" VALUES ('s2', 'Ravi', 1706745600000);
                INSERT INTO "Notice" VALUES (1, 'Holiday', '2024-01-01 00:00:00');
                INSERT INTO "Notice" VALUES (2, 'Exams', '2024-02-01T00:00:00Z');
                INSERT INTO "Setting" VALUES ('logo', x'cafe');
                INSERT INTO "_prisma_migrations" VALUES ('m1');
                "#,
            )
            .unwrap();
        }

        #[tokio::test]
        async fn test_sqlite_collections_skip_internal_tables() {
            let temp_dir = TempDir::new().unwrap();
            let db = temp_dir.path().join("dev.db");
            seed(&db);

            let source = SqliteRecordSource::new(&db);
            let collections = source.collections().await.unwrap();
            assert_eq!(collections, vec!["Notice", "Setting", "Student"]);
            assert_eq!(source.count_records().await.unwrap(), 5);
        }

        #[tokio::test]
        async fn test_sqlite_delta_by_update_column() {
            let temp_dir = TempDir::new().unwrap();
            let db = temp_dir.path().join("dev.db");
            seed(&db);

            let source = SqliteRecordSource::new(&db);
            let since = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();

            let students = source.fetch_changed("Student", Some(since)).await.unwrap();
            assert_eq!(students.len(), 1);
            assert_eq!(students[0]["name"], "Ravi");

            let notices = source.fetch_changed("Notice", Some(since)).await.unwrap();
            assert_eq!(notices.len(), 1);
            assert_eq!(notices[0]["title"], "Exams");

            // No update column: full export
            let settings = source.fetch_changed("Setting", Some(since)).await.unwrap();
            assert_eq!(settings.len(), 1);
            assert_eq!(settings[0]["value"], "cafe");
        }

        #[tokio::test]
        async fn test_sqlite_delta_skips_rows_without_timestamp() {
            let temp_dir = TempDir::new().unwrap();
            let db = temp_dir.path().join("dev.db");
            seed(&db);
            let conn = Connection::open(&db).unwrap();
            conn.execute_batch(
                r#"
                INSERT INTO "Notice" VALUES (3, 'Draft', NULL);
                INSERT INTO "Notice" VALUES (4, 'Garbled', 'not a date');
                "#,
            )
            .unwrap();

            let source = SqliteRecordSource::new(&db);
            let since = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
            let notices = source.fetch_changed("Notice", Some(since)).await.unwrap();
            let titles: Vec<&str> = notices.iter().filter_map(|n| n["title"].as_str()).collect();
            assert_eq!(titles, vec!["Exams"]);

            assert_eq!(source.fetch_changed("Notice", None).await.unwrap().len(), 4);
        }

        #[tokio::test]
        async fn test_sqlite_missing_store() {
            let source = SqliteRecordSource::new("/nonexistent/dev.db");
            let err = source.collections().await.unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::SourceNotFound);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use tempfile::TempDir;

    fn school_source() -> MemoryRecordSource {
        MemoryRecordSource::new()
            .with_collection(
                "students",
                vec![
                    json!({"id": "s1", "name": "Asha", "updatedAt": "2024-01-01T00:00:00Z"}),
                    json!({"id": "s2", "name": "Ravi", "updatedAt": "2024-03-01T00:00:00Z"}),
                ],
            )
            .with_collection(
                "feePayments",
                vec![json!({"id": 1, "amount": 1200, "updated_at": 1709251200000i64})],
            )
            .with_collection("routes", vec![json!({"id": "r1", "stops": 12})])
    }

    #[tokio::test]
    async fn test_export_filters_by_update_timestamp() {
        let exporter = IncrementalExporter::new(Arc::new(school_source()));
        let since = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let exported = exporter.export_changed_records(since).await.unwrap();

        assert_eq!(exported.data["students"].len(), 1);
        assert_eq!(exported.data["students"][0]["name"], "Ravi");
        assert_eq!(exported.data["feePayments"].len(), 1);
        // Collections without an update column are exported in full
        assert_eq!(exported.data["routes"].len(), 1);
        assert_eq!(exported.record_count, 3);
    }

    #[tokio::test]
    async fn test_rows_without_timestamp_are_not_changed() {
        let source = MemoryRecordSource::new().with_collection(
            "notices",
            vec![
                json!({"id": 1, "updatedAt": "2024-03-01T00:00:00Z"}),
                json!({"id": 2, "updatedAt": null}),
                json!({"id": 3, "updatedAt": "not a date"}),
                json!({"id": 4, "updated_at": true}),
            ],
        );
        let since = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let changed = source.fetch_changed("notices", Some(since)).await.unwrap();
        assert_eq!(changed, vec![json!({"id": 1, "updatedAt": "2024-03-01T00:00:00Z"})]);

        // Without a cutoff every row is exported
        assert_eq!(source.fetch_changed("notices", None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_export_includes_every_collection_even_when_empty() {
        let exporter = IncrementalExporter::new(Arc::new(school_source()));
        let since = Utc::now() + Duration::days(1);

        let exported = exporter.export_changed_records(since).await.unwrap();

        assert_eq!(exported.data.len(), 3);
        assert!(exported.data["students"].is_empty());
        assert_eq!(exported.record_count, 1);
    }

    #[tokio::test]
    async fn test_write_export() {
        let temp_dir = TempDir::new().unwrap();
        let exporter = IncrementalExporter::new(Arc::new(school_source()));
        let since = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();

        let artifact = exporter
            .write_export(temp_dir.path().join("backups"), since)
            .await
            .unwrap();

        let name = artifact.file_path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("backup-incremental-"));
        assert!(name.ends_with(".json"));
        assert_eq!(artifact.record_count, 4);

        let written: RecordSet =
            serde_json::from_slice(&std::fs::read(&artifact.file_path).unwrap()).unwrap();
        assert_eq!(written["students"].len(), 2);
        assert_eq!(
            artifact.checksum,
            crate::checksum::hash_file(&artifact.file_path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_count_records() {
        let exporter = IncrementalExporter::new(Arc::new(school_source()));
        assert_eq!(exporter.count_records().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let source = MemoryRecordSource::new();
        assert!(source.fetch_changed("missing", None).await.is_err());
    }

    #[test]
    fn test_row_updated_at() {
        let row = json!({"updatedAt": "2024-01-01T00:00:00Z"});
        assert_eq!(
            row_updated_at(&row),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(row_updated_at(&json!({"id": 1})), None);
        assert_eq!(row_updated_at(&json!("scalar")), None);
    }
}
