//! Database repository layer
//!
//! Provides query and insert operations for persisted capture sources,
//! uploads, and plugins.

use crate::error::{Error, Result};
use crate::types::{CaptureSource, PluginRecord, SourceOrigin, StreamMode};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

/// One stored upload, keyed by content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRecord {
    pub content_hash: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub capture_id: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Database handle with connection
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    // ============================================
    // Capture source operations
    // ============================================

    /// Insert or update a capture source
    pub fn upsert_capture_source(&self, source: &CaptureSource) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO capture_sources
                (capture_id, locator, display_name, stream_mode, origin, poll_interval_ms, live, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(capture_id) DO UPDATE SET
                locator = excluded.locator,
                display_name = excluded.display_name,
                stream_mode = excluded.stream_mode,
                origin = excluded.origin,
                poll_interval_ms = excluded.poll_interval_ms,
                live = excluded.live
            "#,
            params![
                source.capture_id,
                source.locator,
                source.display_name,
                source.stream_mode.as_str(),
                source.origin.as_str(),
                source.poll_interval_ms.map(|ms| ms as i64),
                source.live,
                source.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a capture source by id
    pub fn get_capture_source(&self, capture_id: &str) -> Result<Option<CaptureSource>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM capture_sources WHERE capture_id = ?",
            [capture_id],
            Self::row_to_capture_source,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All capture sources, oldest first
    pub fn list_capture_sources(&self) -> Result<Vec<CaptureSource>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM capture_sources ORDER BY created_at, capture_id")?;
        let rows = stmt.query_map([], Self::row_to_capture_source)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Flip the re-arm flag of a capture source
    pub fn set_capture_live(&self, capture_id: &str, live: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE capture_sources SET live = ?1 WHERE capture_id = ?2",
            params![live, capture_id],
        )?;
        Ok(changed > 0)
    }

    /// Delete a capture source. Returns true if a row was removed.
    pub fn delete_capture_source(&self, capture_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM capture_sources WHERE capture_id = ?",
            [capture_id],
        )?;
        Ok(changed > 0)
    }

    /// Delete every capture source and upload record
    pub fn clear_captures(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            DELETE FROM capture_sources;
            DELETE FROM uploads;
            ",
        )?;
        Ok(())
    }

    fn row_to_capture_source(row: &Row) -> rusqlite::Result<CaptureSource> {
        let stream_mode: String = row.get("stream_mode")?;
        let origin: String = row.get("origin")?;
        let poll_interval_ms: Option<i64> = row.get("poll_interval_ms")?;
        let created_at_str: String = row.get("created_at")?;

        Ok(CaptureSource {
            capture_id: row.get("capture_id")?,
            locator: row.get("locator")?,
            display_name: row.get("display_name")?,
            stream_mode: stream_mode.parse().unwrap_or(StreamMode::Lite),
            origin: origin.parse().unwrap_or(SourceOrigin::File),
            poll_interval_ms: poll_interval_ms.map(|ms| ms.max(0) as u64),
            live: row.get("live")?,
            created_at: parse_timestamp(&created_at_str),
        })
    }

    // ============================================
    // Upload operations
    // ============================================

    /// Record an upload
    pub fn insert_upload(&self, upload: &UploadRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO uploads (content_hash, file_name, size_bytes, capture_id, uploaded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(content_hash) DO UPDATE SET
                file_name = excluded.file_name,
                capture_id = excluded.capture_id
            "#,
            params![
                upload.content_hash,
                upload.file_name,
                upload.size_bytes as i64,
                upload.capture_id,
                upload.uploaded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Find an upload by content hash
    pub fn get_upload(&self, content_hash: &str) -> Result<Option<UploadRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM uploads WHERE content_hash = ?",
            [content_hash],
            Self::row_to_upload,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Remove upload records pointing at a capture, returning them
    pub fn delete_uploads_for_capture(&self, capture_id: &str) -> Result<Vec<UploadRecord>> {
        let conn = self.conn.lock().unwrap();
        let removed = {
            let mut stmt = conn.prepare("SELECT * FROM uploads WHERE capture_id = ?")?;
            let rows = stmt.query_map([capture_id], Self::row_to_upload)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        conn.execute("DELETE FROM uploads WHERE capture_id = ?", [capture_id])?;
        Ok(removed)
    }

    fn row_to_upload(row: &Row) -> rusqlite::Result<UploadRecord> {
        let size: i64 = row.get("size_bytes")?;
        let uploaded_at_str: String = row.get("uploaded_at")?;
        Ok(UploadRecord {
            content_hash: row.get("content_hash")?,
            file_name: row.get("file_name")?,
            size_bytes: size.max(0) as u64,
            capture_id: row.get("capture_id")?,
            uploaded_at: parse_timestamp(&uploaded_at_str),
        })
    }

    // ============================================
    // Plugin operations
    // ============================================

    /// Insert or update a plugin record
    pub fn upsert_plugin(&self, plugin: &PluginRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO plugins
                (id, name, min_inputs, max_inputs, output_keys, content_hash, file_name,
                 valid, validation_error, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                min_inputs = excluded.min_inputs,
                max_inputs = excluded.max_inputs,
                output_keys = excluded.output_keys,
                content_hash = excluded.content_hash,
                file_name = excluded.file_name,
                valid = excluded.valid,
                validation_error = excluded.validation_error
            "#,
            params![
                plugin.id,
                plugin.name,
                plugin.min_inputs as i64,
                plugin.max_inputs as i64,
                serde_json::to_string(&plugin.output_keys)?,
                plugin.content_hash,
                plugin.file_name,
                plugin.valid,
                plugin.validation_error,
                plugin.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a plugin by id
    pub fn get_plugin(&self, id: &str) -> Result<Option<PluginRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM plugins WHERE id = ?",
            [id],
            Self::row_to_plugin,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All plugin records, by id
    pub fn list_plugins(&self) -> Result<Vec<PluginRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM plugins ORDER BY id")?;
        let rows = stmt.query_map([], Self::row_to_plugin)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Delete a plugin record. Returns true if a row was removed.
    pub fn delete_plugin(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM plugins WHERE id = ?", [id])?;
        Ok(changed > 0)
    }

    /// Number of plugin ids referencing a stored file
    pub fn count_plugins_with_file(&self, file_name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM plugins WHERE file_name = ?",
            [file_name],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    fn row_to_plugin(row: &Row) -> rusqlite::Result<PluginRecord> {
        let output_keys_str: String = row.get("output_keys")?;
        let min_inputs: i64 = row.get("min_inputs")?;
        let max_inputs: i64 = row.get("max_inputs")?;
        let created_at_str: String = row.get("created_at")?;

        Ok(PluginRecord {
            id: row.get("id")?,
            name: row.get("name")?,
            min_inputs: min_inputs.max(0) as usize,
            max_inputs: max_inputs.max(0) as usize,
            output_keys: serde_json::from_str(&output_keys_str).unwrap_or_default(),
            content_hash: row.get("content_hash")?,
            file_name: row.get("file_name")?,
            valid: row.get("valid")?,
            validation_error: row.get("validation_error")?,
            created_at: parse_timestamp(&created_at_str),
        })
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn create_test_plugin(id: &str, file_name: &str) -> PluginRecord {
        PluginRecord {
            id: id.to_string(),
            name: "Test".to_string(),
            min_inputs: 1,
            max_inputs: 2,
            output_keys: vec!["out".to_string()],
            content_hash: "abc".to_string(),
            file_name: file_name.to_string(),
            valid: true,
            validation_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_capture_source_crud() {
        let db = test_db();
        let mut source = CaptureSource::new("cap-1", "/tmp/run.jsonl", SourceOrigin::Live);
        source.stream_mode = StreamMode::Full;
        source.poll_interval_ms = Some(250);
        source.live = true;

        db.upsert_capture_source(&source).unwrap();
        let loaded = db.get_capture_source("cap-1").unwrap().unwrap();
        assert_eq!(loaded.locator, "/tmp/run.jsonl");
        assert_eq!(loaded.display_name, "run.jsonl");
        assert_eq!(loaded.stream_mode, StreamMode::Full);
        assert_eq!(loaded.origin, SourceOrigin::Live);
        assert_eq!(loaded.poll_interval_ms, Some(250));
        assert!(loaded.live);

        assert!(db.set_capture_live("cap-1", false).unwrap());
        assert!(!db.get_capture_source("cap-1").unwrap().unwrap().live);

        assert_eq!(db.list_capture_sources().unwrap().len(), 1);
        assert!(db.delete_capture_source("cap-1").unwrap());
        assert!(!db.delete_capture_source("cap-1").unwrap());
    }

    #[test]
    fn test_upload_dedup_index() {
        let db = test_db();
        let upload = UploadRecord {
            content_hash: "deadbeef".to_string(),
            file_name: "deadbeef.jsonl".to_string(),
            size_bytes: 42,
            capture_id: "cap-1".to_string(),
            uploaded_at: Utc::now(),
        };
        db.insert_upload(&upload).unwrap();

        let found = db.get_upload("deadbeef").unwrap().unwrap();
        assert_eq!(found.capture_id, "cap-1");
        assert_eq!(found.size_bytes, 42);

        let removed = db.delete_uploads_for_capture("cap-1").unwrap();
        assert_eq!(removed.len(), 1);
        assert!(db.get_upload("deadbeef").unwrap().is_none());
    }

    #[test]
    fn test_plugin_file_references() {
        let db = test_db();
        db.upsert_plugin(&create_test_plugin("a", "abc.json")).unwrap();
        db.upsert_plugin(&create_test_plugin("b", "abc.json")).unwrap();
        assert_eq!(db.count_plugins_with_file("abc.json").unwrap(), 2);

        assert!(db.delete_plugin("a").unwrap());
        assert_eq!(db.count_plugins_with_file("abc.json").unwrap(), 1);

        let b = db.get_plugin("b").unwrap().unwrap();
        assert_eq!(b.output_keys, vec!["out"]);
        assert_eq!(db.list_plugins().unwrap().len(), 1);
    }
}
