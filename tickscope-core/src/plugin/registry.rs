//! Stored plugins.
//!
//! Uploaded manifests are written to `<plugins dir>/<sha256>.json` and
//! indexed in the `plugins` table. Identical bytes are never validated twice:
//! a re-upload returns the record stored for that hash, valid or not.

use super::manifest::{validate, CompiledPlugin, ExprTransform};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{content_hash, PluginRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Length of the hash prefix used to name unidentifiable uploads.
const INVALID_ID_PREFIX_LEN: usize = 12;

pub struct PluginRegistry {
    dir: PathBuf,
    db: Arc<Database>,
    compiled: Mutex<HashMap<String, Arc<CompiledPlugin>>>,
}

impl PluginRegistry {
    pub fn new(dir: impl Into<PathBuf>, db: Arc<Database>) -> Self {
        Self {
            dir: dir.into(),
            db,
            compiled: Mutex::new(HashMap::new()),
        }
    }

    fn compiled(&self) -> MutexGuard<'_, HashMap<String, Arc<CompiledPlugin>>> {
        self.compiled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Compile every valid stored plugin. Returns how many are runnable.
    ///
    /// A stored plugin whose file is gone or no longer compiles is logged and
    /// left out; its record stays so listings still show it.
    pub fn restore(&self) -> Result<usize> {
        let mut runnable = 0;
        for record in self.db.list_plugins()?.into_iter().filter(|r| r.valid) {
            match self.load_compiled(&record) {
                Ok(_) => runnable += 1,
                Err(e) => {
                    tracing::warn!(plugin_id = %record.id, error = %e, "Stored plugin failed to load")
                }
            }
        }
        tracing::info!(runnable, "Restored plugins");
        Ok(runnable)
    }

    /// Store and validate an uploaded manifest.
    ///
    /// Always returns the stored record; check `valid` and
    /// `validation_error` for the outcome.
    pub fn upload(&self, bytes: &[u8]) -> Result<PluginRecord> {
        let hash = content_hash(bytes);
        if let Some(existing) = self
            .db
            .list_plugins()?
            .into_iter()
            .find(|p| p.content_hash == hash)
        {
            tracing::debug!(plugin_id = %existing.id, "Plugin upload matched stored content");
            return Ok(existing);
        }

        std::fs::create_dir_all(&self.dir)?;
        let file_name = format!("{}.json", hash);
        let path = self.dir.join(&file_name);
        if !path.exists() {
            std::fs::write(&path, bytes)?;
        }

        let outcome = validate(bytes);
        let record = match &outcome {
            Ok(plugin) => PluginRecord {
                id: plugin.id.clone(),
                name: plugin.name.clone(),
                min_inputs: plugin.min_inputs,
                max_inputs: plugin.max_inputs,
                output_keys: plugin.output_keys().to_vec(),
                content_hash: hash.clone(),
                file_name: file_name.clone(),
                valid: true,
                validation_error: None,
                created_at: Utc::now(),
            },
            Err(message) => {
                let (id, name) = identity_hint(bytes)
                    .unwrap_or_else(|| (format!("invalid-{}", &hash[..INVALID_ID_PREFIX_LEN]), String::new()));
                PluginRecord {
                    name: if name.is_empty() { id.clone() } else { name },
                    id,
                    min_inputs: 0,
                    max_inputs: 0,
                    output_keys: Vec::new(),
                    content_hash: hash.clone(),
                    file_name: file_name.clone(),
                    valid: false,
                    validation_error: Some(message.clone()),
                    created_at: Utc::now(),
                }
            }
        };

        let replaced = self.db.get_plugin(&record.id)?;
        self.db.upsert_plugin(&record)?;
        if let Some(old) = replaced.filter(|old| old.file_name != record.file_name) {
            self.remove_file_if_unreferenced(&old.file_name)?;
        }

        let mut compiled = self.compiled();
        match outcome {
            Ok(plugin) => {
                compiled.insert(record.id.clone(), Arc::new(plugin));
                tracing::info!(plugin_id = %record.id, outputs = record.output_keys.len(), "Plugin accepted");
            }
            Err(ref message) => {
                compiled.remove(&record.id);
                tracing::warn!(plugin_id = %record.id, error = %message, "Plugin rejected");
            }
        }
        Ok(record)
    }

    pub fn list(&self) -> Result<Vec<PluginRecord>> {
        self.db.list_plugins()
    }

    pub fn get(&self, id: &str) -> Result<PluginRecord> {
        self.db
            .get_plugin(id)?
            .ok_or_else(|| Error::PluginNotFound(id.to_string()))
    }

    /// The uploaded manifest text.
    pub fn source(&self, id: &str) -> Result<String> {
        let record = self.get(id)?;
        Ok(std::fs::read_to_string(self.dir.join(&record.file_name))?)
    }

    /// Remove a plugin. The file goes too unless another id still uses it.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let Some(record) = self.db.get_plugin(id)? else {
            return Ok(false);
        };
        self.db.delete_plugin(id)?;
        self.compiled().remove(id);
        self.remove_file_if_unreferenced(&record.file_name)?;
        tracing::info!(plugin_id = %id, "Plugin deleted");
        Ok(true)
    }

    fn remove_file_if_unreferenced(&self, file_name: &str) -> Result<()> {
        if self.db.count_plugins_with_file(file_name)? > 0 {
            return Ok(());
        }
        match std::fs::remove_file(self.dir.join(file_name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// A fresh transform for a job with `inputs` inputs.
    ///
    /// Invalid plugins fail with their stored validation error.
    pub fn instantiate(&self, id: &str, inputs: usize) -> Result<ExprTransform> {
        let record = self.get(id)?;
        if !record.valid {
            return Err(Error::PluginInvalid {
                id: record.id,
                message: record
                    .validation_error
                    .unwrap_or_else(|| "plugin failed validation".to_string()),
            });
        }
        let plugin = self.load_compiled(&record)?;
        if !plugin.accepts_inputs(inputs) {
            return Err(Error::InvalidRequest(format!(
                "plugin {} takes {} to {} inputs, got {}",
                id, plugin.min_inputs, plugin.max_inputs, inputs
            )));
        }
        Ok(plugin.instantiate(inputs))
    }

    fn load_compiled(&self, record: &PluginRecord) -> Result<Arc<CompiledPlugin>> {
        if let Some(plugin) = self.compiled().get(&record.id) {
            return Ok(Arc::clone(plugin));
        }
        let bytes = std::fs::read(self.dir.join(&record.file_name))?;
        let plugin = validate(&bytes).map_err(|message| Error::PluginInvalid {
            id: record.id.clone(),
            message,
        })?;
        let plugin = Arc::new(plugin);
        self.compiled()
            .insert(record.id.clone(), Arc::clone(&plugin));
        Ok(plugin)
    }
}

/// Best-effort `(id, name)` from a manifest that failed validation.
fn identity_hint(bytes: &[u8]) -> Option<(String, String)> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    let id = value.get("id")?.as_str()?.trim();
    if id.is_empty() {
        return None;
    }
    let name = value
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();
    Some((id.to_string(), name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &[u8] =
        br#"{"id":"delta","name":"Delta","min_inputs":2,"outputs":[{"key":"d","expr":"in1 - in0"}]}"#;

    fn registry() -> (tempfile::TempDir, PluginRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let registry = PluginRegistry::new(dir.path().join("plugins"), Arc::new(db));
        (dir, registry)
    }

    #[test]
    fn test_upload_dedups_by_content() {
        let (_dir, registry) = registry();
        let first = registry.upload(DIFF).unwrap();
        assert!(first.valid);
        assert_eq!(first.output_keys, vec!["d"]);

        let again = registry.upload(DIFF).unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.content_hash, first.content_hash);
        assert_eq!(registry.list().unwrap().len(), 1);
        assert!(registry.dir().join(&first.file_name).exists());
    }

    #[test]
    fn test_invalid_plugin_recorded_and_rejected_at_run_time() {
        let (_dir, registry) = registry();
        let bad = br#"{"id":"boom","name":"Boom","outputs":[{"key":"x","expr":"in0 / 0"}]}"#;
        let record = registry.upload(bad).unwrap();
        assert!(!record.valid);
        assert_eq!(record.id, "boom");

        match registry.instantiate("boom", 1) {
            Err(Error::PluginInvalid { message, .. }) => {
                assert_eq!(Some(message), record.validation_error)
            }
            other => panic!("expected invalid plugin error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_unidentifiable_upload_named_by_hash() {
        let (_dir, registry) = registry();
        let record = registry.upload(b"{not json").unwrap();
        assert!(record.id.starts_with("invalid-"));
        assert_eq!(record.id.len(), "invalid-".len() + INVALID_ID_PREFIX_LEN);
        assert!(record.validation_error.unwrap().contains("not valid JSON"));
    }

    #[test]
    fn test_delete_keeps_shared_file() {
        let (_dir, registry) = registry();
        let record = registry.upload(DIFF).unwrap();

        // Second id pointing at the same file
        let mut alias = record.clone();
        alias.id = "alias".to_string();
        registry.db.upsert_plugin(&alias).unwrap();

        assert!(registry.delete("delta").unwrap());
        assert!(registry.dir().join(&record.file_name).exists());
        assert!(registry.delete("alias").unwrap());
        assert!(!registry.dir().join(&record.file_name).exists());
        assert!(!registry.delete("alias").unwrap());
    }

    #[test]
    fn test_instantiate_checks_arity() {
        let (_dir, registry) = registry();
        registry.upload(DIFF).unwrap();
        assert!(registry.instantiate("delta", 2).is_ok());
        assert!(matches!(
            registry.instantiate("delta", 3),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            registry.instantiate("missing", 2),
            Err(Error::PluginNotFound(_))
        ));
    }
}
