//! JSON-file task store.
//!
//! Keeps the whole ledger as one pretty-printed JSON document, cached in
//! memory and rewritten on every mutation. Suited to small personal task
//! lists where inspecting the ledger with a text editor matters more
//! than write throughput; larger deployments use the SQLite store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::error::{EngineError, EngineResult};

use super::{
    matches_query, window_cutoff, TaskQuery, TaskRecord, TaskStatus, TaskStore, TaskUpdate,
};

pub struct JsonFileTaskStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    storage_path: PathBuf,
}

impl JsonFileTaskStore {
    /// Open the store, loading any existing document. A corrupt document
    /// is treated as empty rather than blocking startup; the next write
    /// replaces it.
    pub fn open(storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();
        let tasks = if storage_path.exists() {
            match Self::load_from_path(&storage_path) {
                Ok(tasks) => {
                    tracing::info!(
                        "Loaded {} tasks from {}",
                        tasks.len(),
                        storage_path.display()
                    );
                    tasks
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load task ledger from {}: {}, starting empty",
                        storage_path.display(),
                        e
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Self {
            tasks: Mutex::new(tasks),
            storage_path,
        }
    }

    fn load_from_path(path: &PathBuf) -> EngineResult<HashMap<String, TaskRecord>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let records: Vec<TaskRecord> = serde_json::from_str(&contents)?;
        Ok(records.into_iter().map(|r| (r.id.clone(), r)).collect())
    }

    fn save(&self, tasks: &HashMap<String, TaskRecord>) -> EngineResult<()> {
        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Storage(e.to_string()))?;
        }
        let mut records: Vec<&TaskRecord> = tasks.values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let contents = serde_json::to_string_pretty(&records)?;
        std::fs::write(&self.storage_path, contents)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        tracing::debug!("Saved task ledger to {}", self.storage_path.display());
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskRecord>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TaskStore for JsonFileTaskStore {
    fn register(&self, record: &TaskRecord) -> EngineResult<()> {
        let mut tasks = self.lock();
        if tasks.contains_key(&record.id) {
            return Err(EngineError::InvalidRequest(format!(
                "task id already registered: {}",
                record.id
            )));
        }
        tasks.insert(record.id.clone(), record.clone());
        if let Err(e) = self.save(&tasks) {
            // A failed write must not leave the cache ahead of the document.
            tasks.remove(&record.id);
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, id: &str) -> EngineResult<Option<TaskRecord>> {
        Ok(self.lock().get(id).cloned())
    }

    fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<Value>,
    ) -> EngineResult<TaskRecord> {
        let mut tasks = self.lock();
        let mut record = tasks
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        if !record.apply_status(status, error) {
            return Ok(record);
        }
        let previous = tasks.insert(id.to_string(), record.clone());
        if let Err(e) = self.save(&tasks) {
            if let Some(previous) = previous {
                tasks.insert(id.to_string(), previous);
            }
            return Err(e);
        }
        Ok(record)
    }

    fn update(&self, id: &str, update: TaskUpdate) -> EngineResult<TaskRecord> {
        let mut tasks = self.lock();
        let mut record = tasks
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        record.apply_update(update);
        let previous = tasks.insert(id.to_string(), record.clone());
        if let Err(e) = self.save(&tasks) {
            if let Some(previous) = previous {
                tasks.insert(id.to_string(), previous);
            }
            return Err(e);
        }
        Ok(record)
    }

    fn recent(&self, within: Duration, limit: usize) -> EngineResult<Vec<TaskRecord>> {
        let cutoff = window_cutoff(within);
        let mut records: Vec<TaskRecord> = self
            .lock()
            .values()
            .filter(|r| r.created_at >= cutoff)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    fn running(&self, working_dir: Option<&str>) -> EngineResult<Vec<TaskRecord>> {
        let mut records: Vec<TaskRecord> = self
            .lock()
            .values()
            .filter(|r| !r.status.is_terminal())
            .filter(|r| working_dir.map_or(true, |dir| r.working_dir == dir))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    fn query(&self, query: &TaskQuery) -> EngineResult<Vec<TaskRecord>> {
        let mut records: Vec<TaskRecord> = self
            .lock()
            .values()
            .filter(|r| matches_query(r, query))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    fn sweep(&self, older_than: Duration) -> EngineResult<usize> {
        let cutoff = window_cutoff(older_than);
        let mut tasks = self.lock();
        let expired: Vec<TaskRecord> = tasks
            .values()
            .filter(|r| r.completed_at.map_or(false, |done| done < cutoff))
            .cloned()
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        for record in &expired {
            tasks.remove(&record.id);
        }
        if let Err(e) = self.save(&tasks) {
            for record in expired {
                tasks.insert(record.id.clone(), record);
            }
            return Err(e);
        }
        tracing::info!("Swept {} finished tasks from the ledger", expired.len());
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{generate_task_id, TaskOrigin};

    #[test]
    fn test_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let rec = TaskRecord::new(
            generate_task_id(TaskOrigin::Local),
            TaskOrigin::Local,
            "persist me",
            "/tmp",
        );
        {
            let store = JsonFileTaskStore::open(&path);
            store.register(&rec).unwrap();
            store.update_status(&rec.id, TaskStatus::Working, None).unwrap();
        }
        let store = JsonFileTaskStore::open(&path);
        let loaded = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Working);
        assert_eq!(loaded.instruction, "persist me");
    }

    #[test]
    fn test_failed_write_does_not_desync_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let store = JsonFileTaskStore::open(&path);
        let rec = TaskRecord::new(
            generate_task_id(TaskOrigin::Local),
            TaskOrigin::Local,
            "x",
            "/tmp",
        );
        store.register(&rec).unwrap();

        // Make the document unwritable by replacing it with a directory.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store
            .update_status(&rec.id, TaskStatus::Working, None)
            .is_err());
        // Reads must keep serving the last durably written state.
        let cached = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(cached.status, TaskStatus::Pending);

        let other = TaskRecord::new(
            generate_task_id(TaskOrigin::Local),
            TaskOrigin::Local,
            "y",
            "/tmp",
        );
        assert!(store.register(&other).is_err());
        assert!(store.get(&other.id).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_document_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, "not json at all").unwrap();

        let store = JsonFileTaskStore::open(&path);
        assert!(store.recent(Duration::from_secs(60), 10).unwrap().is_empty());

        // The next write replaces the corrupt document.
        let rec = TaskRecord::new(
            generate_task_id(TaskOrigin::Local),
            TaskOrigin::Local,
            "x",
            "/tmp",
        );
        store.register(&rec).unwrap();
        let reopened = JsonFileTaskStore::open(&path);
        assert!(reopened.get(&rec.id).unwrap().is_some());
    }
}
