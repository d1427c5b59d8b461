//! In-memory task store, used by tests and by callers that do not need
//! the ledger to outlive the process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::error::{EngineError, EngineResult};

use super::{
    matches_query, window_cutoff, TaskQuery, TaskRecord, TaskStatus, TaskStore, TaskUpdate,
};

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskRecord>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TaskStore for InMemoryTaskStore {
    fn register(&self, record: &TaskRecord) -> EngineResult<()> {
        let mut tasks = self.lock();
        if tasks.contains_key(&record.id) {
            return Err(EngineError::InvalidRequest(format!(
                "task id already registered: {}",
                record.id
            )));
        }
        tasks.insert(record.id.clone(), record.clone());
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
        let record = tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        record.apply_status(status, error);
        Ok(record.clone())
    }

    fn update(&self, id: &str, update: TaskUpdate) -> EngineResult<TaskRecord> {
        let mut tasks = self.lock();
        let record = tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        record.apply_update(update);
        Ok(record.clone())
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
        let records: Vec<TaskRecord> = records
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(records)
    }

    fn sweep(&self, older_than: Duration) -> EngineResult<usize> {
        let cutoff = window_cutoff(older_than);
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, r| match r.completed_at {
            Some(done) => done >= cutoff,
            None => true,
        });
        Ok(before - tasks.len())
    }
}
