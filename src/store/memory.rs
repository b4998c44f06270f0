//! In-process execution store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{ExecutionPage, ExecutionQuery, ExecutionStore, ProgressOutcome, StoreError, Transition};
use crate::execution::{merge_patch, ExecutionId, ExecutionRecord, Finish, Metadata};

/// Execution store backed by a map behind a single async mutex.
///
/// Each trait call holds the lock for its whole read-modify-write, which
/// gives the same per-row atomicity the SQLite store gets from conditional
/// updates. Suitable for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    rows: Mutex<HashMap<ExecutionId, ExecutionRecord>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn scoped<'a>(
    rows: &'a mut HashMap<ExecutionId, ExecutionRecord>,
    id: ExecutionId,
    project_id: &str,
) -> Result<&'a mut ExecutionRecord, StoreError> {
    rows.get_mut(&id)
        .filter(|r| r.project_id == project_id)
        .ok_or_else(|| StoreError::not_found("execution", id))
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&record.id) {
            return Err(StoreError::Duplicate(format!("execution {}", record.id)));
        }
        rows.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: ExecutionId, project_id: &str) -> Result<ExecutionRecord, StoreError> {
        let mut rows = self.rows.lock().await;
        scoped(&mut rows, id, project_id).map(|r| r.clone())
    }

    async fn latest(
        &self,
        project_id: &str,
        rule_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|r| r.project_id == project_id && r.rule_id == rule_id)
            .max_by_key(|r| (r.created_at, r.id))
            .cloned())
    }

    async fn list(
        &self,
        project_id: &str,
        query: &ExecutionQuery,
    ) -> Result<ExecutionPage, StoreError> {
        let rows = self.rows.lock().await;
        let mut matching: Vec<&ExecutionRecord> = rows
            .values()
            .filter(|r| r.project_id == project_id && query.matches(r))
            .collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();

        Ok(ExecutionPage {
            items,
            total,
            page: query.page.max(1),
            limit: query.limit,
        })
    }

    async fn mark_running(
        &self,
        id: ExecutionId,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let mut rows = self.rows.lock().await;
        let record = scoped(&mut rows, id, project_id)?;
        if record.begin(now) {
            Ok(Transition::Applied(record.clone()))
        } else {
            Ok(Transition::Unchanged(record.clone()))
        }
    }

    async fn apply_progress(
        &self,
        id: ExecutionId,
        project_id: &str,
        scored: u64,
        errors: u64,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        let record = scoped(&mut rows, id, project_id)?;
        let applied = !record.is_terminal();
        let completed_now = record.apply_progress(scored, errors, now);
        Ok(ProgressOutcome {
            completed_now,
            applied,
            record: record.clone(),
        })
    }

    async fn set_spans_matched(
        &self,
        id: ExecutionId,
        project_id: &str,
        matched: u64,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        let record = scoped(&mut rows, id, project_id)?;
        let applied = !record.is_terminal();
        let completed_now = record.set_spans_matched(matched, now);
        Ok(ProgressOutcome {
            completed_now,
            applied,
            record: record.clone(),
        })
    }

    async fn finish(
        &self,
        id: ExecutionId,
        project_id: &str,
        finish: &Finish,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let mut rows = self.rows.lock().await;
        let record = scoped(&mut rows, id, project_id)?;
        if record.finish(finish, now) {
            Ok(Transition::Applied(record.clone()))
        } else {
            Ok(Transition::Unchanged(record.clone()))
        }
    }

    async fn merge_metadata(
        &self,
        id: ExecutionId,
        project_id: &str,
        patch: &Metadata,
    ) -> Result<Transition, StoreError> {
        let mut rows = self.rows.lock().await;
        let record = scoped(&mut rows, id, project_id)?;
        if record.is_terminal() {
            return Ok(Transition::Unchanged(record.clone()));
        }
        merge_patch(&mut record.metadata, patch);
        Ok(Transition::Applied(record.clone()))
    }
}
