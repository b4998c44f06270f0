//! Execution storage trait and types.
//!
//! Every mutating method is a single atomic read-modify-write against one
//! row keyed by `(execution_id, project_id)`. Implementations must never
//! read the row into application memory, modify it and write it back in
//! separate steps: concurrent workers report against the same row.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::execution::{
    ExecutionId, ExecutionRecord, ExecutionStatus, Finish, Metadata, TriggerType,
};

pub use memory::MemoryExecutionStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteExecutionStore;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Duplicate(db.message().to_string())
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Result of a state-changing request that may legitimately be a no-op.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The record changed; holds the new state.
    Applied(ExecutionRecord),
    /// The record was already terminal; holds it unchanged.
    Unchanged(ExecutionRecord),
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn record(&self) -> &ExecutionRecord {
        match self {
            Self::Applied(r) | Self::Unchanged(r) => r,
        }
    }

    pub fn into_record(self) -> ExecutionRecord {
        match self {
            Self::Applied(r) | Self::Unchanged(r) => r,
        }
    }
}

/// Result of a counter update.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressOutcome {
    /// True only for the update that moved the execution to `completed`.
    pub completed_now: bool,
    /// False if the execution was already terminal and nothing was written.
    pub applied: bool,
    pub record: ExecutionRecord,
}

/// Filters for listing executions. `page` is 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionQuery {
    pub rule_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub trigger_type: Option<TriggerType>,
    pub page: u32,
    pub limit: u32,
}

impl ExecutionQuery {
    pub(crate) fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }

    pub(crate) fn matches(&self, record: &ExecutionRecord) -> bool {
        self.rule_id.as_deref().map_or(true, |r| r == record.rule_id)
            && self.status.map_or(true, |s| s == record.status)
            && self.trigger_type.map_or(true, |t| t == record.trigger_type)
    }
}

/// One page of executions, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPage {
    pub items: Vec<ExecutionRecord>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// Trait for execution storage backends.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Fetch a record scoped to its project.
    async fn get(&self, id: ExecutionId, project_id: &str) -> Result<ExecutionRecord, StoreError>;

    /// Most recently created execution of a rule, if any.
    async fn latest(
        &self,
        project_id: &str,
        rule_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError>;

    /// List executions of a project, newest first.
    async fn list(
        &self,
        project_id: &str,
        query: &ExecutionQuery,
    ) -> Result<ExecutionPage, StoreError>;

    /// Move a non-terminal execution to `running`, setting `started_at` once.
    async fn mark_running(
        &self,
        id: ExecutionId,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError>;

    /// Add to the counters and complete the execution if the known match
    /// count is reached, as one atomic step.
    async fn apply_progress(
        &self,
        id: ExecutionId,
        project_id: &str,
        scored: u64,
        errors: u64,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, StoreError>;

    /// Replace the match count and complete the execution if prior progress
    /// already satisfies it, as one atomic step.
    async fn set_spans_matched(
        &self,
        id: ExecutionId,
        project_id: &str,
        matched: u64,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, StoreError>;

    /// Apply a terminal transition unless the execution is already terminal.
    async fn finish(
        &self,
        id: ExecutionId,
        project_id: &str,
        finish: &Finish,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError>;

    /// Merge keys into the metadata of a non-terminal execution.
    async fn merge_metadata(
        &self,
        id: ExecutionId,
        project_id: &str,
        patch: &Metadata,
    ) -> Result<Transition, StoreError>;
}
