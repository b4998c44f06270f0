//! Execution lifecycle API.
//!
//! All terminal transitions are idempotent: calling them on an execution that
//! is already terminal returns the stored record unchanged, which tolerates
//! at-least-once delivery from a dispatcher.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::{
    self, ExecutionId, ExecutionRecord, ExecutionStatus, Finish, Metadata, TriggerType,
};
use crate::store::{ExecutionPage, ExecutionQuery, ExecutionStore, Transition};

/// List filters as received from a caller, before defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct ListExecutions {
    pub rule_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub trigger_type: Option<TriggerType>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

/// Creates, transitions and reads execution records.
#[derive(Clone)]
pub struct ExecutionLifecycle {
    store: Arc<dyn ExecutionStore>,
    config: Arc<EngineConfig>,
}

fn require(field: &'static str, value: &str) -> EngineResult<()> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(field, "must not be empty"));
    }
    Ok(())
}

impl ExecutionLifecycle {
    pub fn new(store: Arc<dyn ExecutionStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Create a pending execution with an unknown match count.
    pub async fn start(
        &self,
        rule_id: &str,
        project_id: &str,
        trigger_type: TriggerType,
    ) -> EngineResult<ExecutionRecord> {
        self.start_with_count(rule_id, project_id, trigger_type, 0)
            .await
    }

    /// Create a pending execution whose match count is known upfront.
    pub async fn start_with_count(
        &self,
        rule_id: &str,
        project_id: &str,
        trigger_type: TriggerType,
        spans_matched: u64,
    ) -> EngineResult<ExecutionRecord> {
        require("rule_id", rule_id)?;
        require("project_id", project_id)?;

        let record = ExecutionRecord::new(rule_id, project_id, trigger_type, spans_matched);
        self.store.insert(&record).await?;

        info!(
            execution_id = %record.id,
            project_id,
            rule_id,
            trigger_type = %trigger_type,
            spans_matched,
            "Execution created"
        );
        Ok(record)
    }

    /// Move an execution to `running`.
    ///
    /// Fails with `Conflict` if the execution is already terminal.
    pub async fn begin(&self, id: ExecutionId, project_id: &str) -> EngineResult<ExecutionRecord> {
        match self.store.mark_running(id, project_id, execution::now()).await? {
            Transition::Applied(record) => {
                debug!(execution_id = %id, "Execution running");
                Ok(record)
            }
            Transition::Unchanged(record) => Err(EngineError::Conflict(format!(
                "execution {} is already {}",
                id, record.status
            ))),
        }
    }

    /// Complete an execution with explicit final counters.
    pub async fn complete(
        &self,
        id: ExecutionId,
        project_id: &str,
        spans_matched: u64,
        spans_scored: u64,
        errors_count: u64,
    ) -> EngineResult<ExecutionRecord> {
        let finish = Finish::Completed {
            spans_matched,
            spans_scored,
            errors_count,
        };
        self.finish(id, project_id, finish).await
    }

    /// Fail an execution, recording the (truncated) error message.
    pub async fn fail(
        &self,
        id: ExecutionId,
        project_id: &str,
        message: &str,
    ) -> EngineResult<ExecutionRecord> {
        let finish = Finish::Failed {
            message: self.config.truncate_error(message),
        };
        self.finish(id, project_id, finish).await
    }

    /// Cancel an execution. In-flight worker reports become no-ops.
    pub async fn cancel(&self, id: ExecutionId, project_id: &str) -> EngineResult<ExecutionRecord> {
        self.finish(id, project_id, Finish::Cancelled).await
    }

    async fn finish(
        &self,
        id: ExecutionId,
        project_id: &str,
        finish: Finish,
    ) -> EngineResult<ExecutionRecord> {
        let status = finish.status();
        match self
            .store
            .finish(id, project_id, &finish, execution::now())
            .await?
        {
            Transition::Applied(record) => {
                if let Some(message) = &record.error_message {
                    warn!(execution_id = %id, project_id, error = %message, "Execution failed");
                } else {
                    info!(
                        execution_id = %id,
                        project_id,
                        status = %status,
                        duration_ms = record.duration_ms,
                        "Execution finished"
                    );
                }
                Ok(record)
            }
            Transition::Unchanged(record) => {
                debug!(
                    execution_id = %id,
                    requested = %status,
                    current = %record.status,
                    "Execution already terminal"
                );
                Ok(record)
            }
        }
    }

    /// Merge keys into the execution's diagnostic metadata.
    ///
    /// Fails with `Conflict` once the execution is terminal.
    pub async fn merge_metadata(
        &self,
        id: ExecutionId,
        project_id: &str,
        patch: &Metadata,
    ) -> EngineResult<ExecutionRecord> {
        match self.store.merge_metadata(id, project_id, patch).await? {
            Transition::Applied(record) => Ok(record),
            Transition::Unchanged(record) => Err(EngineError::Conflict(format!(
                "execution {} is {}; metadata is frozen",
                id, record.status
            ))),
        }
    }

    pub async fn get(&self, id: ExecutionId, project_id: &str) -> EngineResult<ExecutionRecord> {
        Ok(self.store.get(id, project_id).await?)
    }

    /// Most recent execution of a rule.
    pub async fn latest(&self, project_id: &str, rule_id: &str) -> EngineResult<ExecutionRecord> {
        self.store
            .latest(project_id, rule_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "execution",
                id: format!("latest for rule {}", rule_id),
            })
    }

    pub async fn list(&self, project_id: &str, filter: ListExecutions) -> EngineResult<ExecutionPage> {
        let query = ExecutionQuery {
            rule_id: filter.rule_id,
            status: filter.status,
            trigger_type: filter.trigger_type,
            page: filter.page.unwrap_or(1).max(1),
            limit: self.config.page_limit(filter.limit),
        };
        Ok(self.store.list(project_id, &query).await?)
    }
}
