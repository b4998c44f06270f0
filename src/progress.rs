//! Progress counter and completion detector.
//!
//! Workers report how many spans they scored or failed to score. The store
//! applies each report and the completion check as one atomic step, so across
//! any number of concurrent reporters exactly one call observes
//! `completed_now == true`.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::execution::{self, ExecutionId};
use crate::store::{ExecutionStore, ProgressOutcome};

/// Entry point for scoring workers and the dispatcher.
#[derive(Clone)]
pub struct ProgressCounter {
    store: Arc<dyn ExecutionStore>,
}

fn non_negative(field: &'static str, value: i64) -> EngineResult<u64> {
    u64::try_from(value).map_err(|_| EngineError::validation(field, "must not be negative"))
}

impl ProgressCounter {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Add `delta_scored` and `delta_errors` to the execution's counters.
    ///
    /// Returns true only for the call that makes `spans_scored + errors_count`
    /// reach a known, non-zero `spans_matched`. Reports against a terminal
    /// execution are dropped and return false.
    pub async fn increment_and_check_completion(
        &self,
        execution_id: ExecutionId,
        project_id: &str,
        delta_scored: i64,
        delta_errors: i64,
    ) -> EngineResult<bool> {
        Ok(self
            .increment(execution_id, project_id, delta_scored, delta_errors)
            .await?
            .completed_now)
    }

    /// Like [`increment_and_check_completion`](Self::increment_and_check_completion)
    /// but returns the full outcome including the updated record.
    pub async fn increment(
        &self,
        execution_id: ExecutionId,
        project_id: &str,
        delta_scored: i64,
        delta_errors: i64,
    ) -> EngineResult<ProgressOutcome> {
        let scored = non_negative("delta_scored", delta_scored)?;
        let errors = non_negative("delta_errors", delta_errors)?;

        let outcome = self
            .store
            .apply_progress(execution_id, project_id, scored, errors, execution::now())
            .await?;

        log_outcome("progress", &outcome);
        Ok(outcome)
    }

    /// Supply the expected match count after creation.
    ///
    /// Zero or negative counts mean "unknown" and defer completion to an
    /// explicit `complete`. If earlier reports already satisfy the new count,
    /// including a count smaller than what was reported, this call completes
    /// the execution and returns true.
    pub async fn update_spans_matched(
        &self,
        execution_id: ExecutionId,
        project_id: &str,
        matched: i64,
    ) -> EngineResult<bool> {
        Ok(self
            .set_matched(execution_id, project_id, matched)
            .await?
            .completed_now)
    }

    /// Like [`update_spans_matched`](Self::update_spans_matched) but returns
    /// the full outcome including the updated record.
    pub async fn set_matched(
        &self,
        execution_id: ExecutionId,
        project_id: &str,
        matched: i64,
    ) -> EngineResult<ProgressOutcome> {
        let matched = u64::try_from(matched).unwrap_or(0);

        let outcome = self
            .store
            .set_spans_matched(execution_id, project_id, matched, execution::now())
            .await?;

        log_outcome("spans_matched", &outcome);
        Ok(outcome)
    }
}

fn log_outcome(kind: &'static str, outcome: &ProgressOutcome) {
    let record = &outcome.record;
    if outcome.completed_now {
        info!(
            execution_id = %record.id,
            project_id = %record.project_id,
            rule_id = %record.rule_id,
            spans_matched = record.spans_matched,
            spans_scored = record.spans_scored,
            errors_count = record.errors_count,
            duration_ms = record.duration_ms,
            "Execution completed"
        );
    } else if outcome.applied {
        debug!(
            execution_id = %record.id,
            kind,
            spans_matched = record.spans_matched,
            processed = record.processed(),
            "Execution progress recorded"
        );
    } else {
        debug!(
            execution_id = %record.id,
            kind,
            status = %record.status,
            "Ignoring update for terminal execution"
        );
    }
}
