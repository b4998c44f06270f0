//! Trigger resolution: how many targets an execution covers and when it is
//! dispatched.
//!
//! Automatic triggers know their single target upfront. Manual triggers
//! respond immediately with a pending execution and discover matching spans
//! in a detached task, which then reports the match count through the same
//! atomic primitive workers use.

mod rule;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::{ExecutionId, ExecutionRecord, Metadata, TriggerType};
use crate::lifecycle::ExecutionLifecycle;
use crate::progress::ProgressCounter;

pub use rule::{CompletedSpan, EvaluationRule, MemoryRuleCatalog, RuleCatalog, SpanFilter};

/// Inclusive time window. Either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// What a span store is asked to find for a manual trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanQuery {
    pub filter: SpanFilter,
    pub time_range: Option<TimeRange>,
    /// If non-empty, only these spans are candidates.
    pub span_ids: Vec<String>,
    pub sample_limit: u64,
}

/// Trace store that can find spans matching a rule.
#[async_trait]
pub trait SpanStore: Send + Sync {
    async fn find_spans_matching(
        &self,
        project_id: &str,
        query: &SpanQuery,
    ) -> anyhow::Result<Vec<String>>;
}

/// A span store that never finds anything.
#[derive(Debug, Clone, Default)]
pub struct NoSpans;

#[async_trait]
impl SpanStore for NoSpans {
    async fn find_spans_matching(
        &self,
        _project_id: &str,
        _query: &SpanQuery,
    ) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Hands scoring work to workers. Workers report back through
/// [`ProgressCounter`].
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, execution: &ExecutionRecord, span_ids: &[String]) -> anyhow::Result<()>;
}

/// A dispatcher that drops all work.
///
/// Useful for testing or when workers are driven by the caller.
#[derive(Debug, Clone, Default)]
pub struct NoopDispatcher;

#[async_trait]
impl Dispatcher for NoopDispatcher {
    async fn dispatch(&self, _execution: &ExecutionRecord, _span_ids: &[String]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Operator request to run a rule over existing spans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualTrigger {
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub span_ids: Vec<String>,
    /// Defaults to the configured limit when unset or <= 0.
    #[serde(default)]
    pub sample_limit: Option<i64>,
}

/// Immediate answer to a manual trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub execution_id: ExecutionId,
    /// Upper bound on targets known when the trigger returned.
    pub spans_queued: u64,
    pub message: String,
}

/// A manual trigger that has been accepted.
pub struct Triggered {
    pub response: TriggerResponse,
    /// The detached discovery task. Dropping it does not cancel discovery.
    pub discovery: JoinHandle<()>,
}

/// Decides execution semantics at trigger time.
#[derive(Clone)]
pub struct TriggerResolver {
    lifecycle: ExecutionLifecycle,
    progress: ProgressCounter,
    rules: Arc<dyn RuleCatalog>,
    spans: Arc<dyn SpanStore>,
    dispatcher: Arc<dyn Dispatcher>,
    config: Arc<EngineConfig>,
}

impl TriggerResolver {
    pub fn new(
        lifecycle: ExecutionLifecycle,
        progress: ProgressCounter,
        rules: Arc<dyn RuleCatalog>,
        spans: Arc<dyn SpanStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            lifecycle,
            progress,
            rules,
            spans,
            dispatcher,
            config,
        }
    }

    /// Start a manual execution and discover its targets in the background.
    ///
    /// Failures during discovery or dispatch do not fail this call; they move
    /// the execution to `failed`, observable by polling.
    pub async fn trigger_manual(
        &self,
        project_id: &str,
        rule_id: &str,
        request: ManualTrigger,
    ) -> EngineResult<Triggered> {
        let rule = self.rules.get(project_id, rule_id).await?;
        if !rule.enabled {
            return Err(EngineError::validation("rule_id", format!("rule {} is disabled", rule_id)));
        }
        if let Some(TimeRange {
            start: Some(start),
            end: Some(end),
        }) = request.time_range
        {
            if start > end {
                return Err(EngineError::validation("time_range", "start is after end"));
            }
        }
        if request.span_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(EngineError::validation("span_ids", "contains an empty id"));
        }

        let sample_limit = self.config.sample_limit(request.sample_limit);
        let query = SpanQuery {
            filter: rule.filter.clone(),
            time_range: request.time_range,
            span_ids: request.span_ids,
            sample_limit,
        };

        let record = self
            .lifecycle
            .start(rule_id, project_id, TriggerType::Manual)
            .await?;
        let record = match self
            .lifecycle
            .merge_metadata(record.id, project_id, &trigger_metadata(&query))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                error!(execution_id = %record.id, error = %e, "Failed to record trigger metadata");
                self.fail_quietly(record.id, project_id, &format!("trigger setup failed: {}", e))
                    .await;
                return Err(e);
            }
        };

        let spans_queued = (query.span_ids.len() as u64).min(sample_limit);
        let response = TriggerResponse {
            execution_id: record.id,
            spans_queued,
            message: format!("Evaluation triggered for rule {}; discovering matching spans", rule.name),
        };

        let resolver = self.clone();
        let discovery = tokio::spawn(async move {
            resolver.discover(record, query).await;
        });

        Ok(Triggered {
            response,
            discovery,
        })
    }

    async fn discover(&self, record: ExecutionRecord, query: SpanQuery) {
        let id = record.id;
        let project_id = record.project_id.as_str();

        match self.lifecycle.begin(id, project_id).await {
            Ok(_) => {}
            // Cancelled before discovery started
            Err(EngineError::Conflict(reason)) => {
                debug!(execution_id = %id, reason = %reason, "Skipping discovery");
                return;
            }
            Err(e) => {
                error!(execution_id = %id, error = %e, "Failed to start discovery");
                self.fail_quietly(id, project_id, &format!("discovery could not start: {}", e))
                    .await;
                return;
            }
        }

        let mut span_ids = match self.spans.find_spans_matching(project_id, &query).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(execution_id = %id, error = %e, "Span discovery failed");
                self.fail_quietly(id, project_id, &format!("span discovery failed: {:#}", e))
                    .await;
                return;
            }
        };
        span_ids.truncate(query.sample_limit as usize);

        if span_ids.is_empty() {
            info!(execution_id = %id, "No spans matched; completing empty execution");
            if let Err(e) = self.lifecycle.complete(id, project_id, 0, 0, 0).await {
                error!(execution_id = %id, error = %e, "Failed to complete empty execution");
            }
            return;
        }

        let matched = span_ids.len() as i64;
        let outcome = match self.progress.set_matched(id, project_id, matched).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(execution_id = %id, error = %e, "Failed to record match count");
                self.fail_quietly(id, project_id, &e.to_string()).await;
                return;
            }
        };
        if outcome.record.is_terminal() {
            debug!(execution_id = %id, status = %outcome.record.status, "Execution closed during discovery");
            return;
        }

        info!(execution_id = %id, spans_matched = matched, "Dispatching spans");
        if let Err(e) = self.dispatcher.dispatch(&outcome.record, &span_ids).await {
            warn!(execution_id = %id, error = %e, "Dispatch failed");
            self.fail_quietly(id, project_id, &format!("dispatch failed: {:#}", e))
                .await;
        }
    }

    /// Start automatic executions for every enabled rule that applies to a
    /// completed span. Returns the executions created.
    ///
    /// Every applicable rule runs to the end even if another one fails. An
    /// execution whose own setup failed after it was created is failed, and
    /// the first error is returned once all rules have settled.
    pub async fn on_span_completed(
        &self,
        project_id: &str,
        span: &CompletedSpan,
    ) -> EngineResult<Vec<ExecutionRecord>> {
        let rules = self.rules.list_enabled(project_id).await?;
        let applicable: Vec<&EvaluationRule> = rules.iter().filter(|r| r.applies_to(span)).collect();
        if applicable.is_empty() {
            debug!(project_id, span_id = %span.span_id, "No rule applies to span");
            return Ok(Vec::new());
        }

        let results = join_all(
            applicable
                .into_iter()
                .map(|rule| self.trigger_automatic(project_id, rule, span)),
        )
        .await;

        let mut started = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(record) => started.push(record),
                Err(e) => {
                    warn!(project_id, span_id = %span.span_id, error = %e, "Automatic trigger failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(started),
        }
    }

    async fn trigger_automatic(
        &self,
        project_id: &str,
        rule: &EvaluationRule,
        span: &CompletedSpan,
    ) -> EngineResult<ExecutionRecord> {
        let record = self
            .lifecycle
            .start_with_count(&rule.id, project_id, TriggerType::Automatic, 1)
            .await?;
        let record = match self.lifecycle.begin(record.id, project_id).await {
            Ok(record) => record,
            Err(e) => {
                self.fail_quietly(record.id, project_id, &format!("execution could not start: {}", e))
                    .await;
                return Err(e);
            }
        };

        let span_ids = [span.span_id.clone()];
        if let Err(e) = self.dispatcher.dispatch(&record, &span_ids).await {
            warn!(execution_id = %record.id, error = %e, "Dispatch failed");
            return self
                .lifecycle
                .fail(record.id, project_id, &format!("dispatch failed: {:#}", e))
                .await;
        }
        Ok(record)
    }

    async fn fail_quietly(&self, id: ExecutionId, project_id: &str, message: &str) {
        if let Err(e) = self.lifecycle.fail(id, project_id, message).await {
            error!(execution_id = %id, error = %e, "Failed to record execution failure");
        }
    }
}

fn trigger_metadata(query: &SpanQuery) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("sample_limit".into(), query.sample_limit.into());
    if !query.span_ids.is_empty() {
        meta.insert("requested_span_ids".into(), query.span_ids.len().into());
    }
    if let Some(range) = query.time_range {
        if let Ok(value) = serde_json::to_value(range) {
            meta.insert("time_range".into(), value);
        }
    }
    meta
}
