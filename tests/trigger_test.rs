//! End-to-end trigger flows through the engine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evalflow::{
    CompletedSpan, Dispatcher, EngineBuilder, EngineError, EvaluationRule, ExecutionId,
    ExecutionPage, ExecutionQuery, ExecutionRecord, ExecutionStatus, ExecutionStore, Finish,
    ManualTrigger, MemoryExecutionStore, MemoryRuleCatalog, Metadata, ProgressOutcome,
    SpanFilter, SpanQuery, SpanStore, StoreError, TimeRange, Transition, TriggerType,
};
use tokio::sync::Mutex;

/// Span store returning a fixed list of ids.
struct FixedSpans(Vec<String>);

#[async_trait]
impl SpanStore for FixedSpans {
    async fn find_spans_matching(
        &self,
        _project_id: &str,
        query: &SpanQuery,
    ) -> anyhow::Result<Vec<String>> {
        if query.span_ids.is_empty() {
            Ok(self.0.clone())
        } else {
            Ok(query.span_ids.clone())
        }
    }
}

struct BrokenSpans;

#[async_trait]
impl SpanStore for BrokenSpans {
    async fn find_spans_matching(
        &self,
        _project_id: &str,
        _query: &SpanQuery,
    ) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("trace store unavailable")
    }
}

/// Dispatcher that records what it was asked to send.
#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<(ExecutionRecord, Vec<String>)>>,
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, execution: &ExecutionRecord, span_ids: &[String]) -> anyhow::Result<()> {
        self.sent
            .lock()
            .await
            .push((execution.clone(), span_ids.to_vec()));
        Ok(())
    }
}

struct FailingDispatcher;

#[async_trait]
impl Dispatcher for FailingDispatcher {
    async fn dispatch(&self, _execution: &ExecutionRecord, _span_ids: &[String]) -> anyhow::Result<()> {
        anyhow::bail!("queue full")
    }
}

/// Memory store with injectable storage failures.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryExecutionStore,
    fail_insert_for_rule: Option<String>,
    fail_mark_running: bool,
    fail_merge_metadata: bool,
}

fn db_down() -> StoreError {
    StoreError::Storage("db down".into())
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        if self.fail_insert_for_rule.as_deref() == Some(record.rule_id.as_str()) {
            return Err(db_down());
        }
        self.inner.insert(record).await
    }

    async fn get(&self, id: ExecutionId, project_id: &str) -> Result<ExecutionRecord, StoreError> {
        self.inner.get(id, project_id).await
    }

    async fn latest(
        &self,
        project_id: &str,
        rule_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        self.inner.latest(project_id, rule_id).await
    }

    async fn list(
        &self,
        project_id: &str,
        query: &ExecutionQuery,
    ) -> Result<ExecutionPage, StoreError> {
        self.inner.list(project_id, query).await
    }

    async fn mark_running(
        &self,
        id: ExecutionId,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        if self.fail_mark_running {
            return Err(db_down());
        }
        self.inner.mark_running(id, project_id, now).await
    }

    async fn apply_progress(
        &self,
        id: ExecutionId,
        project_id: &str,
        scored: u64,
        errors: u64,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, StoreError> {
        self.inner.apply_progress(id, project_id, scored, errors, now).await
    }

    async fn set_spans_matched(
        &self,
        id: ExecutionId,
        project_id: &str,
        matched: u64,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, StoreError> {
        self.inner.set_spans_matched(id, project_id, matched, now).await
    }

    async fn finish(
        &self,
        id: ExecutionId,
        project_id: &str,
        finish: &Finish,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        self.inner.finish(id, project_id, finish, now).await
    }

    async fn merge_metadata(
        &self,
        id: ExecutionId,
        project_id: &str,
        patch: &Metadata,
    ) -> Result<Transition, StoreError> {
        if self.fail_merge_metadata {
            return Err(db_down());
        }
        self.inner.merge_metadata(id, project_id, patch).await
    }
}

/// Dispatcher that takes a while before recording.
#[derive(Default)]
struct SlowDispatcher {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Dispatcher for SlowDispatcher {
    async fn dispatch(&self, execution: &ExecutionRecord, _span_ids: &[String]) -> anyhow::Result<()> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.sent.lock().await.push(execution.rule_id.clone());
        Ok(())
    }
}

fn spans(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("span-{}", i)).collect()
}

fn catalog() -> Arc<MemoryRuleCatalog> {
    Arc::new(MemoryRuleCatalog::with_rules([
        EvaluationRule::new("rule-1", "proj-1", "helpfulness"),
        EvaluationRule::new("rule-off", "proj-1", "retired").disabled(),
    ]))
}

fn span(span_id: &str, name: &str) -> CompletedSpan {
    CompletedSpan {
        trace_id: "trace-1".into(),
        span_id: span_id.into(),
        name: name.into(),
        attributes: Default::default(),
        end_time: None,
    }
}

#[tokio::test]
async fn test_manual_trigger_end_to_end() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let engine = EngineBuilder::new(MemoryExecutionStore::new())
        .rules(catalog())
        .span_store(Arc::new(FixedSpans(spans(3))))
        .dispatcher(dispatcher.clone())
        .build();

    let triggered = engine
        .trigger_manual("proj-1", "rule-1", ManualTrigger::default())
        .await
        .unwrap();
    let id = triggered.response.execution_id;
    assert_eq!(triggered.response.spans_queued, 0);

    triggered.discovery.await.unwrap();

    let record = engine.lifecycle().get(id, "proj-1").await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);
    assert_eq!(record.trigger_type, TriggerType::Manual);
    assert_eq!(record.spans_matched, 3);
    assert_eq!(record.metadata["sample_limit"], 1000);

    let sent = dispatcher.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, spans(3));
    drop(sent);

    // Workers report one success, one error, one success
    let progress = engine.progress();
    assert!(!progress.increment_and_check_completion(id, "proj-1", 1, 0).await.unwrap());
    assert!(!progress.increment_and_check_completion(id, "proj-1", 0, 1).await.unwrap());
    assert!(progress.increment_and_check_completion(id, "proj-1", 1, 0).await.unwrap());

    let record = engine.lifecycle().get(id, "proj-1").await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!((record.spans_scored, record.errors_count), (2, 1));
    assert!(record.completed_at.unwrap() >= record.started_at.unwrap());

    let latest = engine.lifecycle().latest("proj-1", "rule-1").await.unwrap();
    assert_eq!(latest.id, id);
}

#[tokio::test]
async fn test_manual_trigger_with_no_matches_completes_empty() {
    let engine = EngineBuilder::new(MemoryExecutionStore::new())
        .rules(catalog())
        .build();

    let triggered = engine
        .trigger_manual("proj-1", "rule-1", ManualTrigger::default())
        .await
        .unwrap();
    triggered.discovery.await.unwrap();

    let record = engine
        .lifecycle()
        .get(triggered.response.execution_id, "proj-1")
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.spans_matched, 0);
    assert_eq!(record.processed(), 0);
}

#[tokio::test]
async fn test_discovery_failure_fails_execution() {
    let engine = EngineBuilder::new(MemoryExecutionStore::new())
        .rules(catalog())
        .span_store(Arc::new(BrokenSpans))
        .build();

    let triggered = engine
        .trigger_manual("proj-1", "rule-1", ManualTrigger::default())
        .await
        .unwrap();
    triggered.discovery.await.unwrap();

    let record = engine
        .lifecycle()
        .get(triggered.response.execution_id, "proj-1")
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record
        .error_message
        .unwrap()
        .contains("trace store unavailable"));
}

#[tokio::test]
async fn test_dispatch_failure_fails_execution() {
    let engine = EngineBuilder::new(MemoryExecutionStore::new())
        .rules(catalog())
        .span_store(Arc::new(FixedSpans(spans(2))))
        .dispatcher(Arc::new(FailingDispatcher))
        .build();

    let triggered = engine
        .trigger_manual("proj-1", "rule-1", ManualTrigger::default())
        .await
        .unwrap();
    triggered.discovery.await.unwrap();

    let record = engine
        .lifecycle()
        .get(triggered.response.execution_id, "proj-1")
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error_message.unwrap().contains("queue full"));
}

#[tokio::test]
async fn test_sample_limit_caps_targets() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let engine = EngineBuilder::new(MemoryExecutionStore::new())
        .rules(catalog())
        .span_store(Arc::new(FixedSpans(spans(10))))
        .dispatcher(dispatcher.clone())
        .build();

    let request = ManualTrigger {
        span_ids: spans(6),
        sample_limit: Some(4),
        ..Default::default()
    };
    let triggered = engine.trigger_manual("proj-1", "rule-1", request).await.unwrap();
    assert_eq!(triggered.response.spans_queued, 4);
    triggered.discovery.await.unwrap();

    let record = engine
        .lifecycle()
        .get(triggered.response.execution_id, "proj-1")
        .await
        .unwrap();
    assert_eq!(record.spans_matched, 4);
    assert_eq!(dispatcher.sent.lock().await[0].1, spans(4));
}

#[tokio::test]
async fn test_manual_trigger_validation() {
    let engine = EngineBuilder::new(MemoryExecutionStore::new())
        .rules(catalog())
        .build();

    let err = engine
        .trigger_manual("proj-1", "missing", ManualTrigger::default())
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found());

    let err = engine
        .trigger_manual("proj-1", "rule-off", ManualTrigger::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::Validation(ref v) if v.field == "rule_id"));

    let start = chrono::Utc::now();
    let request = ManualTrigger {
        time_range: Some(TimeRange {
            start: Some(start),
            end: Some(start - chrono::Duration::hours(1)),
        }),
        ..Default::default()
    };
    let err = engine
        .trigger_manual("proj-1", "rule-1", request)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::Validation(ref v) if v.field == "time_range"));

    let request = ManualTrigger {
        span_ids: vec!["span-1".into(), " ".into()],
        ..Default::default()
    };
    let err = engine
        .trigger_manual("proj-1", "rule-1", request)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::Validation(ref v) if v.field == "span_ids"));

    // Nothing was created by rejected triggers
    assert!(engine.lifecycle().latest("proj-1", "rule-1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_cancel_during_work_drops_reports() {
    let engine = EngineBuilder::new(MemoryExecutionStore::new())
        .rules(catalog())
        .span_store(Arc::new(FixedSpans(spans(3))))
        .build();

    let triggered = engine
        .trigger_manual("proj-1", "rule-1", ManualTrigger::default())
        .await
        .unwrap();
    let id = triggered.response.execution_id;
    triggered.discovery.await.unwrap();

    engine.progress().increment_and_check_completion(id, "proj-1", 1, 0).await.unwrap();
    let cancelled = engine.lifecycle().cancel(id, "proj-1").await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    assert!(!engine.progress().increment_and_check_completion(id, "proj-1", 2, 0).await.unwrap());
    let record = engine.lifecycle().get(id, "proj-1").await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.spans_scored, 1);
}

#[tokio::test]
async fn test_span_completion_starts_automatic_executions() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let rules = Arc::new(MemoryRuleCatalog::with_rules([
        EvaluationRule::new("rule-llm", "proj-1", "llm quality").with_filter(SpanFilter {
            span_names: vec!["llm.call".into()],
            ..Default::default()
        }),
        EvaluationRule::new("rule-all", "proj-1", "everything"),
        EvaluationRule::new("rule-never", "proj-1", "sampled out").with_sampling_rate(0.0),
    ]));
    let engine = EngineBuilder::new(MemoryExecutionStore::new())
        .rules(rules)
        .dispatcher(dispatcher.clone())
        .build();

    let started = engine
        .on_span_completed("proj-1", &span("span-9", "llm.call"))
        .await
        .unwrap();
    assert_eq!(started.len(), 2);
    for record in &started {
        assert_eq!(record.trigger_type, TriggerType::Automatic);
        assert_eq!(record.spans_matched, 1);
        assert_eq!(record.status, ExecutionStatus::Running);
    }
    assert_eq!(dispatcher.sent.lock().await.len(), 2);

    // A single report completes an automatic execution
    let id = started[0].id;
    assert!(engine
        .progress()
        .increment_and_check_completion(id, "proj-1", 1, 0)
        .await
        .unwrap());

    let started = engine
        .on_span_completed("proj-1", &span("span-10", "retrieval"))
        .await
        .unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].rule_id, "rule-all");
}

#[tokio::test]
async fn test_automatic_dispatch_failure_fails_execution() {
    let engine = EngineBuilder::new(MemoryExecutionStore::new())
        .rules(catalog())
        .dispatcher(Arc::new(FailingDispatcher))
        .build();

    let started = engine
        .on_span_completed("proj-1", &span("span-1", "llm.call"))
        .await
        .unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].status, ExecutionStatus::Failed);
    assert!(started[0].error_message.as_deref().unwrap().contains("queue full"));
}

#[tokio::test]
async fn test_one_failing_rule_does_not_abandon_the_others() {
    let store = FlakyStore {
        fail_insert_for_rule: Some("rule-b".into()),
        ..Default::default()
    };
    let dispatcher = Arc::new(SlowDispatcher::default());
    let rules = Arc::new(MemoryRuleCatalog::with_rules([
        EvaluationRule::new("rule-a", "proj-1", "first"),
        EvaluationRule::new("rule-b", "proj-1", "second"),
    ]));
    let engine = EngineBuilder::new(store)
        .rules(rules)
        .dispatcher(dispatcher.clone())
        .build();

    let err = engine
        .on_span_completed("proj-1", &span("span-1", "llm.call"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Infrastructure(ref m) if m.contains("db down")));

    // The healthy rule still reached a worker
    assert_eq!(*dispatcher.sent.lock().await, vec!["rule-a".to_string()]);
    let record = engine.lifecycle().latest("proj-1", "rule-a").await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);
    assert_eq!(record.spans_matched, 1);
    assert!(engine.lifecycle().latest("proj-1", "rule-b").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_automatic_begin_failure_fails_execution() {
    let store = FlakyStore {
        fail_mark_running: true,
        ..Default::default()
    };
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let engine = EngineBuilder::new(store)
        .rules(catalog())
        .dispatcher(dispatcher.clone())
        .build();

    let err = engine
        .on_span_completed("proj-1", &span("span-1", "llm.call"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Infrastructure(_)));

    let record = engine.lifecycle().latest("proj-1", "rule-1").await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error_message.unwrap().contains("db down"));
    assert!(dispatcher.sent.lock().await.is_empty());
}

#[tokio::test]
async fn test_discovery_start_failure_fails_execution() {
    let store = FlakyStore {
        fail_mark_running: true,
        ..Default::default()
    };
    let engine = EngineBuilder::new(store)
        .rules(catalog())
        .span_store(Arc::new(FixedSpans(spans(3))))
        .build();

    let triggered = engine
        .trigger_manual("proj-1", "rule-1", ManualTrigger::default())
        .await
        .unwrap();
    triggered.discovery.await.unwrap();

    let record = engine
        .lifecycle()
        .get(triggered.response.execution_id, "proj-1")
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.spans_matched, 0);
    assert!(record.error_message.unwrap().contains("db down"));
}

#[tokio::test]
async fn test_trigger_setup_failure_leaves_no_pending_execution() {
    let store = FlakyStore {
        fail_merge_metadata: true,
        ..Default::default()
    };
    let engine = EngineBuilder::new(store).rules(catalog()).build();

    let err = engine
        .trigger_manual("proj-1", "rule-1", ManualTrigger::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::Infrastructure(_)));

    let record = engine.lifecycle().latest("proj-1", "rule-1").await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error_message.unwrap().contains("trigger setup failed"));
}
