//! Engine façade wiring the lifecycle, progress counter, trigger resolver and
//! score services over shared stores.

use std::sync::Arc;

use tracing::{debug, info};

use crate::compare::{self, ComparisonResult, ScoreSample};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::execution::ExecutionRecord;
use crate::lifecycle::ExecutionLifecycle;
use crate::progress::ProgressCounter;
use crate::score::{
    MemorySchemaStore, MemoryScoreStore, SchemaStore, ScoreRecord, ScoreSchema, ScoreStore,
    ScoreValidator, SubmittedScore,
};
use crate::store::ExecutionStore;
use crate::trigger::{
    CompletedSpan, Dispatcher, ManualTrigger, MemoryRuleCatalog, NoSpans, NoopDispatcher,
    RuleCatalog, SpanStore, TriggerResolver, Triggered,
};

/// The evaluation execution engine.
pub struct Engine {
    lifecycle: ExecutionLifecycle,
    progress: ProgressCounter,
    triggers: TriggerResolver,
    validator: ScoreValidator,
    schemas: Arc<dyn SchemaStore>,
    scores: Arc<dyn ScoreStore>,
    config: Arc<EngineConfig>,
}

impl Engine {
    /// Create, transition and read executions.
    pub fn lifecycle(&self) -> &ExecutionLifecycle {
        &self.lifecycle
    }

    /// Report worker progress.
    pub fn progress(&self) -> &ProgressCounter {
        &self.progress
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Trigger a rule manually. See [`TriggerResolver::trigger_manual`].
    pub async fn trigger_manual(
        &self,
        project_id: &str,
        rule_id: &str,
        request: ManualTrigger,
    ) -> EngineResult<Triggered> {
        self.triggers.trigger_manual(project_id, rule_id, request).await
    }

    /// Start automatic executions for a span that just completed.
    pub async fn on_span_completed(
        &self,
        project_id: &str,
        span: &CompletedSpan,
    ) -> EngineResult<Vec<ExecutionRecord>> {
        self.triggers.on_span_completed(project_id, span).await
    }

    /// Validate a score against its schema and persist it.
    pub async fn submit_score(
        &self,
        project_id: &str,
        score: SubmittedScore,
    ) -> EngineResult<ScoreRecord> {
        self.validator.validate(project_id, &score).await?;
        let record = ScoreRecord::new(project_id, score);
        self.scores.insert(&record).await?;
        debug!(project_id, score = %record.score.name, id = %record.id, "Score recorded");
        Ok(record)
    }

    /// Create or replace a score schema after checking it is well formed.
    pub async fn upsert_score_schema(&self, schema: ScoreSchema) -> EngineResult<ScoreSchema> {
        schema.check()?;
        self.schemas.upsert(&schema).await?;
        info!(
            project_id = %schema.project_id,
            name = %schema.name,
            data_type = %schema.data_type,
            "Score schema saved"
        );
        Ok(schema)
    }

    pub async fn score_schema(&self, project_id: &str, name: &str) -> EngineResult<ScoreSchema> {
        Ok(self.schemas.get(project_id, name).await?)
    }

    pub async fn delete_score_schema(&self, project_id: &str, name: &str) -> EngineResult<()> {
        self.schemas.delete(project_id, name).await?;
        info!(project_id, name, "Score schema deleted");
        Ok(())
    }

    pub async fn list_score_schemas(&self, project_id: &str) -> EngineResult<Vec<ScoreSchema>> {
        Ok(self.schemas.list(project_id).await?)
    }

    /// Compare stored scores across experiment runs.
    pub async fn compare_experiments(
        &self,
        project_id: &str,
        experiment_ids: &[String],
        baseline_id: Option<&str>,
    ) -> EngineResult<ComparisonResult> {
        compare::check_selection(&self.config, experiment_ids, baseline_id)?;
        let records = self.scores.for_experiments(project_id, experiment_ids).await?;
        let samples: Vec<ScoreSample> = records.iter().filter_map(ScoreSample::from_record).collect();
        Ok(compare::compare(experiment_ids, baseline_id, &samples))
    }
}

/// Builder for constructing an [`Engine`].
///
/// Everything except the execution store has an in-process default.
pub struct EngineBuilder {
    store: Arc<dyn ExecutionStore>,
    schemas: Option<Arc<dyn SchemaStore>>,
    scores: Option<Arc<dyn ScoreStore>>,
    spans: Arc<dyn SpanStore>,
    dispatcher: Arc<dyn Dispatcher>,
    rules: Arc<dyn RuleCatalog>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a new builder with the given execution store.
    pub fn new(store: impl ExecutionStore + 'static) -> Self {
        Self::from_arc(Arc::new(store))
    }

    /// Like [`new`](Self::new) for a store that is already shared.
    pub fn from_arc(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            schemas: None,
            scores: None,
            spans: Arc::new(NoSpans),
            dispatcher: Arc::new(NoopDispatcher),
            rules: Arc::new(MemoryRuleCatalog::new()),
            config: EngineConfig::default(),
        }
    }

    pub fn schema_store(mut self, schemas: Arc<dyn SchemaStore>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn score_store(mut self, scores: Arc<dyn ScoreStore>) -> Self {
        self.scores = Some(scores);
        self
    }

    /// Set the span store used by manual triggers to discover targets.
    pub fn span_store(mut self, spans: Arc<dyn SpanStore>) -> Self {
        self.spans = spans;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn rules(mut self, rules: Arc<dyn RuleCatalog>) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Engine {
        let config = Arc::new(self.config);
        let schemas: Arc<dyn SchemaStore> = match self.schemas {
            Some(schemas) => schemas,
            None => Arc::new(MemorySchemaStore::new()),
        };
        let scores: Arc<dyn ScoreStore> = match self.scores {
            Some(scores) => scores,
            None => Arc::new(MemoryScoreStore::new()),
        };

        let lifecycle = ExecutionLifecycle::new(self.store.clone(), config.clone());
        let progress = ProgressCounter::new(self.store);
        let triggers = TriggerResolver::new(
            lifecycle.clone(),
            progress.clone(),
            self.rules,
            self.spans,
            self.dispatcher,
            config.clone(),
        );

        Engine {
            lifecycle,
            progress,
            triggers,
            validator: ScoreValidator::new(schemas.clone()),
            schemas,
            scores,
            config,
        }
    }
}
