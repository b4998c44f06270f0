//! # Evalflow
//!
//! Execution tracking for LLM evaluation runs.
//!
//! An evaluation rule scores spans. Every time it runs, automatically for a
//! single completed span or manually over a batch of historical spans, the
//! run is recorded as an execution with a lifecycle, progress counters and a
//! precise completion moment.
//!
//! ## Why Evalflow?
//!
//! - **Exactly-once completion** - Concurrent workers report progress; exactly one report observes the completion
//! - **Deferred match counts** - Manual triggers answer immediately and learn how many spans matched later
//! - **Idempotent terminal writes** - Redelivered worker messages never reopen or double-complete an execution
//! - **Embeddable** - A library, not a service. Runs in your process.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use evalflow::{EngineBuilder, ManualTrigger, SqliteExecutionStore};
//!
//! let store = SqliteExecutionStore::new(pool);
//! store.run_migrations().await?;
//!
//! let engine = EngineBuilder::new(store)
//!     .rules(catalog)
//!     .span_store(traces)
//!     .dispatcher(queue)
//!     .build();
//!
//! let triggered = engine
//!     .trigger_manual("proj-1", "rule-1", ManualTrigger::default())
//!     .await?;
//!
//! // Workers, once per scored span:
//! let done = engine
//!     .progress()
//!     .increment_and_check_completion(id, "proj-1", 1, 0)
//!     .await?;
//! ```
//!
//! ## Scores and Experiments
//!
//! Scores are validated against optional per-project schemas and can be
//! compared across experiment runs:
//!
//! ```rust,ignore
//! engine
//!     .upsert_score_schema(ScoreSchema::numeric("proj-1", "accuracy", Some(0.0), Some(1.0)))
//!     .await?;
//! engine
//!     .submit_score("proj-1", SubmittedScore::numeric("accuracy", 0.82).for_experiment("exp-a"))
//!     .await?;
//! let report = engine
//!     .compare_experiments("proj-1", &experiments, Some("exp-a"))
//!     .await?;
//! ```
//!
//! ## HTTP API
//!
//! Use `evalflow-harness` to serve the engine over HTTP:
//!
//! ```rust,ignore
//! use evalflow_harness::EngineHarnessExt;
//!
//! let engine = Arc::new(engine).with_api(3000);
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable SQLite-backed execution and score storage

pub mod compare;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod lifecycle;
pub mod progress;
pub mod score;
pub mod store;
pub mod trigger;

pub use compare::{
    CategoryStats, ComparisonResult, Direction, ScoreAggregate, ScoreComparison, ScoreDiff,
    ScoreSample, ScoreStats,
};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult, ValidationError};
pub use execution::{
    ExecutionId, ExecutionRecord, ExecutionStatus, Finish, Metadata, TriggerType,
};
pub use lifecycle::{ExecutionLifecycle, ListExecutions};
pub use progress::ProgressCounter;
pub use score::{
    MemorySchemaStore, MemoryScoreStore, SchemaStore, ScoreDataType, ScoreRecord, ScoreSchema,
    ScoreStore, ScoreValidator, SubmittedScore,
};
pub use store::{
    ExecutionPage, ExecutionQuery, ExecutionStore, MemoryExecutionStore, ProgressOutcome,
    StoreError, Transition,
};
pub use trigger::{
    CompletedSpan, Dispatcher, EvaluationRule, ManualTrigger, MemoryRuleCatalog, NoSpans,
    NoopDispatcher, RuleCatalog, SpanFilter, SpanQuery, SpanStore, TimeRange, TriggerResolver,
    TriggerResponse, Triggered,
};

#[cfg(feature = "sqlite")]
pub use score::SqliteScoreStore;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;
