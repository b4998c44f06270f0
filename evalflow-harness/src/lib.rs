//! HTTP API for Evalflow.
//!
//! This crate adds a `.with_api(port)` method to a shared `Engine` that
//! spawns a JSON API for triggering rules, polling executions, reporting
//! worker progress, managing score configs and comparing experiments.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use evalflow::{EngineBuilder, SqliteExecutionStore};
//! use evalflow_harness::EngineHarnessExt;
//!
//! let engine = Arc::new(EngineBuilder::new(store).build()).with_api(3000);
//!
//! // POST http://localhost:3000/api/projects/p1/rules/r1/trigger
//! ```
//!
//! # Routes
//!
//! All routes live under `/api/projects/:project_id`:
//!
//! - `POST rules/:rule_id/trigger` - manual trigger, answers `202 Accepted`
//! - `GET rules/:rule_id/executions` - paginated history
//! - `GET rules/:rule_id/executions/latest` - most recent execution
//! - `GET executions/:execution_id` and `POST executions/:execution_id/cancel`
//! - `POST executions/:execution_id/progress`, `.../matched`, `.../complete` and
//!   `.../fail` - worker reports
//! - `POST scores`, `GET|POST score-configs`, `GET|DELETE score-configs/:name`
//! - `POST experiments/compare`
//!
//! Malformed bodies and query strings answer `400` with `{error, field}`,
//! the same shape as engine validation errors.
//!
//! For full documentation, see [evalflow](https://docs.rs/evalflow).

mod ext;
mod server;

pub use ext::EngineHarnessExt;
pub use server::{create_router, run_server, ApiError, ApiJson};
