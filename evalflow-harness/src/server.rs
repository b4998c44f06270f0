//! HTTP server exposing the engine.

use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{rejection::QueryRejection, FromRequest, Path, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use evalflow::{
    ComparisonResult, Engine, EngineError, ExecutionId, ExecutionPage, ExecutionRecord,
    ExecutionStatus, ListExecutions, ManualTrigger, ProgressOutcome, ScoreDataType, ScoreRecord,
    ScoreSchema, SubmittedScore, TriggerResponse, TriggerType, ValidationError,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::error;

type ApiState = Arc<Engine>;
type ApiResult<T> = Result<T, ApiError>;

/// Engine error rendered as a JSON response.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self(err.into())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ValidationError::new("query", rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            EngineError::Validation(v) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": v.to_string(), "field": v.field }),
            ),
            EngineError::NotFound { .. } => {
                (StatusCode::NOT_FOUND, json!({ "error": self.0.to_string() }))
            }
            EngineError::Conflict(_) => {
                (StatusCode::CONFLICT, json!({ "error": self.0.to_string() }))
            }
            EngineError::Infrastructure(msg) => {
                error!(error = %msg, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn execution_id(raw: &str) -> ApiResult<ExecutionId> {
    Ok(raw.parse::<ExecutionId>()?)
}

/// JSON body whose decode failures are validation errors naming the field.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ValidationError::new("body", e.body_text()))?;
        let de = &mut serde_json::Deserializer::from_slice(&bytes);
        match serde_path_to_error::deserialize(de) {
            Ok(value) => Ok(Self(value)),
            Err(e) => {
                let message = e.inner().to_string();
                let field = body_field(&e.path().to_string(), &message);
                Err(ValidationError::new(field, message).into())
            }
        }
    }
}

/// Field a JSON decode error points at. Root-level errors only name a field
/// when serde reports it missing.
fn body_field(path: &str, message: &str) -> String {
    if path != "." {
        return path.to_string();
    }
    message
        .strip_prefix("missing field `")
        .and_then(|rest| rest.split('`').next())
        .unwrap_or("body")
        .to_string()
}

/// Parse one query parameter with the same rules as its JSON form.
fn query_param<T: DeserializeOwned>(field: &str, raw: Option<String>) -> ApiResult<Option<T>> {
    raw.map(|value| {
        serde_json::from_value(serde_json::Value::String(value))
            .map_err(|e| ApiError::from(ValidationError::new(field, e.to_string())))
    })
    .transpose()
}

fn page_param(field: &str, raw: Option<String>) -> ApiResult<Option<u32>> {
    raw.map(|value| {
        value
            .parse::<u32>()
            .map_err(|_| ApiError::from(ValidationError::new(field, "must be a non-negative integer")))
    })
    .transpose()
}

/// Create the router for the engine API.
pub fn create_router(engine: ApiState) -> Router {
    Router::new()
        .route(
            "/api/projects/:project_id/rules/:rule_id/trigger",
            post(trigger_rule),
        )
        .route(
            "/api/projects/:project_id/rules/:rule_id/executions",
            get(list_executions),
        )
        .route(
            "/api/projects/:project_id/rules/:rule_id/executions/latest",
            get(latest_execution),
        )
        .route(
            "/api/projects/:project_id/executions/:execution_id",
            get(get_execution),
        )
        .route(
            "/api/projects/:project_id/executions/:execution_id/cancel",
            post(cancel_execution),
        )
        .route(
            "/api/projects/:project_id/executions/:execution_id/complete",
            post(complete_execution),
        )
        .route(
            "/api/projects/:project_id/executions/:execution_id/fail",
            post(fail_execution),
        )
        .route(
            "/api/projects/:project_id/executions/:execution_id/progress",
            post(report_progress),
        )
        .route(
            "/api/projects/:project_id/executions/:execution_id/matched",
            post(report_matched),
        )
        .route("/api/projects/:project_id/scores", post(submit_score))
        .route(
            "/api/projects/:project_id/score-configs",
            get(list_score_configs).post(save_score_config),
        )
        .route(
            "/api/projects/:project_id/score-configs/:name",
            get(get_score_config).delete(delete_score_config),
        )
        .route(
            "/api/projects/:project_id/experiments/compare",
            post(compare_experiments),
        )
        .with_state(engine)
}

async fn trigger_rule(
    State(engine): State<ApiState>,
    Path((project_id, rule_id)): Path<(String, String)>,
    ApiJson(request): ApiJson<ManualTrigger>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    // Discovery keeps running after the response is sent
    let triggered = engine.trigger_manual(&project_id, &rule_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(triggered.response)))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    trigger_type: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

async fn list_executions(
    State(engine): State<ApiState>,
    Path((project_id, rule_id)): Path<(String, String)>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<ExecutionPage>> {
    let Query(params) = params?;
    let filter = ListExecutions {
        rule_id: Some(rule_id),
        status: query_param::<ExecutionStatus>("status", params.status)?,
        trigger_type: query_param::<TriggerType>("trigger_type", params.trigger_type)?,
        page: page_param("page", params.page)?,
        limit: page_param("limit", params.limit)?,
    };
    Ok(Json(engine.lifecycle().list(&project_id, filter).await?))
}

async fn latest_execution(
    State(engine): State<ApiState>,
    Path((project_id, rule_id)): Path<(String, String)>,
) -> ApiResult<Json<ExecutionRecord>> {
    Ok(Json(engine.lifecycle().latest(&project_id, &rule_id).await?))
}

async fn get_execution(
    State(engine): State<ApiState>,
    Path((project_id, id)): Path<(String, String)>,
) -> ApiResult<Json<ExecutionRecord>> {
    let id = execution_id(&id)?;
    Ok(Json(engine.lifecycle().get(id, &project_id).await?))
}

async fn cancel_execution(
    State(engine): State<ApiState>,
    Path((project_id, id)): Path<(String, String)>,
) -> ApiResult<Json<ExecutionRecord>> {
    let id = execution_id(&id)?;
    Ok(Json(engine.lifecycle().cancel(id, &project_id).await?))
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    spans_matched: u64,
    spans_scored: u64,
    #[serde(default)]
    errors_count: u64,
}

async fn complete_execution(
    State(engine): State<ApiState>,
    Path((project_id, id)): Path<(String, String)>,
    ApiJson(body): ApiJson<CompleteBody>,
) -> ApiResult<Json<ExecutionRecord>> {
    let id = execution_id(&id)?;
    let record = engine
        .lifecycle()
        .complete(id, &project_id, body.spans_matched, body.spans_scored, body.errors_count)
        .await?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct FailBody {
    message: String,
}

async fn fail_execution(
    State(engine): State<ApiState>,
    Path((project_id, id)): Path<(String, String)>,
    ApiJson(body): ApiJson<FailBody>,
) -> ApiResult<Json<ExecutionRecord>> {
    let id = execution_id(&id)?;
    Ok(Json(engine.lifecycle().fail(id, &project_id, &body.message).await?))
}

#[derive(Debug, Deserialize)]
struct ProgressBody {
    #[serde(default)]
    delta_scored: i64,
    #[serde(default)]
    delta_errors: i64,
}

#[derive(Debug, Deserialize)]
struct MatchedBody {
    spans_matched: i64,
}

/// Reply to worker reports.
#[derive(Debug, Serialize)]
struct ProgressReply {
    completed_now: bool,
    execution: ExecutionRecord,
}

impl From<ProgressOutcome> for ProgressReply {
    fn from(outcome: ProgressOutcome) -> Self {
        Self {
            completed_now: outcome.completed_now,
            execution: outcome.record,
        }
    }
}

async fn report_progress(
    State(engine): State<ApiState>,
    Path((project_id, id)): Path<(String, String)>,
    ApiJson(body): ApiJson<ProgressBody>,
) -> ApiResult<Json<ProgressReply>> {
    let id = execution_id(&id)?;
    let outcome = engine
        .progress()
        .increment(id, &project_id, body.delta_scored, body.delta_errors)
        .await?;
    Ok(Json(outcome.into()))
}

async fn report_matched(
    State(engine): State<ApiState>,
    Path((project_id, id)): Path<(String, String)>,
    ApiJson(body): ApiJson<MatchedBody>,
) -> ApiResult<Json<ProgressReply>> {
    let id = execution_id(&id)?;
    let outcome = engine
        .progress()
        .set_matched(id, &project_id, body.spans_matched)
        .await?;
    Ok(Json(outcome.into()))
}

async fn submit_score(
    State(engine): State<ApiState>,
    Path(project_id): Path<String>,
    ApiJson(score): ApiJson<SubmittedScore>,
) -> ApiResult<(StatusCode, Json<ScoreRecord>)> {
    let record = engine.submit_score(&project_id, score).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Score schema as posted; the project comes from the path.
#[derive(Debug, Deserialize)]
struct ScoreConfigBody {
    name: String,
    data_type: ScoreDataType,
    #[serde(default)]
    min_value: Option<f64>,
    #[serde(default)]
    max_value: Option<f64>,
    #[serde(default)]
    categories: Option<Vec<String>>,
    #[serde(default)]
    description: Option<String>,
}

async fn save_score_config(
    State(engine): State<ApiState>,
    Path(project_id): Path<String>,
    ApiJson(body): ApiJson<ScoreConfigBody>,
) -> ApiResult<(StatusCode, Json<ScoreSchema>)> {
    let schema = ScoreSchema {
        project_id,
        name: body.name,
        data_type: body.data_type,
        min_value: body.min_value,
        max_value: body.max_value,
        categories: body.categories,
        description: body.description,
    };
    let saved = engine.upsert_score_schema(schema).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn list_score_configs(
    State(engine): State<ApiState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<ScoreSchema>>> {
    Ok(Json(engine.list_score_schemas(&project_id).await?))
}

async fn get_score_config(
    State(engine): State<ApiState>,
    Path((project_id, name)): Path<(String, String)>,
) -> ApiResult<Json<ScoreSchema>> {
    Ok(Json(engine.score_schema(&project_id, &name).await?))
}

async fn delete_score_config(
    State(engine): State<ApiState>,
    Path((project_id, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    engine.delete_score_schema(&project_id, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CompareBody {
    experiment_ids: Vec<String>,
    #[serde(default)]
    baseline_id: Option<String>,
}

async fn compare_experiments(
    State(engine): State<ApiState>,
    Path(project_id): Path<String>,
    ApiJson(body): ApiJson<CompareBody>,
) -> ApiResult<Json<ComparisonResult>> {
    let result = engine
        .compare_experiments(&project_id, &body.experiment_ids, body.baseline_id.as_deref())
        .await?;
    Ok(Json(result))
}

/// Start the API server.
pub async fn run_server(engine: ApiState, port: u16) {
    let app = create_router(engine);
    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port, error = %e, "Failed to bind API port");
            return;
        }
    };

    tracing::info!(port, "Evalflow API listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "API server error");
    }
}
