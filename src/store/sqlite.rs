//! SQLite implementation of ExecutionStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{ExecutionPage, ExecutionQuery, ExecutionStore, ProgressOutcome, StoreError, Transition};
use crate::execution::{ExecutionId, ExecutionRecord, ExecutionStatus, Finish, Metadata};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS eval_executions (
    id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    trigger_type TEXT NOT NULL,
    spans_matched INTEGER NOT NULL DEFAULT 0,
    spans_scored INTEGER NOT NULL DEFAULT 0,
    errors_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    duration_ms INTEGER,
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_eval_executions_rule
ON eval_executions(project_id, rule_id, created_at);

CREATE INDEX IF NOT EXISTS idx_eval_executions_status
ON eval_executions(project_id, status, created_at)
"#;

const COLUMNS: &str = "id, rule_id, project_id, status, trigger_type, spans_matched, \
    spans_scored, errors_count, created_at, started_at, completed_at, duration_ms, \
    error_message, metadata";

const OPEN: &str = "status IN ('pending', 'running')";

/// SQLite-backed execution store.
///
/// Every mutation is one conditional `UPDATE ... RETURNING` statement. SQLite
/// evaluates all `SET` expressions against the pre-update row and serializes
/// writers, so the counter increment and the completion check cannot interleave
/// with another worker's report.
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Create a new SqliteExecutionStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the executions table.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    async fn fetch(&self, id: ExecutionId, project_id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM eval_executions WHERE id = ? AND project_id = ?",
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| decode_row(&row))
            .transpose()
    }

    /// Turn the RETURNING row of a conditional update into an outcome. No row
    /// means the execution is missing or already terminal.
    async fn progress_outcome(
        &self,
        id: ExecutionId,
        project_id: &str,
        row: Option<SqliteRow>,
    ) -> Result<ProgressOutcome, StoreError> {
        match row {
            Some(row) => {
                let record = decode_row(&row)?;
                Ok(ProgressOutcome {
                    completed_now: record.status == ExecutionStatus::Completed,
                    applied: true,
                    record,
                })
            }
            None => {
                let record = self.unchanged(id, project_id).await?;
                Ok(ProgressOutcome {
                    completed_now: false,
                    applied: false,
                    record,
                })
            }
        }
    }

    async fn transition(
        &self,
        id: ExecutionId,
        project_id: &str,
        row: Option<SqliteRow>,
    ) -> Result<Transition, StoreError> {
        match row {
            Some(row) => Ok(Transition::Applied(decode_row(&row)?)),
            None => Ok(Transition::Unchanged(self.unchanged(id, project_id).await?)),
        }
    }

    async fn unchanged(&self, id: ExecutionId, project_id: &str) -> Result<ExecutionRecord, StoreError> {
        self.fetch(id, project_id)
            .await?
            .ok_or_else(|| StoreError::not_found("execution", id))
    }
}

fn to_i64(n: u64) -> Result<i64, StoreError> {
    i64::try_from(n).map_err(|_| StoreError::Serialization(format!("counter overflow: {}", n)))
}

fn to_u64(n: i64) -> Result<u64, StoreError> {
    u64::try_from(n).map_err(|_| StoreError::Serialization(format!("negative counter: {}", n)))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {}", ms)))
}

fn decode_row(row: &SqliteRow) -> Result<ExecutionRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let trigger_type: String = row.try_get("trigger_type")?;
    let metadata: String = row.try_get("metadata")?;
    let started_at: Option<i64> = row.try_get("started_at")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;

    Ok(ExecutionRecord {
        id: id
            .parse()
            .map_err(|e: crate::error::ValidationError| StoreError::Serialization(e.to_string()))?,
        rule_id: row.try_get("rule_id")?,
        project_id: row.try_get("project_id")?,
        status: status
            .parse()
            .map_err(|e: crate::error::ValidationError| StoreError::Serialization(e.to_string()))?,
        trigger_type: trigger_type
            .parse()
            .map_err(|e: crate::error::ValidationError| StoreError::Serialization(e.to_string()))?,
        spans_matched: to_u64(row.try_get("spans_matched")?)?,
        spans_scored: to_u64(row.try_get("spans_scored")?)?,
        errors_count: to_u64(row.try_get("errors_count")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        started_at: started_at.map(from_millis).transpose()?,
        completed_at: completed_at.map(from_millis).transpose()?,
        duration_ms: row.try_get("duration_ms")?,
        error_message: row.try_get("error_message")?,
        metadata: serde_json::from_str::<Metadata>(&metadata)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
    })
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(&format!(
            "INSERT INTO eval_executions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLUMNS
        ))
        .bind(record.id.to_string())
        .bind(record.rule_id.as_str())
        .bind(record.project_id.as_str())
        .bind(record.status.as_str())
        .bind(record.trigger_type.as_str())
        .bind(to_i64(record.spans_matched)?)
        .bind(to_i64(record.spans_scored)?)
        .bind(to_i64(record.errors_count)?)
        .bind(record.created_at.timestamp_millis())
        .bind(record.started_at.map(|t| t.timestamp_millis()))
        .bind(record.completed_at.map(|t| t.timestamp_millis()))
        .bind(record.duration_ms)
        .bind(record.error_message.as_deref())
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: ExecutionId, project_id: &str) -> Result<ExecutionRecord, StoreError> {
        self.unchanged(id, project_id).await
    }

    async fn latest(
        &self,
        project_id: &str,
        rule_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM eval_executions
            WHERE project_id = ? AND rule_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(project_id)
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| decode_row(&row))
            .transpose()
    }

    async fn list(
        &self,
        project_id: &str,
        query: &ExecutionQuery,
    ) -> Result<ExecutionPage, StoreError> {
        // Build WHERE clause from the filters that are present
        let mut clauses = vec!["project_id = ?"];
        if query.rule_id.is_some() {
            clauses.push("rule_id = ?");
        }
        if query.status.is_some() {
            clauses.push("status = ?");
        }
        if query.trigger_type.is_some() {
            clauses.push("trigger_type = ?");
        }
        let where_clause = clauses.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) FROM eval_executions WHERE {}", where_clause);
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql).bind(project_id);
        if let Some(rule_id) = &query.rule_id {
            count = count.bind(rule_id.as_str());
        }
        if let Some(status) = query.status {
            count = count.bind(status.as_str());
        }
        if let Some(trigger_type) = query.trigger_type {
            count = count.bind(trigger_type.as_str());
        }
        let total = to_u64(count.fetch_one(&self.pool).await?)?;

        let select_sql = format!(
            "SELECT {} FROM eval_executions WHERE {} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            COLUMNS, where_clause
        );
        let mut select = sqlx::query(&select_sql).bind(project_id);
        if let Some(rule_id) = &query.rule_id {
            select = select.bind(rule_id.as_str());
        }
        if let Some(status) = query.status {
            select = select.bind(status.as_str());
        }
        if let Some(trigger_type) = query.trigger_type {
            select = select.bind(trigger_type.as_str());
        }
        let rows = select
            .bind(i64::from(query.limit))
            .bind(to_i64(query.offset())?)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, StoreError>>()?;

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
        let sql = format!(
            r#"
            UPDATE eval_executions
            SET status = 'running', started_at = COALESCE(started_at, ?)
            WHERE id = ? AND project_id = ? AND {}
            RETURNING {}
            "#,
            OPEN, COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(now.timestamp_millis())
            .bind(id.to_string())
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        self.transition(id, project_id, row).await
    }

    async fn apply_progress(
        &self,
        id: ExecutionId,
        project_id: &str,
        scored: u64,
        errors: u64,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, StoreError> {
        // All SET expressions read the pre-update row, so the completion
        // condition adds the delta explicitly.
        let sql = format!(
            r#"
            UPDATE eval_executions
            SET spans_scored = spans_scored + ?,
                errors_count = errors_count + ?,
                started_at = COALESCE(started_at, ?),
                status = CASE
                    WHEN spans_matched > 0 AND spans_scored + errors_count + ? >= spans_matched
                    THEN 'completed' ELSE 'running' END,
                completed_at = CASE
                    WHEN spans_matched > 0 AND spans_scored + errors_count + ? >= spans_matched
                    THEN ? ELSE NULL END,
                duration_ms = CASE
                    WHEN spans_matched > 0 AND spans_scored + errors_count + ? >= spans_matched
                    THEN MAX(0, ? - COALESCE(started_at, ?)) ELSE NULL END
            WHERE id = ? AND project_id = ? AND {}
            RETURNING {}
            "#,
            OPEN, COLUMNS
        );
        let scored = to_i64(scored)?;
        let errors = to_i64(errors)?;
        let delta = scored
            .checked_add(errors)
            .ok_or_else(|| StoreError::Serialization("progress delta overflow".into()))?;
        let now_ms = now.timestamp_millis();

        let row = sqlx::query(&sql)
            .bind(scored)
            .bind(errors)
            .bind(now_ms)
            .bind(delta)
            .bind(delta)
            .bind(now_ms)
            .bind(delta)
            .bind(now_ms)
            .bind(now_ms)
            .bind(id.to_string())
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        self.progress_outcome(id, project_id, row).await
    }

    async fn set_spans_matched(
        &self,
        id: ExecutionId,
        project_id: &str,
        matched: u64,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, StoreError> {
        let sql = format!(
            r#"
            UPDATE eval_executions
            SET spans_matched = ?,
                status = CASE
                    WHEN ? > 0 AND spans_scored + errors_count >= ?
                    THEN 'completed' ELSE status END,
                completed_at = CASE
                    WHEN ? > 0 AND spans_scored + errors_count >= ?
                    THEN ? ELSE completed_at END,
                duration_ms = CASE
                    WHEN ? > 0 AND spans_scored + errors_count >= ?
                    THEN MAX(0, ? - COALESCE(started_at, created_at)) ELSE duration_ms END
            WHERE id = ? AND project_id = ? AND {}
            RETURNING {}
            "#,
            OPEN, COLUMNS
        );
        let matched = to_i64(matched)?;
        let now_ms = now.timestamp_millis();

        let row = sqlx::query(&sql)
            .bind(matched)
            .bind(matched)
            .bind(matched)
            .bind(matched)
            .bind(matched)
            .bind(now_ms)
            .bind(matched)
            .bind(matched)
            .bind(now_ms)
            .bind(id.to_string())
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        self.progress_outcome(id, project_id, row).await
    }

    async fn finish(
        &self,
        id: ExecutionId,
        project_id: &str,
        finish: &Finish,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let (matched, scored, errors, message) = match finish {
            Finish::Completed {
                spans_matched,
                spans_scored,
                errors_count,
            } => (
                Some(to_i64(*spans_matched)?),
                Some(to_i64(*spans_scored)?),
                Some(to_i64(*errors_count)?),
                None,
            ),
            Finish::Failed { message } => (None, None, None, Some(message.as_str())),
            Finish::Cancelled => (None, None, None, None),
        };

        let sql = format!(
            r#"
            UPDATE eval_executions
            SET status = ?,
                spans_matched = COALESCE(?, spans_matched),
                spans_scored = COALESCE(?, spans_scored),
                errors_count = COALESCE(?, errors_count),
                error_message = COALESCE(?, error_message),
                completed_at = ?,
                duration_ms = MAX(0, ? - COALESCE(started_at, created_at))
            WHERE id = ? AND project_id = ? AND {}
            RETURNING {}
            "#,
            OPEN, COLUMNS
        );
        let now_ms = now.timestamp_millis();

        let row = sqlx::query(&sql)
            .bind(finish.status().as_str())
            .bind(matched)
            .bind(scored)
            .bind(errors)
            .bind(message)
            .bind(now_ms)
            .bind(now_ms)
            .bind(id.to_string())
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        self.transition(id, project_id, row).await
    }

    async fn merge_metadata(
        &self,
        id: ExecutionId,
        project_id: &str,
        patch: &Metadata,
    ) -> Result<Transition, StoreError> {
        let patch = serde_json::to_string(patch)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let sql = format!(
            r#"
            UPDATE eval_executions
            SET metadata = json_patch(metadata, ?)
            WHERE id = ? AND project_id = ? AND {}
            RETURNING {}
            "#,
            OPEN, COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(patch)
            .bind(id.to_string())
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        self.transition(id, project_id, row).await
    }
}
