//! SQLite implementations of SchemaStore and ScoreStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::schema::{ScoreDataType, ScoreRecord, ScoreSchema, SubmittedScore};
use super::store::{SchemaStore, ScoreStore};
use crate::error::ValidationError;
use crate::store::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS eval_score_configs (
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    data_type TEXT NOT NULL,
    min_value REAL,
    max_value REAL,
    categories TEXT,
    description TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (project_id, name)
);

CREATE TABLE IF NOT EXISTS eval_scores (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    data_type TEXT NOT NULL,
    value REAL,
    string_value TEXT,
    trace_id TEXT,
    span_id TEXT,
    experiment_id TEXT,
    comment TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_eval_scores_experiment
ON eval_scores(project_id, experiment_id, name)
"#;

/// SQLite-backed store for score schemas and scores.
#[derive(Clone)]
pub struct SqliteScoreStore {
    pool: SqlitePool,
}

impl SqliteScoreStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the score tables.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}

fn data_type(row: &SqliteRow) -> Result<ScoreDataType, StoreError> {
    let raw: String = row.try_get("data_type")?;
    raw.parse()
        .map_err(|e: ValidationError| StoreError::Serialization(e.to_string()))
}

fn decode_schema(row: &SqliteRow) -> Result<ScoreSchema, StoreError> {
    let categories: Option<String> = row.try_get("categories")?;
    Ok(ScoreSchema {
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        data_type: data_type(row)?,
        min_value: row.try_get("min_value")?,
        max_value: row.try_get("max_value")?,
        categories: categories
            .map(|c| serde_json::from_str(&c))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        description: row.try_get("description")?,
    })
}

fn decode_score(row: &SqliteRow) -> Result<ScoreRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(ScoreRecord {
        id: id
            .parse()
            .map_err(|e: ulid::DecodeError| StoreError::Serialization(e.to_string()))?,
        project_id: row.try_get("project_id")?,
        score: SubmittedScore {
            name: row.try_get("name")?,
            data_type: data_type(row)?,
            value: row.try_get("value")?,
            string_value: row.try_get("string_value")?,
            trace_id: row.try_get("trace_id")?,
            span_id: row.try_get("span_id")?,
            experiment_id: row.try_get("experiment_id")?,
            comment: row.try_get("comment")?,
        },
        created_at: DateTime::<Utc>::from_timestamp_millis(created_at).ok_or_else(|| {
            StoreError::Serialization(format!("timestamp out of range: {}", created_at))
        })?,
    })
}

#[async_trait]
impl SchemaStore for SqliteScoreStore {
    async fn get(&self, project_id: &str, name: &str) -> Result<ScoreSchema, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT project_id, name, data_type, min_value, max_value, categories, description
            FROM eval_score_configs
            WHERE project_id = ? AND name = ?
            "#,
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("score schema", name))?;

        decode_schema(&row)
    }

    async fn upsert(&self, schema: &ScoreSchema) -> Result<(), StoreError> {
        let categories = schema
            .categories
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO eval_score_configs
                (project_id, name, data_type, min_value, max_value, categories, description)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (project_id, name) DO UPDATE SET
                data_type = excluded.data_type,
                min_value = excluded.min_value,
                max_value = excluded.max_value,
                categories = excluded.categories,
                description = excluded.description,
                updated_at = datetime('now')
            "#,
        )
        .bind(schema.project_id.as_str())
        .bind(schema.name.as_str())
        .bind(schema.data_type.as_str())
        .bind(schema.min_value)
        .bind(schema.max_value)
        .bind(categories)
        .bind(schema.description.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, project_id: &str, name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM eval_score_configs WHERE project_id = ? AND name = ?")
            .bind(project_id)
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("score schema", name));
        }
        Ok(())
    }

    async fn list(&self, project_id: &str) -> Result<Vec<ScoreSchema>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT project_id, name, data_type, min_value, max_value, categories, description
            FROM eval_score_configs
            WHERE project_id = ?
            ORDER BY name
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_schema).collect()
    }
}

#[async_trait]
impl ScoreStore for SqliteScoreStore {
    async fn insert(&self, score: &ScoreRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO eval_scores
                (id, project_id, name, data_type, value, string_value,
                 trace_id, span_id, experiment_id, comment, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(score.id.to_string())
        .bind(score.project_id.as_str())
        .bind(score.score.name.as_str())
        .bind(score.score.data_type.as_str())
        .bind(score.score.value)
        .bind(score.score.string_value.as_deref())
        .bind(score.score.trace_id.as_deref())
        .bind(score.score.span_id.as_deref())
        .bind(score.score.experiment_id.as_deref())
        .bind(score.score.comment.as_deref())
        .bind(score.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn for_experiments(
        &self,
        project_id: &str,
        experiment_ids: &[String],
    ) -> Result<Vec<ScoreRecord>, StoreError> {
        if experiment_ids.is_empty() {
            return Ok(vec![]);
        }

        // Build placeholders for IN clause
        let placeholders: Vec<&str> = experiment_ids.iter().map(|_| "?").collect();
        let sql = format!(
            r#"
            SELECT id, project_id, name, data_type, value, string_value,
                   trace_id, span_id, experiment_id, comment, created_at
            FROM eval_scores
            WHERE project_id = ? AND experiment_id IN ({})
            ORDER BY created_at
            "#,
            placeholders.join(",")
        );

        let mut query = sqlx::query(&sql).bind(project_id);
        for id in experiment_ids {
            query = query.bind(id.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter().map(decode_score).collect()
    }
}
