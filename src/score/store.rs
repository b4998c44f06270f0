//! Storage traits for score schemas and submitted scores.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::schema::{ScoreRecord, ScoreSchema};
use crate::store::StoreError;

/// Project-owned score schemas, keyed by `(project_id, name)`.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Look up a schema. A missing schema is `StoreError::NotFound`.
    async fn get(&self, project_id: &str, name: &str) -> Result<ScoreSchema, StoreError>;

    /// Insert or replace a schema.
    async fn upsert(&self, schema: &ScoreSchema) -> Result<(), StoreError>;

    /// Delete a schema. Deleting a missing schema is `StoreError::NotFound`.
    async fn delete(&self, project_id: &str, name: &str) -> Result<(), StoreError>;

    /// All schemas of a project, ordered by name.
    async fn list(&self, project_id: &str) -> Result<Vec<ScoreSchema>, StoreError>;
}

/// Persisted scores.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    async fn insert(&self, score: &ScoreRecord) -> Result<(), StoreError>;

    /// All scores attached to any of the given experiments.
    async fn for_experiments(
        &self,
        project_id: &str,
        experiment_ids: &[String],
    ) -> Result<Vec<ScoreRecord>, StoreError>;
}

/// In-process schema store.
#[derive(Debug, Default)]
pub struct MemorySchemaStore {
    schemas: RwLock<HashMap<(String, String), ScoreSchema>>,
}

impl MemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchemaStore for MemorySchemaStore {
    async fn get(&self, project_id: &str, name: &str) -> Result<ScoreSchema, StoreError> {
        self.schemas
            .read()
            .await
            .get(&(project_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found("score schema", name))
    }

    async fn upsert(&self, schema: &ScoreSchema) -> Result<(), StoreError> {
        self.schemas.write().await.insert(
            (schema.project_id.clone(), schema.name.clone()),
            schema.clone(),
        );
        Ok(())
    }

    async fn delete(&self, project_id: &str, name: &str) -> Result<(), StoreError> {
        self.schemas
            .write()
            .await
            .remove(&(project_id.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("score schema", name))
    }

    async fn list(&self, project_id: &str) -> Result<Vec<ScoreSchema>, StoreError> {
        let mut schemas: Vec<ScoreSchema> = self
            .schemas
            .read()
            .await
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schemas)
    }
}

/// In-process score store.
#[derive(Debug, Default)]
pub struct MemoryScoreStore {
    scores: RwLock<Vec<ScoreRecord>>,
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn insert(&self, score: &ScoreRecord) -> Result<(), StoreError> {
        self.scores.write().await.push(score.clone());
        Ok(())
    }

    async fn for_experiments(
        &self,
        project_id: &str,
        experiment_ids: &[String],
    ) -> Result<Vec<ScoreRecord>, StoreError> {
        Ok(self
            .scores
            .read()
            .await
            .iter()
            .filter(|s| {
                s.project_id == project_id
                    && s
                        .score
                        .experiment_id
                        .as_ref()
                        .is_some_and(|e| experiment_ids.contains(e))
            })
            .cloned()
            .collect())
    }
}
