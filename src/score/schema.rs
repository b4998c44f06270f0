//! Score schemas and submitted score values.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::ValidationError;

/// Declared type of a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoreDataType {
    Numeric,
    Categorical,
    Boolean,
}

impl ScoreDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Numeric => "NUMERIC",
            Self::Categorical => "CATEGORICAL",
            Self::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for ScoreDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScoreDataType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NUMERIC" => Ok(Self::Numeric),
            "CATEGORICAL" => Ok(Self::Categorical),
            "BOOLEAN" => Ok(Self::Boolean),
            other => Err(ValidationError::new(
                "data_type",
                format!("unknown data type '{}'", other),
            )),
        }
    }
}

/// Named contract a score must satisfy within a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSchema {
    pub project_id: String,
    pub name: String,
    pub data_type: ScoreDataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ScoreSchema {
    pub fn numeric(project_id: &str, name: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            project_id: project_id.to_string(),
            name: name.to_string(),
            data_type: ScoreDataType::Numeric,
            min_value: min,
            max_value: max,
            categories: None,
            description: None,
        }
    }

    pub fn categorical(project_id: &str, name: &str, categories: &[&str]) -> Self {
        Self {
            project_id: project_id.to_string(),
            name: name.to_string(),
            data_type: ScoreDataType::Categorical,
            min_value: None,
            max_value: None,
            categories: Some(categories.iter().map(|c| c.to_string()).collect()),
            description: None,
        }
    }

    pub fn boolean(project_id: &str, name: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            name: name.to_string(),
            data_type: ScoreDataType::Boolean,
            min_value: None,
            max_value: None,
            categories: None,
            description: None,
        }
    }

    /// Check that the schema itself is well-formed before it is stored.
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.project_id.trim().is_empty() {
            return Err(ValidationError::new("project_id", "must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("name", "must not be empty"));
        }

        match self.data_type {
            ScoreDataType::Numeric => {
                for (field, bound) in [("min_value", self.min_value), ("max_value", self.max_value)] {
                    if bound.is_some_and(|b| !b.is_finite()) {
                        return Err(ValidationError::new(field, "must be a finite number"));
                    }
                }
                if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
                    if min > max {
                        return Err(ValidationError::new(
                            "min_value",
                            format!("{} is greater than max_value {}", min, max),
                        ));
                    }
                }
            }
            ScoreDataType::Categorical | ScoreDataType::Boolean => {
                if self.min_value.is_some() || self.max_value.is_some() {
                    return Err(ValidationError::new(
                        "min_value",
                        format!("bounds are only allowed for NUMERIC, not {}", self.data_type),
                    ));
                }
            }
        }

        match (self.data_type, &self.categories) {
            (ScoreDataType::Categorical, None) => Err(ValidationError::new(
                "categories",
                "required for CATEGORICAL",
            )),
            (ScoreDataType::Categorical, Some(categories)) => {
                if categories.is_empty() {
                    return Err(ValidationError::new("categories", "must not be empty"));
                }
                let mut seen = HashSet::new();
                for category in categories {
                    if category.is_empty() {
                        return Err(ValidationError::new("categories", "contains an empty label"));
                    }
                    if !seen.insert(category.as_str()) {
                        return Err(ValidationError::new(
                            "categories",
                            format!("duplicate category '{}'", category),
                        ));
                    }
                }
                Ok(())
            }
            (other, Some(_)) => Err(ValidationError::new(
                "categories",
                format!("only allowed for CATEGORICAL, not {}", other),
            )),
            (_, None) => Ok(()),
        }
    }
}

/// A score value submitted by a worker or SDK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedScore {
    pub name: String,
    pub data_type: ScoreDataType,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub string_value: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl SubmittedScore {
    pub fn numeric(name: &str, value: f64) -> Self {
        Self::new(name, ScoreDataType::Numeric, Some(value), None)
    }

    pub fn categorical(name: &str, value: &str) -> Self {
        Self::new(name, ScoreDataType::Categorical, None, Some(value.to_string()))
    }

    pub fn boolean(name: &str, value: bool) -> Self {
        Self::new(name, ScoreDataType::Boolean, Some(if value { 1.0 } else { 0.0 }), None)
    }

    fn new(
        name: &str,
        data_type: ScoreDataType,
        value: Option<f64>,
        string_value: Option<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            value,
            string_value,
            trace_id: None,
            span_id: None,
            experiment_id: None,
            comment: None,
        }
    }

    /// Attach the score to an experiment run.
    pub fn for_experiment(mut self, experiment_id: &str) -> Self {
        self.experiment_id = Some(experiment_id.to_string());
        self
    }

    /// Attach the score to a span.
    pub fn for_span(mut self, trace_id: &str, span_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self.span_id = Some(span_id.to_string());
        self
    }
}

/// A validated, persisted score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub id: Ulid,
    pub project_id: String,
    #[serde(flatten)]
    pub score: SubmittedScore,
    pub created_at: DateTime<Utc>,
}

impl ScoreRecord {
    pub fn new(project_id: &str, score: SubmittedScore) -> Self {
        Self {
            id: Ulid::new(),
            project_id: project_id.to_string(),
            score,
            created_at: crate::execution::now(),
        }
    }
}
