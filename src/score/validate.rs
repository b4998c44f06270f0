//! Score validation against an optional schema.

use std::sync::Arc;

use tracing::{debug, warn};

use super::schema::{ScoreDataType, ScoreSchema, SubmittedScore};
use super::store::SchemaStore;
use crate::error::{EngineError, EngineResult, ValidationError};

/// Validate a score value against a schema.
///
/// `None` means no schema is declared for the score name, and every value is
/// accepted.
pub fn validate(
    schema: Option<&ScoreSchema>,
    data_type: ScoreDataType,
    value: Option<f64>,
    string_value: Option<&str>,
) -> Result<(), ValidationError> {
    if value.is_some_and(|v| !v.is_finite()) {
        return Err(ValidationError::new("value", "must be a finite number"));
    }

    let Some(schema) = schema else {
        return Ok(());
    };

    if data_type != schema.data_type {
        return Err(ValidationError::new(
            "data_type",
            format!(
                "score '{}' is declared {} but {} was submitted",
                schema.name, schema.data_type, data_type
            ),
        ));
    }

    match schema.data_type {
        ScoreDataType::Numeric => {
            let value = value
                .ok_or_else(|| ValidationError::new("value", "required for NUMERIC scores"))?;
            if let Some(min) = schema.min_value {
                if value < min {
                    return Err(ValidationError::new(
                        "value",
                        format!("{} is below the minimum {}", value, min),
                    ));
                }
            }
            if let Some(max) = schema.max_value {
                if value > max {
                    return Err(ValidationError::new(
                        "value",
                        format!("{} is above the maximum {}", value, max),
                    ));
                }
            }
            Ok(())
        }
        ScoreDataType::Categorical => {
            let label = string_value.ok_or_else(|| {
                ValidationError::new("string_value", "required for CATEGORICAL scores")
            })?;
            let allowed = schema.categories.as_deref().unwrap_or_default();
            if !allowed.iter().any(|c| c == label) {
                return Err(ValidationError::new(
                    "string_value",
                    format!("'{}' is not one of [{}]", label, allowed.join(", ")),
                ));
            }
            Ok(())
        }
        ScoreDataType::Boolean => match (value, string_value) {
            (Some(v), _) if v == 0.0 || v == 1.0 => Ok(()),
            (Some(v), _) => Err(ValidationError::new(
                "value",
                format!("{} is not a boolean; expected 0 or 1", v),
            )),
            (None, Some(s)) if parse_bool(s).is_some() => Ok(()),
            (None, Some(s)) => Err(ValidationError::new(
                "string_value",
                format!("'{}' is not a boolean; expected true, false, 0 or 1", s),
            )),
            (None, None) => Err(ValidationError::new(
                "value",
                "required for BOOLEAN scores",
            )),
        },
    }
}

/// Parse the string form of a boolean score.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Looks up the schema for a submitted score and validates against it.
#[derive(Clone)]
pub struct ScoreValidator {
    schemas: Arc<dyn SchemaStore>,
}

impl ScoreValidator {
    pub fn new(schemas: Arc<dyn SchemaStore>) -> Self {
        Self { schemas }
    }

    /// Validate a submission.
    ///
    /// A missing schema accepts the score. Any other lookup failure blocks the
    /// submission: skipping validation during a store outage would bypass the
    /// project's declared constraints.
    pub async fn validate(&self, project_id: &str, score: &SubmittedScore) -> EngineResult<()> {
        if score.name.trim().is_empty() {
            return Err(EngineError::validation("name", "must not be empty"));
        }

        let schema = match self.schemas.get(project_id, &score.name).await {
            Ok(schema) => Some(schema),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(project_id, score = %score.name, error = %e, "Score schema lookup failed");
                return Err(EngineError::Infrastructure(e.to_string()));
            }
        };

        validate(
            schema.as_ref(),
            score.data_type,
            score.value,
            score.string_value.as_deref(),
        )
        .map_err(|e| {
            debug!(project_id, score = %score.name, error = %e, "Score rejected");
            EngineError::Validation(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_bounds() {
        let schema = ScoreSchema::numeric("p", "accuracy", Some(0.0), Some(1.0));
        for rejected in [-0.1, 1.1] {
            let err = validate(Some(&schema), ScoreDataType::Numeric, Some(rejected), None)
                .unwrap_err();
            assert_eq!(err.field, "value");
        }
        for accepted in [0.0, 0.5, 1.0] {
            assert!(validate(Some(&schema), ScoreDataType::Numeric, Some(accepted), None).is_ok());
        }
    }

    #[test]
    fn test_numeric_open_bounds() {
        let schema = ScoreSchema::numeric("p", "latency", Some(0.0), None);
        assert!(validate(Some(&schema), ScoreDataType::Numeric, Some(1e9), None).is_ok());
        assert!(validate(Some(&schema), ScoreDataType::Numeric, Some(-1.0), None).is_err());
        let err = validate(Some(&schema), ScoreDataType::Numeric, None, None).unwrap_err();
        assert!(err.message.contains("required"));
    }

    #[test]
    fn test_categorical_membership_is_case_sensitive() {
        let schema = ScoreSchema::categorical("p", "quality", &["good", "bad"]);
        assert!(validate(Some(&schema), ScoreDataType::Categorical, None, Some("good")).is_ok());
        let err = validate(Some(&schema), ScoreDataType::Categorical, None, Some("ugly"))
            .unwrap_err();
        assert_eq!(err.field, "string_value");
        assert!(validate(Some(&schema), ScoreDataType::Categorical, None, Some("Good")).is_err());
        assert!(validate(Some(&schema), ScoreDataType::Categorical, None, None).is_err());
    }

    #[test]
    fn test_boolean_shapes() {
        let schema = ScoreSchema::boolean("p", "is_safe");
        let check = |v: Option<f64>, s: Option<&str>| {
            validate(Some(&schema), ScoreDataType::Boolean, v, s)
        };
        assert!(check(Some(0.0), None).is_ok());
        assert!(check(Some(1.0), None).is_ok());
        assert!(check(Some(0.5), None).is_err());
        assert!(check(Some(2.0), None).is_err());
        assert!(check(None, Some("true")).is_ok());
        assert!(check(None, Some("FALSE")).is_ok());
        assert!(check(None, Some("maybe")).is_err());
        assert!(check(None, None).is_err());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let schema = ScoreSchema::numeric("p", "accuracy", None, None);
        let err = validate(Some(&schema), ScoreDataType::Boolean, Some(1.0), None).unwrap_err();
        assert_eq!(err.field, "data_type");
    }

    #[test]
    fn test_no_schema_accepts_anything_well_typed() {
        assert!(validate(None, ScoreDataType::Numeric, Some(42.0), None).is_ok());
        assert!(validate(None, ScoreDataType::Categorical, None, Some("ugly")).is_ok());
        assert!(validate(None, ScoreDataType::Numeric, Some(f64::INFINITY), None).is_err());
    }
}
