//! Score schemas, submission and experiment comparison over SQLite.

use std::sync::Arc;

use evalflow::{
    Direction, Engine, EngineBuilder, EngineError, ScoreAggregate, ScoreDiff, ScoreSchema,
    SqliteExecutionStore, SqliteScoreStore, SubmittedScore,
};
use sqlx::sqlite::SqlitePoolOptions;

async fn setup_engine() -> Engine {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    let executions = SqliteExecutionStore::new(pool.clone());
    executions.run_migrations().await.unwrap();
    let scores = Arc::new(SqliteScoreStore::new(pool));
    scores.run_migrations().await.unwrap();

    EngineBuilder::new(executions)
        .schema_store(scores.clone())
        .score_store(scores)
        .build()
}

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_schema_upsert_replaces() {
    let engine = setup_engine().await;
    engine
        .upsert_score_schema(ScoreSchema::numeric("proj-1", "accuracy", Some(0.0), Some(1.0)))
        .await
        .unwrap();
    engine
        .upsert_score_schema(ScoreSchema::numeric("proj-1", "accuracy", Some(0.0), Some(100.0)))
        .await
        .unwrap();

    let schema = engine.score_schema("proj-1", "accuracy").await.unwrap();
    assert_eq!(schema.max_value, Some(100.0));
    assert_eq!(engine.list_score_schemas("proj-1").await.unwrap().len(), 1);
    assert!(engine.score_schema("proj-2", "accuracy").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_categorical_schema_round_trips() {
    let engine = setup_engine().await;
    let schema = ScoreSchema::categorical("proj-1", "tone", &["formal", "casual"]);
    engine.upsert_score_schema(schema.clone()).await.unwrap();
    assert_eq!(engine.score_schema("proj-1", "tone").await.unwrap(), schema);

    engine
        .submit_score("proj-1", SubmittedScore::categorical("tone", "casual"))
        .await
        .unwrap();
    let err = engine
        .submit_score("proj-1", SubmittedScore::categorical("tone", "snarky"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_delete_missing_schema_is_not_found() {
    let engine = setup_engine().await;
    let err = engine.delete_score_schema("proj-1", "nope").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_numeric_bounds_and_nan() {
    let engine = setup_engine().await;
    engine
        .upsert_score_schema(ScoreSchema::numeric("proj-1", "accuracy", Some(0.0), Some(1.0)))
        .await
        .unwrap();

    for value in [0.0, 0.5, 1.0] {
        engine
            .submit_score("proj-1", SubmittedScore::numeric("accuracy", value))
            .await
            .unwrap();
    }
    for value in [-0.1, 1.1, f64::NAN] {
        let err = engine
            .submit_score("proj-1", SubmittedScore::numeric("accuracy", value))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "value {}", value);
    }
}

#[tokio::test]
async fn test_compare_experiments_over_stored_scores() {
    let engine = setup_engine().await;
    let submissions = [
        ("exp-a", 0.6),
        ("exp-a", 0.8),
        ("exp-b", 0.5),
        ("exp-b", 0.6),
        ("exp-c", 0.9),
    ];
    for (exp, value) in submissions {
        engine
            .submit_score(
                "proj-1",
                SubmittedScore::numeric("accuracy", value)
                    .for_experiment(exp)
                    .for_span("trace-1", "span-1"),
            )
            .await
            .unwrap();
    }
    for (exp, label) in [("exp-a", "formal"), ("exp-b", "formal")] {
        engine
            .submit_score("proj-1", SubmittedScore::categorical("tone", label).for_experiment(exp))
            .await
            .unwrap();
    }
    // Not part of any experiment
    engine
        .submit_score("proj-1", SubmittedScore::numeric("accuracy", 0.0))
        .await
        .unwrap();

    let result = engine
        .compare_experiments("proj-1", &ids(&["exp-a", "exp-b"]), Some("exp-a"))
        .await
        .unwrap();

    let accuracy = &result.scores["accuracy"];
    assert_eq!(accuracy.experiments.len(), 2);
    match &accuracy.experiments["exp-a"] {
        ScoreAggregate::Numeric(stats) => {
            assert!((stats.mean - 0.7).abs() < 1e-9);
            assert_eq!(stats.count, 2);
        }
        other => panic!("unexpected aggregate {:?}", other),
    }
    match &accuracy.diffs["exp-b"] {
        ScoreDiff::Numeric {
            difference,
            direction,
        } => {
            assert!((difference - 0.15).abs() < 1e-9);
            assert_eq!(*direction, Direction::Down);
        }
        other => panic!("unexpected diff {:?}", other),
    }
    assert_eq!(
        result.scores["tone"].diffs["exp-b"],
        ScoreDiff::Categorical { is_different: false }
    );

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["scores"]["accuracy"]["diffs"]["exp-b"]["direction"], "-");
}

#[tokio::test]
async fn test_compare_rejects_bad_selection() {
    let engine = setup_engine().await;

    let err = engine
        .compare_experiments("proj-1", &ids(&["exp-a"]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(ref v) if v.field == "experiment_ids"));

    let err = engine
        .compare_experiments("proj-1", &ids(&["exp-a", "exp-b"]), Some("exp-z"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(ref v) if v.field == "baseline_id"));
}
