use std::sync::Arc;
use std::time::Duration;

use evalflow::{
    EngineBuilder, EvaluationRule, MemoryRuleCatalog, SqliteExecutionStore, SqliteScoreStore,
    TriggerType,
};
use evalflow_harness::EngineHarnessExt;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;

// Use unusual port to avoid conflicts
const BASE: &str = "http://localhost:13371/api/projects/proj-1";

#[tokio::test]
async fn test_api_round_trip() {
    // Setup
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteExecutionStore::new(pool.clone());
    store.run_migrations().await.unwrap();
    let scores = Arc::new(SqliteScoreStore::new(pool));
    scores.run_migrations().await.unwrap();

    let engine = Arc::new(
        EngineBuilder::new(store)
            .schema_store(scores.clone())
            .score_store(scores)
            .rules(Arc::new(MemoryRuleCatalog::with_rules([EvaluationRule::new(
                "rule-1", "proj-1", "helpfulness",
            )])))
            .build(),
    )
    .with_api(13371);

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    let client = reqwest::Client::new();

    // Manual trigger with nothing to discover completes empty
    let response = client
        .post(format!("{}/rules/rule-1/trigger", BASE))
        .json(&json!({}))
        .send()
        .await
        .expect("Failed to connect to API");
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    let id = body["execution_id"].as_str().unwrap().to_string();
    assert_eq!(body["spans_queued"], 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let execution: Value = client
        .get(format!("{}/executions/{}", BASE, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(execution["status"], "completed");
    assert_eq!(execution["trigger_type"], "manual");

    // Unknown rule and malformed id
    let response = client
        .post(format!("{}/rules/nope/trigger", BASE))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let response = client
        .get(format!("{}/executions/not-a-ulid", BASE))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Worker reports against an automatic execution
    let record = engine
        .lifecycle()
        .start_with_count("rule-1", "proj-1", TriggerType::Automatic, 1)
        .await
        .unwrap();
    let reply: Value = client
        .post(format!("{}/executions/{}/progress", BASE, record.id))
        .json(&json!({"delta_scored": 1}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["completed_now"], true);
    assert_eq!(reply["execution"]["status"], "completed");

    let response = client
        .post(format!("{}/executions/{}/progress", BASE, record.id))
        .json(&json!({"delta_scored": -1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let page: Value = client
        .get(format!("{}/rules/rule-1/executions?trigger_type=automatic", BASE))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 1);

    let latest: Value = client
        .get(format!("{}/rules/rule-1/executions/latest", BASE))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(latest["id"], record.id.to_string());

    // Reported match count comes back with the record it produced
    let manual = engine
        .lifecycle()
        .start("rule-1", "proj-1", TriggerType::Manual)
        .await
        .unwrap();
    engine
        .progress()
        .increment(manual.id, "proj-1", 2, 0)
        .await
        .unwrap();
    let reply: Value = client
        .post(format!("{}/executions/{}/matched", BASE, manual.id))
        .json(&json!({"spans_matched": 2}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["completed_now"], true);
    assert_eq!(reply["execution"]["spans_matched"], 2);
    assert_eq!(reply["execution"]["status"], "completed");

    // Undecodable input is a 400 naming the field
    let response = client
        .get(format!("{}/rules/rule-1/executions?status=bogus", BASE))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["field"], "status");

    let response = client
        .post(format!("{}/executions/{}/fail", BASE, manual.id))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["field"], "message");

    // Score configs and scores
    let response = client
        .post(format!("{}/score-configs", BASE))
        .json(&json!({"name": "accuracy", "data_type": "NUMERIC", "min_value": 0.0, "max_value": 1.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    for (exp, value) in [("exp-a", 0.70), ("exp-b", 0.55)] {
        let response = client
            .post(format!("{}/scores", BASE))
            .json(&json!({
                "name": "accuracy",
                "data_type": "NUMERIC",
                "value": value,
                "experiment_id": exp
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }
    let response = client
        .post(format!("{}/scores", BASE))
        .json(&json!({"name": "accuracy", "data_type": "PERCENT", "value": 0.5}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["field"], "data_type");

    let response = client
        .post(format!("{}/scores", BASE))
        .json(&json!({"name": "accuracy", "data_type": "NUMERIC", "value": 1.5}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["field"], "value");

    let result: Value = client
        .post(format!("{}/experiments/compare", BASE))
        .json(&json!({"experiment_ids": ["exp-a", "exp-b"], "baseline_id": "exp-a"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let diff = &result["scores"]["accuracy"]["diffs"]["exp-b"];
    assert_eq!(diff["direction"], "-");
    assert!((diff["difference"].as_f64().unwrap() - 0.15).abs() < 1e-9);
}
