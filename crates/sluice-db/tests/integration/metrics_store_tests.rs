use serde_json::json;
use sluice_core::MetricsStore;

use crate::common::setup_test_db;

#[tokio::test]
async fn load_missing_key_is_none() {
    let (db, _container) = setup_test_db().await;
    let store = db.metrics_store();

    assert!(store.load("throttle/unknown").await.unwrap().is_none());
}

#[tokio::test]
async fn save_overwrites_previous_snapshot() {
    let (db, _container) = setup_test_db().await;
    let store = db.metrics_store();

    store
        .save("throttle/hn", &json!({"error_count": 1}))
        .await
        .unwrap();
    store
        .save("throttle/hn", &json!({"error_count": 4, "health_status": "degraded"}))
        .await
        .unwrap();

    let loaded = store.load("throttle/hn").await.unwrap().unwrap();
    assert_eq!(loaded["error_count"], 4);
    assert_eq!(loaded["health_status"], "degraded");
}

#[tokio::test]
async fn throttle_state_survives_restart() {
    use sluice_core::{AdaptiveThrottleController, HealthStatus, ThrottleConfig};

    let (db, _container) = setup_test_db().await;
    let throttle =
        AdaptiveThrottleController::new(db.metrics_store(), ThrottleConfig::default()).unwrap();
    for _ in 0..3 {
        throttle.after_request("feed", false, 120.0, Some(503)).await;
    }
    assert_eq!(throttle.health("feed").await, HealthStatus::Degraded);
    let delay = throttle.recommended_delay("feed").await;

    let restarted =
        AdaptiveThrottleController::new(db.metrics_store(), ThrottleConfig::default()).unwrap();
    restarted.restore(["feed"]).await;
    let after = &restarted.snapshot().await[0];

    assert_eq!(after.error_count, 3);
    assert_eq!(after.health_status, HealthStatus::Degraded);
    assert_eq!(restarted.recommended_delay("feed").await, delay);
}
