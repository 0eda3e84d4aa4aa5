//! Integration tests for the stats REST surface.
//!
//! Each test spins up an Axum server on a random port over an in-memory
//! database and talks to it with a real HTTP client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;

use fable_bot::profile::NewProfile;
use fable_bot::stats::{StatCounter, StatsRouteState, stats_routes};
use fable_bot::store::{Database, LibSqlBackend};

/// Start an Axum server on a random port, return (base url, db).
async fn start_server() -> (String, Arc<dyn Database>) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let app = stats_routes(StatsRouteState {
        db: Arc::clone(&db),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), db)
}

async fn get_json(url: &str) -> Value {
    let resp = reqwest::get(url).await.unwrap();
    assert!(resp.status().is_success(), "GET {url} -> {}", resp.status());
    resp.json().await.unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let (base, _db) = start_server().await;
    let body = get_json(&format!("{base}/health")).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn empty_database_has_no_days() {
    let (base, _db) = start_server().await;
    let body = get_json(&format!("{base}/api/stats")).await;
    assert_eq!(body["days"].as_array().unwrap().len(), 0);

    let summary = get_json(&format!("{base}/api/stats/summary")).await;
    assert_eq!(summary["stories"], 0);
    assert_eq!(summary["days"], 0);
}

#[tokio::test]
async fn counters_show_up_in_daily_and_summary() {
    let (base, db) = start_server().await;

    let profile = NewProfile {
        display_name: None,
        child_names: "Mia".into(),
        age: "7".into(),
        traits: "curious".into(),
        active_context: None,
    };
    db.upsert_profile(1, &profile).await.unwrap();
    db.save_story(1, "Once upon a time", "stub").await.unwrap();
    db.save_story(1, "Another time", "stub").await.unwrap();
    db.increment_stat(StatCounter::StartCommands).await.unwrap();

    let body = get_json(&format!("{base}/api/stats?limit=7")).await;
    let days = body["days"].as_array().unwrap();
    assert_eq!(days.len(), 1);
    assert_eq!(days[0]["stories_count"], 2);
    assert_eq!(days[0]["new_users_count"], 1);
    assert_eq!(days[0]["start_command_count"], 1);

    let summary = get_json(&format!("{base}/api/stats/summary")).await;
    assert_eq!(summary["days"], 1);
    assert_eq!(summary["stories"], 2);
    assert_eq!(summary["new_users"], 1);
}

#[tokio::test]
async fn cors_headers_present() {
    let (base, _db) = start_server().await;
    let resp = reqwest::Client::new()
        .get(format!("{base}/api/stats"))
        .header("Origin", "http://dashboard.local")
        .send()
        .await
        .unwrap();
    assert!(resp.headers().contains_key("access-control-allow-origin"));
}
