//! Integration tests for the swarm REST API.
//!
//! Each test spins up an Axum server on a random port backed by an in-memory
//! database and drives the real HTTP contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use claw_swarm::api::{AppState, swarm_routes};
use claw_swarm::config::SwarmConfig;
use claw_swarm::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    base: String,
    client: reqwest::Client,
}

/// Start an Axum server on a random port.
async fn start_server() -> TestServer {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let app = swarm_routes(AppState::new(db, SwarmConfig::default()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base)
    }

    async fn create_problem(&self, title: &str) -> Value {
        let resp = self
            .client
            .post(self.url("/problems"))
            .json(&json!({
                "title": title,
                "statement": "What is six times seven?",
                "hints": ["Multiply."],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }

    /// Register an agent and return its API key.
    async fn register(&self, name: &str) -> String {
        let resp = self
            .client
            .post(self.url("/agents/register"))
            .json(&json!({ "name": name }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        body["agent"]["apiKey"].as_str().unwrap().to_string()
    }

    async fn next_task(&self, key: &str) -> Value {
        let resp = self
            .client
            .get(self.url("/tasks/next"))
            .bearer_auth(key)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    async fn submit(&self, key: &str, task_id: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/tasks/{task_id}/submit")))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn get_json(&self, path: &str) -> Value {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        assert_eq!(resp.status(), 200, "GET {path}");
        resp.json().await.unwrap()
    }
}

fn answer(content: &str) -> Value {
    json!({ "content": content, "answer": "42", "confidence": 0.8 })
}

// ── Basics ───────────────────────────────────────────────────────────

#[tokio::test]
async fn health_returns_ok() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let resp = reqwest::get(format!("{}/health", server.base))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn missing_or_bad_bearer_is_unauthorized() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = server
            .client
            .get(server.url("/tasks/next"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert!(body["hint"].as_str().unwrap().contains("Bearer"));

        let resp = server
            .client
            .get(server.url("/tasks/next"))
            .bearer_auth("clawswarm_nope")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Invalid API key");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn registration_validates_and_rejects_duplicates() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = server
            .client
            .post(server.url("/agents/register"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let key = server.register("alpha").await;
        assert!(key.starts_with("clawswarm_"));

        let resp = server
            .client
            .post(server.url("/agents/register"))
            .json(&json!({ "name": "alpha" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);

        let me: Value = server
            .client
            .get(server.url("/agents/me"))
            .bearer_auth(&key)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(me["agent"]["name"], "alpha");
        assert!(!me["agent"]["lastActiveAt"].is_null());
        assert_eq!(me["agent"]["stats"]["solutionsSubmitted"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn no_active_problem_means_no_task() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let key = server.register("alpha").await;

        let body = server.next_task(&key).await;
        assert_eq!(body["status"], "no_task_available");
        assert_eq!(body["retryAfterMs"], 300000);

        let resp = server
            .client
            .get(server.url("/problems/current"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

// ── Task flow ────────────────────────────────────────────────────────

#[tokio::test]
async fn solve_then_aggregate_round_trip() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.create_problem("Product").await;
        let a = server.register("a").await;
        let b = server.register("b").await;
        let f = server.register("f").await;

        for key in [&a, &b] {
            let task = server.next_task(key).await;
            assert_eq!(task["status"], "task_assigned");
            assert_eq!(task["task"]["type"], "solve");
            assert_eq!(task["freshContextRequired"], false);
            assert_eq!(task["task"]["problem"]["hints"][0], "Multiply.");
            let id = task["task"]["id"].as_str().unwrap();

            // Re-polling returns the same task.
            let again = server.next_task(key).await;
            assert_eq!(again["task"]["id"], id);

            let resp = server.submit(key, id, answer("6 * 7")).await;
            assert_eq!(resp.status(), 200);
        }

        let task = server.next_task(&f).await;
        assert_eq!(task["task"]["type"], "aggregate");
        assert_eq!(task["task"]["level"], 2);
        assert_eq!(task["task"]["sourceCount"], 2);
        assert_eq!(task["freshContextRequired"], true);
        assert_eq!(task["sources"].as_array().unwrap().len(), 2);
        assert!(task["sourcesFormatted"]
            .as_str()
            .unwrap()
            .contains("--- Solution 1 (from a, Level 1) ---"));

        let task_id = task["task"]["id"].as_str().unwrap();
        let resp = server.submit(&f, task_id, answer("both say 42")).await;
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        let solution_id = body["solutionId"].as_str().unwrap().to_string();

        let solutions = server.get_json("/solutions").await;
        assert_eq!(solutions["pagination"]["total"], 2);
        for s in solutions["solutions"].as_array().unwrap() {
            assert_eq!(s["isAggregated"], true);
        }

        let detail = server.get_json(&format!("/solutions/{solution_id}")).await;
        assert_eq!(detail["solution"]["level"], 2);
        assert_eq!(detail["solution"]["parents"].as_array().unwrap().len(), 2);
        assert_eq!(detail["solution"]["agent"]["name"], "f");

        let aggregations = server.get_json("/aggregations").await;
        assert_eq!(aggregations["aggregationsByLevel"]["2"][0]["parentCount"], 2);

        let tree = server.get_json("/aggregations/tree").await;
        let roots = tree["tree"]["roots"].as_array().unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0]["id"], solution_id.as_str());
        assert_eq!(roots[0]["children"].as_array().unwrap().len(), 2);
        assert_eq!(tree["tree"]["totalSolutions"], 3);

        let task: Value = server
            .client
            .get(server.url(&format!("/tasks/{task_id}")))
            .bearer_auth(&f)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(task["task"]["status"], "completed");
        assert_eq!(task["task"]["type"], "aggregate");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn submission_errors_map_to_status_codes() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.create_problem("Product").await;
        let a = server.register("a").await;
        let b = server.register("b").await;

        let task = server.next_task(&a).await;
        let id = task["task"]["id"].as_str().unwrap();

        let resp = server.submit(&a, id, json!({ "content": "" })).await;
        assert_eq!(resp.status(), 400);

        let resp = server.submit(&b, id, answer("not mine")).await;
        assert_eq!(resp.status(), 403);

        let resp = server
            .submit(&a, "00000000-0000-0000-0000-000000000000", answer("x"))
            .await;
        assert_eq!(resp.status(), 404);

        let resp = server.submit(&a, "garbage", answer("x")).await;
        assert_eq!(resp.status(), 400);

        let resp = server.submit(&a, id, answer("mine")).await;
        assert_eq!(resp.status(), 200);
        let resp = server.submit(&a, id, answer("again")).await;
        assert_eq!(resp.status(), 409);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn confidence_is_clamped_at_the_boundary() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.create_problem("Product").await;
        let a = server.register("a").await;

        let task = server.next_task(&a).await;
        let id = task["task"]["id"].as_str().unwrap();
        let resp = server
            .submit(&a, id, json!({ "content": "sure", "confidence": 7.5 }))
            .await;
        let body: Value = resp.json().await.unwrap();
        let solution_id = body["solutionId"].as_str().unwrap();

        let detail = server.get_json(&format!("/solutions/{solution_id}")).await;
        assert_eq!(detail["solution"]["confidence"], 1.0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn page_size_is_capped() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.create_problem("Product").await;
        for name in ["a", "b"] {
            let key = server.register(name).await;
            let task = server.next_task(&key).await;
            let id = task["task"]["id"].as_str().unwrap();
            assert_eq!(server.submit(&key, id, answer("42")).await.status(), 200);
        }

        let body = server
            .get_json(&format!("/solutions?limit={}", u64::MAX))
            .await;
        assert_eq!(body["pagination"]["limit"], 100);
        assert_eq!(body["solutions"].as_array().unwrap().len(), 2);

        let body = server.get_json("/solutions?limit=1").await;
        assert_eq!(body["solutions"].as_array().unwrap().len(), 1);
        assert_eq!(body["pagination"]["total"], 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn replacing_the_problem_rejects_stale_tasks() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let first = server.create_problem("First").await;
        let a = server.register("a").await;

        let task = server.next_task(&a).await;
        let stale_id = task["task"]["id"].as_str().unwrap().to_string();

        let second = server.create_problem("Second").await;
        let resp = server.submit(&a, &stale_id, answer("late")).await;
        assert_eq!(resp.status(), 409);

        let old = server
            .get_json(&format!("/problems/{}", first["problem"]["id"].as_str().unwrap()))
            .await;
        assert_eq!(old["problem"]["isActive"], false);

        let fresh = server.next_task(&a).await;
        assert_ne!(fresh["task"]["id"], stale_id.as_str());
        assert_eq!(fresh["task"]["problem"]["id"], second["problem"]["id"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn phase_update_is_validated() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let problem = server.create_problem("Product").await;
        let id = problem["problem"]["id"].as_str().unwrap();

        let resp = server
            .client
            .patch(server.url(&format!("/problems/{id}/phase")))
            .json(&json!({ "phase": "closed" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = server
            .client
            .patch(server.url(&format!("/problems/{id}/phase")))
            .json(&json!({ "phase": "aggregating" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["problem"]["phase"], "aggregating");
    })
    .await
    .expect("test timed out");
}

// ── Convergence ──────────────────────────────────────────────────────

#[tokio::test]
async fn swarm_reaches_a_final_answer() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.create_problem("Product").await;
        let mut keys = Vec::new();
        for i in 0..7 {
            keys.push(server.register(&format!("agent-{i}")).await);
        }

        let before = server.get_json("/aggregations/final").await;
        assert!(before["final"].is_null());
        assert_eq!(before["message"], "No aggregation completed yet");

        // a, b solve; c aggregates; d, e solve; f aggregates; g finalizes.
        for key in &keys {
            let task = server.next_task(key).await;
            let id = task["task"]["id"].as_str().unwrap();
            let resp = server.submit(key, id, answer("42")).await;
            assert_eq!(resp.status(), 200);
        }

        let result = server.get_json("/aggregations/final").await;
        assert_eq!(result["final"]["level"], 3);
        assert_eq!(result["final"]["answer"], "42");
        assert_eq!(result["final"]["agent"]["name"], "agent-6");

        let current = server.get_json("/problems/current").await;
        assert_eq!(current["convergence"]["state"], "converged");
        assert_eq!(current["stats"]["highestLevel"], 3);
        assert_eq!(current["stats"]["totalAggregations"], 3);
    })
    .await
    .expect("test timed out");
}
