mod common;

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};

use agency::api::{self, AppState};
use agency::orchestration::manager::AgentManager;

use common::Fixture;

// ─── Helper ───────────────────────────────────────────────────────────

struct Server {
    base: String,
    client: reqwest::Client,
    manager: AgentManager,
    // Keeps the temp dir alive for the server's lifetime.
    _fx: Fixture,
}

impl Server {
    async fn start() -> Self {
        let fx = Fixture::new();
        let manager = fx.manager();
        let state = AppState::new(fx.hub.clone(), manager.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(api::serve(listener, state, std::future::pending()));
        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            manager,
            _fx: fx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn create_task(&self, body: Value) -> String {
        let (status, task) = self.post("/api/tasks", body).await;
        assert_eq!(status, StatusCode::CREATED);
        task["id"].as_str().unwrap().to_string()
    }
}

// ============================================================
// Basics
// ============================================================

#[tokio::test]
async fn test_health() {
    let server = Server::start().await;

    let (status, body) = server.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let server = Server::start().await;

    let (status, body) = server.get("/api/nothing-here").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

// ============================================================
// Tasks
// ============================================================

#[tokio::test]
async fn test_task_claim_and_complete() {
    let server = Server::start().await;
    let id = server
        .create_task(json!({ "title": "Fix race in session cache", "status": "READY" }))
        .await;

    let (status, task) = server
        .post(&format!("/api/tasks/{id}/claim"), json!({ "agent": "dev-alpha" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "IN_PROGRESS");
    assert_eq!(task["assigned_to"], "dev-alpha");

    let (status, task) = server
        .post(
            &format!("/api/tasks/{id}/complete"),
            json!({ "summary": "Fixed race condition", "filesChanged": ["src/cache.rs"] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "DONE");
    assert_eq!(task["summary"], "Fixed race condition");
    assert_eq!(task["files_changed"], json!(["src/cache.rs"]));

    let (_, listed) = server.get("/api/tasks?status=DONE,QA_TESTING").await;
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["tasks"][0]["id"], id.as_str());

    let (_, events) = server.get("/api/events?type=task.completed").await;
    assert_eq!(events["events"].as_array().unwrap().len(), 1);
    assert_eq!(events["events"][0]["agent_name"], "dev-alpha");
}

#[tokio::test]
async fn test_task_errors_map_to_status_codes() {
    let server = Server::start().await;

    let (status, body) = server.get("/api/tasks/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let id = server.create_task(json!({ "title": "Still in the inbox" })).await;
    let (status, body) = server
        .post(&format!("/api/tasks/{id}/qa-pass"), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, body) = server.post("/api/tasks", json!({ "title": "   " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let resp = server
        .client
        .post(server.url("/api/tasks"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_task_walks_the_pipeline() {
    let server = Server::start().await;
    let id = server
        .create_task(json!({ "title": "Rewrite auth", "status": "DONE", "review_required": true }))
        .await;

    for (step, expected) in [
        ("qa-start", "QA_TESTING"),
        ("qa-pass", "QA_PASSED"),
        ("review-start", "REVIEWING"),
        ("review-pass", "REVIEWED"),
        ("ship", "SHIPPED"),
    ] {
        let (status, task) = server
            .post(&format!("/api/tasks/{id}/{step}"), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK, "{step}");
        assert_eq!(task["status"], expected, "{step}");
    }

    let (_, summary) = server.get("/api/dashboard/summary").await;
    assert_eq!(summary["tasks"]["shipped_today"], 1);
}

// ============================================================
// Handoffs
// ============================================================

#[tokio::test]
async fn test_handoff_claim_and_resolve() {
    let server = Server::start().await;
    let (status, handoff) = server
        .post(
            "/api/handoffs",
            json!({
                "from_agent": "dev-alpha",
                "to_agent": "qa",
                "title": "Ready for testing",
                "content": "Login flow fixed, see src/auth.rs",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = handoff["id"].as_str().unwrap().to_string();

    let (_, pending) = server.get("/api/handoffs?to_agent=qa&status=PENDING").await;
    assert_eq!(pending["handoffs"].as_array().unwrap().len(), 1);

    let (status, claimed) = server
        .post(&format!("/api/handoffs/{id}/claim"), json!({ "agent": "qa" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["status"], "CLAIMED");

    let (status, resolved) = server
        .post(&format!("/api/handoffs/{id}/resolve"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "RESOLVED");
}

// ============================================================
// Agents and process control
// ============================================================

#[tokio::test]
async fn test_start_and_stop_agent() {
    let server = Server::start().await;

    let (status, body) = server.post("/api/agents/dev-alpha/start", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["pid"].is_u64());

    let (_, running) = server.get("/api/agents/running").await;
    assert_eq!(running["running"][0]["name"], "dev-alpha");
    assert_eq!(running["running"][0]["state"], "running");

    let (status, body) = server.post("/api/agents/dev-alpha/start", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (_, agent) = server.get("/api/agents/dev-alpha").await;
    assert_eq!(agent["status"], "WORKING");
    assert_eq!(agent["controllerState"], "running");

    let (status, _) = server.post("/api/agents/dev-alpha/stop", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, running) = server.get("/api/agents/running").await;
    assert!(running["running"].as_array().unwrap().is_empty());
    assert!(!server.manager.is_running("dev-alpha"));
}

#[tokio::test]
async fn test_agent_control_errors() {
    let server = Server::start().await;

    let (status, _) = server.post("/api/agents/nobody/start", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server.post("/api/agents/qa/pause", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.post("/api/agents/qa/start", json!({})).await;
    let (status, body) = server
        .post("/api/agents/qa/inject", json!({ "message": "  " }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, _) = server.post("/api/agents/qa/resume", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_start_body_is_optional_but_must_be_valid() {
    let server = Server::start().await;

    let (status, body) = server
        .post("/api/agents/dev-alpha/start", json!({ "taskId": 5 }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
    assert!(!server.manager.is_running("dev-alpha"));

    let resp = server
        .client
        .post(server.url("/api/agents/dev-alpha/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(server.manager.is_running("dev-alpha"));
}

#[tokio::test]
async fn test_orchestration_endpoints() {
    let server = Server::start().await;

    let (status, body) = server.get("/api/agents/orchestration/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "enabled": false, "intervalMs": 50 }));

    let (status, _) = server
        .post("/api/agents/orchestration/enable", json!({ "intervalMs": 0 }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    server.create_task(json!({ "title": "Ship it", "status": "DONE" })).await;
    let (status, body) = server.post("/api/agents/orchestration/run", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["started"][0]["agent"], "qa");
    assert!(body["errors"].as_array().unwrap().is_empty());

    let (_, body) = server
        .post("/api/agents/orchestration/enable", json!({ "intervalMs": 60000 }))
        .await;
    assert_eq!(body["enabled"], true);
    assert_eq!(body["intervalMs"], 60000);
    let (_, body) = server.post("/api/agents/orchestration/disable", json!({})).await;
    assert_eq!(body["enabled"], false);
}

// ============================================================
// Events
// ============================================================

#[tokio::test]
async fn test_post_event_is_listed() {
    let server = Server::start().await;

    let (status, event) = server
        .post(
            "/api/events",
            json!({ "type": "agent.note", "agentName": "tech-lead", "message": "Design doc posted" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(event["type"], "agent.note");

    let (_, events) = server.get("/api/events?type=agent.note").await;
    assert_eq!(events["events"][0]["agent_name"], "tech-lead");
    assert_eq!(events["events"][0]["message"], "Design doc posted");
}

#[tokio::test]
async fn test_event_stream_opens_with_connected_and_state() {
    let server = Server::start().await;

    let mut resp = server
        .client
        .get(server.url("/api/events/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let mut received = String::new();
    while !received.contains("\"type\":\"state\"") {
        let chunk = tokio::time::timeout(Duration::from_secs(2), resp.chunk())
            .await
            .expect("timed out waiting for stream frames")
            .unwrap()
            .expect("stream ended early");
        received.push_str(&String::from_utf8_lossy(&chunk));
    }
    let connected = received.find("\"type\":\"connected\"").unwrap();
    let state = received.find("\"type\":\"state\"").unwrap();
    assert!(connected < state);
}
