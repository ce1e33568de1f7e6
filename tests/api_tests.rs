//! End-to-end tests for the hub router: auth, task dispatch, webhook
//! ingestion and dependency promotion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use fleet::errors::GatewayError;
use fleet::hub::api::AppState;
use fleet::hub::db::{DbHandle, FleetDb};
use fleet::hub::gateway::{ExecutionGateway, ProviderStatus, ProviderTask, ProviderTaskRequest};
use fleet::hub::github::GitHubClient;
use fleet::hub::lifecycle::LifecycleOptions;
use fleet::hub::server::build_router;
use fleet::hub::webhook::{SIGNATURE_HEADER, sign};

const SECRET: &str = "whsec-test";

#[derive(Default)]
struct FakeGateway {
    created: AtomicUsize,
    fail: AtomicBool,
    /// `get_task` reports a completed run instead of a running one.
    remote_completed: AtomicBool,
    /// `get_task` fails as if the provider were unreachable.
    remote_down: AtomicBool,
}

#[async_trait]
impl ExecutionGateway for FakeGateway {
    async fn create_task(&self, _request: &ProviderTaskRequest) -> Result<ProviderTask, GatewayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: 503,
                message: "provider unavailable".into(),
            });
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(snapshot(&format!("bb-{}", n), ProviderStatus::Pending))
    }

    async fn get_task(&self, task_id: &str) -> Result<ProviderTask, GatewayError> {
        if self.remote_down.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: 502,
                message: "bad gateway".into(),
            });
        }
        if self.remote_completed.load(Ordering::SeqCst) {
            let mut task = snapshot(task_id, ProviderStatus::Completed);
            task.progress = Some(100);
            task.pr_url = Some("https://github.com/acme/app/pull/9".into());
            task.logs = vec!["cloning".into(), "Opened pull request".into()];
            return Ok(task);
        }
        let mut task = snapshot(task_id, ProviderStatus::Running);
        task.progress = Some(45);
        Ok(task)
    }
}

fn snapshot(id: &str, status: ProviderStatus) -> ProviderTask {
    ProviderTask {
        id: id.to_string(),
        status,
        progress: None,
        logs: Vec::new(),
        error: None,
        branch_name: None,
        pr_url: None,
        diff_stats: None,
    }
}

struct TestHub {
    app: Router,
    db: DbHandle,
    gateway: Arc<FakeGateway>,
}

fn hub_with(secret: Option<&str>, deduplicate: bool) -> TestHub {
    let db = DbHandle::new(FleetDb::new_in_memory().unwrap());
    let gateway = Arc::new(FakeGateway::default());
    let state = Arc::new(AppState::new(
        db.clone(),
        gateway.clone(),
        GitHubClient::new("http://127.0.0.1:9"),
        secret.map(str::to_string),
        LifecycleOptions { deduplicate },
    ));
    TestHub {
        app: build_router(state),
        db,
        gateway,
    }
}

fn hub() -> TestHub {
    hub_with(Some(SECRET), true)
}

/// Create a user; with `github` set they also get a stored GitHub token.
fn add_user(hub: &TestHub, email: &str, github: bool) -> String {
    let db = hub.db.lock_sync().unwrap();
    let user = db.create_user(email, None).unwrap();
    if github {
        db.set_github_connection(&user.id, Some("ghp_testtoken"), Some("octo"))
            .unwrap();
    }
    user.api_token
}

async fn send(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn post_webhook(app: &Router, body: &Value, signature: Option<String>) -> (StatusCode, Value) {
    let raw = body.to_string();
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/webhooks/blackbox")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(raw)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn signed_webhook(app: &Router, body: &Value) -> (StatusCode, Value) {
    let signature = sign(SECRET, body.to_string().as_bytes());
    post_webhook(app, body, Some(signature)).await
}

// =============================================================================
// Auth
// =============================================================================

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let hub = hub();
    let (status, body) = send(&hub.app, "GET", "/api/tasks", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "Unauthorized" }));

    let (status, _) = send(&hub.app, "GET", "/api/tasks", Some("flt_bogus"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_other_users_task_is_not_found() {
    let hub = hub();
    let alice = add_user(&hub, "alice@example.com", true);
    let bob = add_user(&hub, "bob@example.com", true);

    let (status, created) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&alice),
        Some(json!({ "prompt": "Fix the flaky test" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_id = created["task"]["id"].as_str().unwrap();

    let (status, body) = send(&hub.app, "GET", &format!("/api/tasks/{}", task_id), Some(&bob), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Task not found");
}

// =============================================================================
// Task creation and dispatch
// =============================================================================

#[tokio::test]
async fn test_create_task_requires_github_connection() {
    let hub = hub();
    let token = add_user(&hub, "nogh@example.com", false);
    let (status, repo) = send(
        &hub.app,
        "POST",
        "/api/repositories",
        Some(&token),
        Some(json!({
            "url": "https://github.com/acme/app",
            "name": "app",
            "fullName": "acme/app"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let repository_id = repo["repository"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&token),
        Some(json!({ "prompt": "Add a README", "repositoryId": repository_id })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "GitHub connection required. Please connect your GitHub account."
    );
    assert_eq!(hub.gateway.created.load(Ordering::SeqCst), 0);

    let (status, tasks) = send(&hub.app, "GET", "/api/tasks", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tasks["total"], 0);
    assert!(tasks["tasks"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_create_task_dispatches_to_provider() {
    let hub = hub();
    let token = add_user(&hub, "dev@example.com", true);
    let (status, body) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&token),
        Some(json!({ "prompt": "Add pagination", "priority": "high" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["task"]["status"], "running");
    assert_eq!(body["task"]["external_task_id"], "bb-1");
    assert_eq!(body["task"]["priority"], "high");
    assert_eq!(body["task"]["branch"], "main");
}

#[tokio::test]
async fn test_create_task_without_prompt_is_rejected() {
    let hub = hub();
    let token = add_user(&hub, "dev@example.com", true);
    let (status, body) = send(&hub.app, "POST", "/api/tasks", Some(&token), Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Prompt is required");
}

#[tokio::test]
async fn test_review_template_builds_prompt() {
    let hub = hub();
    let token = add_user(&hub, "dev@example.com", true);
    let (status, body) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&token),
        Some(json!({ "type": "review", "focus": "security" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let prompt = body["task"]["prompt"].as_str().unwrap();
    assert!(prompt.starts_with("Code Review:"));
    assert!(prompt.contains("security vulnerabilities"));
}

#[tokio::test]
async fn test_provider_failure_marks_task_failed() {
    let hub = hub();
    hub.gateway.fail.store(true, Ordering::SeqCst);
    let token = add_user(&hub, "dev@example.com", true);
    let (status, body) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&token),
        Some(json!({ "prompt": "Upgrade dependencies" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["task"]["status"], "failed");
    assert_eq!(body["task"]["result"]["success"], false);
    assert!(body["task"]["external_task_id"].is_null());
}

#[tokio::test]
async fn test_multi_agent_count_is_validated() {
    let hub = hub();
    let token = add_user(&hub, "dev@example.com", true);
    let (status, _) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&token),
        Some(json!({ "prompt": "Compare approaches", "agents": ["claude"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// =============================================================================
// Webhooks
// =============================================================================

async fn running_task(hub: &TestHub) -> (String, String) {
    let token = add_user(hub, "hook@example.com", true);
    let (_, body) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&token),
        Some(json!({ "prompt": "Refactor the parser" })),
    )
    .await;
    (
        token,
        body["task"]["external_task_id"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let hub = hub();
    let body = json!({ "event": "task.started", "task": { "id": "bb-1" } });
    let (status, response) = post_webhook(&hub.app, &body, Some("deadbeef".into())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "Invalid signature");

    let (status, _) = post_webhook(&hub.app, &body, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_webhook_requires_task_id() {
    let hub = hub();
    let (status, response) = signed_webhook(&hub.app, &json!({ "event": "task.started", "task": {} })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "Missing task ID");
}

#[tokio::test]
async fn test_webhook_for_unknown_task_is_acknowledged() {
    let hub = hub();
    let (status, response) = signed_webhook(
        &hub.app,
        &json!({ "event": "task.completed", "task": { "id": "bb-missing" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["received"], true);
    assert_eq!(response["message"], "Task not found");
}

#[tokio::test]
async fn test_webhook_completion_updates_task() {
    let hub = hub();
    let (token, external_id) = running_task(&hub).await;

    let event = json!({
        "event": "task.completed",
        "task": {
            "id": external_id,
            "status": "completed",
            "prUrl": "https://github.com/acme/app/pull/7",
            "branchName": "fleet/refactor-parser",
            "diffStats": { "added": 12, "removed": 3, "filesChanged": 2 },
            "summary": "Split the parser into modules"
        }
    });
    let (status, response) = signed_webhook(&hub.app, &event).await;
    assert_eq!(status, StatusCode::OK);
    let task_id = response["taskId"].as_str().unwrap().to_string();

    let (_, body) = send(&hub.app, "GET", &format!("/api/tasks/{}", task_id), Some(&token), None).await;
    assert_eq!(body["task"]["status"], "completed");
    assert_eq!(body["task"]["progress"], 100);
    assert_eq!(body["task"]["result"]["prUrl"], "https://github.com/acme/app/pull/7");
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_webhook_completion_with_fractional_progress() {
    let hub = hub();
    let (token, external_id) = running_task(&hub).await;

    let event = json!({
        "event": "task.completed",
        "task": {
            "id": external_id,
            "status": "completed",
            "progress": 99.5,
            "prUrl": "https://github.com/acme/app/pull/8"
        }
    });
    let (status, response) = signed_webhook(&hub.app, &event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["received"], true);
    let task_id = response["taskId"].as_str().unwrap().to_string();

    let (_, body) = send(&hub.app, "GET", &format!("/api/tasks/{}", task_id), Some(&token), None).await;
    assert_eq!(body["task"]["status"], "completed");
    assert_eq!(body["task"]["progress"], 100);
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_webhook_progress_fraction_is_rounded() {
    let hub = hub();
    let (token, external_id) = running_task(&hub).await;

    let (status, response) = signed_webhook(
        &hub.app,
        &json!({ "event": "task.progress", "task": { "id": external_id, "progress": 41.6 } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = response["taskId"].as_str().unwrap().to_string();

    let (_, body) = send(&hub.app, "GET", &format!("/api/tasks/{}", task_id), Some(&token), None).await;
    assert_eq!(body["task"]["status"], "running");
    assert_eq!(body["task"]["progress"], 42);
}

#[tokio::test]
async fn test_webhook_replay_is_deduplicated() {
    let hub = hub();
    let (token, external_id) = running_task(&hub).await;
    let event = json!({ "event": "task.completed", "task": { "id": external_id } });

    let (_, first) = signed_webhook(&hub.app, &event).await;
    assert!(first.get("duplicate").is_none());
    let (status, second) = signed_webhook(&hub.app, &event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["duplicate"], true);

    let (_, messages) = send(&hub.app, "GET", "/api/messages", Some(&token), None).await;
    assert_eq!(messages["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_webhook_replay_without_dedup_repeats_effects() {
    let hub = hub_with(Some(SECRET), false);
    let (token, external_id) = running_task(&hub).await;
    let event = json!({ "event": "task.completed", "task": { "id": external_id } });

    signed_webhook(&hub.app, &event).await;
    let (_, second) = signed_webhook(&hub.app, &event).await;
    assert!(second.get("duplicate").is_none());

    let (_, messages) = send(&hub.app, "GET", "/api/messages", Some(&token), None).await;
    assert_eq!(messages["messages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_webhook_without_secret_skips_verification() {
    let hub = hub_with(None, true);
    let (status, response) = post_webhook(
        &hub.app,
        &json!({ "event": "task.progress", "task": { "id": "bb-404", "progress": 40 } }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["received"], true);
}

// =============================================================================
// Status sync and deletion
// =============================================================================

async fn first_task_id(hub: &TestHub, token: &str) -> String {
    let (_, tasks) = send(&hub.app, "GET", "/api/tasks", Some(token), None).await;
    tasks["tasks"][0]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_sync_pulls_running_progress() {
    let hub = hub();
    let (token, _) = running_task(&hub).await;
    let task_id = first_task_id(&hub, &token).await;

    let (status, body) = send(&hub.app, "GET", &format!("/api/tasks/{}?sync=true", task_id), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["status"], "running");
    assert_eq!(body["task"]["progress"], 45);
}

#[tokio::test]
async fn test_sync_applies_provider_completion() {
    let hub = hub();
    let (token, external_id) = running_task(&hub).await;
    let task_id = first_task_id(&hub, &token).await;
    hub.gateway.remote_completed.store(true, Ordering::SeqCst);

    let (status, body) = send(&hub.app, "GET", &format!("/api/tasks/{}?sync=true", task_id), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["status"], "completed");
    assert!(body["task"]["completed_at"].is_string());
    assert_eq!(body["task"]["result"]["prUrl"], "https://github.com/acme/app/pull/9");
    assert_eq!(body["task"]["result"]["summary"], "Opened pull request");
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);

    // the provider's own webhook for the same completion is a replay
    let (_, replay) = signed_webhook(
        &hub.app,
        &json!({ "event": "task.completed", "task": { "id": external_id } }),
    )
    .await;
    assert_eq!(replay["duplicate"], true);
}

#[tokio::test]
async fn test_sync_failure_returns_cached_task() {
    let hub = hub();
    let (token, _) = running_task(&hub).await;
    let task_id = first_task_id(&hub, &token).await;
    hub.gateway.remote_down.store(true, Ordering::SeqCst);

    let (status, body) = send(&hub.app, "GET", &format!("/api/tasks/{}?sync=true", task_id), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["id"], task_id.as_str());
    assert_eq!(body["task"]["status"], "running");
    assert_eq!(body["task"]["progress"], 0);
}

#[tokio::test]
async fn test_delete_running_task_cancels_then_deletes() {
    let hub = hub();
    let (token, _) = running_task(&hub).await;
    let task_id = first_task_id(&hub, &token).await;
    let uri = format!("/api/tasks/{}", task_id);

    let (status, body) = send(&hub.app, "DELETE", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "action": "cancelled" }));

    let (_, cancelled) = send(&hub.app, "GET", &uri, Some(&token), None).await;
    assert_eq!(cancelled["task"]["status"], "cancelled");
    assert!(cancelled["task"]["completed_at"].is_string());

    let (status, body) = send(&hub.app, "DELETE", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "deleted");

    let (status, _) = send(&hub.app, "GET", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_queued_task_removes_it() {
    let hub = hub();
    let (token, _) = running_task(&hub).await;
    let parent_id = first_task_id(&hub, &token).await;
    let (_, child) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&token),
        Some(json!({ "prompt": "Wait for the parent", "dependsOn": [parent_id] })),
    )
    .await;
    assert_eq!(child["task"]["status"], "queued");
    let uri = format!("/api/tasks/{}", child["task"]["id"].as_str().unwrap());

    let (status, body) = send(&hub.app, "DELETE", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "deleted");
    let (status, _) = send(&hub.app, "GET", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Dependencies
// =============================================================================

#[tokio::test]
async fn test_completion_promotes_dependent_task() {
    let hub = hub();
    let (token, external_id) = running_task(&hub).await;
    let (_, parent) = send(&hub.app, "GET", "/api/tasks", Some(&token), None).await;
    let parent_id = parent["tasks"][0]["id"].as_str().unwrap().to_string();

    let (status, child) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&token),
        Some(json!({ "prompt": "Document the new parser", "dependsOn": [parent_id] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(child["task"]["status"], "queued");
    let child_id = child["task"]["id"].as_str().unwrap().to_string();

    signed_webhook(
        &hub.app,
        &json!({ "event": "task.completed", "task": { "id": external_id } }),
    )
    .await;

    let (_, child) = send(&hub.app, "GET", &format!("/api/tasks/{}", child_id), Some(&token), None).await;
    assert_eq!(child["task"]["status"], "assigned");

    let (status, run) = send(&hub.app, "POST", &format!("/api/tasks/{}/run", child_id), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["task"]["status"], "running");
    assert_eq!(run["task"]["external_task_id"], "bb-2");
}

#[tokio::test]
async fn test_unknown_dependency_is_rejected() {
    let hub = hub();
    let token = add_user(&hub, "dev@example.com", true);
    let (status, _) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&token),
        Some(json!({ "prompt": "Follow-up", "dependsOn": ["no-such-task"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_dependency_cycle_is_rejected_on_update() {
    let hub = hub();
    let token = add_user(&hub, "dev@example.com", true);
    let (_, first) = send(&hub.app, "POST", "/api/tasks", Some(&token), Some(json!({ "prompt": "First" }))).await;
    let first_id = first["task"]["id"].as_str().unwrap().to_string();
    let (_, second) = send(
        &hub.app,
        "POST",
        "/api/tasks",
        Some(&token),
        Some(json!({ "prompt": "Second", "dependsOn": [first_id.clone()] })),
    )
    .await;
    let second_id = second["task"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &hub.app,
        "PUT",
        &format!("/api/tasks/{}", first_id),
        Some(&token),
        Some(json!({ "depends_on": [second_id] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("cycle"));
}

// =============================================================================
// Dashboard and metrics
// =============================================================================

#[tokio::test]
async fn test_metrics_count_created_tasks() {
    let hub = hub();
    let token = add_user(&hub, "dev@example.com", true);
    send(&hub.app, "POST", "/api/tasks", Some(&token), Some(json!({ "prompt": "One" }))).await;
    send(&hub.app, "POST", "/api/tasks", Some(&token), Some(json!({ "prompt": "Two" }))).await;

    let (status, body) = send(&hub.app, "GET", "/api/metrics?hours=1", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totals"]["tasks_created"], 2);
}

#[tokio::test]
async fn test_dashboard_lists_recent_tasks() {
    let hub = hub();
    let token = add_user(&hub, "dev@example.com", true);
    send(&hub.app, "POST", "/api/tasks", Some(&token), Some(json!({ "prompt": "One" }))).await;

    let (status, body) = send(&hub.app, "GET", "/api/dashboard", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_object());
}
