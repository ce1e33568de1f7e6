use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{Duration, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;

use super::auth::CurrentUser;
use super::dag::{DependencyGraph, TaskNode, normalize_depends_on};
use super::db::{DbHandle, FleetDb, hour_bucket};
use super::dispatch::{self, PromptOptions};
use super::gateway::{ExecutionGateway, ProviderTaskRequest};
use super::github::{GitHubClient, is_valid_github_token};
use super::lifecycle::{self, LifecycleOptions};
use super::models::*;
use super::webhook;
use super::ws::{WsMessage, broadcast_message};
use crate::errors::{DagError, FleetError, GatewayError};

const GITHUB_REQUIRED: &str = "GitHub connection required. Please connect your GitHub account.";
const DEFAULT_TASK_LIMIT: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;
const DASHBOARD_TASK_LIMIT: i64 = 10;
const DASHBOARD_MESSAGE_LIMIT: i64 = 20;
const DEFAULT_AGENT_CAPACITY: i64 = 100;

static SLUG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").unwrap());

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub github: GitHubClient,
    pub webhook_secret: Option<String>,
    pub lifecycle: LifecycleOptions,
}

impl AppState {
    pub fn new(
        db: DbHandle,
        gateway: Arc<dyn ExecutionGateway>,
        github: GitHubClient,
        webhook_secret: Option<String>,
        lifecycle: LifecycleOptions,
    ) -> Self {
        let (ws_tx, _) = broadcast::channel(256);
        Self {
            db,
            ws_tx,
            gateway,
            github,
            webhook_secret: webhook_secret.filter(|s| !s.is_empty()),
            lifecycle,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ConnectTokenRequest {
    pub token: String,
}

#[derive(Deserialize)]
pub struct ReposQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Deserialize)]
pub struct InitiativesQuery {
    pub status: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct CreateInitiativeRequest {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
    #[serde(alias = "maxAgents")]
    pub max_agents: Option<i64>,
    #[serde(alias = "minAgents")]
    pub min_agents: Option<i64>,
    #[serde(alias = "scalingPolicy")]
    pub scaling_policy: Option<ScalingPolicy>,
    #[serde(alias = "defaultAgent")]
    pub default_agent: Option<AgentKind>,
    #[serde(alias = "defaultModel")]
    pub default_model: Option<String>,
    #[serde(alias = "allowedAgents")]
    pub allowed_agents: Option<Vec<AgentKind>>,
    pub triggers: Option<serde_json::Value>,
    #[serde(default, alias = "repositoryIds")]
    pub repository_ids: Vec<String>,
}

#[derive(Deserialize, Default)]
pub struct CreateRepositoryRequest {
    pub url: Option<String>,
    pub provider: Option<RepoProvider>,
    pub name: Option<String>,
    #[serde(alias = "fullName")]
    pub full_name: Option<String>,
    #[serde(alias = "defaultBranch")]
    pub default_branch: Option<String>,
    #[serde(alias = "installationId")]
    pub installation_id: Option<String>,
    #[serde(alias = "repoInstructions")]
    pub repo_instructions: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct CreateTaskRequest {
    pub prompt: Option<String>,
    #[serde(alias = "type")]
    pub task_type: Option<TaskType>,
    pub agent: Option<AgentKind>,
    pub agents: Option<Vec<AgentKind>>,
    pub model: Option<String>,
    pub priority: Option<Priority>,
    #[serde(alias = "initiativeId")]
    pub initiative_id: Option<String>,
    #[serde(alias = "repositoryId")]
    pub repository_id: Option<String>,
    #[serde(alias = "repoUrl")]
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    pub focus: Option<String>,
    #[serde(alias = "docsType")]
    pub docs_type: Option<String>,
    #[serde(alias = "testType")]
    pub test_type: Option<String>,
    pub target: Option<String>,
}

#[derive(Deserialize)]
pub struct TasksQuery {
    pub initiative_id: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub sync: bool,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    pub initiative_id: Option<String>,
    #[serde(default)]
    pub unread: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct CreateMessageRequest {
    #[serde(alias = "fromInitiativeId")]
    pub from_initiative_id: Option<String>,
    #[serde(alias = "toInitiativeId")]
    pub to_initiative_id: Option<String>,
    #[serde(alias = "fromTaskId")]
    pub from_task_id: Option<String>,
    #[serde(alias = "toTaskId")]
    pub to_task_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub metadata: Option<serde_json::Value>,
    #[serde(alias = "suggestedActions")]
    pub suggested_actions: Option<Vec<SuggestedAction>>,
}

#[derive(Deserialize)]
pub struct MetricsQuery {
    pub hours: Option<i64>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<FleetError>() {
            match e {
                FleetError::TaskNotFound { .. } => return ApiError::NotFound("Task not found".into()),
                FleetError::InitiativeNotFound { .. } => {
                    return ApiError::NotFound("Initiative not found".into());
                }
                FleetError::RepositoryNotFound { .. } => {
                    return ApiError::NotFound("Repository not found".into());
                }
                FleetError::BadRequest(msg) => return ApiError::BadRequest(msg.clone()),
                _ => {}
            }
        }
        if let Some(e) = err.downcast_ref::<DagError>() {
            return ApiError::BadRequest(e.to_string());
        }
        tracing::error!(error = %format!("{:#}", err), "request failed");
        ApiError::Internal("Internal server error".into())
    }
}

fn bad_request(msg: impl Into<String>) -> anyhow::Error {
    FleetError::BadRequest(msg.into()).into()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/me", get(get_me))
        .route(
            "/api/me/github",
            put(connect_github).delete(disconnect_github),
        )
        .route("/api/me/github/repos", get(list_github_repos))
        .route(
            "/api/initiatives",
            get(list_initiatives).post(create_initiative),
        )
        .route(
            "/api/initiatives/{id}",
            get(get_initiative)
                .put(update_initiative)
                .delete(delete_initiative),
        )
        .route(
            "/api/repositories",
            get(list_repositories).post(create_repository),
        )
        .route(
            "/api/repositories/{id}",
            get(get_repository)
                .put(update_repository)
                .delete(delete_repository),
        )
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/run", post(run_task))
        .route("/api/messages", get(list_messages).post(create_message))
        .route("/api/messages/{id}/read", put(mark_message_read))
        .route("/api/metrics", get(get_metrics))
        .route("/api/dashboard", get(get_dashboard))
        .route("/api/webhooks/blackbox", post(webhook::blackbox_webhook))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn page(limit: Option<i64>, offset: Option<i64>, default_limit: i64) -> (i64, i64) {
    (
        limit.unwrap_or(default_limit).clamp(1, MAX_PAGE_SIZE),
        offset.unwrap_or(0).max(0),
    )
}

fn parse_statuses(raw: Option<&str>) -> Result<Vec<TaskStatus>, ApiError> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| TaskStatus::from_str(s).map_err(ApiError::BadRequest))
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn initiative_detail(db: &FleetDb, initiative: Initiative) -> anyhow::Result<InitiativeDetail> {
    let repositories = db.list_initiative_repositories(&initiative.id)?;
    let stats = db.initiative_stats(&initiative.id)?;
    Ok(InitiativeDetail {
        initiative,
        repositories,
        stats,
    })
}

fn ensure_repositories_owned(db: &FleetDb, user_id: &str, ids: &[String]) -> anyhow::Result<()> {
    for id in ids {
        if db.get_repository(user_id, id)?.is_none() {
            return Err(FleetError::RepositoryNotFound { id: id.clone() }.into());
        }
    }
    Ok(())
}

/// Reject `depends_on` for `task_id` if it references unknown tasks or
/// closes a cycle in the user's graph.
fn validate_dependencies(
    db: &FleetDb,
    user_id: &str,
    task_id: &str,
    depends_on: &[String],
) -> anyhow::Result<()> {
    let mut nodes = db.dependency_nodes(user_id)?;
    nodes.push(TaskNode::new(task_id, depends_on.to_vec()));
    DependencyGraph::build(nodes)?;
    Ok(())
}

fn dependencies_met(db: &FleetDb, depends_on: &[String]) -> anyhow::Result<bool> {
    Ok(depends_on.is_empty() || db.count_completed(depends_on)? == depends_on.len() as i64)
}

fn load_tasks(db: &FleetDb, ids: &[String]) -> anyhow::Result<Vec<Task>> {
    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(task) = db.get_task(id)? {
            tasks.push(task);
        }
    }
    Ok(tasks)
}

fn require_github_token(user: &User) -> Result<String, ApiError> {
    user.github_token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::BadRequest(GITHUB_REQUIRED.into()))
}

// ── Health & identity ─────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_me(CurrentUser(user): CurrentUser) -> impl IntoResponse {
    let connected = user.has_github_connection();
    Json(json!({ "user": user, "github_connected": connected }))
}

async fn connect_github(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<ConnectTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = req.token.trim().to_string();
    if !is_valid_github_token(&token) {
        return Err(ApiError::BadRequest("Invalid GitHub token format".into()));
    }
    let github_user = state.github.authenticated_user(&token).await.map_err(|e| {
        tracing::warn!(error = %format!("{:#}", e), "GitHub rejected token");
        ApiError::BadRequest("Invalid token, could not authenticate with GitHub".into())
    })?;

    let user = state
        .db
        .call(move |db| db.set_github_connection(&user.id, Some(&token), Some(&github_user.login)))
        .await?;
    tracing::info!(user_id = %user.id, github = ?user.github_username, "GitHub connected");
    Ok(Json(json!({ "user": user, "github_connected": true })))
}

async fn disconnect_github(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .db
        .call(move |db| db.set_github_connection(&user.id, None, None))
        .await?;
    Ok(Json(json!({ "user": user, "github_connected": false })))
}

async fn list_github_repos(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<ReposQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let token = require_github_token(&user)?;
    let repos = state
        .github
        .list_repos(
            &token,
            query.page.unwrap_or(1).max(1),
            query.per_page.unwrap_or(30).clamp(1, 100),
        )
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to list GitHub repos: {}", e)))?;
    Ok(Json(json!({ "repos": repos })))
}

// ── Initiatives ───────────────────────────────────────────────────────

async fn list_initiatives(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<InitiativesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(InitiativeStatus::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let initiatives = state
        .db
        .call(move |db| db.list_initiatives(&user.id, status))
        .await?;
    Ok(Json(json!({ "initiatives": initiatives })))
}

async fn create_initiative(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateInitiativeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(name), Some(slug)) = (non_empty(req.name), non_empty(req.slug)) else {
        return Err(ApiError::BadRequest("Name and slug are required".into()));
    };
    if !SLUG_REGEX.is_match(&slug) {
        return Err(ApiError::BadRequest(
            "Slug must contain only lowercase letters, numbers, and hyphens".into(),
        ));
    }

    let mut new = NewInitiative::named(name, slug);
    new.description = req.description;
    new.max_agents = req.max_agents.unwrap_or(new.max_agents);
    new.min_agents = req.min_agents.unwrap_or(new.min_agents);
    new.scaling_policy = req.scaling_policy.unwrap_or(new.scaling_policy);
    new.default_agent = req.default_agent.unwrap_or(new.default_agent);
    new.default_model = req.default_model;
    if let Some(allowed) = req.allowed_agents {
        new.allowed_agents = allowed;
    }
    if let Some(triggers) = req.triggers {
        new.triggers = triggers;
    }
    let repository_ids = req.repository_ids;

    let detail = state
        .db
        .call(move |db| {
            db.transaction(|db| {
                if db.slug_exists(&user.id, &new.slug)? {
                    return Err(bad_request("An initiative with this slug already exists"));
                }
                ensure_repositories_owned(db, &user.id, &repository_ids)?;
                let initiative = db.create_initiative(&user.id, &new)?;
                db.set_initiative_repositories(&initiative.id, &repository_ids)?;
                initiative_detail(db, initiative)
            })
        })
        .await?;
    tracing::info!(initiative_id = %detail.initiative.id, slug = %detail.initiative.slug, "initiative created");
    Ok((StatusCode::CREATED, Json(json!({ "initiative": detail }))))
}

async fn get_initiative(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            let initiative = db
                .get_initiative(&user.id, &id)?
                .ok_or(FleetError::InitiativeNotFound { id })?;
            initiative_detail(db, initiative)
        })
        .await?;
    Ok(Json(json!({ "initiative": detail })))
}

async fn update_initiative(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    Json(patch): Json<InitiativePatch>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            db.transaction(|db| {
                if let Some(ids) = &patch.repository_ids {
                    ensure_repositories_owned(db, &user.id, ids)?;
                }
                let initiative = db
                    .update_initiative(&user.id, &id, &patch)?
                    .ok_or(FleetError::InitiativeNotFound { id: id.clone() })?;
                if let Some(ids) = &patch.repository_ids {
                    db.set_initiative_repositories(&initiative.id, ids)?;
                }
                initiative_detail(db, initiative)
            })
        })
        .await?;
    Ok(Json(json!({ "initiative": detail })))
}

async fn delete_initiative(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .call(move |db| db.delete_initiative(&user.id, &id))
        .await?;
    if !deleted {
        return Err(ApiError::NotFound("Initiative not found".into()));
    }
    Ok(Json(json!({ "success": true })))
}

// ── Repositories ──────────────────────────────────────────────────────

async fn list_repositories(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let repositories = state
        .db
        .call(move |db| db.list_repositories(&user.id))
        .await?;
    Ok(Json(json!({ "repositories": repositories })))
}

async fn create_repository(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateRepositoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(url), Some(name), Some(full_name)) =
        (non_empty(req.url), non_empty(req.name), non_empty(req.full_name))
    else {
        return Err(ApiError::BadRequest(
            "URL, name, and fullName are required".into(),
        ));
    };
    let new = NewRepository {
        url,
        provider: req.provider.unwrap_or(RepoProvider::Github),
        name,
        full_name,
        default_branch: non_empty(req.default_branch).unwrap_or_else(|| "main".to_string()),
        installation_id: req.installation_id,
        repo_instructions: req.repo_instructions,
        webhooks_enabled: false,
    };

    let repository = state
        .db
        .call(move |db| {
            if db.find_repository_by_url(&user.id, &new.url)?.is_some() {
                return Err(bad_request("Repository already connected"));
            }
            db.create_repository(&user.id, &new)
        })
        .await?;
    tracing::info!(repository_id = %repository.id, full_name = %repository.full_name, "repository connected");
    Ok((StatusCode::CREATED, Json(json!({ "repository": repository }))))
}

async fn get_repository(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            let repository = db
                .get_repository(&user.id, &id)?
                .ok_or(FleetError::RepositoryNotFound { id })?;
            let stats = db.repository_stats(&repository.id)?;
            Ok(RepositoryDetail { repository, stats })
        })
        .await?;
    Ok(Json(json!({ "repository": detail })))
}

async fn update_repository(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    Json(patch): Json<RepositoryPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let repository = state
        .db
        .call(move |db| db.update_repository(&user.id, &id, &patch))
        .await?
        .ok_or_else(|| ApiError::NotFound("Repository not found".into()))?;
    Ok(Json(json!({ "repository": repository })))
}

async fn delete_repository(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .call(move |db| db.delete_repository(&user.id, &id))
        .await?;
    if !deleted {
        return Err(ApiError::NotFound("Repository not found".into()));
    }
    Ok(Json(json!({ "success": true })))
}

// ── Tasks ─────────────────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<TasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = page(query.limit, query.offset, DEFAULT_TASK_LIMIT);
    let filter = TaskFilter {
        initiative_id: query.initiative_id,
        statuses: parse_statuses(query.status.as_deref())?,
        priority: query
            .priority
            .as_deref()
            .map(Priority::from_str)
            .transpose()
            .map_err(ApiError::BadRequest)?,
        limit,
        offset,
    };
    let (tasks, total) = state
        .db
        .call(move |db| db.list_tasks(&user.id, &filter))
        .await?;
    Ok(Json(json!({ "tasks": tasks, "total": total })))
}

async fn create_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let github_token = require_github_token(&user)?;

    let task_type = req.task_type.unwrap_or(TaskType::Custom);
    let prompt = dispatch::build_prompt(
        task_type,
        &PromptOptions {
            prompt: req.prompt,
            focus: req.focus,
            docs_type: req.docs_type,
            test_type: req.test_type,
            target: req.target,
        },
    )
    .ok_or_else(|| ApiError::BadRequest("Prompt is required".into()))?;

    if let Some(agents) = &req.agents {
        ProviderTaskRequest::new(prompt.clone(), AgentKind::Claude, None)
            .with_agents(agents)
            .map_err(|e| match e {
                GatewayError::InvalidRequest(msg) => ApiError::BadRequest(msg),
                other => ApiError::BadRequest(other.to_string()),
            })?;
    }

    let depends_on = normalize_depends_on(req.depends_on);
    let user_id = user.id.clone();
    let initiative_id = req.initiative_id;
    let repository_id = req.repository_id;
    let (agent, agents, model) = (req.agent, req.agents, req.model);
    let (repo_url, branch, priority) = (req.repo_url, req.branch, req.priority);

    let (task, repo_instructions) = state
        .db
        .call(move |db| {
            let now = Utc::now();
            let initiative = match initiative_id {
                Some(id) => db
                    .get_initiative(&user_id, &id)?
                    .ok_or(FleetError::InitiativeNotFound { id })?,
                None => db.get_or_create_default_initiative(&user_id)?,
            };
            let repository = match repository_id {
                Some(id) => Some(
                    db.get_repository(&user_id, &id)?
                        .ok_or(FleetError::RepositoryNotFound { id })?,
                ),
                None => None,
            };
            if !depends_on.is_empty() {
                validate_dependencies(db, &user_id, "new task", &depends_on)?;
            }

            let agent = agent
                .or_else(|| agents.as_ref().and_then(|a| a.first().copied()))
                .unwrap_or(initiative.default_agent);
            let model = model.or_else(|| {
                (agent == initiative.default_agent)
                    .then(|| initiative.default_model.clone())
                    .flatten()
            });
            let status = if dependencies_met(db, &depends_on)? {
                TaskStatus::Running
            } else {
                TaskStatus::Queued
            };
            let branch = branch
                .or_else(|| repository.as_ref().map(|r| r.default_branch.clone()))
                .unwrap_or_else(|| "main".to_string());

            let mut task = db.create_task(
                &NewTask {
                    initiative_id: initiative.id.clone(),
                    repository_id: repository.as_ref().map(|r| r.id.clone()),
                    prompt,
                    task_type,
                    priority: priority.unwrap_or(Priority::Medium),
                    status,
                    agent,
                    model,
                    repo_url: repository.as_ref().map(|r| r.url.clone()).or(repo_url),
                    branch: Some(branch),
                    depends_on,
                },
                now,
            )?;
            if let Some(agents) = agents {
                let patch = TaskPatch {
                    assigned_agents: Some(agents.iter().map(|a| a.as_str().to_string()).collect()),
                    ..Default::default()
                };
                task = db.update_task(&task.id, &patch, now)?;
            }
            db.record_metrics(
                &hour_bucket(now),
                &MetricsDelta {
                    tasks_created: 1,
                    ..Default::default()
                },
            )?;
            Ok((task, repository.and_then(|r| r.repo_instructions)))
        })
        .await?;
    tracing::info!(task_id = %task.id, status = task.status.as_str(), "task created");

    let task = if task.status == TaskStatus::Running {
        dispatch::dispatch_task(
            &state.db,
            state.gateway.as_ref(),
            task,
            &github_token,
            repo_instructions,
        )
        .await?
    } else {
        task
    };

    broadcast_message(&state.ws_tx, &WsMessage::TaskCreated { task: task.clone() });
    Ok((StatusCode::CREATED, Json(json!({ "task": task }))))
}

async fn get_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .db
        .call(move |db| {
            db.get_task_for_user(&user.id, &id)?
                .ok_or_else(|| FleetError::TaskNotFound { id }.into())
        })
        .await?;

    let syncable = matches!(task.status, TaskStatus::Running | TaskStatus::Assigned);
    let task = match task.external_task_id.clone() {
        Some(external_id) if query.sync && syncable => {
            sync_with_provider(&state, task, &external_id).await
        }
        _ => task,
    };

    let task_id = task.id.clone();
    let messages = state
        .db
        .call(move |db| db.messages_for_task(&task_id))
        .await?;
    Ok(Json(json!({ "task": task, "messages": messages })))
}

/// Pull the provider snapshot and reconcile. Failures leave the cached task.
async fn sync_with_provider(state: &SharedState, task: Task, external_id: &str) -> Task {
    let snapshot = match state.gateway.get_task(external_id).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(task_id = %task.id, error = %e, "status sync failed");
            return task;
        }
    };
    let options = state.lifecycle;
    let cached = task.clone();
    match state
        .db
        .call(move |db| lifecycle::sync_snapshot(db, &task, &snapshot, options, Utc::now()))
        .await
    {
        Ok(synced) => {
            if synced.status != cached.status || synced.progress != cached.progress {
                broadcast_message(&state.ws_tx, &WsMessage::TaskUpdated { task: synced.clone() });
            }
            synced
        }
        Err(e) => {
            tracing::warn!(task_id = %cached.id, error = %format!("{:#}", e), "status sync failed");
            cached
        }
    }
}

async fn update_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    Json(mut patch): Json<TaskPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let (task, promoted) = state
        .db
        .call(move |db| {
            let now = Utc::now();
            let existing = db
                .get_task_for_user(&user.id, &id)?
                .ok_or(FleetError::TaskNotFound { id })?;
            if let Some(depends_on) = patch.depends_on.take() {
                let depends_on = normalize_depends_on(depends_on);
                validate_dependencies(db, &user.id, &existing.id, &depends_on)?;
                patch.depends_on = Some(depends_on);
            }
            let task = db.update_task(&existing.id, &patch, now)?;
            let promoted = if existing.status != TaskStatus::Completed
                && task.status == TaskStatus::Completed
            {
                let ids = lifecycle::trigger_dependents(db, &task.id, now)?;
                load_tasks(db, &ids)?
            } else {
                Vec::new()
            };
            Ok((task, promoted))
        })
        .await?;

    broadcast_message(&state.ws_tx, &WsMessage::TaskUpdated { task: task.clone() });
    for promoted in promoted {
        broadcast_message(&state.ws_tx, &WsMessage::TaskUpdated { task: promoted });
    }
    Ok(Json(json!({ "task": task })))
}

async fn run_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let github_token = require_github_token(&user)?;
    let (task, repo_instructions) = state
        .db
        .call(move |db| {
            let task = db
                .get_task_for_user(&user.id, &id)?
                .ok_or(FleetError::TaskNotFound { id })?;
            if !matches!(task.status, TaskStatus::Queued | TaskStatus::Assigned) {
                return Err(bad_request(format!(
                    "Task is {} and cannot be started",
                    task.status.as_str()
                )));
            }
            if !dependencies_met(db, &task.depends_on)? {
                return Err(bad_request("Task has unfinished dependencies"));
            }
            let repo_instructions = match &task.repository_id {
                Some(repo_id) => db
                    .get_repository(&user.id, repo_id)?
                    .and_then(|r| r.repo_instructions),
                None => None,
            };
            db.set_task_status(&task.id, TaskStatus::Running, Utc::now())?;
            let task = db
                .get_task(&task.id)?
                .ok_or(FleetError::TaskNotFound { id: task.id })?;
            Ok((task, repo_instructions))
        })
        .await?;

    let task = dispatch::dispatch_task(
        &state.db,
        state.gateway.as_ref(),
        task,
        &github_token,
        repo_instructions,
    )
    .await?;
    broadcast_message(&state.ws_tx, &WsMessage::TaskUpdated { task: task.clone() });
    Ok(Json(json!({ "task": task })))
}

async fn delete_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (action, cancelled) = state
        .db
        .call(move |db| {
            let task = db
                .get_task_for_user(&user.id, &id)?
                .ok_or(FleetError::TaskNotFound { id })?;
            if task.status == TaskStatus::Running {
                db.set_task_status(&task.id, TaskStatus::Cancelled, Utc::now())?;
                Ok(("cancelled", db.get_task(&task.id)?.ok_or_else(|| {
                    FleetError::TaskNotFound { id: task.id.clone() }
                })?))
            } else {
                db.delete_task(&task.id)?;
                Ok(("deleted", task))
            }
        })
        .await?;

    if action == "cancelled" {
        broadcast_message(&state.ws_tx, &WsMessage::TaskUpdated { task: cancelled });
    } else {
        broadcast_message(&state.ws_tx, &WsMessage::TaskDeleted { task_id: cancelled.id });
    }
    Ok(Json(json!({ "success": true, "action": action })))
}

// ── Messages ──────────────────────────────────────────────────────────

async fn list_messages(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = page(query.limit, query.offset, DEFAULT_TASK_LIMIT);
    let filter = MessageFilter {
        initiative_id: query.initiative_id,
        unread_only: query.unread,
        limit,
        offset,
    };
    let messages = state
        .db
        .call(move |db| db.list_messages(&user.id, &filter))
        .await?;
    let total = messages.len();
    Ok(Json(json!({ "messages": messages, "total": total })))
}

async fn create_message(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(message_type), Some(subject)) = (non_empty(req.message_type), non_empty(req.subject))
    else {
        return Err(ApiError::BadRequest("Type and subject are required".into()));
    };
    let message_type = MessageType::from_str(&message_type).map_err(ApiError::BadRequest)?;
    let new = NewMessage {
        from_initiative_id: req.from_initiative_id,
        to_initiative_id: req.to_initiative_id,
        from_task_id: req.from_task_id,
        to_task_id: req.to_task_id,
        message_type,
        subject,
        body: req.body,
        metadata: req.metadata.unwrap_or_else(|| json!({})),
        suggested_actions: req.suggested_actions.unwrap_or_default(),
    };

    let message = state
        .db
        .call(move |db| {
            for id in [&new.from_initiative_id, &new.to_initiative_id]
                .into_iter()
                .flatten()
            {
                if db.get_initiative(&user.id, id)?.is_none() {
                    return Err(FleetError::InitiativeNotFound { id: id.clone() }.into());
                }
            }
            for id in [&new.from_task_id, &new.to_task_id].into_iter().flatten() {
                if db.get_task_for_user(&user.id, id)?.is_none() {
                    return Err(FleetError::TaskNotFound { id: id.clone() }.into());
                }
            }
            db.create_message(&new, Utc::now())
        })
        .await?;

    broadcast_message(
        &state.ws_tx,
        &WsMessage::MessageCreated {
            message: message.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(json!({ "message": message }))))
}

async fn mark_message_read(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .db
        .call(move |db| db.mark_message_read(&user.id, &id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Message not found".into()))?;
    Ok(Json(json!({ "message": message })))
}

// ── Metrics & dashboard ───────────────────────────────────────────────

/// First hour bucket of a window of `hours` ending with the current hour.
fn window_start(hours: i64) -> String {
    hour_bucket(Utc::now() - Duration::hours(hours.max(1) - 1))
}

async fn get_metrics(
    State(state): State<SharedState>,
    CurrentUser(_user): CurrentUser,
    Query(query): Query<MetricsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 30);
    let from = window_start(hours);
    let rows = state
        .db
        .call(move |db| db.list_metrics_since(&from))
        .await?;
    let totals = MetricsTotals::accumulate(&rows);
    Ok(Json(json!({ "hours": hours, "hourly": rows, "totals": totals })))
}

async fn get_dashboard(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let from = window_start(24);
    let dashboard = state
        .db
        .call(move |db| {
            let initiatives = db.list_initiatives(&user.id, Some(InitiativeStatus::Active))?;
            let (active_tasks, _) = db.list_tasks(
                &user.id,
                &TaskFilter {
                    statuses: vec![TaskStatus::Running, TaskStatus::Assigned],
                    limit: DASHBOARD_TASK_LIMIT,
                    ..Default::default()
                },
            )?;
            let messages = db.list_messages(
                &user.id,
                &MessageFilter {
                    limit: DASHBOARD_MESSAGE_LIMIT,
                    ..Default::default()
                },
            )?;
            let stats = db.user_task_stats(&user.id)?;
            let totals = MetricsTotals::accumulate(&db.list_metrics_since(&from)?);
            let agent_capacity = if initiatives.is_empty() {
                DEFAULT_AGENT_CAPACITY
            } else {
                initiatives.iter().map(|i| i.max_agents).sum()
            };
            Ok(json!({
                "initiatives": initiatives,
                "active_tasks": active_tasks,
                "messages": messages,
                "metrics": totals,
                "live_agents": stats.running,
                "agent_capacity": agent_capacity,
                "tasks_queued": stats.queued,
            }))
        })
        .await?;
    Ok(Json(dashboard))
}
