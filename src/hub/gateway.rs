//! Client for the remote agent execution provider.
//!
//! The provider runs the coding agent; fleet only creates tasks, reads
//! their status and optionally polls until a terminal state. Every call
//! is a single attempt.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::models::{AgentKind, DiffStats, deserialize_progress};
use crate::errors::GatewayError;

pub const DEFAULT_BASE_URL: &str = "https://cloud.blackbox.ai";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

const MIN_MULTI_AGENTS: usize = 2;
const MAX_MULTI_AGENTS: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ProviderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of a task as the provider reports it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTask {
    pub id: String,
    pub status: ProviderStatus,
    #[serde(default, deserialize_with = "deserialize_progress")]
    pub progress: Option<i64>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub diff_stats: Option<DiffStats>,
}

impl ProviderTask {
    /// The provider has no summary field; its last log line stands in.
    pub fn summary(&self) -> Option<&str> {
        self.logs.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent: AgentKind,
    pub model: String,
}

/// Body of `POST /api/tasks`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTaskRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_branch: Option<String>,
    pub selected_agent: AgentKind,
    pub selected_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_agents: Option<Vec<AgentConfig>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub multi_launch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_instructions: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_variables: BTreeMap<String, String>,
}

impl ProviderTaskRequest {
    /// A single-agent request. Without a model the agent's default is used.
    pub fn new(prompt: impl Into<String>, agent: AgentKind, model: Option<String>) -> Self {
        Self {
            prompt: prompt.into(),
            repo_url: None,
            selected_branch: None,
            selected_agent: agent,
            selected_model: model.unwrap_or_else(|| agent.default_model().to_string()),
            selected_agents: None,
            multi_launch: false,
            repo_instructions: None,
            environment_variables: BTreeMap::new(),
        }
    }

    pub fn with_repo(mut self, repo_url: Option<String>, branch: Option<String>) -> Self {
        self.repo_url = repo_url;
        self.selected_branch = branch;
        self
    }

    pub fn with_repo_instructions(mut self, instructions: Option<String>) -> Self {
        self.repo_instructions = instructions;
        self
    }

    /// Hand the user's GitHub token to the agent sandbox for repository access.
    pub fn with_github_token(mut self, token: &str) -> Self {
        self.environment_variables
            .insert("GITHUB_TOKEN".to_string(), token.to_string());
        self
    }

    /// Launch the same prompt on several agents at once (2 to 5).
    pub fn with_agents(mut self, agents: &[AgentKind]) -> Result<Self, GatewayError> {
        if agents.len() < MIN_MULTI_AGENTS {
            return Err(GatewayError::InvalidRequest(
                "Multi-agent tasks require at least 2 agents".to_string(),
            ));
        }
        if agents.len() > MAX_MULTI_AGENTS {
            return Err(GatewayError::InvalidRequest(
                "Multi-agent tasks support maximum 5 agents".to_string(),
            ));
        }
        self.selected_agents = Some(
            agents
                .iter()
                .map(|a| AgentConfig {
                    agent: *a,
                    model: a.default_model().to_string(),
                })
                .collect(),
        );
        self.multi_launch = true;
        Ok(self)
    }
}

#[derive(Deserialize)]
struct TaskEnvelope {
    task: ProviderTask,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Operations fleet needs from an execution provider.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn create_task(&self, request: &ProviderTaskRequest)
    -> Result<ProviderTask, GatewayError>;

    async fn get_task(&self, task_id: &str) -> Result<ProviderTask, GatewayError>;
}

/// Poll `task_id` until it reaches a terminal state or `timeout` elapses.
/// `on_poll` sees every snapshot, including the final one.
pub async fn wait_for_completion(
    gateway: &dyn ExecutionGateway,
    task_id: &str,
    poll_interval: Duration,
    timeout: Duration,
    mut on_poll: impl FnMut(&ProviderTask),
) -> Result<ProviderTask, GatewayError> {
    let start = Instant::now();
    loop {
        let task = gateway.get_task(task_id).await?;
        on_poll(&task);
        if task.status.is_terminal() {
            return Ok(task);
        }
        if start.elapsed() >= timeout {
            return Err(GatewayError::Timeout {
                task_id: task_id.to_string(),
                timeout_ms: timeout.as_millis(),
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// HTTP client for the hosted provider API.
#[derive(Clone)]
pub struct RemoteAgentClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RemoteAgentClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key(&self) -> Result<&str, GatewayError> {
        self.api_key.as_deref().ok_or(GatewayError::MissingApiKey)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.api_key()?))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
            let message = parsed
                .message
                .or(parsed.error)
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ExecutionGateway for RemoteAgentClient {
    async fn create_task(
        &self,
        request: &ProviderTaskRequest,
    ) -> Result<ProviderTask, GatewayError> {
        let url = format!("{}/api/tasks", self.base_url);
        tracing::debug!(agent = request.selected_agent.as_str(), "creating provider task");
        let envelope: TaskEnvelope = self.send(self.http.post(url).json(request)).await?;
        tracing::info!(external_id = %envelope.task.id, "provider task created");
        Ok(envelope.task)
    }

    async fn get_task(&self, task_id: &str) -> Result<ProviderTask, GatewayError> {
        let url = format!("{}/api/tasks/{}", self.base_url, task_id);
        let envelope: TaskEnvelope = self.send(self.http.get(url)).await?;
        Ok(envelope.task)
    }
}
