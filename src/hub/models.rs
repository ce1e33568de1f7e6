use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    #[serde(skip_serializing)]
    pub api_token: String,
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    pub github_username: Option<String>,
    pub created_at: String,
}

impl User {
    pub fn has_github_connection(&self) -> bool {
        self.github_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Internal task state. `queued → assigned → running → {completed, failed, cancelled}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states carry a `completed_at` timestamp.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Review,
    Docs,
    Research,
    #[serde(alias = "tests")]
    Test,
    Custom,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Review => "review",
            Self::Docs => "docs",
            Self::Research => "research",
            Self::Test => "test",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(Self::Code),
            "review" => Ok(Self::Review),
            "docs" => Ok(Self::Docs),
            "research" => Ok(Self::Research),
            "test" | "tests" => Ok(Self::Test),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

/// Agents the execution provider can run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Blackbox,
    Codex,
    Gemini,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Blackbox => "blackbox",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    /// Model selected when a task names an agent but no model.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Claude => "blackboxai/anthropic/claude-sonnet-4.5",
            Self::Blackbox => "blackboxai/blackbox-pro",
            Self::Codex => "gpt-5-codex",
            Self::Gemini => "gemini-2.0-flash-exp",
        }
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "blackbox" => Ok(Self::Blackbox),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            _ => Err(format!("Invalid agent: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScalingPolicy {
    Auto,
    Manual,
}

impl ScalingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ScalingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Invalid scaling policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InitiativeStatus {
    Active,
    Paused,
    Archived,
}

impl InitiativeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }
}

impl FromStr for InitiativeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Invalid initiative status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepoProvider {
    Github,
    Gitlab,
    Bitbucket,
}

impl RepoProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Bitbucket => "bitbucket",
        }
    }
}

impl FromStr for RepoProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            "gitlab" => Ok(Self::Gitlab),
            "bitbucket" => Ok(Self::Bitbucket),
            _ => Err(format!("Invalid repository provider: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Handoff,
    Response,
    Alert,
    Request,
    Status,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handoff => "HANDOFF",
            Self::Response => "RESPONSE",
            Self::Alert => "ALERT",
            Self::Request => "REQUEST",
            Self::Status => "STATUS",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HANDOFF" => Ok(Self::Handoff),
            "RESPONSE" => Ok(Self::Response),
            "ALERT" => Ok(Self::Alert),
            "REQUEST" => Ok(Self::Request),
            "STATUS" => Ok(Self::Status),
            _ => Err(format!("Invalid message type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Initiative {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub max_agents: i64,
    pub min_agents: i64,
    pub scaling_policy: ScalingPolicy,
    pub default_agent: AgentKind,
    pub default_model: Option<String>,
    pub allowed_agents: Vec<AgentKind>,
    pub triggers: serde_json::Value,
    pub status: InitiativeStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitiativeStats {
    pub running: i64,
    pub queued: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiativeDetail {
    #[serde(flatten)]
    pub initiative: Initiative,
    pub repositories: Vec<Repository>,
    pub stats: InitiativeStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub provider: RepoProvider,
    pub name: String,
    pub full_name: String,
    pub default_branch: String,
    pub installation_id: Option<String>,
    pub repo_instructions: Option<String>,
    pub webhooks_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryStats {
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub tasks_total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryDetail {
    #[serde(flatten)]
    pub repository: Repository,
    pub stats: RepositoryStats,
}

/// Line-change totals reported by the execution provider.
///
/// The provider's task snapshot spells these `totalLinesAdded` and friends;
/// webhook payloads use the short names.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiffStats {
    #[serde(default, alias = "totalLinesAdded")]
    pub added: i64,
    #[serde(default, alias = "totalLinesRemoved")]
    pub removed: i64,
    #[serde(default, alias = "totalFilesChanged")]
    pub files_changed: i64,
}

/// Outcome stored on a task once it reaches a terminal provider state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_stats: Option<DiffStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub initiative_id: String,
    pub repository_id: Option<String>,
    pub prompt: String,
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,
    pub agent: AgentKind,
    pub model: Option<String>,
    pub assigned_agents: Vec<String>,
    pub progress: i64,
    pub eta: Option<String>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub external_task_id: Option<String>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub depends_on: Vec<String>,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestedAction {
    pub label: String,
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from_initiative_id: Option<String>,
    pub to_initiative_id: Option<String>,
    pub from_task_id: Option<String>,
    pub to_task_id: Option<String>,
    pub message_type: MessageType,
    pub subject: String,
    pub body: Option<String>,
    pub metadata: serde_json::Value,
    pub suggested_actions: Vec<SuggestedAction>,
    pub read: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsHourly {
    pub hour: String,
    pub tasks_created: i64,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub prs_created: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub files_changed: i64,
}

/// Additive change applied to one hour bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsDelta {
    pub tasks_created: i64,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub prs_created: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub files_changed: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsTotals {
    pub tasks_created: i64,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub prs_created: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub files_changed: i64,
}

impl MetricsTotals {
    pub fn accumulate(rows: &[MetricsHourly]) -> Self {
        rows.iter().fold(Self::default(), |mut acc, row| {
            acc.tasks_created += row.tasks_created;
            acc.tasks_completed += row.tasks_completed;
            acc.tasks_failed += row.tasks_failed;
            acc.prs_created += row.prs_created;
            acc.lines_added += row.lines_added;
            acc.lines_removed += row.lines_removed;
            acc.files_changed += row.files_changed;
            acc
        })
    }
}

// ── Store inputs ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewInitiative {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub max_agents: i64,
    pub min_agents: i64,
    pub scaling_policy: ScalingPolicy,
    pub default_agent: AgentKind,
    pub default_model: Option<String>,
    pub allowed_agents: Vec<AgentKind>,
    pub triggers: serde_json::Value,
}

impl NewInitiative {
    pub fn named(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            description: None,
            max_agents: 100,
            min_agents: 1,
            scaling_policy: ScalingPolicy::Auto,
            default_agent: AgentKind::Claude,
            default_model: None,
            allowed_agents: vec![AgentKind::Claude, AgentKind::Codex, AgentKind::Gemini],
            triggers: serde_json::json!([]),
        }
    }
}

/// Partial initiative update. `repository_ids` replaces the linked set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitiativePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub max_agents: Option<i64>,
    pub min_agents: Option<i64>,
    pub scaling_policy: Option<ScalingPolicy>,
    pub default_agent: Option<AgentKind>,
    pub default_model: Option<String>,
    pub allowed_agents: Option<Vec<AgentKind>>,
    pub triggers: Option<serde_json::Value>,
    pub status: Option<InitiativeStatus>,
    pub repository_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct NewRepository {
    pub url: String,
    pub provider: RepoProvider,
    pub name: String,
    pub full_name: String,
    pub default_branch: String,
    pub installation_id: Option<String>,
    pub repo_instructions: Option<String>,
    pub webhooks_enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryPatch {
    pub default_branch: Option<String>,
    pub repo_instructions: Option<String>,
    pub webhooks_enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub initiative_id: String,
    pub repository_id: Option<String>,
    pub prompt: String,
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,
    pub agent: AgentKind,
    pub model: Option<String>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub depends_on: Vec<String>,
}

/// Read a progress percentage sent as any JSON number. Fractions are
/// rounded and the result clamped to `0..=100`.
pub fn deserialize_progress<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(0.0, 100.0) as i64))
}

/// Fields the owning user may change on a task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub priority: Option<Priority>,
    pub status: Option<TaskStatus>,
    #[serde(default, deserialize_with = "deserialize_progress")]
    pub progress: Option<i64>,
    pub eta: Option<String>,
    pub error: Option<String>,
    pub assigned_agents: Option<Vec<String>>,
    pub depends_on: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub initiative_id: Option<String>,
    pub statuses: Vec<TaskStatus>,
    pub priority: Option<Priority>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from_initiative_id: Option<String>,
    pub to_initiative_id: Option<String>,
    pub from_task_id: Option<String>,
    pub to_task_id: Option<String>,
    pub message_type: MessageType,
    pub subject: String,
    pub body: Option<String>,
    pub metadata: serde_json::Value,
    pub suggested_actions: Vec<SuggestedAction>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub initiative_id: Option<String>,
    pub unread_only: bool,
    pub limit: i64,
    pub offset: i64,
}
