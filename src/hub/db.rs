use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use super::dag::TaskNode;
use super::models::*;
use crate::errors::FleetError;

/// Async-safe handle to the fleet database.
///
/// Wraps `FleetDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FleetDb>>,
}

impl DbHandle {
    pub fn new(db: FleetDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FleetDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| FleetError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FleetDb>> {
        self.inner
            .lock()
            .map_err(|_| FleetError::LockPoisoned.into())
    }
}

/// RFC 3339 timestamp with millisecond precision, as stored in every table.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Key of the metrics bucket containing `at`: the time truncated to the hour.
pub fn hour_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:00:00Z").to_string()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

const TASK_COLUMNS: &str = "t.id, t.initiative_id, t.repository_id, t.prompt, t.task_type, t.priority, t.status,
     t.agent, t.model, t.assigned_agents, t.progress, t.eta, t.repo_url, t.branch, t.external_task_id,
     t.result, t.error, t.depends_on, t.queued_at, t.started_at, t.completed_at, t.updated_at";

const INITIATIVE_COLUMNS: &str = "id, user_id, name, slug, description, max_agents, min_agents, scaling_policy,
     default_agent, default_model, allowed_agents, triggers, status, created_at, updated_at";

const REPOSITORY_COLUMNS: &str = "r.id, r.user_id, r.url, r.provider, r.name, r.full_name, r.default_branch,
     r.installation_id, r.repo_instructions, r.webhooks_enabled, r.created_at, r.updated_at";

const MESSAGE_COLUMNS: &str = "m.id, m.from_initiative_id, m.to_initiative_id, m.from_task_id, m.to_task_id,
     m.message_type, m.subject, m.body, m.metadata, m.suggested_actions, m.read, m.created_at";

const USER_COLUMNS: &str =
    "id, email, name, api_token, github_token, github_username, created_at";

pub struct FleetDb {
    conn: Connection,
}

impl FleetDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    name TEXT,
                    api_token TEXT NOT NULL UNIQUE,
                    github_token TEXT,
                    github_username TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS initiatives (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    slug TEXT NOT NULL,
                    description TEXT,
                    max_agents INTEGER NOT NULL DEFAULT 100,
                    min_agents INTEGER NOT NULL DEFAULT 1,
                    scaling_policy TEXT NOT NULL DEFAULT 'auto',
                    default_agent TEXT NOT NULL DEFAULT 'claude',
                    default_model TEXT,
                    allowed_agents TEXT NOT NULL DEFAULT '[]',
                    triggers TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'active',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(user_id, slug)
                );

                CREATE TABLE IF NOT EXISTS repositories (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    url TEXT NOT NULL,
                    provider TEXT NOT NULL DEFAULT 'github',
                    name TEXT NOT NULL,
                    full_name TEXT NOT NULL,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    installation_id TEXT,
                    repo_instructions TEXT,
                    webhooks_enabled INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(user_id, url)
                );

                CREATE TABLE IF NOT EXISTS initiative_repositories (
                    initiative_id TEXT NOT NULL REFERENCES initiatives(id) ON DELETE CASCADE,
                    repository_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                    PRIMARY KEY (initiative_id, repository_id)
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    initiative_id TEXT NOT NULL REFERENCES initiatives(id) ON DELETE CASCADE,
                    repository_id TEXT REFERENCES repositories(id) ON DELETE SET NULL,
                    prompt TEXT NOT NULL,
                    task_type TEXT NOT NULL DEFAULT 'code',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    status TEXT NOT NULL DEFAULT 'queued',
                    agent TEXT NOT NULL DEFAULT 'claude',
                    model TEXT,
                    assigned_agents TEXT NOT NULL DEFAULT '[]',
                    progress INTEGER NOT NULL DEFAULT 0,
                    eta TEXT,
                    repo_url TEXT,
                    branch TEXT,
                    external_task_id TEXT,
                    result TEXT,
                    error TEXT,
                    depends_on TEXT NOT NULL DEFAULT '[]',
                    queued_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agent_messages (
                    id TEXT PRIMARY KEY,
                    from_initiative_id TEXT REFERENCES initiatives(id) ON DELETE CASCADE,
                    to_initiative_id TEXT REFERENCES initiatives(id) ON DELETE CASCADE,
                    from_task_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
                    to_task_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
                    message_type TEXT NOT NULL,
                    subject TEXT NOT NULL,
                    body TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    suggested_actions TEXT NOT NULL DEFAULT '[]',
                    read INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS metrics_hourly (
                    hour TEXT PRIMARY KEY,
                    tasks_created INTEGER NOT NULL DEFAULT 0,
                    tasks_completed INTEGER NOT NULL DEFAULT 0,
                    tasks_failed INTEGER NOT NULL DEFAULT 0,
                    prs_created INTEGER NOT NULL DEFAULT 0,
                    lines_added INTEGER NOT NULL DEFAULT 0,
                    lines_removed INTEGER NOT NULL DEFAULT 0,
                    files_changed INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    external_task_id TEXT NOT NULL,
                    event TEXT NOT NULL,
                    received_at TEXT NOT NULL,
                    PRIMARY KEY (external_task_id, event)
                );

                CREATE INDEX IF NOT EXISTS idx_initiatives_user ON initiatives(user_id);
                CREATE INDEX IF NOT EXISTS idx_repositories_user ON repositories(user_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_initiative ON tasks(initiative_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_external ON tasks(external_task_id);
                CREATE INDEX IF NOT EXISTS idx_messages_to ON agent_messages(to_initiative_id);
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    /// Run `f` inside one transaction; any error rolls everything back.
    pub fn transaction<R>(&self, f: impl FnOnce(&FleetDb) -> Result<R>) -> Result<R> {
        // DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let out = f(self)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(out)
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, email: &str, name: Option<&str>) -> Result<User> {
        let id = new_id();
        let token = format!("flt_{}", uuid::Uuid::new_v4().simple());
        let now = timestamp(Utc::now());
        self.conn
            .execute(
                "INSERT INTO users (id, email, name, api_token, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, email, name, token, now],
            )
            .context("Failed to insert user")?;
        self.get_user(&id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.query_user(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"), id)
    }

    pub fn get_user_by_token(&self, token: &str) -> Result<Option<User>> {
        self.query_user(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE api_token = ?1"),
            token,
        )
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.query_user(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            email,
        )
    }

    fn query_user(&self, sql: &str, key: &str) -> Result<Option<User>> {
        self.conn
            .query_row(sql, params![key], |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                    api_token: row.get(3)?,
                    github_token: row.get(4)?,
                    github_username: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .optional()
            .context("Failed to query user")
    }

    /// Store or clear the user's GitHub credential.
    pub fn set_github_connection(
        &self,
        user_id: &str,
        token: Option<&str>,
        username: Option<&str>,
    ) -> Result<User> {
        self.conn
            .execute(
                "UPDATE users SET github_token = ?1, github_username = ?2, updated_at = ?3 WHERE id = ?4",
                params![token, username, timestamp(Utc::now()), user_id],
            )
            .context("Failed to update GitHub connection")?;
        self.get_user(user_id)?
            .context("User not found after GitHub update")
    }

    // ── Initiatives ───────────────────────────────────────────────────

    pub fn create_initiative(&self, user_id: &str, new: &NewInitiative) -> Result<Initiative> {
        let id = new_id();
        let now = timestamp(Utc::now());
        let allowed: Vec<&str> = new.allowed_agents.iter().map(|a| a.as_str()).collect();
        self.conn
            .execute(
                "INSERT INTO initiatives (id, user_id, name, slug, description, max_agents, min_agents,
                     scaling_policy, default_agent, default_model, allowed_agents, triggers, status,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'active', ?13, ?13)",
                params![
                    id,
                    user_id,
                    new.name,
                    new.slug,
                    new.description,
                    new.max_agents,
                    new.min_agents,
                    new.scaling_policy.as_str(),
                    new.default_agent.as_str(),
                    new.default_model,
                    serde_json::to_string(&allowed)?,
                    new.triggers.to_string(),
                    now,
                ],
            )
            .context("Failed to insert initiative")?;
        self.get_initiative(user_id, &id)?
            .context("Initiative not found after insert")
    }

    pub fn slug_exists(&self, user_id: &str, slug: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM initiatives WHERE user_id = ?1 AND slug = ?2)",
                params![user_id, slug],
                |row| row.get(0),
            )
            .context("Failed to check slug")
    }

    pub fn list_initiatives(
        &self,
        user_id: &str,
        status: Option<InitiativeStatus>,
    ) -> Result<Vec<Initiative>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {INITIATIVE_COLUMNS} FROM initiatives
                 WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, rowid DESC"
            ))
            .context("Failed to prepare list_initiatives")?;
        let rows = stmt
            .query_map(params![user_id, status.map(|s| s.as_str())], InitiativeRow::from_row)
            .context("Failed to query initiatives")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read initiative row")?.into_initiative()?);
        }
        Ok(out)
    }

    /// Fetch an initiative owned by `user_id`. Other users' rows read as absent.
    pub fn get_initiative(&self, user_id: &str, id: &str) -> Result<Option<Initiative>> {
        self.conn
            .query_row(
                &format!("SELECT {INITIATIVE_COLUMNS} FROM initiatives WHERE id = ?1 AND user_id = ?2"),
                params![id, user_id],
                InitiativeRow::from_row,
            )
            .optional()
            .context("Failed to query initiative")?
            .map(InitiativeRow::into_initiative)
            .transpose()
    }

    fn get_initiative_by_slug(&self, user_id: &str, slug: &str) -> Result<Option<Initiative>> {
        self.conn
            .query_row(
                &format!("SELECT {INITIATIVE_COLUMNS} FROM initiatives WHERE slug = ?1 AND user_id = ?2"),
                params![slug, user_id],
                InitiativeRow::from_row,
            )
            .optional()
            .context("Failed to query initiative by slug")?
            .map(InitiativeRow::into_initiative)
            .transpose()
    }

    /// The user's `default` initiative, created on first use.
    pub fn get_or_create_default_initiative(&self, user_id: &str) -> Result<Initiative> {
        if let Some(existing) = self.get_initiative_by_slug(user_id, "default")? {
            return Ok(existing);
        }
        let mut new = NewInitiative::named("Default", "default");
        new.description = Some("Default initiative for tasks".to_string());
        self.create_initiative(user_id, &new)
    }

    pub fn update_initiative(
        &self,
        user_id: &str,
        id: &str,
        patch: &InitiativePatch,
    ) -> Result<Option<Initiative>> {
        if self.get_initiative(user_id, id)?.is_none() {
            return Ok(None);
        }
        let allowed = patch
            .allowed_agents
            .as_ref()
            .map(|agents| {
                let names: Vec<&str> = agents.iter().map(|a| a.as_str()).collect();
                serde_json::to_string(&names)
            })
            .transpose()?;
        self.conn
            .execute(
                "UPDATE initiatives SET
                    name = COALESCE(?1, name),
                    description = COALESCE(?2, description),
                    max_agents = COALESCE(?3, max_agents),
                    min_agents = COALESCE(?4, min_agents),
                    scaling_policy = COALESCE(?5, scaling_policy),
                    default_agent = COALESCE(?6, default_agent),
                    default_model = COALESCE(?7, default_model),
                    allowed_agents = COALESCE(?8, allowed_agents),
                    triggers = COALESCE(?9, triggers),
                    status = COALESCE(?10, status),
                    updated_at = ?11
                 WHERE id = ?12 AND user_id = ?13",
                params![
                    patch.name,
                    patch.description,
                    patch.max_agents,
                    patch.min_agents,
                    patch.scaling_policy.map(|p| p.as_str()),
                    patch.default_agent.map(|a| a.as_str()),
                    patch.default_model,
                    allowed,
                    patch.triggers.as_ref().map(|t| t.to_string()),
                    patch.status.map(|s| s.as_str()),
                    timestamp(Utc::now()),
                    id,
                    user_id,
                ],
            )
            .context("Failed to update initiative")?;
        self.get_initiative(user_id, id)
    }

    pub fn delete_initiative(&self, user_id: &str, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "DELETE FROM initiatives WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete initiative")?;
        Ok(n > 0)
    }

    /// Replace the repositories linked to an initiative.
    pub fn set_initiative_repositories(
        &self,
        initiative_id: &str,
        repository_ids: &[String],
    ) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM initiative_repositories WHERE initiative_id = ?1",
                params![initiative_id],
            )
            .context("Failed to clear initiative repositories")?;
        for repo_id in repository_ids {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO initiative_repositories (initiative_id, repository_id) VALUES (?1, ?2)",
                    params![initiative_id, repo_id],
                )
                .context("Failed to link repository")?;
        }
        Ok(())
    }

    pub fn list_initiative_repositories(&self, initiative_id: &str) -> Result<Vec<Repository>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {REPOSITORY_COLUMNS} FROM repositories r
                 JOIN initiative_repositories ir ON ir.repository_id = r.id
                 WHERE ir.initiative_id = ?1 ORDER BY r.name"
            ))
            .context("Failed to prepare list_initiative_repositories")?;
        let rows = stmt
            .query_map(params![initiative_id], RepositoryRow::from_row)
            .context("Failed to query initiative repositories")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read repository row")?.into_repository()?);
        }
        Ok(out)
    }

    pub fn initiative_stats(&self, initiative_id: &str) -> Result<InitiativeStats> {
        self.conn
            .query_row(
                "SELECT
                    COALESCE(SUM(status = 'running'), 0),
                    COALESCE(SUM(status IN ('queued', 'assigned')), 0),
                    COALESCE(SUM(status = 'completed'), 0),
                    COALESCE(SUM(status = 'failed'), 0)
                 FROM tasks WHERE initiative_id = ?1",
                params![initiative_id],
                |row| {
                    Ok(InitiativeStats {
                        running: row.get(0)?,
                        queued: row.get(1)?,
                        completed: row.get(2)?,
                        failed: row.get(3)?,
                    })
                },
            )
            .context("Failed to compute initiative stats")
    }

    /// Same counts as `initiative_stats`, across everything the user owns.
    pub fn user_task_stats(&self, user_id: &str) -> Result<InitiativeStats> {
        self.conn
            .query_row(
                "SELECT
                    COALESCE(SUM(t.status = 'running'), 0),
                    COALESCE(SUM(t.status IN ('queued', 'assigned')), 0),
                    COALESCE(SUM(t.status = 'completed'), 0),
                    COALESCE(SUM(t.status = 'failed'), 0)
                 FROM tasks t JOIN initiatives i ON i.id = t.initiative_id
                 WHERE i.user_id = ?1",
                params![user_id],
                |row| {
                    Ok(InitiativeStats {
                        running: row.get(0)?,
                        queued: row.get(1)?,
                        completed: row.get(2)?,
                        failed: row.get(3)?,
                    })
                },
            )
            .context("Failed to compute task stats")
    }

    // ── Repositories ──────────────────────────────────────────────────

    pub fn create_repository(&self, user_id: &str, new: &NewRepository) -> Result<Repository> {
        let id = new_id();
        let now = timestamp(Utc::now());
        self.conn
            .execute(
                "INSERT INTO repositories (id, user_id, url, provider, name, full_name, default_branch,
                     installation_id, repo_instructions, webhooks_enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    id,
                    user_id,
                    new.url,
                    new.provider.as_str(),
                    new.name,
                    new.full_name,
                    new.default_branch,
                    new.installation_id,
                    new.repo_instructions,
                    new.webhooks_enabled,
                    now,
                ],
            )
            .context("Failed to insert repository")?;
        self.get_repository(user_id, &id)?
            .context("Repository not found after insert")
    }

    pub fn find_repository_by_url(&self, user_id: &str, url: &str) -> Result<Option<Repository>> {
        self.conn
            .query_row(
                &format!("SELECT {REPOSITORY_COLUMNS} FROM repositories r WHERE r.url = ?1 AND r.user_id = ?2"),
                params![url, user_id],
                RepositoryRow::from_row,
            )
            .optional()
            .context("Failed to query repository by url")?
            .map(RepositoryRow::into_repository)
            .transpose()
    }

    pub fn list_repositories(&self, user_id: &str) -> Result<Vec<Repository>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {REPOSITORY_COLUMNS} FROM repositories r
                 WHERE r.user_id = ?1 ORDER BY r.created_at DESC, r.rowid DESC"
            ))
            .context("Failed to prepare list_repositories")?;
        let rows = stmt
            .query_map(params![user_id], RepositoryRow::from_row)
            .context("Failed to query repositories")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read repository row")?.into_repository()?);
        }
        Ok(out)
    }

    pub fn get_repository(&self, user_id: &str, id: &str) -> Result<Option<Repository>> {
        self.conn
            .query_row(
                &format!("SELECT {REPOSITORY_COLUMNS} FROM repositories r WHERE r.id = ?1 AND r.user_id = ?2"),
                params![id, user_id],
                RepositoryRow::from_row,
            )
            .optional()
            .context("Failed to query repository")?
            .map(RepositoryRow::into_repository)
            .transpose()
    }

    pub fn update_repository(
        &self,
        user_id: &str,
        id: &str,
        patch: &RepositoryPatch,
    ) -> Result<Option<Repository>> {
        self.conn
            .execute(
                "UPDATE repositories SET
                    default_branch = COALESCE(?1, default_branch),
                    repo_instructions = COALESCE(?2, repo_instructions),
                    webhooks_enabled = COALESCE(?3, webhooks_enabled),
                    updated_at = ?4
                 WHERE id = ?5 AND user_id = ?6",
                params![
                    patch.default_branch,
                    patch.repo_instructions,
                    patch.webhooks_enabled,
                    timestamp(Utc::now()),
                    id,
                    user_id,
                ],
            )
            .context("Failed to update repository")?;
        self.get_repository(user_id, id)
    }

    pub fn delete_repository(&self, user_id: &str, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "DELETE FROM repositories WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete repository")?;
        Ok(n > 0)
    }

    pub fn repository_stats(&self, repository_id: &str) -> Result<RepositoryStats> {
        self.conn
            .query_row(
                "SELECT
                    COALESCE(SUM(status = 'completed'), 0),
                    COALESCE(SUM(status = 'failed'), 0),
                    COUNT(*)
                 FROM tasks WHERE repository_id = ?1",
                params![repository_id],
                |row| {
                    Ok(RepositoryStats {
                        tasks_completed: row.get(0)?,
                        tasks_failed: row.get(1)?,
                        tasks_total: row.get(2)?,
                    })
                },
            )
            .context("Failed to compute repository stats")
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn create_task(&self, new: &NewTask, now: DateTime<Utc>) -> Result<Task> {
        let id = new_id();
        let ts = timestamp(now);
        let started_at = (new.status == TaskStatus::Running).then(|| ts.clone());
        self.conn
            .execute(
                "INSERT INTO tasks (id, initiative_id, repository_id, prompt, task_type, priority, status,
                     agent, model, assigned_agents, repo_url, branch, depends_on, queued_at, started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?14)",
                params![
                    id,
                    new.initiative_id,
                    new.repository_id,
                    new.prompt,
                    new.task_type.as_str(),
                    new.priority.as_str(),
                    new.status.as_str(),
                    new.agent.as_str(),
                    new.model,
                    serde_json::to_string(&[new.agent.as_str()])?,
                    new.repo_url,
                    new.branch,
                    serde_json::to_string(&new.depends_on)?,
                    ts,
                    started_at,
                ],
            )
            .context("Failed to insert task")?;
        self.get_task(&id)?.context("Task not found after insert")
    }

    /// Unscoped lookup, for the lifecycle controller.
    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1"),
                params![id],
                TaskRow::from_row,
            )
            .optional()
            .context("Failed to query task")?
            .map(TaskRow::into_task)
            .transpose()
    }

    /// Fetch a task owned (through its initiative) by `user_id`.
    pub fn get_task_for_user(&self, user_id: &str, id: &str) -> Result<Option<Task>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t
                     JOIN initiatives i ON i.id = t.initiative_id
                     WHERE t.id = ?1 AND i.user_id = ?2"
                ),
                params![id, user_id],
                TaskRow::from_row,
            )
            .optional()
            .context("Failed to query task")?
            .map(TaskRow::into_task)
            .transpose()
    }

    pub fn get_task_by_external_id(&self, external_id: &str) -> Result<Option<Task>> {
        self.conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.external_task_id = ?1"),
                params![external_id],
                TaskRow::from_row,
            )
            .optional()
            .context("Failed to query task by external id")?
            .map(TaskRow::into_task)
            .transpose()
    }

    /// Filtered page of the user's tasks, newest first, with the unpaged total.
    pub fn list_tasks(&self, user_id: &str, filter: &TaskFilter) -> Result<(Vec<Task>, i64)> {
        let mut clauses = vec!["i.user_id = ?".to_string()];
        let mut args: Vec<Value> = vec![Value::Text(user_id.to_string())];
        if let Some(initiative_id) = &filter.initiative_id {
            clauses.push("t.initiative_id = ?".to_string());
            args.push(Value::Text(initiative_id.clone()));
        }
        if !filter.statuses.is_empty() {
            let marks = vec!["?"; filter.statuses.len()].join(", ");
            clauses.push(format!("t.status IN ({marks})"));
            args.extend(
                filter
                    .statuses
                    .iter()
                    .map(|s| Value::Text(s.as_str().to_string())),
            );
        }
        if let Some(priority) = filter.priority {
            clauses.push("t.priority = ?".to_string());
            args.push(Value::Text(priority.as_str().to_string()));
        }
        let where_sql = clauses.join(" AND ");

        let total: i64 = self
            .conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM tasks t JOIN initiatives i ON i.id = t.initiative_id WHERE {where_sql}"
                ),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )
            .context("Failed to count tasks")?;

        let mut page_args = args;
        page_args.push(Value::Integer(filter.limit));
        page_args.push(Value::Integer(filter.offset));
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks t JOIN initiatives i ON i.id = t.initiative_id
                 WHERE {where_sql}
                 ORDER BY t.queued_at DESC, t.rowid DESC LIMIT ? OFFSET ?"
            ))
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(params_from_iter(page_args.iter()), TaskRow::from_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok((tasks, total))
    }

    /// Every task id the user owns with its dependency list.
    pub fn dependency_nodes(&self, user_id: &str) -> Result<Vec<TaskNode>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.id, t.depends_on FROM tasks t
                 JOIN initiatives i ON i.id = t.initiative_id WHERE i.user_id = ?1",
            )
            .context("Failed to prepare dependency_nodes")?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query dependency nodes")?;
        let mut nodes = Vec::new();
        for row in rows {
            let (id, deps) = row.context("Failed to read dependency row")?;
            let deps: Vec<String> =
                serde_json::from_str(&deps).context("Invalid depends_on JSON")?;
            nodes.push(TaskNode::new(id, deps));
        }
        Ok(nodes)
    }

    /// Queued tasks whose dependency list contains `task_id`, with those lists.
    pub fn queued_dependents_of(&self, task_id: &str) -> Result<Vec<(String, Vec<String>)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.id, t.depends_on FROM tasks t
                 WHERE t.status = 'queued'
                   AND EXISTS (SELECT 1 FROM json_each(t.depends_on) WHERE value = ?1)",
            )
            .context("Failed to prepare queued_dependents_of")?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query dependents")?;
        let mut out = Vec::new();
        for row in rows {
            let (id, deps) = row.context("Failed to read dependent row")?;
            let deps: Vec<String> =
                serde_json::from_str(&deps).context("Invalid depends_on JSON")?;
            out.push((id, deps));
        }
        Ok(out)
    }

    /// How many of `ids` name tasks in `completed` status.
    pub fn count_completed(&self, ids: &[String]) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE status = 'completed' AND id IN (SELECT value FROM json_each(?1))",
                params![serde_json::to_string(ids)?],
                |row| row.get(0),
            )
            .context("Failed to count completed dependencies")
    }

    /// Move a task to `status`, keeping the timestamp invariants:
    /// entering `running` stamps `started_at` once, terminal states stamp
    /// `completed_at`, every other state clears it.
    pub fn set_task_status(&self, id: &str, status: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        let ts = timestamp(now);
        self.conn
            .execute(
                "UPDATE tasks SET
                    status = ?1,
                    started_at = CASE WHEN ?1 = 'running' THEN COALESCE(started_at, ?2) ELSE started_at END,
                    completed_at = CASE WHEN ?1 IN ('completed', 'failed', 'cancelled') THEN ?2 ELSE NULL END,
                    updated_at = ?2
                 WHERE id = ?3",
                params![status.as_str(), ts, id],
            )
            .context("Failed to update task status")?;
        Ok(())
    }

    pub fn set_task_progress(
        &self,
        id: &str,
        progress: i64,
        eta: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET progress = ?1, eta = COALESCE(?2, eta), updated_at = ?3 WHERE id = ?4",
                params![progress.clamp(0, 100), eta, timestamp(now), id],
            )
            .context("Failed to update task progress")?;
        Ok(())
    }

    /// Store the terminal outcome. `error` mirrors `result.error`.
    pub fn set_task_result(&self, id: &str, result: &TaskResult, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET result = ?1, error = ?2,
                    progress = CASE WHEN ?3 THEN 100 ELSE progress END,
                    updated_at = ?4
                 WHERE id = ?5",
                params![
                    serde_json::to_string(result)?,
                    result.error,
                    result.success,
                    timestamp(now),
                    id
                ],
            )
            .context("Failed to store task result")?;
        Ok(())
    }

    pub fn set_external_task_id(&self, id: &str, external_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET external_task_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![external_id, timestamp(Utc::now()), id],
            )
            .context("Failed to store external task id")?;
        Ok(())
    }

    /// Apply the user-editable fields. Status changes go through
    /// `set_task_status` so the timestamp rules hold.
    pub fn update_task(&self, id: &str, patch: &TaskPatch, now: DateTime<Utc>) -> Result<Task> {
        self.transaction(|db| {
            let ts = timestamp(now);
            let assigned = patch
                .assigned_agents
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let depends_on = patch
                .depends_on
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            db.conn
                .execute(
                    "UPDATE tasks SET
                        priority = COALESCE(?1, priority),
                        progress = COALESCE(?2, progress),
                        eta = COALESCE(?3, eta),
                        error = COALESCE(?4, error),
                        assigned_agents = COALESCE(?5, assigned_agents),
                        depends_on = COALESCE(?6, depends_on),
                        updated_at = ?7
                     WHERE id = ?8",
                    params![
                        patch.priority.map(|p| p.as_str()),
                        patch.progress.map(|p| p.clamp(0, 100)),
                        patch.eta,
                        patch.error,
                        assigned,
                        depends_on,
                        ts,
                        id,
                    ],
                )
                .context("Failed to update task")?;
            if let Some(status) = patch.status {
                db.set_task_status(id, status, now)?;
            }
            db.get_task(id)?
                .ok_or_else(|| FleetError::TaskNotFound { id: id.to_string() }.into())
        })
    }

    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(n > 0)
    }

    // ── Messages ──────────────────────────────────────────────────────

    pub fn create_message(&self, new: &NewMessage, now: DateTime<Utc>) -> Result<AgentMessage> {
        let id = new_id();
        self.conn
            .execute(
                "INSERT INTO agent_messages (id, from_initiative_id, to_initiative_id, from_task_id,
                     to_task_id, message_type, subject, body, metadata, suggested_actions, read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
                params![
                    id,
                    new.from_initiative_id,
                    new.to_initiative_id,
                    new.from_task_id,
                    new.to_task_id,
                    new.message_type.as_str(),
                    new.subject,
                    new.body,
                    new.metadata.to_string(),
                    serde_json::to_string(&new.suggested_actions)?,
                    timestamp(now),
                ],
            )
            .context("Failed to insert message")?;
        self.get_message(&id)?
            .context("Message not found after insert")
    }

    fn get_message(&self, id: &str) -> Result<Option<AgentMessage>> {
        self.conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM agent_messages m WHERE m.id = ?1"),
                params![id],
                MessageRow::from_row,
            )
            .optional()
            .context("Failed to query message")?
            .map(MessageRow::into_message)
            .transpose()
    }

    /// Messages sent from or to any initiative the user owns.
    pub fn list_messages(&self, user_id: &str, filter: &MessageFilter) -> Result<Vec<AgentMessage>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM agent_messages m
                 WHERE (m.from_initiative_id IN (SELECT id FROM initiatives WHERE user_id = ?1)
                        OR m.to_initiative_id IN (SELECT id FROM initiatives WHERE user_id = ?1))
                   AND (?2 IS NULL OR m.from_initiative_id = ?2 OR m.to_initiative_id = ?2)
                   AND (?3 = 0 OR m.read = 0)
                 ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?4 OFFSET ?5"
            ))
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(
                params![
                    user_id,
                    filter.initiative_id,
                    filter.unread_only,
                    filter.limit,
                    filter.offset
                ],
                MessageRow::from_row,
            )
            .context("Failed to query messages")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read message row")?.into_message()?);
        }
        Ok(out)
    }

    pub fn messages_for_task(&self, task_id: &str) -> Result<Vec<AgentMessage>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM agent_messages m
                 WHERE m.from_task_id = ?1 OR m.to_task_id = ?1 ORDER BY m.rowid"
            ))
            .context("Failed to prepare messages_for_task")?;
        let rows = stmt
            .query_map(params![task_id], MessageRow::from_row)
            .context("Failed to query task messages")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read message row")?.into_message()?);
        }
        Ok(out)
    }

    pub fn mark_message_read(&self, user_id: &str, id: &str) -> Result<Option<AgentMessage>> {
        let n = self
            .conn
            .execute(
                "UPDATE agent_messages SET read = 1
                 WHERE id = ?1
                   AND (from_initiative_id IN (SELECT id FROM initiatives WHERE user_id = ?2)
                        OR to_initiative_id IN (SELECT id FROM initiatives WHERE user_id = ?2))",
                params![id, user_id],
            )
            .context("Failed to mark message read")?;
        if n == 0 {
            return Ok(None);
        }
        self.get_message(id)
    }

    // ── Metrics ───────────────────────────────────────────────────────

    /// Add `delta` to the bucket for `hour` in one atomic upsert.
    pub fn record_metrics(&self, hour: &str, delta: &MetricsDelta) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO metrics_hourly (hour, tasks_created, tasks_completed, tasks_failed,
                     prs_created, lines_added, lines_removed, files_changed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(hour) DO UPDATE SET
                    tasks_created = tasks_created + excluded.tasks_created,
                    tasks_completed = tasks_completed + excluded.tasks_completed,
                    tasks_failed = tasks_failed + excluded.tasks_failed,
                    prs_created = prs_created + excluded.prs_created,
                    lines_added = lines_added + excluded.lines_added,
                    lines_removed = lines_removed + excluded.lines_removed,
                    files_changed = files_changed + excluded.files_changed",
                params![
                    hour,
                    delta.tasks_created,
                    delta.tasks_completed,
                    delta.tasks_failed,
                    delta.prs_created,
                    delta.lines_added,
                    delta.lines_removed,
                    delta.files_changed,
                ],
            )
            .context("Failed to upsert hourly metrics")?;
        Ok(())
    }

    pub fn get_metrics_hour(&self, hour: &str) -> Result<Option<MetricsHourly>> {
        self.conn
            .query_row(
                "SELECT hour, tasks_created, tasks_completed, tasks_failed, prs_created,
                        lines_added, lines_removed, files_changed
                 FROM metrics_hourly WHERE hour = ?1",
                params![hour],
                metrics_from_row,
            )
            .optional()
            .context("Failed to query hourly metrics")
    }

    /// Buckets at or after `from_hour`, oldest first.
    pub fn list_metrics_since(&self, from_hour: &str) -> Result<Vec<MetricsHourly>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT hour, tasks_created, tasks_completed, tasks_failed, prs_created,
                        lines_added, lines_removed, files_changed
                 FROM metrics_hourly WHERE hour >= ?1 ORDER BY hour",
            )
            .context("Failed to prepare list_metrics_since")?;
        let rows = stmt
            .query_map(params![from_hour], metrics_from_row)
            .context("Failed to query hourly metrics")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read metrics row")?);
        }
        Ok(out)
    }

    // ── Webhook deliveries ────────────────────────────────────────────

    /// Claim `(external_task_id, event)`. Returns false when it was already seen.
    pub fn record_delivery(
        &self,
        external_task_id: &str,
        event: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO webhook_deliveries (external_task_id, event, received_at)
                 VALUES (?1, ?2, ?3)",
                params![external_task_id, event, timestamp(now)],
            )
            .context("Failed to record webhook delivery")?;
        Ok(n > 0)
    }
}

fn metrics_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricsHourly> {
    Ok(MetricsHourly {
        hour: row.get(0)?,
        tasks_created: row.get(1)?,
        tasks_completed: row.get(2)?,
        tasks_failed: row.get(3)?,
        prs_created: row.get(4)?,
        lines_added: row.get(5)?,
        lines_removed: row.get(6)?,
        files_changed: row.get(7)?,
    })
}

fn parse_enum<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    T::from_str(value).map_err(|e| anyhow::anyhow!(e))
}

struct InitiativeRow {
    id: String,
    user_id: String,
    name: String,
    slug: String,
    description: Option<String>,
    max_agents: i64,
    min_agents: i64,
    scaling_policy: String,
    default_agent: String,
    default_model: Option<String>,
    allowed_agents: String,
    triggers: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl InitiativeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            slug: row.get(3)?,
            description: row.get(4)?,
            max_agents: row.get(5)?,
            min_agents: row.get(6)?,
            scaling_policy: row.get(7)?,
            default_agent: row.get(8)?,
            default_model: row.get(9)?,
            allowed_agents: row.get(10)?,
            triggers: row.get(11)?,
            status: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_initiative(self) -> Result<Initiative> {
        let allowed: Vec<String> =
            serde_json::from_str(&self.allowed_agents).context("Invalid allowed_agents JSON")?;
        Ok(Initiative {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            slug: self.slug,
            description: self.description,
            max_agents: self.max_agents,
            min_agents: self.min_agents,
            scaling_policy: parse_enum(&self.scaling_policy)?,
            default_agent: parse_enum(&self.default_agent)?,
            default_model: self.default_model,
            allowed_agents: allowed
                .iter()
                .map(|a| parse_enum(a))
                .collect::<Result<_>>()?,
            triggers: serde_json::from_str(&self.triggers).context("Invalid triggers JSON")?,
            status: parse_enum(&self.status)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct RepositoryRow {
    id: String,
    user_id: String,
    url: String,
    provider: String,
    name: String,
    full_name: String,
    default_branch: String,
    installation_id: Option<String>,
    repo_instructions: Option<String>,
    webhooks_enabled: bool,
    created_at: String,
    updated_at: String,
}

impl RepositoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            url: row.get(2)?,
            provider: row.get(3)?,
            name: row.get(4)?,
            full_name: row.get(5)?,
            default_branch: row.get(6)?,
            installation_id: row.get(7)?,
            repo_instructions: row.get(8)?,
            webhooks_enabled: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_repository(self) -> Result<Repository> {
        Ok(Repository {
            id: self.id,
            user_id: self.user_id,
            url: self.url,
            provider: parse_enum(&self.provider)?,
            name: self.name,
            full_name: self.full_name,
            default_branch: self.default_branch,
            installation_id: self.installation_id,
            repo_instructions: self.repo_instructions,
            webhooks_enabled: self.webhooks_enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct TaskRow {
    id: String,
    initiative_id: String,
    repository_id: Option<String>,
    prompt: String,
    task_type: String,
    priority: String,
    status: String,
    agent: String,
    model: Option<String>,
    assigned_agents: String,
    progress: i64,
    eta: Option<String>,
    repo_url: Option<String>,
    branch: Option<String>,
    external_task_id: Option<String>,
    result: Option<String>,
    error: Option<String>,
    depends_on: String,
    queued_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            initiative_id: row.get(1)?,
            repository_id: row.get(2)?,
            prompt: row.get(3)?,
            task_type: row.get(4)?,
            priority: row.get(5)?,
            status: row.get(6)?,
            agent: row.get(7)?,
            model: row.get(8)?,
            assigned_agents: row.get(9)?,
            progress: row.get(10)?,
            eta: row.get(11)?,
            repo_url: row.get(12)?,
            branch: row.get(13)?,
            external_task_id: row.get(14)?,
            result: row.get(15)?,
            error: row.get(16)?,
            depends_on: row.get(17)?,
            queued_at: row.get(18)?,
            started_at: row.get(19)?,
            completed_at: row.get(20)?,
            updated_at: row.get(21)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            initiative_id: self.initiative_id,
            repository_id: self.repository_id,
            prompt: self.prompt,
            task_type: parse_enum(&self.task_type)?,
            priority: parse_enum(&self.priority)?,
            status: parse_enum(&self.status)?,
            agent: parse_enum(&self.agent)?,
            model: self.model,
            assigned_agents: serde_json::from_str(&self.assigned_agents)
                .context("Invalid assigned_agents JSON")?,
            progress: self.progress,
            eta: self.eta,
            repo_url: self.repo_url,
            branch: self.branch,
            external_task_id: self.external_task_id,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Invalid result JSON")?,
            error: self.error,
            depends_on: serde_json::from_str(&self.depends_on).context("Invalid depends_on JSON")?,
            queued_at: self.queued_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

struct MessageRow {
    id: String,
    from_initiative_id: Option<String>,
    to_initiative_id: Option<String>,
    from_task_id: Option<String>,
    to_task_id: Option<String>,
    message_type: String,
    subject: String,
    body: Option<String>,
    metadata: String,
    suggested_actions: String,
    read: bool,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            from_initiative_id: row.get(1)?,
            to_initiative_id: row.get(2)?,
            from_task_id: row.get(3)?,
            to_task_id: row.get(4)?,
            message_type: row.get(5)?,
            subject: row.get(6)?,
            body: row.get(7)?,
            metadata: row.get(8)?,
            suggested_actions: row.get(9)?,
            read: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_message(self) -> Result<AgentMessage> {
        Ok(AgentMessage {
            id: self.id,
            from_initiative_id: self.from_initiative_id,
            to_initiative_id: self.to_initiative_id,
            from_task_id: self.from_task_id,
            to_task_id: self.to_task_id,
            message_type: parse_enum(&self.message_type)?,
            subject: self.subject,
            body: self.body,
            metadata: serde_json::from_str(&self.metadata).context("Invalid metadata JSON")?,
            suggested_actions: serde_json::from_str(&self.suggested_actions)
                .context("Invalid suggested_actions JSON")?,
            read: self.read,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn setup() -> Result<(FleetDb, User, Initiative)> {
        let db = FleetDb::new_in_memory()?;
        let user = db.create_user("dev@example.com", Some("Dev"))?;
        let initiative =
            db.create_initiative(&user.id, &NewInitiative::named("Platform", "platform"))?;
        Ok((db, user, initiative))
    }

    fn new_task(initiative_id: &str, status: TaskStatus, depends_on: Vec<String>) -> NewTask {
        NewTask {
            initiative_id: initiative_id.to_string(),
            repository_id: None,
            prompt: "Fix the flaky test".to_string(),
            task_type: TaskType::Code,
            priority: Priority::Medium,
            status,
            agent: AgentKind::Claude,
            model: None,
            repo_url: None,
            branch: None,
            depends_on,
        }
    }

    #[test]
    fn test_migrations_create_tables() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
             ('users', 'initiatives', 'repositories', 'initiative_repositories', 'tasks',
              'agent_messages', 'metrics_hourly', 'webhook_deliveries')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 8);
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fleet.db");
        FleetDb::new(&path)?;
        FleetDb::new(&path)?;
        Ok(())
    }

    #[test]
    fn test_user_lookup_by_token() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let user = db.create_user("a@example.com", None)?;
        assert!(user.api_token.starts_with("flt_"));
        let found = db.get_user_by_token(&user.api_token)?.unwrap();
        assert_eq!(found.id, user.id);
        assert!(db.get_user_by_token("flt_nope")?.is_none());
        assert!(db.get_user_by_email("a@example.com")?.is_some());
        Ok(())
    }

    #[test]
    fn test_github_connection_round_trip() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let user = db.create_user("a@example.com", None)?;
        assert!(!user.has_github_connection());
        let user = db.set_github_connection(&user.id, Some("ghp_abc"), Some("octocat"))?;
        assert!(user.has_github_connection());
        assert_eq!(user.github_username.as_deref(), Some("octocat"));
        let user = db.set_github_connection(&user.id, None, None)?;
        assert!(!user.has_github_connection());
        Ok(())
    }

    #[test]
    fn test_initiative_scoped_to_owner() -> Result<()> {
        let (db, user, initiative) = setup()?;
        let other = db.create_user("other@example.com", None)?;
        assert!(db.get_initiative(&user.id, &initiative.id)?.is_some());
        assert!(db.get_initiative(&other.id, &initiative.id)?.is_none());
        assert!(!db.delete_initiative(&other.id, &initiative.id)?);
        assert!(db.get_initiative(&user.id, &initiative.id)?.is_some());
        Ok(())
    }

    #[test]
    fn test_slug_unique_per_user_only() -> Result<()> {
        let (db, user, _) = setup()?;
        let other = db.create_user("other@example.com", None)?;
        assert!(db.slug_exists(&user.id, "platform")?);
        assert!(!db.slug_exists(&other.id, "platform")?);
        db.create_initiative(&other.id, &NewInitiative::named("Platform", "platform"))?;
        assert!(
            db.create_initiative(&user.id, &NewInitiative::named("Dup", "platform"))
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_default_initiative_created_once() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let user = db.create_user("a@example.com", None)?;
        let first = db.get_or_create_default_initiative(&user.id)?;
        let second = db.get_or_create_default_initiative(&user.id)?;
        assert_eq!(first.id, second.id);
        assert_eq!(first.slug, "default");
        assert_eq!(first.max_agents, 100);
        Ok(())
    }

    #[test]
    fn test_update_initiative_partial() -> Result<()> {
        let (db, user, initiative) = setup()?;
        let patch = InitiativePatch {
            status: Some(InitiativeStatus::Paused),
            max_agents: Some(5),
            allowed_agents: Some(vec![AgentKind::Codex]),
            ..Default::default()
        };
        let updated = db.update_initiative(&user.id, &initiative.id, &patch)?.unwrap();
        assert_eq!(updated.status, InitiativeStatus::Paused);
        assert_eq!(updated.max_agents, 5);
        assert_eq!(updated.allowed_agents, vec![AgentKind::Codex]);
        assert_eq!(updated.name, "Platform");
        Ok(())
    }

    #[test]
    fn test_initiative_repository_links_replace() -> Result<()> {
        let (db, user, initiative) = setup()?;
        let repo = |url: &str, name: &str| NewRepository {
            url: url.to_string(),
            provider: RepoProvider::Github,
            name: name.to_string(),
            full_name: format!("acme/{}", name),
            default_branch: "main".to_string(),
            installation_id: None,
            repo_instructions: None,
            webhooks_enabled: false,
        };
        let a = db.create_repository(&user.id, &repo("https://github.com/acme/a", "a"))?;
        let b = db.create_repository(&user.id, &repo("https://github.com/acme/b", "b"))?;
        db.set_initiative_repositories(&initiative.id, &[a.id.clone(), b.id.clone()])?;
        assert_eq!(db.list_initiative_repositories(&initiative.id)?.len(), 2);
        db.set_initiative_repositories(&initiative.id, &[b.id.clone()])?;
        let linked = db.list_initiative_repositories(&initiative.id)?;
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, b.id);

        // deleting the initiative drops its links but not the repositories
        db.delete_initiative(&user.id, &initiative.id)?;
        assert!(db.get_repository(&user.id, &b.id)?.is_some());
        Ok(())
    }

    #[test]
    fn test_repository_duplicate_url_rejected_by_store() -> Result<()> {
        let (db, user, _) = setup()?;
        let new = NewRepository {
            url: "https://github.com/acme/a".to_string(),
            provider: RepoProvider::Github,
            name: "a".to_string(),
            full_name: "acme/a".to_string(),
            default_branch: "main".to_string(),
            installation_id: None,
            repo_instructions: None,
            webhooks_enabled: false,
        };
        db.create_repository(&user.id, &new)?;
        assert!(db.find_repository_by_url(&user.id, &new.url)?.is_some());
        assert!(db.create_repository(&user.id, &new).is_err());
        Ok(())
    }

    #[test]
    fn test_create_running_task_sets_started_at() -> Result<()> {
        let (db, _, initiative) = setup()?;
        let task = db.create_task(&new_task(&initiative.id, TaskStatus::Running, vec![]), Utc::now())?;
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());
        assert_eq!(task.assigned_agents, vec!["claude"]);

        let queued = db.create_task(&new_task(&initiative.id, TaskStatus::Queued, vec![]), Utc::now())?;
        assert!(queued.started_at.is_none());
        Ok(())
    }

    #[test]
    fn test_completed_at_tracks_terminal_status() -> Result<()> {
        let (db, _, initiative) = setup()?;
        let task = db.create_task(&new_task(&initiative.id, TaskStatus::Queued, vec![]), Utc::now())?;
        let now = Utc::now();
        for status in [
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Queued,
            TaskStatus::Failed,
            TaskStatus::Running,
            TaskStatus::Cancelled,
        ] {
            db.set_task_status(&task.id, status, now)?;
            let t = db.get_task(&task.id)?.unwrap();
            assert_eq!(t.status, status);
            assert_eq!(t.completed_at.is_some(), status.is_terminal(), "{:?}", status);
        }
        Ok(())
    }

    #[test]
    fn test_started_at_set_once() -> Result<()> {
        let (db, _, initiative) = setup()?;
        let task = db.create_task(&new_task(&initiative.id, TaskStatus::Queued, vec![]), Utc::now())?;
        let first = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap();
        db.set_task_status(&task.id, TaskStatus::Running, first)?;
        db.set_task_status(&task.id, TaskStatus::Running, later)?;
        let t = db.get_task(&task.id)?.unwrap();
        assert_eq!(t.started_at, Some(timestamp(first)));
        Ok(())
    }

    #[test]
    fn test_list_tasks_filters_and_total() -> Result<()> {
        let (db, user, initiative) = setup()?;
        for status in [TaskStatus::Queued, TaskStatus::Running, TaskStatus::Running] {
            db.create_task(&new_task(&initiative.id, status, vec![]), Utc::now())?;
        }
        let filter = TaskFilter {
            statuses: vec![TaskStatus::Running],
            limit: 1,
            ..Default::default()
        };
        let (tasks, total) = db.list_tasks(&user.id, &filter)?;
        assert_eq!(total, 2);
        assert_eq!(tasks.len(), 1);

        let filter = TaskFilter {
            statuses: vec![TaskStatus::Queued, TaskStatus::Running],
            limit: 50,
            ..Default::default()
        };
        assert_eq!(db.list_tasks(&user.id, &filter)?.1, 3);

        let other = db.create_user("other@example.com", None)?;
        assert_eq!(db.list_tasks(&other.id, &filter)?.1, 0);
        Ok(())
    }

    #[test]
    fn test_task_ownership_through_initiative() -> Result<()> {
        let (db, user, initiative) = setup()?;
        let other = db.create_user("other@example.com", None)?;
        let task = db.create_task(&new_task(&initiative.id, TaskStatus::Queued, vec![]), Utc::now())?;
        assert!(db.get_task_for_user(&user.id, &task.id)?.is_some());
        assert!(db.get_task_for_user(&other.id, &task.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_queued_dependents_and_completed_count() -> Result<()> {
        let (db, _, initiative) = setup()?;
        let a = db.create_task(&new_task(&initiative.id, TaskStatus::Running, vec![]), Utc::now())?;
        let b = db.create_task(&new_task(&initiative.id, TaskStatus::Running, vec![]), Utc::now())?;
        let dependent = db.create_task(
            &new_task(&initiative.id, TaskStatus::Queued, vec![a.id.clone(), b.id.clone()]),
            Utc::now(),
        )?;
        let found = db.queued_dependents_of(&a.id)?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, dependent.id);
        assert_eq!(found[0].1, vec![a.id.clone(), b.id.clone()]);

        assert_eq!(db.count_completed(&found[0].1)?, 0);
        db.set_task_status(&a.id, TaskStatus::Completed, Utc::now())?;
        assert_eq!(db.count_completed(&found[0].1)?, 1);
        Ok(())
    }

    #[test]
    fn test_update_task_applies_status_rules() -> Result<()> {
        let (db, _, initiative) = setup()?;
        let task = db.create_task(&new_task(&initiative.id, TaskStatus::Queued, vec![]), Utc::now())?;
        let patch = TaskPatch {
            priority: Some(Priority::Critical),
            status: Some(TaskStatus::Running),
            progress: Some(140),
            ..Default::default()
        };
        let updated = db.update_task(&task.id, &patch, Utc::now())?;
        assert_eq!(updated.priority, Priority::Critical);
        assert_eq!(updated.progress, 100);
        assert!(updated.started_at.is_some());

        let patch = TaskPatch {
            status: Some(TaskStatus::Cancelled),
            ..Default::default()
        };
        let updated = db.update_task(&task.id, &patch, Utc::now())?;
        assert!(updated.completed_at.is_some());
        Ok(())
    }

    #[test]
    fn test_metrics_upsert_is_additive() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 15, 42, 7).unwrap();
        let hour = hour_bucket(at);
        assert_eq!(hour, "2025-03-04T15:00:00Z");
        db.record_metrics(
            &hour,
            &MetricsDelta {
                tasks_completed: 1,
                lines_added: 10,
                ..Default::default()
            },
        )?;
        db.record_metrics(
            &hour,
            &MetricsDelta {
                tasks_completed: 1,
                lines_added: 5,
                ..Default::default()
            },
        )?;
        let row = db.get_metrics_hour(&hour)?.unwrap();
        assert_eq!(row.tasks_completed, 2);
        assert_eq!(row.lines_added, 15);
        assert_eq!(db.list_metrics_since("2025-03-04T00:00:00Z")?.len(), 1);
        assert!(db.list_metrics_since("2025-03-05T00:00:00Z")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_record_delivery_insert_if_absent() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        assert!(db.record_delivery("bb-1", "task.completed", Utc::now())?);
        assert!(!db.record_delivery("bb-1", "task.completed", Utc::now())?);
        assert!(db.record_delivery("bb-1", "task.failed", Utc::now())?);
        Ok(())
    }

    #[test]
    fn test_messages_scoped_and_mark_read() -> Result<()> {
        let (db, user, initiative) = setup()?;
        let other = db.create_user("other@example.com", None)?;
        let msg = db.create_message(
            &NewMessage {
                from_initiative_id: Some(initiative.id.clone()),
                to_initiative_id: Some(initiative.id.clone()),
                from_task_id: None,
                to_task_id: None,
                message_type: MessageType::Alert,
                subject: "Heads up".to_string(),
                body: None,
                metadata: serde_json::json!({}),
                suggested_actions: vec![],
            },
            Utc::now(),
        )?;
        let filter = MessageFilter {
            unread_only: true,
            limit: 50,
            ..Default::default()
        };
        assert_eq!(db.list_messages(&user.id, &filter)?.len(), 1);
        assert!(db.list_messages(&other.id, &filter)?.is_empty());
        assert!(db.mark_message_read(&other.id, &msg.id)?.is_none());
        let read = db.mark_message_read(&user.id, &msg.id)?.unwrap();
        assert!(read.read);
        assert!(db.list_messages(&user.id, &filter)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_transaction_rolls_back_on_error() -> Result<()> {
        let (db, _, initiative) = setup()?;
        let task = db.create_task(&new_task(&initiative.id, TaskStatus::Queued, vec![]), Utc::now())?;
        let res: Result<()> = db.transaction(|db| {
            db.set_task_status(&task.id, TaskStatus::Running, Utc::now())?;
            anyhow::bail!("abort")
        });
        assert!(res.is_err());
        assert_eq!(db.get_task(&task.id)?.unwrap().status, TaskStatus::Queued);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call() -> Result<()> {
        let handle = DbHandle::new(FleetDb::new_in_memory()?);
        let user = handle
            .call(|db| db.create_user("async@example.com", None))
            .await?;
        let found = handle
            .call(move |db| db.get_user(&user.id))
            .await?;
        assert!(found.is_some());
        Ok(())
    }
}
