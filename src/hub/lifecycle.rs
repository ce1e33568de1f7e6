//! Task lifecycle controller.
//!
//! Translates execution-provider events into task state and cascades the
//! side effects: the completion message, hourly metrics and the promotion
//! of dependent tasks. Every event is applied inside one store transaction.
//!
//! | Event            | Status      | Side effects                                 |
//! |------------------|-------------|----------------------------------------------|
//! | `task.started`   | `running`   | `started_at` if unset                        |
//! | `task.progress`  | unchanged   | `progress`, `eta`                            |
//! | `task.completed` | `completed` | result, STATUS message, metrics, dependents  |
//! | `task.failed`    | `failed`    | result + error, metrics                      |
//! | `task.cancelled` | `cancelled` | none                                         |

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::db::{FleetDb, hour_bucket};
use super::gateway::{ProviderStatus, ProviderTask};
use super::models::*;

const SUBJECT_SUMMARY_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
    Unknown(String),
}

impl TaskEvent {
    pub fn parse(name: &str) -> Self {
        match name {
            "task.started" => Self::Started,
            "task.progress" => Self::Progress,
            "task.completed" => Self::Completed,
            "task.failed" => Self::Failed,
            "task.cancelled" => Self::Cancelled,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Started => "task.started",
            Self::Progress => "task.progress",
            Self::Completed => "task.completed",
            Self::Failed => "task.failed",
            Self::Cancelled => "task.cancelled",
            Self::Unknown(name) => name,
        }
    }

    /// Progress updates legitimately repeat and are never deduplicated.
    fn is_deduplicated(&self) -> bool {
        matches!(
            self,
            Self::Started | Self::Completed | Self::Failed | Self::Cancelled
        )
    }
}

/// The provider's task object as carried in webhook bodies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTaskPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_progress")]
    pub progress: Option<i64>,
    #[serde(default)]
    pub eta: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub diff_stats: Option<DiffStats>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleOptions {
    /// Claim `(external id, event)` before applying effects, skipping replays.
    pub deduplicate: bool,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self { deduplicate: true }
    }
}

#[derive(Debug)]
pub struct AppliedEvent {
    pub task: Task,
    pub message: Option<AgentMessage>,
    pub promoted: Vec<String>,
}

#[derive(Debug)]
pub enum EventOutcome {
    /// No task carries this external id.
    TaskNotFound,
    /// Event name not recognised; nothing changed.
    Ignored { task_id: String },
    /// Already applied once for this external id.
    Duplicate { task_id: String },
    Applied(AppliedEvent),
}

/// Apply one provider event to the task whose external id is `external_id`.
pub fn apply_event(
    db: &FleetDb,
    external_id: &str,
    event: &TaskEvent,
    payload: &ProviderTaskPayload,
    options: LifecycleOptions,
    now: DateTime<Utc>,
) -> Result<EventOutcome> {
    db.transaction(|db| {
        let Some(task) = db.get_task_by_external_id(external_id)? else {
            return Ok(EventOutcome::TaskNotFound);
        };

        if let TaskEvent::Unknown(name) = event {
            tracing::warn!(event = %name, task_id = %task.id, "ignoring unknown provider event");
            return Ok(EventOutcome::Ignored { task_id: task.id });
        }

        if options.deduplicate
            && event.is_deduplicated()
            && !db.record_delivery(external_id, event.as_str(), now)?
        {
            tracing::info!(event = event.as_str(), task_id = %task.id, "duplicate provider event skipped");
            return Ok(EventOutcome::Duplicate { task_id: task.id });
        }

        let mut message = None;
        let mut promoted = Vec::new();
        match event {
            TaskEvent::Started => {
                db.set_task_status(&task.id, TaskStatus::Running, now)?;
            }
            TaskEvent::Progress => {
                db.set_task_progress(
                    &task.id,
                    payload.progress.unwrap_or(0),
                    payload.eta.as_deref(),
                    now,
                )?;
            }
            TaskEvent::Completed => {
                let result = TaskResult {
                    success: true,
                    pr_url: payload.pr_url.clone(),
                    branch_name: payload.branch_name.clone(),
                    diff_stats: payload.diff_stats,
                    summary: payload.summary.clone(),
                    error: None,
                };
                db.set_task_status(&task.id, TaskStatus::Completed, now)?;
                db.set_task_result(&task.id, &result, now)?;
                message = Some(db.create_message(&completion_message(&task, &result), now)?);
                db.record_metrics(&hour_bucket(now), &completion_metrics(&result))?;
                promoted = trigger_dependents(db, &task.id, now)?;
            }
            TaskEvent::Failed => {
                let error = payload
                    .error
                    .clone()
                    .unwrap_or_else(|| "Task failed".to_string());
                let result = TaskResult {
                    success: false,
                    error: Some(error),
                    ..Default::default()
                };
                db.set_task_status(&task.id, TaskStatus::Failed, now)?;
                db.set_task_result(&task.id, &result, now)?;
                db.record_metrics(
                    &hour_bucket(now),
                    &MetricsDelta {
                        tasks_failed: 1,
                        ..Default::default()
                    },
                )?;
            }
            TaskEvent::Cancelled => {
                db.set_task_status(&task.id, TaskStatus::Cancelled, now)?;
            }
            TaskEvent::Unknown(_) => {}
        }

        tracing::info!(
            event = event.as_str(),
            task_id = %task.id,
            external_id,
            promoted = promoted.len(),
            "provider event applied"
        );
        let task = db
            .get_task(&task.id)?
            .ok_or_else(|| crate::errors::FleetError::TaskNotFound { id: task.id.clone() })?;
        Ok(EventOutcome::Applied(AppliedEvent {
            task,
            message,
            promoted,
        }))
    })
}

/// Promote queued dependents of `completed_id` whose dependencies are all
/// completed. The AND-gate is recomputed from the store on every call; a
/// dependent with a failed or cancelled dependency stays queued.
pub fn trigger_dependents(
    db: &FleetDb,
    completed_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let mut promoted = Vec::new();
    for (id, depends_on) in db.queued_dependents_of(completed_id)? {
        let completed = db.count_completed(&depends_on)?;
        if completed == depends_on.len() as i64 {
            db.set_task_status(&id, TaskStatus::Assigned, now)?;
            tracing::info!(task_id = %id, trigger = completed_id, "dependencies satisfied, task assigned");
            promoted.push(id);
        }
    }
    Ok(promoted)
}

/// Reconcile a task with a provider snapshot fetched on demand.
///
/// Terminal snapshots go through [`apply_event`] so they share effects and
/// dedup keys with webhook deliveries. Pending and running snapshots are
/// written directly, so a task can move back and forth between them.
pub fn sync_snapshot(
    db: &FleetDb,
    task: &Task,
    snapshot: &ProviderTask,
    options: LifecycleOptions,
    now: DateTime<Utc>,
) -> Result<Task> {
    let external_id = task.external_task_id.as_deref().unwrap_or(&snapshot.id);
    match snapshot.status {
        // Non-terminal snapshots mirror the provider's current state and
        // bypass the delivery ledger, which only guards one-shot effects.
        ProviderStatus::Pending | ProviderStatus::Running => {
            let status = if snapshot.status == ProviderStatus::Pending {
                TaskStatus::Assigned
            } else {
                TaskStatus::Running
            };
            db.transaction(|db| {
                db.set_task_status(&task.id, status, now)?;
                db.set_task_progress(&task.id, snapshot.progress.unwrap_or(0), None, now)
            })?;
        }
        ProviderStatus::Completed | ProviderStatus::Failed | ProviderStatus::Cancelled => {
            let (event, payload) = event_from_snapshot(snapshot);
            apply_event(db, external_id, &event, &payload, options, now)?;
        }
    }
    db.get_task(&task.id)?
        .ok_or_else(|| crate::errors::FleetError::TaskNotFound { id: task.id.clone() }.into())
}

/// The webhook event equivalent to a terminal provider snapshot.
fn event_from_snapshot(snapshot: &ProviderTask) -> (TaskEvent, ProviderTaskPayload) {
    let event = match snapshot.status {
        ProviderStatus::Completed => TaskEvent::Completed,
        ProviderStatus::Failed => TaskEvent::Failed,
        ProviderStatus::Cancelled => TaskEvent::Cancelled,
        ProviderStatus::Pending => TaskEvent::Progress,
        ProviderStatus::Running => TaskEvent::Started,
    };
    let payload = ProviderTaskPayload {
        id: Some(snapshot.id.clone()),
        status: None,
        progress: snapshot.progress,
        eta: None,
        pr_url: snapshot.pr_url.clone(),
        branch_name: snapshot.branch_name.clone(),
        diff_stats: snapshot.diff_stats,
        summary: snapshot.summary().map(str::to_string),
        error: snapshot.error.clone(),
    };
    (event, payload)
}

fn completion_metrics(result: &TaskResult) -> MetricsDelta {
    let diff = result.diff_stats.unwrap_or_default();
    MetricsDelta {
        tasks_completed: 1,
        prs_created: i64::from(result.pr_url.is_some()),
        lines_added: diff.added,
        lines_removed: diff.removed,
        files_changed: diff.files_changed,
        ..Default::default()
    }
}

/// STATUS message announcing a completed task to its own initiative.
pub fn completion_message(task: &Task, result: &TaskResult) -> NewMessage {
    let headline = result
        .summary
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| s.chars().take(SUBJECT_SUMMARY_CHARS).collect::<String>())
        .unwrap_or_else(|| "Task finished".to_string());
    let diff_text = result
        .diff_stats
        .map(|d| format!("+{}/-{} lines", d.added, d.removed))
        .unwrap_or_default();
    let body = match &result.pr_url {
        Some(url) => format!("PR created: {}. {}", url, diff_text),
        None => format!("Task completed successfully. {}", diff_text),
    };
    let suggested_actions = result
        .pr_url
        .as_ref()
        .map(|url| {
            vec![
                SuggestedAction {
                    label: "View PR".to_string(),
                    action: "open_url".to_string(),
                    params: serde_json::json!({ "url": url }),
                },
                SuggestedAction {
                    label: "Merge PR".to_string(),
                    action: "merge_pr".to_string(),
                    params: serde_json::json!({ "url": url }),
                },
            ]
        })
        .unwrap_or_default();

    NewMessage {
        from_initiative_id: Some(task.initiative_id.clone()),
        to_initiative_id: Some(task.initiative_id.clone()),
        from_task_id: Some(task.id.clone()),
        to_task_id: None,
        message_type: MessageType::Status,
        subject: format!("Task completed: {}", headline),
        body: Some(body.trim_end().to_string()),
        metadata: serde_json::json!({
            "prUrl": result.pr_url,
            "diffStats": result.diff_stats,
        }),
        suggested_actions,
    }
}
