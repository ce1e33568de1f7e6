//! Prompt templates and hand-off of persisted tasks to the execution provider.

use std::str::FromStr;

use anyhow::Result;
use chrono::Utc;

use super::db::{DbHandle, hour_bucket};
use super::gateway::{ExecutionGateway, ProviderTaskRequest};
use super::models::*;
use crate::errors::{FleetError, GatewayError};

/// Template inputs for the task types that generate their own prompt.
#[derive(Debug, Default, Clone)]
pub struct PromptOptions {
    pub prompt: Option<String>,
    pub focus: Option<String>,
    pub docs_type: Option<String>,
    pub test_type: Option<String>,
    pub target: Option<String>,
}

fn review_focus(focus: &str) -> &'static str {
    match focus {
        "security" => {
            "Focus on security vulnerabilities, auth issues, injection attacks, hardcoded secrets."
        }
        "performance" => {
            "Focus on algorithm efficiency, N+1 queries, memory leaks, caching opportunities."
        }
        "quality" => {
            "Focus on code organization, SOLID principles, DRY violations, naming conventions."
        }
        _ => "Comprehensive review covering security, performance, and code quality.",
    }
}

fn docs_scope(docs_type: &str) -> &'static str {
    match docs_type {
        "api" => {
            "Generate API documentation with all endpoints, request/response schemas, and auth details."
        }
        "full" => "Generate full documentation including README, API docs, and architecture guide.",
        "changelog" => "Generate a CHANGELOG following Keep a Changelog format.",
        _ => {
            "Generate a comprehensive README with installation, usage, configuration, and examples."
        }
    }
}

fn test_scope(test_type: &str) -> &'static str {
    match test_type {
        "integration" => "Generate integration tests for component interactions and API testing.",
        "e2e" => "Generate end-to-end tests for critical user journeys.",
        _ => "Generate unit tests with happy path, edge cases, and error handling coverage.",
    }
}

/// Final prompt for a new task. Review, docs and test tasks replace the
/// caller's prompt with a template; other types use it as given.
/// `None` when there is nothing to send.
pub fn build_prompt(task_type: TaskType, options: &PromptOptions) -> Option<String> {
    let prompt = match task_type {
        TaskType::Review => format!(
            "Code Review: {}",
            review_focus(options.focus.as_deref().unwrap_or("all"))
        ),
        TaskType::Docs => format!(
            "Documentation: {}",
            docs_scope(options.docs_type.as_deref().unwrap_or("readme"))
        ),
        TaskType::Test => {
            let mut prompt = format!(
                "Test Generation: {}",
                test_scope(options.test_type.as_deref().unwrap_or("unit"))
            );
            if let Some(target) = options.target.as_deref().filter(|t| !t.is_empty()) {
                prompt.push_str(&format!(" Target: {}", target));
            }
            prompt
        }
        _ => options.prompt.clone().unwrap_or_default(),
    };
    let prompt = prompt.trim().to_string();
    (!prompt.is_empty()).then_some(prompt)
}

/// Provider request for `task`. Two or more assigned agents launch a
/// multi-agent run.
pub fn provider_request(
    task: &Task,
    github_token: &str,
    repo_instructions: Option<String>,
) -> Result<ProviderTaskRequest, GatewayError> {
    let request = ProviderTaskRequest::new(task.prompt.clone(), task.agent, task.model.clone())
        .with_repo(task.repo_url.clone(), task.branch.clone())
        .with_repo_instructions(repo_instructions)
        .with_github_token(github_token);

    let agents: Vec<AgentKind> = task
        .assigned_agents
        .iter()
        .filter_map(|a| AgentKind::from_str(a).ok())
        .collect();
    if agents.len() > 1 {
        request.with_agents(&agents)
    } else {
        Ok(request)
    }
}

/// Send a persisted `running` task to the provider.
///
/// The provider call happens outside the store lock. A provider error is
/// not returned: the task is marked `failed` with the error captured and
/// the updated task comes back as usual.
pub async fn dispatch_task(
    db: &DbHandle,
    gateway: &dyn ExecutionGateway,
    task: Task,
    github_token: &str,
    repo_instructions: Option<String>,
) -> Result<Task> {
    let created = match provider_request(&task, github_token, repo_instructions) {
        Ok(request) => gateway.create_task(&request).await,
        Err(e) => Err(e),
    };

    let task_id = task.id.clone();
    match created {
        Ok(provider_task) => {
            tracing::info!(task_id = %task_id, external_id = %provider_task.id, "task dispatched");
            db.call(move |db| {
                db.set_external_task_id(&task_id, &provider_task.id)?;
                reload(db, &task_id)
            })
            .await
        }
        Err(e) => {
            let error = e.to_string();
            tracing::warn!(task_id = %task_id, error = %error, "provider rejected task");
            db.call(move |db| {
                let now = Utc::now();
                db.transaction(|db| {
                    db.set_task_status(&task_id, TaskStatus::Failed, now)?;
                    db.set_task_result(
                        &task_id,
                        &TaskResult {
                            success: false,
                            error: Some(error),
                            ..Default::default()
                        },
                        now,
                    )?;
                    db.record_metrics(
                        &hour_bucket(now),
                        &MetricsDelta {
                            tasks_failed: 1,
                            ..Default::default()
                        },
                    )?;
                    reload(db, &task_id)
                })
            })
            .await
        }
    }
}

fn reload(db: &super::db::FleetDb, id: &str) -> Result<Task> {
    db.get_task(id)?
        .ok_or_else(|| FleetError::TaskNotFound { id: id.to_string() }.into())
}
