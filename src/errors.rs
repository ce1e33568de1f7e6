//! Typed error hierarchy for fleet.
//!
//! - `FleetError`: record store and lifecycle controller failures
//! - `GatewayError`: execution provider client failures
//! - `DagError`: rejected task dependency sets

use thiserror::Error;

/// Errors from the record store and lifecycle controller.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Initiative {id} not found")]
    InitiativeNotFound { id: String },

    #[error("Repository {id} not found")]
    RepositoryNotFound { id: String },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// Errors from the execution provider HTTP client.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Execution provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Execution provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    Timeout { task_id: String, timeout_ms: u128 },

    #[error("Execution provider API key is not configured")]
    MissingApiKey,

    #[error("Invalid provider request: {0}")]
    InvalidRequest(String),

    #[error("Unexpected response from execution provider: {0}")]
    InvalidResponse(String),
}

/// Errors from validating a task dependency graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Dependency cycle detected. Involved tasks: {tasks:?}")]
    Cycle { tasks: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_error_task_not_found_carries_id() {
        let err = FleetError::TaskNotFound { id: "t-1".into() };
        assert!(matches!(&err, FleetError::TaskNotFound { id } if id == "t-1"));
        assert_eq!(err.to_string(), "Task t-1 not found");
    }

    #[test]
    fn fleet_error_survives_anyhow_downcast() {
        let err: anyhow::Error = FleetError::BadRequest("Slug taken".into()).into();
        assert!(matches!(
            err.downcast_ref::<FleetError>(),
            Some(FleetError::BadRequest(msg)) if msg == "Slug taken"
        ));
    }

    #[test]
    fn gateway_timeout_message_names_task_and_budget() {
        let err = GatewayError::Timeout {
            task_id: "bb-7".into(),
            timeout_ms: 600000,
        };
        assert_eq!(err.to_string(), "Task bb-7 timed out after 600000ms");
    }

    #[test]
    fn gateway_api_error_carries_status() {
        let err = GatewayError::Api {
            status: 422,
            message: "Invalid repo".into(),
        };
        match &err {
            GatewayError::Api { status, message } => {
                assert_eq!(*status, 422);
                assert_eq!(message, "Invalid repo");
            }
            _ => panic!("Expected Api variant"),
        }
    }

    #[test]
    fn dag_cycle_lists_tasks() {
        let err = DagError::Cycle {
            tasks: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("\"a\""));
        assert!(err.to_string().contains("\"b\""));
    }
}
