//! Inbound ports (use-case ports) define the application service interface that
//! driving adapters (HTTP server, CLI) consume.

use async_trait::async_trait;
use serde::Serialize;

use crate::core::{
    domain::{Action, ContinuationToken, Expense, RunContext, Transition, WorkflowRun},
    error::{Error, Result},
};

/// What happened to the notification an action may trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationStatus {
    /// The transition was not a decision; nobody is woken.
    NotRequired,
    Delivered,
    Failed(Error),
}

/// Response from applying an action to an expense.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub transition: Transition,
    pub notification: NotificationStatus,
}

/// Liveness report for the healthcheck route.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub task_queue: String,
    pub version: String,
}

/// The primary application service trait that driving adapters consume.
#[async_trait]
pub trait ExpenseService: Send + Sync {
    /// Start a new expense workflow under a freshly generated expense id.
    async fn start_run(&self) -> Result<WorkflowRun>;

    async fn create_expense(&self, id: &str) -> Result<()>;

    /// All expenses, ordered by id.
    async fn list_expenses(&self) -> Result<Vec<Expense>>;

    async fn get_expense(&self, id: &str) -> Result<Expense>;

    /// Accept a continuation token for an expense still awaiting its decision.
    async fn register_callback(&self, id: &str, token: ContinuationToken) -> Result<()>;

    /// Apply an action and notify the suspended run when it is a decision.
    async fn apply_action(&self, id: &str, action: Action) -> Result<ActionOutcome>;

    async fn get_run(&self, workflow_id: &str) -> Result<Option<RunContext>>;

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunContext>>;

    fn health(&self) -> HealthReport;
}
