//! Outbound ports: collaborators the application calls out to.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::core::{
    domain::{ContinuationToken, PendingStep, Resumption, RunContext},
    error::Result,
};

/// A pending step removed from storage by its token.
#[derive(Debug, Clone)]
pub struct ClaimedStep {
    /// Run as stored after the claim (pending cleared).
    pub run: RunContext,
    pub pending: PendingStep,
}

/// Durable storage for run checkpoints.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Store a new run. Fails with `Error::Duplicate` if the workflow id exists.
    async fn insert(&self, run: &RunContext) -> Result<()>;
    /// Upsert a checkpoint.
    async fn save(&self, run: &RunContext) -> Result<()>;
    async fn load(&self, workflow_id: &str) -> Result<Option<RunContext>>;
    /// Most recently updated runs first.
    async fn list(&self, limit: usize) -> Result<Vec<RunContext>>;
    /// Atomically find the run pending on `token` and clear its pending step.
    /// A token can be claimed once; later claims return `None`.
    async fn claim_pending(&self, token: &ContinuationToken) -> Result<Option<ClaimedStep>>;
    /// Runs with a confirmed suspension whose deadline is before `now_ms`.
    async fn overdue(&self, now_ms: u64) -> Result<Vec<RunContext>>;
    /// Runs that are neither completed nor failed.
    async fn unfinished(&self) -> Result<Vec<RunContext>>;
}

/// Outbound calls made by the three steps.
#[async_trait]
pub trait ExpenseGateway: Send + Sync {
    async fn create_expense(&self, id: &str) -> Result<()>;
    async fn register_callback(&self, id: &str, token: &ContinuationToken) -> Result<()>;
    async fn request_payment(&self, id: &str) -> Result<()>;
}

/// Completion half of the durable execution substrate.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Resume the step suspended on `token`. A token resumes at most once.
    async fn complete_step(&self, token: &ContinuationToken, resumption: Resumption)
    -> Result<()>;
}

/// Notified about run lifecycle events the engine does not own the state for.
pub trait RunObserver: Send + Sync {
    /// An unfinished run was found in the store by `recover`, before it is
    /// re-driven or left waiting.
    fn run_restored(&self, _run: &RunContext) {}

    /// The run reached a terminal state.
    fn run_terminated(&self, _run: &RunContext) {}
}

/// Abstraction for getting the current time.
pub trait Clock: Send + Sync {
    /// Get the current UTC timestamp in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Abstraction for sending telemetry events.
pub trait TelemetrySink: Send + Sync {
    /// Record a generic event.
    fn record_event(&self, event_name: &str, properties: HashMap<String, String>);
}
