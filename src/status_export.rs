use serde::{Deserialize, Serialize};

use crate::core::domain::{PendingStep, RunContext, RunOutcome};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunListExport {
    pub runs: Vec<RunSummaryExport>,
}

impl RunListExport {
    pub fn from_runs(runs: &[RunContext]) -> Self {
        Self {
            runs: runs.iter().map(RunSummaryExport::from).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunSummaryExport {
    pub workflow_id: String,
    pub run_id: String,
    pub expense_id: String,
    pub status: String,
    pub stage: String,
    pub result: Option<String>,
    pub updated_at_ms: u64,
}

impl From<&RunContext> for RunSummaryExport {
    fn from(run: &RunContext) -> Self {
        Self {
            workflow_id: run.run.workflow_id.clone(),
            run_id: run.run.run_id.clone(),
            expense_id: run.expense_id.clone(),
            status: run.status.as_str().to_string(),
            stage: run.stage.as_str().to_string(),
            result: run.outcome.as_ref().map(RunOutcome::summary),
            updated_at_ms: run.updated_at_ms,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunDetailExport {
    #[serde(flatten)]
    pub summary: RunSummaryExport,
    pub task_queue: String,
    pub decision: Option<String>,
    pub waiting_on: Option<String>,
    pub deadline_ms: Option<u64>,
    pub attempts: u32,
    pub started_at_ms: u64,
    pub outcome: Option<RunOutcome>,
}

impl RunDetailExport {
    pub fn from_run(run: &RunContext) -> Self {
        let pending: Option<&PendingStep> = run.pending.as_ref();
        Self {
            summary: RunSummaryExport::from(run),
            task_queue: run.task_queue.clone(),
            decision: run.decision.clone(),
            waiting_on: pending.map(|p| p.step.name().to_string()),
            deadline_ms: pending.map(|p| p.deadline_ms),
            attempts: run.attempts,
            started_at_ms: run.started_at_ms,
            outcome: run.outcome.clone(),
        }
    }
}
