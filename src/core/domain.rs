//! Domain types shared by the expense state machine, the continuation
//! registry and the durable run engine.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::core::error::{Error, FailureKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpenseState {
    Created,
    Approved,
    Rejected,
    Completed,
}

impl ExpenseState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpenseState::Created => "CREATED",
            ExpenseState::Approved => "APPROVED",
            ExpenseState::Rejected => "REJECTED",
            ExpenseState::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for ExpenseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpenseState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATED" => Ok(ExpenseState::Created),
            "APPROVED" => Ok(ExpenseState::Approved),
            "REJECTED" => Ok(ExpenseState::Rejected),
            "COMPLETED" => Ok(ExpenseState::Completed),
            other => Err(Error::InvalidInput(format!("unknown expense state '{other}'"))),
        }
    }
}

/// External actions accepted by the action endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
    Payment,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Payment => "payment",
        }
    }

    /// State an expense lands in once the action is applied.
    pub fn target(self) -> ExpenseState {
        match self {
            Action::Approve => ExpenseState::Approved,
            Action::Reject => ExpenseState::Rejected,
            Action::Payment => ExpenseState::Completed,
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "approve" => Ok(Action::Approve),
            "reject" => Ok(Action::Reject),
            "payment" => Ok(Action::Payment),
            other => Err(Error::InvalidInput(format!("unknown action '{other}'"))),
        }
    }
}

/// Previous and new state returned by an applied action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub previous: ExpenseState,
    pub current: ExpenseState,
}

impl Transition {
    /// True for the first move out of `CREATED` into a decided state. Only these
    /// transitions wake a suspended run.
    pub fn is_decision(&self) -> bool {
        self.previous == ExpenseState::Created
            && matches!(
                self.current,
                ExpenseState::Approved | ExpenseState::Rejected
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expense {
    pub id: String,
    pub state: ExpenseState,
}

/// Handle returned to the caller when a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub run_id: String,
}

/// Opaque handle identifying one suspended step instance.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContinuationToken(Vec<u8>);

impl ContinuationToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Mints a fresh token for one execution attempt of a run's step.
    pub fn issue(run: &WorkflowRun, attempt: u32) -> Self {
        let raw = format!(
            "{}/{}/{attempt}/{}",
            run.workflow_id,
            run.run_id,
            Uuid::new_v4().simple()
        );
        Self(raw.into_bytes())
    }

    /// Workflow id of a token minted by `issue`. Run ids and attempts hold
    /// no '/', so the id is whatever precedes the last three segments.
    pub fn workflow_id(&self) -> Option<&str> {
        let raw = std::str::from_utf8(&self.0).ok()?;
        let mut parts = raw.rsplitn(4, '/');
        let _nonce = parts.next()?;
        let _attempt = parts.next()?;
        let _run_id = parts.next()?;
        parts.next().filter(|id| !id.is_empty())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContinuationToken({self})")
    }
}

impl From<&str> for ContinuationToken {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for ContinuationToken {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl Serialize for ContinuationToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContinuationToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(ContinuationToken::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    CreateExpense,
    WaitForDecision,
    RequestPayment,
}

impl StepKind {
    pub fn name(self) -> &'static str {
        match self {
            StepKind::CreateExpense => "create_expense",
            StepKind::WaitForDecision => "wait_for_decision",
            StepKind::RequestPayment => "request_payment",
        }
    }

    /// Steps that may hand back a continuation token instead of a value.
    pub fn suspends(self) -> bool {
        matches!(self, StepKind::WaitForDecision)
    }
}

/// Result of executing one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(String),
    Pending(ContinuationToken),
    Failed(Error),
}

/// Value delivered to a pending step through `complete_step`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Resumption {
    Value(String),
    Failure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Creating,
    AwaitingDecision,
    Paying,
    Done,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStage::Creating => "creating",
            RunStage::AwaitingDecision => "awaiting_decision",
            RunStage::Paying => "paying",
            RunStage::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Persisted record of the step a run is suspended on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingStep {
    pub step: StepKind,
    pub token: ContinuationToken,
    pub deadline_ms: u64,
    /// Set once the step's synchronous phase returned pending and the driver let go.
    #[serde(default)]
    pub confirmed: bool,
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { result: String },
    Failed { kind: FailureKind, detail: String },
}

impl RunOutcome {
    pub fn completed(value: &str) -> Self {
        RunOutcome::Completed {
            result: format!("COMPLETED({value})"),
        }
    }

    pub fn failed(err: &Error) -> Self {
        RunOutcome::Failed {
            kind: err.kind(),
            detail: err.detail(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    /// Human-readable one-liner for status listings.
    pub fn summary(&self) -> String {
        match self {
            RunOutcome::Completed { result } => result.clone(),
            RunOutcome::Failed { kind, detail } => format!("FAILED[{}]: {detail}", kind.as_str()),
        }
    }
}

/// Everything the engine checkpoints about one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run: WorkflowRun,
    pub expense_id: String,
    pub task_queue: String,
    pub stage: RunStage,
    pub status: RunStatus,
    #[serde(default)]
    pub pending: Option<PendingStep>,
    #[serde(default)]
    pub resumed: Option<Resumption>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
    #[serde(default)]
    pub attempts: u32,
    pub started_at_ms: u64,
    pub updated_at_ms: u64,
}

impl RunContext {
    pub fn new(run: WorkflowRun, expense_id: &str, task_queue: &str, now_ms: u64) -> Self {
        Self {
            run,
            expense_id: expense_id.to_string(),
            task_queue: task_queue.to_string(),
            stage: RunStage::Creating,
            status: RunStatus::Running,
            pending: None,
            resumed: None,
            decision: None,
            outcome: None,
            attempts: 0,
            started_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.run.workflow_id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn finish(&mut self, outcome: RunOutcome, now_ms: u64) {
        self.status = if outcome.is_success() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.stage = RunStage::Done;
        self.pending = None;
        self.resumed = None;
        self.outcome = Some(outcome);
        self.updated_at_ms = now_ms;
    }
}
