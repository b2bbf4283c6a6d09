//! Expense approval process definition: create, wait for a decision, pay.
//!
//! `ExpenseWorkflow::advance` moves a run through exactly one stage per call so
//! the engine can checkpoint between stages and resume from any of them.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::core::{
    domain::{
        ContinuationToken, Resumption, RunContext, RunOutcome, RunStage, StepKind, StepOutcome,
    },
    error::{Error, Result},
};

pub const APPROVED: &str = "APPROVED";

/// Per-step timeouts. Create is short; the decision budget doubles as the
/// payment budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    pub create: Duration,
    pub decision: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(10),
            decision: Duration::from_secs(10 * 60),
        }
    }
}

/// Runs one step on behalf of the orchestrator. `Err` means the substrate
/// itself failed; step failures come back as `StepOutcome::Failed`.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute_step(
        &self,
        run: &mut RunContext,
        step: StepKind,
        timeout: Duration,
    ) -> Result<StepOutcome>;
}

/// What the engine should do after one `advance`.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Continue,
    Suspend(ContinuationToken),
    Finish(RunOutcome),
}

#[derive(Debug, Clone, Default)]
pub struct ExpenseWorkflow {
    timeouts: StepTimeouts,
}

impl ExpenseWorkflow {
    pub fn new(timeouts: StepTimeouts) -> Self {
        Self { timeouts }
    }

    pub fn timeouts(&self) -> StepTimeouts {
        self.timeouts
    }

    pub async fn advance(
        &self,
        run: &mut RunContext,
        executor: &dyn StepExecutor,
    ) -> Result<Advance> {
        match run.stage {
            RunStage::Creating => {
                let outcome = executor
                    .execute_step(run, StepKind::CreateExpense, self.timeouts.create)
                    .await?;
                match outcome {
                    StepOutcome::Completed(_) => {
                        run.stage = RunStage::AwaitingDecision;
                        Ok(Advance::Continue)
                    }
                    StepOutcome::Failed(err) => {
                        error!(
                            expense_id = %run.expense_id,
                            error = %err,
                            "Failed to create expense report"
                        );
                        Ok(Advance::Finish(RunOutcome::failed(&err)))
                    }
                    StepOutcome::Pending(_) => Ok(Advance::Finish(unexpected_pending(
                        StepKind::CreateExpense,
                    ))),
                }
            }
            RunStage::AwaitingDecision => {
                if let Some(resumption) = run.resumed.take() {
                    return Ok(self.decide(run, resumption));
                }
                let outcome = executor
                    .execute_step(run, StepKind::WaitForDecision, self.timeouts.decision)
                    .await?;
                match outcome {
                    StepOutcome::Pending(token) => Ok(Advance::Suspend(token)),
                    StepOutcome::Completed(value) => {
                        Ok(self.decide(run, Resumption::Value(value)))
                    }
                    StepOutcome::Failed(err) => {
                        error!(
                            expense_id = %run.expense_id,
                            error = %err,
                            "Failed to wait for decision"
                        );
                        Ok(Advance::Finish(RunOutcome::failed(&err)))
                    }
                }
            }
            RunStage::Paying => {
                let outcome = executor
                    .execute_step(run, StepKind::RequestPayment, self.timeouts.decision)
                    .await?;
                match outcome {
                    StepOutcome::Completed(_) => {
                        info!(expense_id = %run.expense_id, "Workflow completed with payment");
                        Ok(Advance::Finish(RunOutcome::completed(APPROVED)))
                    }
                    StepOutcome::Failed(err) => {
                        error!(
                            expense_id = %run.expense_id,
                            error = %err,
                            "Failed to request payment"
                        );
                        Ok(Advance::Finish(RunOutcome::failed(&err)))
                    }
                    StepOutcome::Pending(_) => Ok(Advance::Finish(unexpected_pending(
                        StepKind::RequestPayment,
                    ))),
                }
            }
            RunStage::Done => match &run.outcome {
                Some(outcome) => Ok(Advance::Finish(outcome.clone())),
                None => Err(Error::InvalidState(format!(
                    "run {} is done without an outcome",
                    run.run.workflow_id
                ))),
            },
        }
    }

    fn decide(&self, run: &mut RunContext, resumption: Resumption) -> Advance {
        match resumption {
            Resumption::Value(value) => {
                run.decision = Some(value.clone());
                if value == APPROVED {
                    run.stage = RunStage::Paying;
                    Advance::Continue
                } else {
                    info!(
                        expense_id = %run.expense_id,
                        decision = %value,
                        "Workflow completed without payment"
                    );
                    Advance::Finish(RunOutcome::completed(&value))
                }
            }
            Resumption::Failure(detail) => {
                warn!(
                    expense_id = %run.expense_id,
                    %detail,
                    "Decision step completed with failure"
                );
                Advance::Finish(RunOutcome::failed(&Error::Remote { reason: detail }))
            }
        }
    }
}

fn unexpected_pending(step: StepKind) -> RunOutcome {
    RunOutcome::failed(&Error::System(format!(
        "step {} cannot suspend",
        step.name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FailureKind, RunStatus, WorkflowRun};
    use std::{collections::VecDeque, sync::Mutex};

    /// Hands out canned outcomes and records which steps ran with which timeout.
    struct ScriptedExecutor {
        outcomes: Mutex<VecDeque<StepOutcome>>,
        calls: Mutex<Vec<(StepKind, Duration)>>,
    }

    impl ScriptedExecutor {
        fn new(outcomes: Vec<StepOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(StepKind, Duration)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        async fn execute_step(
            &self,
            _run: &mut RunContext,
            step: StepKind,
            timeout: Duration,
        ) -> Result<StepOutcome> {
            self.calls.lock().unwrap().push((step, timeout));
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::System("script exhausted".into()))
        }
    }

    fn new_run() -> RunContext {
        RunContext::new(
            WorkflowRun {
                workflow_id: "expense_e1".into(),
                run_id: "r1".into(),
            },
            "e1",
            "expense",
            0,
        )
    }

    fn workflow() -> ExpenseWorkflow {
        ExpenseWorkflow::new(StepTimeouts {
            create: Duration::from_secs(1),
            decision: Duration::from_secs(30),
        })
    }

    #[tokio::test]
    async fn create_then_suspend_on_decision() {
        let executor = ScriptedExecutor::new(vec![
            StepOutcome::Completed("e1".into()),
            StepOutcome::Pending(ContinuationToken::from("t1")),
        ]);
        let wf = workflow();
        let mut run = new_run();

        assert_eq!(wf.advance(&mut run, &executor).await.unwrap(), Advance::Continue);
        assert_eq!(run.stage, RunStage::AwaitingDecision);
        assert_eq!(
            wf.advance(&mut run, &executor).await.unwrap(),
            Advance::Suspend(ContinuationToken::from("t1"))
        );
        assert_eq!(
            executor.calls(),
            vec![
                (StepKind::CreateExpense, Duration::from_secs(1)),
                (StepKind::WaitForDecision, Duration::from_secs(30)),
            ]
        );
    }

    #[tokio::test]
    async fn rejected_decision_finishes_without_payment() {
        let executor = ScriptedExecutor::new(vec![]);
        let mut run = new_run();
        run.stage = RunStage::AwaitingDecision;
        run.resumed = Some(Resumption::Value("REJECTED".into()));

        let advance = workflow().advance(&mut run, &executor).await.unwrap();
        assert_eq!(advance, Advance::Finish(RunOutcome::completed("REJECTED")));
        assert!(executor.calls().is_empty());
        assert_eq!(run.decision.as_deref(), Some("REJECTED"));
        assert!(run.resumed.is_none());
    }

    #[tokio::test]
    async fn approval_pays_with_decision_timeout() {
        let executor = ScriptedExecutor::new(vec![StepOutcome::Completed("e1".into())]);
        let wf = workflow();
        let mut run = new_run();
        run.stage = RunStage::AwaitingDecision;
        run.resumed = Some(Resumption::Value("APPROVED".into()));

        assert_eq!(wf.advance(&mut run, &executor).await.unwrap(), Advance::Continue);
        assert_eq!(run.stage, RunStage::Paying);
        let advance = wf.advance(&mut run, &executor).await.unwrap();
        assert_eq!(
            advance,
            Advance::Finish(RunOutcome::Completed {
                result: "COMPLETED(APPROVED)".into()
            })
        );
        assert_eq!(
            executor.calls(),
            vec![(StepKind::RequestPayment, Duration::from_secs(30))]
        );
    }

    #[tokio::test]
    async fn create_failure_stops_the_run() {
        let executor = ScriptedExecutor::new(vec![StepOutcome::Failed(Error::Duplicate(
            "e1".into(),
        ))]);
        let mut run = new_run();
        let advance = workflow().advance(&mut run, &executor).await.unwrap();
        assert_eq!(
            advance,
            Advance::Finish(RunOutcome::Failed {
                kind: FailureKind::Duplicate,
                detail: "Duplicate id: e1".into()
            })
        );
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn declined_payment_fails_with_reason() {
        let executor = ScriptedExecutor::new(vec![StepOutcome::Failed(Error::Remote {
            reason: "DECLINED".into(),
        })]);
        let mut run = new_run();
        run.stage = RunStage::Paying;
        let advance = workflow().advance(&mut run, &executor).await.unwrap();
        assert_eq!(
            advance,
            Advance::Finish(RunOutcome::Failed {
                kind: FailureKind::Remote,
                detail: "DECLINED".into()
            })
        );
    }

    #[tokio::test]
    async fn done_stage_replays_recorded_outcome() {
        let executor = ScriptedExecutor::new(vec![]);
        let mut run = new_run();
        run.finish(RunOutcome::completed("REJECTED"), 1);
        assert_eq!(run.status, RunStatus::Completed);
        let advance = workflow().advance(&mut run, &executor).await.unwrap();
        assert_eq!(advance, Advance::Finish(RunOutcome::completed("REJECTED")));
    }
}
