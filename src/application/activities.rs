//! The three units of work a run executes. Each is safe to re-run: the engine
//! retries transient failures and replays steps after a restart.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tracing::{error, info};

use crate::core::{
    domain::{ContinuationToken, StepKind, StepOutcome, WorkflowRun},
    error::{Error, Result},
    ports::ExpenseGateway,
};

/// Inputs handed to an activity for one execution attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub run: WorkflowRun,
    pub expense_id: String,
    pub attempt: u32,
    /// Present for suspending steps only.
    pub task_token: Option<ContinuationToken>,
}

#[async_trait]
pub trait Activity: Send + Sync {
    fn kind(&self) -> StepKind;
    async fn execute(&self, ctx: &ActivityContext) -> StepOutcome;
}

fn require_id(ctx: &ActivityContext) -> Result<()> {
    if ctx.expense_id.is_empty() {
        Err(Error::InvalidInput("expense id is empty".into()))
    } else {
        Ok(())
    }
}

pub struct CreateExpenseStep {
    gateway: Arc<dyn ExpenseGateway>,
}

impl CreateExpenseStep {
    pub fn new(gateway: Arc<dyn ExpenseGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Activity for CreateExpenseStep {
    fn kind(&self) -> StepKind {
        StepKind::CreateExpense
    }

    async fn execute(&self, ctx: &ActivityContext) -> StepOutcome {
        if let Err(err) = require_id(ctx) {
            return StepOutcome::Failed(err);
        }
        match self.gateway.create_expense(&ctx.expense_id).await {
            Ok(()) => {
                info!(expense_id = %ctx.expense_id, "Expense created");
                StepOutcome::Completed(ctx.expense_id.clone())
            }
            Err(err) => StepOutcome::Failed(err),
        }
    }
}

/// Phase A registers the issued token and reports pending. Phase B happens
/// when the engine receives a completion for that token.
pub struct WaitForDecisionStep {
    gateway: Arc<dyn ExpenseGateway>,
}

impl WaitForDecisionStep {
    pub fn new(gateway: Arc<dyn ExpenseGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Activity for WaitForDecisionStep {
    fn kind(&self) -> StepKind {
        StepKind::WaitForDecision
    }

    async fn execute(&self, ctx: &ActivityContext) -> StepOutcome {
        if let Err(err) = require_id(ctx) {
            return StepOutcome::Failed(err);
        }
        let Some(token) = ctx.task_token.clone() else {
            return StepOutcome::Failed(Error::System(
                "wait step executed without a continuation token".into(),
            ));
        };
        match self.gateway.register_callback(&ctx.expense_id, &token).await {
            Ok(()) => {
                info!(
                    expense_id = %ctx.expense_id,
                    attempt = ctx.attempt,
                    "Waiting for decision"
                );
                StepOutcome::Pending(token)
            }
            Err(err) => StepOutcome::Failed(err),
        }
    }
}

pub struct PaymentStep {
    gateway: Arc<dyn ExpenseGateway>,
}

impl PaymentStep {
    pub fn new(gateway: Arc<dyn ExpenseGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Activity for PaymentStep {
    fn kind(&self) -> StepKind {
        StepKind::RequestPayment
    }

    async fn execute(&self, ctx: &ActivityContext) -> StepOutcome {
        if let Err(err) = require_id(ctx) {
            return StepOutcome::Failed(err);
        }
        match self.gateway.request_payment(&ctx.expense_id).await {
            Ok(()) => {
                info!(expense_id = %ctx.expense_id, "Payment requested");
                StepOutcome::Completed(ctx.expense_id.clone())
            }
            Err(err) => {
                error!(expense_id = %ctx.expense_id, error = %err, "Payment request rejected");
                StepOutcome::Failed(err)
            }
        }
    }
}

/// Activity implementations keyed by step.
#[derive(Clone, Default)]
pub struct ActivitySet {
    steps: HashMap<StepKind, Arc<dyn Activity>>,
}

impl ActivitySet {
    pub fn from_gateway(gateway: Arc<dyn ExpenseGateway>) -> Self {
        Self::default()
            .with(Arc::new(CreateExpenseStep::new(gateway.clone())))
            .with(Arc::new(WaitForDecisionStep::new(gateway.clone())))
            .with(Arc::new(PaymentStep::new(gateway)))
    }

    /// Replace the implementation for the activity's step.
    pub fn with(mut self, activity: Arc<dyn Activity>) -> Self {
        self.steps.insert(activity.kind(), activity);
        self
    }

    pub fn get(&self, kind: StepKind) -> Result<Arc<dyn Activity>> {
        self.steps
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no activity registered for {}", kind.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedGateway {
        registrations: Mutex<Vec<(String, ContinuationToken)>>,
        register_error: Option<Error>,
        payment_error: Option<Error>,
    }

    #[async_trait]
    impl ExpenseGateway for ScriptedGateway {
        async fn create_expense(&self, id: &str) -> Result<()> {
            if id == "dup" {
                Err(Error::Duplicate(id.into()))
            } else {
                Ok(())
            }
        }

        async fn register_callback(&self, id: &str, token: &ContinuationToken) -> Result<()> {
            if let Some(err) = &self.register_error {
                return Err(err.clone());
            }
            self.registrations
                .lock()
                .unwrap()
                .push((id.to_string(), token.clone()));
            Ok(())
        }

        async fn request_payment(&self, _id: &str) -> Result<()> {
            match &self.payment_error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn ctx(id: &str, token: Option<&str>) -> ActivityContext {
        ActivityContext {
            run: WorkflowRun {
                workflow_id: format!("expense_{id}"),
                run_id: "run".into(),
            },
            expense_id: id.to_string(),
            attempt: 1,
            task_token: token.map(ContinuationToken::from),
        }
    }

    #[tokio::test]
    async fn every_step_rejects_empty_id() {
        let gateway: Arc<dyn ExpenseGateway> = Arc::new(ScriptedGateway::default());
        let set = ActivitySet::from_gateway(gateway);
        for kind in [
            StepKind::CreateExpense,
            StepKind::WaitForDecision,
            StepKind::RequestPayment,
        ] {
            let outcome = set.get(kind).unwrap().execute(&ctx("", Some("t"))).await;
            assert!(
                matches!(outcome, StepOutcome::Failed(Error::InvalidInput(_))),
                "{} accepted empty id",
                kind.name()
            );
        }
    }

    #[tokio::test]
    async fn create_surfaces_duplicate() {
        let step = CreateExpenseStep::new(Arc::new(ScriptedGateway::default()));
        let outcome = step.execute(&ctx("dup", None)).await;
        assert_eq!(outcome, StepOutcome::Failed(Error::Duplicate("dup".into())));
    }

    #[tokio::test]
    async fn wait_registers_token_then_reports_pending() {
        let gateway = Arc::new(ScriptedGateway::default());
        let step = WaitForDecisionStep::new(gateway.clone());
        let outcome = step.execute(&ctx("e1", Some("tok-1"))).await;
        assert_eq!(outcome, StepOutcome::Pending(ContinuationToken::from("tok-1")));
        assert_eq!(
            gateway.registrations.lock().unwrap().clone(),
            vec![("e1".to_string(), ContinuationToken::from("tok-1"))]
        );
    }

    #[tokio::test]
    async fn failed_registration_is_step_failure() {
        let gateway = Arc::new(ScriptedGateway {
            register_error: Some(Error::InvalidState("INVALID_STATE".into())),
            ..Default::default()
        });
        let step = WaitForDecisionStep::new(gateway);
        let outcome = step.execute(&ctx("e1", Some("tok-1"))).await;
        assert!(matches!(outcome, StepOutcome::Failed(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn payment_carries_remote_reason() {
        let gateway = Arc::new(ScriptedGateway {
            payment_error: Some(Error::Remote {
                reason: "DECLINED".into(),
            }),
            ..Default::default()
        });
        let outcome = PaymentStep::new(gateway).execute(&ctx("e1", None)).await;
        match outcome {
            StepOutcome::Failed(err) => assert_eq!(err.detail(), "DECLINED"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
