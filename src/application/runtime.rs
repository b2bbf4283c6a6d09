use std::sync::Arc;

use crate::{
    application::{
        activities::ActivitySet,
        dispatcher::NotificationDispatcher,
        engine::{Engine, EngineOptions},
        expenses::ExpenseBook,
        registry::ContinuationRegistry,
        service::ExpenseApp,
        workflow::{ExpenseWorkflow, StepTimeouts},
    },
    core::ports::{Clock, ExpenseGateway, RunRepository, TelemetrySink, WorkflowClient},
};

/// Fully wired set of components sharing one expense book and registry.
#[derive(Clone)]
pub struct ExpenseRuntime {
    pub book: Arc<ExpenseBook>,
    pub registry: Arc<ContinuationRegistry>,
    pub engine: Engine,
    pub service: Arc<ExpenseApp>,
}

pub struct RuntimeParts {
    pub store: Arc<dyn RunRepository>,
    pub clock: Arc<dyn Clock>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub timeouts: StepTimeouts,
    pub options: EngineOptions,
}

impl ExpenseRuntime {
    /// `gateway` receives the shared book and registry so an in-process
    /// gateway can be built over them.
    pub fn assemble<G>(parts: RuntimeParts, gateway: G) -> Self
    where
        G: FnOnce(Arc<ExpenseBook>, Arc<ContinuationRegistry>) -> Arc<dyn ExpenseGateway>,
    {
        let book = Arc::new(ExpenseBook::new());
        let registry = Arc::new(ContinuationRegistry::new());
        let gateway = gateway(book.clone(), registry.clone());

        let engine = Engine::new(
            parts.store,
            ExpenseWorkflow::new(parts.timeouts),
            ActivitySet::from_gateway(gateway),
            parts.clock,
            parts.telemetry,
            parts.options,
        );
        engine.add_observer(book.clone());
        engine.add_observer(registry.clone());

        let client: Arc<dyn WorkflowClient> = Arc::new(engine.clone());
        let dispatcher = NotificationDispatcher::new(registry.clone(), client);
        let service = Arc::new(ExpenseApp::new(
            book.clone(),
            registry.clone(),
            dispatcher,
            engine.clone(),
        ));

        Self {
            book,
            registry,
            engine,
            service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::outbound::{local::LocalExpenseGateway, memory::InMemoryRunStore},
        application::testing::{ManualClock, RecordingTelemetry},
        core::{
            Action, ContinuationToken, Error, ExpenseState, FailureKind, Result, RunContext,
            RunOutcome, RunStatus, marker,
            ports::{ExpenseService, NotificationStatus},
        },
    };
    use async_trait::async_trait;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(3);

    /// Local gateway whose payment endpoint answers `ERROR:DECLINED`.
    struct DecliningPayments {
        inner: LocalExpenseGateway,
    }

    #[async_trait]
    impl ExpenseGateway for DecliningPayments {
        async fn create_expense(&self, id: &str) -> Result<()> {
            self.inner.create_expense(id).await
        }

        async fn register_callback(&self, id: &str, token: &ContinuationToken) -> Result<()> {
            self.inner.register_callback(id, token).await
        }

        async fn request_payment(&self, _id: &str) -> Result<()> {
            marker::parse("ERROR:DECLINED")
        }
    }

    struct Harness {
        rt: ExpenseRuntime,
        clock: Arc<ManualClock>,
        telemetry: Arc<RecordingTelemetry>,
    }

    fn harness_with<G>(gateway: G) -> Harness
    where
        G: FnOnce(Arc<ExpenseBook>, Arc<ContinuationRegistry>) -> Arc<dyn ExpenseGateway>,
    {
        harness_on(Arc::new(InMemoryRunStore::new()), gateway)
    }

    fn harness_on<G>(store: Arc<InMemoryRunStore>, gateway: G) -> Harness
    where
        G: FnOnce(Arc<ExpenseBook>, Arc<ContinuationRegistry>) -> Arc<dyn ExpenseGateway>,
    {
        let clock = Arc::new(ManualClock::new(10_000));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let rt = ExpenseRuntime::assemble(
            RuntimeParts {
                store,
                clock: clock.clone(),
                telemetry: telemetry.clone(),
                timeouts: StepTimeouts {
                    create: Duration::from_secs(1),
                    decision: Duration::from_secs(60),
                },
                options: EngineOptions::default(),
            },
            gateway,
        );
        Harness {
            rt,
            clock,
            telemetry,
        }
    }

    fn local_gateway(
        book: Arc<ExpenseBook>,
        registry: Arc<ContinuationRegistry>,
    ) -> Arc<dyn ExpenseGateway> {
        Arc::new(LocalExpenseGateway::new(book, registry))
    }

    fn harness() -> Harness {
        harness_with(local_gateway)
    }

    async fn start_and_park(rt: &ExpenseRuntime, id: &str) -> RunContext {
        let run = rt.engine.start_run(id).await.unwrap();
        assert_eq!(run.workflow_id, format!("expense_{id}"));
        rt.engine
            .wait_for(&run.workflow_id, WAIT, |r| r.status == RunStatus::Suspended)
            .await
            .unwrap()
    }

    async fn wait_done(rt: &ExpenseRuntime, id: &str) -> RunContext {
        rt.engine
            .wait_for(&format!("expense_{id}"), WAIT, |r| r.is_terminal())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rejected_expense_completes_without_payment() {
        let h = harness();
        let parked = start_and_park(&h.rt, "E1").await;
        assert!(h.rt.registry.contains("E1").unwrap());
        assert_eq!(h.rt.book.get("E1").unwrap().state, ExpenseState::Created);
        assert!(parked.pending.is_some());

        let outcome = h.rt.service.apply_action("E1", Action::Reject).await.unwrap();
        assert_eq!(outcome.notification, NotificationStatus::Delivered);

        let done = wait_done(&h.rt, "E1").await;
        assert_eq!(done.outcome, Some(RunOutcome::completed("REJECTED")));
        assert_eq!(h.rt.book.get("E1").unwrap().state, ExpenseState::Rejected);

        // Repeating the action is not a decision and notifies nobody.
        let again = h.rt.service.apply_action("E1", Action::Reject).await.unwrap();
        assert_eq!(again.notification, NotificationStatus::NotRequired);
        assert!(h.telemetry.names().contains(&"run_completed".to_string()));
    }

    #[tokio::test]
    async fn approved_expense_is_paid() {
        let h = harness();
        start_and_park(&h.rt, "E1").await;

        h.rt.service.apply_action("E1", Action::Approve).await.unwrap();

        let done = wait_done(&h.rt, "E1").await;
        assert_eq!(
            done.outcome,
            Some(RunOutcome::Completed {
                result: "COMPLETED(APPROVED)".into()
            })
        );
        assert_eq!(done.decision.as_deref(), Some("APPROVED"));
        assert_eq!(h.rt.book.get("E1").unwrap().state, ExpenseState::Completed);
    }

    #[tokio::test]
    async fn declined_payment_leaves_expense_approved() {
        let h = harness_with(|book, registry| {
            Arc::new(DecliningPayments {
                inner: LocalExpenseGateway::new(book, registry),
            }) as Arc<dyn ExpenseGateway>
        });
        start_and_park(&h.rt, "E1").await;

        h.rt.service.apply_action("E1", Action::Approve).await.unwrap();

        let done = wait_done(&h.rt, "E1").await;
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(
            done.outcome,
            Some(RunOutcome::Failed {
                kind: FailureKind::Remote,
                detail: "DECLINED".into()
            })
        );
        assert_eq!(h.rt.book.get("E1").unwrap().state, ExpenseState::Approved);
    }

    #[tokio::test]
    async fn missed_deadline_times_out_and_drops_registration() {
        let h = harness();
        start_and_park(&h.rt, "E1").await;

        assert_eq!(h.rt.engine.expire_overdue().await.unwrap(), 0);
        h.clock.advance(Duration::from_secs(61));
        assert_eq!(h.rt.engine.expire_overdue().await.unwrap(), 1);

        let done = h.rt.engine.load("expense_E1").await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(matches!(
            done.outcome,
            Some(RunOutcome::Failed {
                kind: FailureKind::Timeout,
                ..
            })
        ));
        assert!(!h.rt.registry.contains("E1").unwrap());

        let late = h.rt.service.apply_action("E1", Action::Approve).await.unwrap();
        assert_eq!(
            late.notification,
            NotificationStatus::Failed(Error::UnknownExpense("E1".into()))
        );
        assert!(h.telemetry.names().contains(&"run_timed_out".to_string()));
    }

    #[tokio::test]
    async fn decision_before_registration_is_dropped() {
        let h = harness();
        h.rt.service.create_expense("E7").await.unwrap();
        let outcome = h.rt.service.apply_action("E7", Action::Approve).await.unwrap();
        assert_eq!(
            outcome.notification,
            NotificationStatus::Failed(Error::UnknownExpense("E7".into()))
        );

        // Registration now finds the expense decided.
        let err = h
            .rt
            .service
            .register_callback("E7", ContinuationToken::from("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn second_run_for_same_expense_fails_creation() {
        let h = harness();
        h.rt.service.create_expense("E2").await.unwrap();
        let run = h.rt.engine.start_run("E2").await.unwrap();
        let done = h
            .rt
            .engine
            .wait_for(&run.workflow_id, WAIT, |r| r.is_terminal())
            .await
            .unwrap();
        assert!(matches!(
            done.outcome,
            Some(RunOutcome::Failed {
                kind: FailureKind::Duplicate,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn started_runs_get_fresh_expense_ids() {
        let h = harness();
        let a = h.rt.service.start_run().await.unwrap();
        let b = h.rt.service.start_run().await.unwrap();
        assert_ne!(a.workflow_id, b.workflow_id);
        assert!(a.workflow_id.starts_with("expense_"));
        assert_eq!(h.rt.service.health().task_queue, "expense");
    }

    #[tokio::test]
    async fn suspended_run_resumes_after_restart() {
        let store = Arc::new(InMemoryRunStore::new());
        let before = harness_on(store.clone(), local_gateway);
        let parked = start_and_park(&before.rt, "E1").await;
        drop(before);

        let after = harness_on(store, local_gateway);
        assert!(!after.rt.registry.contains("E1").unwrap());
        assert_eq!(after.rt.engine.recover().await.unwrap(), 0);
        assert!(after.rt.registry.contains("E1").unwrap());
        assert_eq!(after.rt.book.get("E1").unwrap().state, ExpenseState::Created);

        let outcome = after
            .rt
            .service
            .apply_action("E1", Action::Approve)
            .await
            .unwrap();
        assert_eq!(outcome.notification, NotificationStatus::Delivered);

        let done = wait_done(&after.rt, "E1").await;
        assert_eq!(done.run.run_id, parked.run.run_id);
        assert_eq!(done.outcome, Some(RunOutcome::completed("APPROVED")));
        assert_eq!(after.rt.book.get("E1").unwrap().state, ExpenseState::Completed);
    }
}
