//! Application service implementation that provides the `ExpenseService` trait.
//! This is the primary use-case port implementation that driving adapters consume.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    application::{
        dispatcher::NotificationDispatcher,
        engine::Engine,
        expenses::ExpenseBook,
        registry::{ContinuationRegistry, accept_callback},
    },
    core::{
        domain::{Action, ContinuationToken, Expense, RunContext, WorkflowRun},
        error::Result,
        ports::{ActionOutcome, ExpenseService, HealthReport, NotificationStatus},
    },
};

/// Application service that implements `ExpenseService`.
pub struct ExpenseApp {
    book: Arc<ExpenseBook>,
    registry: Arc<ContinuationRegistry>,
    dispatcher: NotificationDispatcher,
    engine: Engine,
}

impl ExpenseApp {
    pub fn new(
        book: Arc<ExpenseBook>,
        registry: Arc<ContinuationRegistry>,
        dispatcher: NotificationDispatcher,
        engine: Engine,
    ) -> Self {
        Self {
            book,
            registry,
            dispatcher,
            engine,
        }
    }
}

#[async_trait]
impl ExpenseService for ExpenseApp {
    async fn start_run(&self) -> Result<WorkflowRun> {
        let expense_id = Uuid::new_v4().to_string();
        self.engine.start_run(&expense_id).await
    }

    async fn create_expense(&self, id: &str) -> Result<()> {
        self.book.create(id)
    }

    async fn list_expenses(&self) -> Result<Vec<Expense>> {
        self.book.list()
    }

    async fn get_expense(&self, id: &str) -> Result<Expense> {
        self.book.get(id)
    }

    async fn register_callback(&self, id: &str, token: ContinuationToken) -> Result<()> {
        accept_callback(&self.book, &self.registry, id, token)
    }

    async fn apply_action(&self, id: &str, action: Action) -> Result<ActionOutcome> {
        let transition = self.book.apply_action(id, action)?;
        info!(
            expense_id = id,
            "Set state for {id} from {} to {}",
            transition.previous,
            transition.current
        );
        if !transition.is_decision() {
            return Ok(ActionOutcome {
                transition,
                notification: NotificationStatus::NotRequired,
            });
        }
        let notification = match self.dispatcher.notify(id, transition.current).await {
            Ok(()) => NotificationStatus::Delivered,
            Err(err) => {
                warn!(expense_id = id, error = %err, "Decision was not delivered");
                NotificationStatus::Failed(err)
            }
        };
        Ok(ActionOutcome {
            transition,
            notification,
        })
    }

    async fn get_run(&self, workflow_id: &str) -> Result<Option<RunContext>> {
        self.engine.load(workflow_id).await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunContext>> {
        self.engine.list(limit).await
    }

    fn health(&self) -> HealthReport {
        HealthReport {
            status: "available".into(),
            task_queue: self.engine.task_queue().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
