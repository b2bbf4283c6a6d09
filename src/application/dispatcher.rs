use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    application::registry::ContinuationRegistry,
    core::{
        domain::{ExpenseState, Resumption},
        error::{Error, Result},
        ports::WorkflowClient,
    },
};

/// Wakes the run suspended on an expense's decision.
pub struct NotificationDispatcher {
    registry: Arc<ContinuationRegistry>,
    client: Arc<dyn WorkflowClient>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<ContinuationRegistry>, client: Arc<dyn WorkflowClient>) -> Self {
        Self { registry, client }
    }

    /// The token is consumed before delivery and stays consumed if delivery
    /// fails; a lost decision has to be re-submitted.
    pub async fn notify(&self, id: &str, state: ExpenseState) -> Result<()> {
        let token = match self.registry.resolve(id) {
            Ok(token) => token,
            Err(Error::NotFound(_)) => {
                warn!(
                    expense_id = id,
                    state = state.as_str(),
                    "Invalid id, no live registration for expense"
                );
                return Err(Error::UnknownExpense(id.to_string()));
            }
            Err(err) => return Err(err),
        };

        match self
            .client
            .complete_step(&token, Resumption::Value(state.as_str().to_string()))
            .await
        {
            Ok(()) => {
                info!(expense_id = id, state = state.as_str(), "Delivered decision");
                Ok(())
            }
            Err(err) => {
                warn!(expense_id = id, error = %err, "Failed to complete step");
                Err(err)
            }
        }
    }
}
