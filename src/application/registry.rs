use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tracing::{debug, info, warn};

use crate::{
    application::expenses::ExpenseBook,
    core::{
        domain::{ContinuationToken, ExpenseState, RunContext, RunStatus},
        error::{Error, Result},
        ports::RunObserver,
    },
};

/// Live continuation token per expense id. Tokens are one-shot: `resolve`
/// pops them.
#[derive(Debug, Default)]
pub struct ContinuationRegistry {
    tokens: Mutex<HashMap<String, ContinuationToken>>,
}

impl ContinuationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites any token already stored for `id`.
    pub fn register(&self, id: &str, token: ContinuationToken) -> Result<()> {
        let mut tokens = self.lock()?;
        if tokens.insert(id.to_string(), token).is_some() {
            debug!(expense_id = id, "Replaced live continuation token");
        }
        Ok(())
    }

    pub fn resolve(&self, id: &str) -> Result<ContinuationToken> {
        self.lock()?
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("no continuation registered for {id}")))
    }

    pub fn discard(&self, id: &str) -> Result<Option<ContinuationToken>> {
        Ok(self.lock()?.remove(id))
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(id))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ContinuationToken>>> {
        self.tokens
            .lock()
            .map_err(|e| Error::System(format!("continuation registry lock poisoned: {e}")))
    }
}

impl RunObserver for ContinuationRegistry {
    /// A suspension confirmed by an earlier process is resumable again once
    /// its stored token is registered here.
    fn run_restored(&self, run: &RunContext) {
        let Some(pending) = run.pending.as_ref().filter(|p| p.confirmed) else {
            return;
        };
        if run.status != RunStatus::Suspended {
            return;
        }
        match self.register(&run.expense_id, pending.token.clone()) {
            Ok(()) => info!(
                expense_id = %run.expense_id,
                workflow_id = %run.run.workflow_id,
                "Restored continuation of suspended run"
            ),
            Err(err) => warn!(
                expense_id = %run.expense_id,
                error = %err,
                "Failed to restore continuation"
            ),
        }
    }

    fn run_terminated(&self, run: &RunContext) {
        if let Ok(Some(_)) = self.discard(&run.expense_id) {
            info!(
                expense_id = %run.expense_id,
                workflow_id = %run.run.workflow_id,
                "Dropped continuation of terminated run"
            );
        }
    }
}

/// Registration request from a suspending step: the expense must exist and
/// still await its decision.
pub fn accept_callback(
    book: &ExpenseBook,
    registry: &ContinuationRegistry,
    id: &str,
    token: ContinuationToken,
) -> Result<()> {
    if token.is_empty() {
        return Err(Error::InvalidInput("task token must not be empty".into()));
    }
    let expense = book.get(id)?;
    if expense.state != ExpenseState::Created {
        return Err(Error::InvalidState(format!(
            "expense {id} is {}, expected CREATED",
            expense.state
        )));
    }
    registry.register(id, token)?;
    info!(expense_id = id, "Registered callback");
    Ok(())
}
