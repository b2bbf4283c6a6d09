//! Authoritative per-expense state and the transitions external actions drive.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use tracing::{debug, info, warn};

use crate::core::{
    domain::{Action, Expense, ExpenseState, RunContext, RunStage, Transition},
    error::{Error, Result},
    ports::RunObserver,
};

/// In-process expense store. Ordered by id so listings are stable.
#[derive(Debug, Default)]
pub struct ExpenseBook {
    entries: Mutex<BTreeMap<String, ExpenseState>>,
}

impl ExpenseBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidInput("expense id must not be empty".into()));
        }
        let mut entries = self.lock()?;
        if entries.contains_key(id) {
            return Err(Error::Duplicate(id.to_string()));
        }
        entries.insert(id.to_string(), ExpenseState::Created);
        info!(expense_id = id, "Created new expense");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Expense> {
        let entries = self.lock()?;
        entries
            .get(id)
            .map(|state| Expense {
                id: id.to_string(),
                state: *state,
            })
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Expense>> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .map(|(id, state)| Expense {
                id: id.clone(),
                state: *state,
            })
            .collect())
    }

    /// Last writer wins, except that nothing leaves `COMPLETED`. The returned
    /// transition tells the caller whether a notification is due.
    pub fn apply_action(&self, id: &str, action: Action) -> Result<Transition> {
        let mut entries = self.lock()?;
        let state = entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if *state == ExpenseState::Completed {
            return Err(Error::InvalidState(format!(
                "expense {id} is already COMPLETED"
            )));
        }
        let transition = Transition {
            previous: *state,
            current: action.target(),
        };
        *state = transition.current;
        debug!(expense_id = id, action = action.as_str(), "Applied action");
        Ok(transition)
    }

    /// Re-seeds an expense lost with a previous process. Returns false when
    /// the id is already known.
    pub fn restore(&self, id: &str, state: ExpenseState) -> Result<bool> {
        let mut entries = self.lock()?;
        if entries.contains_key(id) {
            return Ok(false);
        }
        entries.insert(id.to_string(), state);
        info!(expense_id = id, %state, "Restored expense");
        Ok(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, ExpenseState>>> {
        self.entries
            .lock()
            .map_err(|e| Error::System(format!("expense book lock poisoned: {e}")))
    }
}

impl RunObserver for ExpenseBook {
    /// The create step of a `creating` run still runs, so only later stages
    /// need their expense back.
    fn run_restored(&self, run: &RunContext) {
        let state = match run.stage {
            RunStage::Creating | RunStage::Done => return,
            RunStage::AwaitingDecision => ExpenseState::Created,
            RunStage::Paying => ExpenseState::Approved,
        };
        if let Err(err) = self.restore(&run.expense_id, state) {
            warn!(expense_id = %run.expense_id, error = %err, "Failed to restore expense");
        }
    }
}
