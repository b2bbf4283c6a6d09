use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::core::{
    domain::{ContinuationToken, RunContext},
    error::{Error, Result},
    ports::{ClaimedStep, RunRepository},
};

/// Run store kept in process memory. Runs do not survive a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<RwLock<HashMap<String, RunContext>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(err: std::sync::PoisonError<T>) -> Error {
    Error::System(format!("run store lock poisoned: {err}"))
}

#[async_trait]
impl RunRepository for InMemoryRunStore {
    async fn insert(&self, run: &RunContext) -> Result<()> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let id = run.workflow_id().to_string();
        if runs.contains_key(&id) {
            return Err(Error::Duplicate(id));
        }
        runs.insert(id, run.clone());
        Ok(())
    }

    async fn save(&self, run: &RunContext) -> Result<()> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        runs.insert(run.workflow_id().to_string(), run.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<RunContext>> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs.get(workflow_id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<RunContext>> {
        let runs = self.runs.read().map_err(poisoned)?;
        let mut all: Vec<RunContext> = runs.values().cloned().collect();
        all.sort_by(|a, b| {
            b.updated_at_ms
                .cmp(&a.updated_at_ms)
                .then_with(|| a.run.workflow_id.cmp(&b.run.workflow_id))
        });
        all.truncate(limit);
        Ok(all)
    }

    async fn claim_pending(&self, token: &ContinuationToken) -> Result<Option<ClaimedStep>> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let Some(run) = runs
            .values_mut()
            .find(|run| run.pending.as_ref().is_some_and(|p| &p.token == token))
        else {
            return Ok(None);
        };
        let Some(pending) = run.pending.take() else {
            return Ok(None);
        };
        Ok(Some(ClaimedStep {
            run: run.clone(),
            pending,
        }))
    }

    async fn overdue(&self, now_ms: u64) -> Result<Vec<RunContext>> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs
            .values()
            .filter(|run| {
                run.pending
                    .as_ref()
                    .is_some_and(|p| p.confirmed && p.deadline_ms < now_ms)
            })
            .cloned()
            .collect())
    }

    async fn unfinished(&self) -> Result<Vec<RunContext>> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs
            .values()
            .filter(|run| !run.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{PendingStep, StepKind, WorkflowRun};

    fn run(id: &str, token: Option<&str>, deadline_ms: u64) -> RunContext {
        let mut ctx = RunContext::new(
            WorkflowRun {
                workflow_id: format!("expense_{id}"),
                run_id: "r".into(),
            },
            id,
            "expense",
            0,
        );
        ctx.pending = token.map(|t| PendingStep {
            step: StepKind::WaitForDecision,
            token: ContinuationToken::from(t),
            deadline_ms,
            confirmed: true,
        });
        ctx
    }

    #[tokio::test]
    async fn claim_is_one_shot() {
        let store = InMemoryRunStore::new();
        store.insert(&run("a", Some("tok"), 50)).await.unwrap();

        let token = ContinuationToken::from("tok");
        let claimed = store.claim_pending(&token).await.unwrap().unwrap();
        assert_eq!(claimed.pending.deadline_ms, 50);
        assert!(claimed.run.pending.is_none());
        assert!(store.claim_pending(&token).await.unwrap().is_none());
        let stored = store.load("expense_a").await.unwrap().unwrap();
        assert!(stored.pending.is_none());
    }

    #[tokio::test]
    async fn overdue_only_returns_confirmed_past_deadline() {
        let store = InMemoryRunStore::new();
        store.insert(&run("late", Some("t1"), 10)).await.unwrap();
        store.insert(&run("fresh", Some("t2"), 1_000)).await.unwrap();
        let mut unconfirmed = run("racing", Some("t3"), 10);
        if let Some(p) = unconfirmed.pending.as_mut() {
            p.confirmed = false;
        }
        store.insert(&unconfirmed).await.unwrap();

        let overdue = store.overdue(100).await.unwrap();
        let ids: Vec<&str> = overdue.iter().map(|r| r.expense_id.as_str()).collect();
        assert_eq!(ids, vec!["late"]);
    }

    #[tokio::test]
    async fn insert_rejects_existing_workflow() {
        let store = InMemoryRunStore::new();
        store.insert(&run("a", None, 0)).await.unwrap();
        assert!(matches!(
            store.insert(&run("a", None, 0)).await,
            Err(Error::Duplicate(_))
        ));
    }
}
