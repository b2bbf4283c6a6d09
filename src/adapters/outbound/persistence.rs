use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};

use crate::{
    core::{
        domain::{ContinuationToken, RunContext},
        error::Error as CoreError,
        ports::{ClaimedStep, RunRepository},
    },
    paths::data_dir,
};

const RUN_COLUMNS: &str = "context_json";

/// SQLite-backed run checkpoints. Each call opens its own connection, so the
/// store is cheap to clone and safe to share between tasks and processes.
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    db_path: PathBuf,
}

impl SqliteRunStore {
    pub fn open(custom_root: Option<PathBuf>) -> Result<Self> {
        let base = custom_root.unwrap_or_else(data_dir);
        if !base.exists() {
            fs::create_dir_all(&base).with_context(|| {
                format!("Failed to create run store directory {}", base.display())
            })?;
        }
        let db_path = base.join("runs.sqlite3");
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!("Failed to open run database {}", self.db_path.display())
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                workflow_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                expense_id TEXT NOT NULL,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                pending_token TEXT,
                pending_confirmed INTEGER NOT NULL DEFAULT 0,
                deadline_ms INTEGER,
                context_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS runs_pending_token ON runs(pending_token);
            CREATE INDEX IF NOT EXISTS runs_deadline ON runs(deadline_ms);
            "#,
        )?;
        Ok(())
    }

    /// Runs blocking SQLite work off the async executor.
    async fn blocking<T, F>(&self, work: F) -> crate::core::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteRunStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| CoreError::System(format!("Join error: {e}")))?
            .map_err(into_core)
    }
}

fn into_core(err: anyhow::Error) -> CoreError {
    match err.downcast::<CoreError>() {
        Ok(core) => core,
        Err(other) => CoreError::Persistence(format!("{other:#}")),
    }
}

fn upsert(conn: &Connection, run: &RunContext) -> Result<()> {
    let context_json = serde_json::to_string(run)?;
    let pending = run.pending.as_ref();
    conn.execute(
        r#"
        INSERT INTO runs (workflow_id, run_id, expense_id, status, stage, pending_token,
                          pending_confirmed, deadline_ms, context_json, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(workflow_id)
        DO UPDATE SET
            run_id=excluded.run_id,
            expense_id=excluded.expense_id,
            status=excluded.status,
            stage=excluded.stage,
            pending_token=excluded.pending_token,
            pending_confirmed=excluded.pending_confirmed,
            deadline_ms=excluded.deadline_ms,
            context_json=excluded.context_json,
            updated_at=excluded.updated_at
        "#,
        params![
            run.run.workflow_id,
            run.run.run_id,
            run.expense_id,
            run.status.as_str(),
            run.stage.as_str(),
            pending.map(|p| p.token.to_string()),
            pending.is_some_and(|p| p.confirmed),
            pending.map(|p| p.deadline_ms as i64),
            context_json,
            run.updated_at_ms as i64,
        ],
    )?;
    Ok(())
}

fn decode(json: &str) -> Result<RunContext> {
    serde_json::from_str(json).context("Corrupt run checkpoint")
}

fn query_runs(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<RunContext>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| row.get::<_, String>(0))?;
    let mut runs = Vec::new();
    for row in rows {
        runs.push(decode(&row?)?);
    }
    Ok(runs)
}

#[async_trait]
impl RunRepository for SqliteRunStore {
    async fn insert(&self, run: &RunContext) -> crate::core::Result<()> {
        let run = run.clone();
        self.blocking(move |store| {
            let conn = store.connect()?;
            let context_json = serde_json::to_string(&run)?;
            let inserted = conn.execute(
                r#"
                INSERT INTO runs (workflow_id, run_id, expense_id, status, stage,
                                  context_json, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    run.run.workflow_id,
                    run.run.run_id,
                    run.expense_id,
                    run.status.as_str(),
                    run.stage.as_str(),
                    context_json,
                    run.updated_at_ms as i64,
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(CoreError::Duplicate(run.run.workflow_id.clone()).into())
                }
                Err(other) => Err(other.into()),
            }
        })
        .await
    }

    async fn save(&self, run: &RunContext) -> crate::core::Result<()> {
        let run = run.clone();
        self.blocking(move |store| upsert(&store.connect()?, &run))
            .await
    }

    async fn load(&self, workflow_id: &str) -> crate::core::Result<Option<RunContext>> {
        let workflow_id = workflow_id.to_string();
        self.blocking(move |store| {
            let conn = store.connect()?;
            let json: Option<String> = conn
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM runs WHERE workflow_id = ?1"),
                    params![workflow_id],
                    |row| row.get(0),
                )
                .optional()?;
            json.as_deref().map(decode).transpose()
        })
        .await
    }

    async fn list(&self, limit: usize) -> crate::core::Result<Vec<RunContext>> {
        self.blocking(move |store| {
            let conn = store.connect()?;
            query_runs(
                &conn,
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs ORDER BY updated_at DESC, workflow_id LIMIT ?1"
                ),
                params![limit as i64],
            )
        })
        .await
    }

    async fn claim_pending(
        &self,
        token: &ContinuationToken,
    ) -> crate::core::Result<Option<ClaimedStep>> {
        let token = token.to_string();
        self.blocking(move |store| {
            let mut conn = store.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let json: Option<String> = tx
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM runs WHERE pending_token = ?1"),
                    params![token],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(json) = json else {
                tx.commit()?;
                return Ok(None);
            };
            let mut run = decode(&json)?;
            let Some(pending) = run.pending.take() else {
                tx.commit()?;
                return Ok(None);
            };
            upsert(&tx, &run)?;
            tx.commit()?;
            Ok(Some(ClaimedStep { run, pending }))
        })
        .await
    }

    async fn overdue(&self, now_ms: u64) -> crate::core::Result<Vec<RunContext>> {
        self.blocking(move |store| {
            let conn = store.connect()?;
            query_runs(
                &conn,
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs \
                     WHERE pending_confirmed = 1 AND deadline_ms IS NOT NULL AND deadline_ms < ?1"
                ),
                params![now_ms as i64],
            )
        })
        .await
    }

    async fn unfinished(&self) -> crate::core::Result<Vec<RunContext>> {
        self.blocking(move |store| {
            let conn = store.connect()?;
            query_runs(
                &conn,
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs \
                     WHERE status IN ('running', 'suspended') ORDER BY updated_at"
                ),
                [],
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{PendingStep, RunOutcome, RunStatus, StepKind, WorkflowRun};
    use tempfile::tempdir;

    fn suspended(id: &str, token: &str, deadline_ms: u64, updated_at_ms: u64) -> RunContext {
        let mut ctx = RunContext::new(
            WorkflowRun {
                workflow_id: format!("expense_{id}"),
                run_id: format!("run-{id}"),
            },
            id,
            "expense",
            updated_at_ms,
        );
        ctx.status = RunStatus::Suspended;
        ctx.pending = Some(PendingStep {
            step: StepKind::WaitForDecision,
            token: ContinuationToken::from(token),
            deadline_ms,
            confirmed: true,
        });
        ctx
    }

    #[tokio::test]
    async fn saves_and_loads_run() {
        let temp = tempdir().unwrap();
        let store = SqliteRunStore::open(Some(temp.path().to_path_buf())).unwrap();
        let ctx = suspended("e1", "tok-1", 500, 10);

        store.insert(&ctx).await.unwrap();
        store.save(&ctx).await.unwrap();

        let loaded = store.load("expense_e1").await.unwrap().unwrap();
        assert_eq!(loaded, ctx);
        assert!(store.load("expense_missing").await.unwrap().is_none());
        assert!(matches!(
            store.insert(&ctx).await,
            Err(CoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn claim_pending_is_atomic_and_one_shot() {
        let temp = tempdir().unwrap();
        let store = SqliteRunStore::open(Some(temp.path().to_path_buf())).unwrap();
        store.save(&suspended("e1", "tok-1", 500, 10)).await.unwrap();

        let token = ContinuationToken::from("tok-1");
        let (a, b) = tokio::join!(store.claim_pending(&token), store.claim_pending(&token));
        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);

        let stored = store.load("expense_e1").await.unwrap().unwrap();
        assert!(stored.pending.is_none());
        assert!(store.overdue(10_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overdue_and_unfinished_queries() {
        let temp = tempdir().unwrap();
        let store = SqliteRunStore::open(Some(temp.path().to_path_buf())).unwrap();
        store.save(&suspended("late", "t1", 100, 1)).await.unwrap();
        store.save(&suspended("fresh", "t2", 9_000, 2)).await.unwrap();
        let mut done = suspended("done", "t3", 100, 3);
        done.finish(RunOutcome::completed("REJECTED"), 4);
        store.save(&done).await.unwrap();

        let overdue = store.overdue(1_000).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].expense_id, "late");

        let unfinished = store.unfinished().await.unwrap();
        let ids: Vec<&str> = unfinished.iter().map(|r| r.expense_id.as_str()).collect();
        assert_eq!(ids, vec!["late", "fresh"]);

        let listed = store.list(2).await.unwrap();
        assert_eq!(listed[0].expense_id, "done");
        assert_eq!(listed.len(), 2);
    }
}
