//! In-process durable execution engine.
//!
//! Every stage transition is checkpointed through `RunRepository`. A run that
//! suspends leaves nothing behind but its stored record: the driver task exits
//! and a later `complete_step` (possibly in another process) schedules a new
//! one. Deadlines of suspended steps are enforced by `expire_overdue`, which
//! the sweeper calls periodically.

use std::{
    collections::{HashMap, HashSet, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    application::{
        activities::{Activity, ActivityContext, ActivitySet},
        workflow::{Advance, ExpenseWorkflow, StepExecutor},
    },
    core::{
        domain::{
            ContinuationToken, PendingStep, Resumption, RunContext, RunOutcome, RunStatus,
            StepKind, StepOutcome, WorkflowRun,
        },
        error::{Error, Result},
        ports::{ClaimedStep, Clock, RunObserver, RunRepository, TelemetrySink, WorkflowClient},
    },
};

/// Exponential backoff for transient step failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(200),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_interval.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub task_queue: String,
    pub retry: RetryPolicy,
    pub sweep_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            task_queue: "expense".into(),
            retry: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

const DRIVER_SHARDS: usize = 16;

enum DriveExit {
    Suspended,
    Finished,
}

struct Inner {
    store: Arc<dyn RunRepository>,
    workflow: ExpenseWorkflow,
    activities: ActivitySet,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
    observers: RwLock<Vec<Arc<dyn RunObserver>>>,
    options: EngineOptions,
    /// Workflow ids with a live driver task, sharded by id. A run's
    /// suspension is confirmed and its completions are claimed while holding
    /// its shard.
    shards: Vec<Mutex<HashSet<String>>>,
}

impl Inner {
    fn shard(&self, workflow_id: &str) -> &Mutex<HashSet<String>> {
        let mut hasher = DefaultHasher::new();
        workflow_id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn RunRepository>,
        workflow: ExpenseWorkflow,
        activities: ActivitySet,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
        options: EngineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                workflow,
                activities,
                clock,
                telemetry,
                observers: RwLock::new(Vec::new()),
                options,
                shards: (0..DRIVER_SHARDS)
                    .map(|_| Mutex::new(HashSet::new()))
                    .collect(),
            }),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn RunObserver>) {
        let mut observers = self
            .inner
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.push(observer);
    }

    pub fn task_queue(&self) -> &str {
        &self.inner.options.task_queue
    }

    /// Persist a new run for `expense_id` and start driving it.
    pub async fn start_run(&self, expense_id: &str) -> Result<WorkflowRun> {
        let run = WorkflowRun {
            workflow_id: format!("expense_{expense_id}"),
            run_id: Uuid::new_v4().to_string(),
        };
        let ctx = RunContext::new(
            run.clone(),
            expense_id,
            &self.inner.options.task_queue,
            self.inner.clock.now_ms(),
        );
        self.inner.store.insert(&ctx).await?;
        info!(
            workflow_id = %run.workflow_id,
            run_id = %run.run_id,
            expense_id,
            "Started workflow"
        );
        self.record("run_started", &ctx, None);
        self.schedule(&run.workflow_id).await;
        Ok(run)
    }

    pub async fn load(&self, workflow_id: &str) -> Result<Option<RunContext>> {
        self.inner.store.load(workflow_id).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<RunContext>> {
        self.inner.store.list(limit).await
    }

    /// Poll the stored run until `predicate` holds.
    pub async fn wait_for<F>(
        &self,
        workflow_id: &str,
        timeout: Duration,
        predicate: F,
    ) -> Result<RunContext>
    where
        F: Fn(&RunContext) -> bool,
    {
        let poll = async {
            loop {
                if let Some(run) = self.inner.store.load(workflow_id).await?
                    && predicate(&run)
                {
                    return Ok::<RunContext, Error>(run);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                step: format!("wait_for({workflow_id})"),
                after: timeout,
            }),
        }
    }

    /// Fail every confirmed suspension whose deadline has passed. Returns how
    /// many runs were expired.
    pub async fn expire_overdue(&self) -> Result<usize> {
        let now = self.inner.clock.now_ms();
        let candidates = self.inner.store.overdue(now).await?;
        let mut expired = 0;
        for candidate in candidates {
            let Some(pending) = candidate.pending else {
                continue;
            };
            let claimed = {
                let _active = self.inner.shard(&candidate.run.workflow_id).lock().await;
                self.inner.store.claim_pending(&pending.token).await?
            };
            if let Some(claimed) = claimed {
                self.expire(claimed).await?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let period = self.inner.options.sweep_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks = IntervalStream::new(interval);
            while ticks.next().await.is_some() {
                match engine.expire_overdue().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "Expired overdue suspensions"),
                    Err(err) => warn!(error = %err, "Deadline sweep failed"),
                }
            }
        })
    }

    /// Re-drive runs interrupted by a restart and returns how many drivers
    /// were started. Observers see every unfinished run first, so confirmed
    /// suspensions keep waiting with their stored token live again. A wait
    /// step whose registration never confirmed is replayed with a fresh token.
    pub async fn recover(&self) -> Result<usize> {
        let mut resumed = 0;
        for run in self.inner.store.unfinished().await? {
            let workflow_id = run.workflow_id().to_string();
            self.notify_restored(&run);
            match &run.pending {
                Some(pending) if pending.confirmed => {
                    info!(%workflow_id, step = pending.step.name(), "Run still suspended");
                    continue;
                }
                Some(pending) => {
                    let _active = self.inner.shard(&workflow_id).lock().await;
                    if self.inner.store.claim_pending(&pending.token).await?.is_none() {
                        continue;
                    }
                    info!(%workflow_id, step = pending.step.name(), "Replaying unconfirmed step");
                }
                None => info!(%workflow_id, stage = run.stage.as_str(), "Recovering run"),
            }
            self.schedule(&workflow_id).await;
            resumed += 1;
        }
        Ok(resumed)
    }

    async fn schedule(&self, workflow_id: &str) {
        let mut active = self.inner.shard(workflow_id).lock().await;
        self.spawn_driver(&mut active, workflow_id);
    }

    fn spawn_driver(&self, active: &mut HashSet<String>, workflow_id: &str) {
        if !active.insert(workflow_id.to_string()) {
            return;
        }
        let engine = self.clone();
        let workflow_id = workflow_id.to_string();
        tokio::spawn(async move {
            match engine.drive(&workflow_id).await {
                Ok(DriveExit::Suspended) => {}
                Ok(DriveExit::Finished) => {
                    engine.inner.shard(&workflow_id).lock().await.remove(&workflow_id);
                }
                Err(err) => {
                    error!(%workflow_id, error = %err, "Run driver stopped");
                    engine.inner.shard(&workflow_id).lock().await.remove(&workflow_id);
                }
            }
        });
    }

    async fn drive(&self, workflow_id: &str) -> Result<DriveExit> {
        let mut run = self
            .inner
            .store
            .load(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;

        loop {
            if run.is_terminal() {
                return Ok(DriveExit::Finished);
            }
            match self.inner.workflow.advance(&mut run, self).await? {
                Advance::Continue => {
                    run.updated_at_ms = self.inner.clock.now_ms();
                    self.inner.store.save(&run).await?;
                }
                Advance::Suspend(token) => {
                    let mut active = self.inner.shard(workflow_id).lock().await;
                    let stored = self
                        .inner
                        .store
                        .load(workflow_id)
                        .await?
                        .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
                    if stored.resumed.is_some() || stored.is_terminal() {
                        // Completion or expiry landed while phase A was running.
                        debug!(%workflow_id, "Completion raced suspension");
                        run = stored;
                        continue;
                    }
                    if let Some(pending) = run.pending.as_mut() {
                        pending.confirmed = true;
                    }
                    run.status = RunStatus::Suspended;
                    run.updated_at_ms = self.inner.clock.now_ms();
                    self.inner.store.save(&run).await?;
                    active.remove(workflow_id);
                    info!(%workflow_id, %token, "Run suspended");
                    self.record("step_suspended", &run, None);
                    return Ok(DriveExit::Suspended);
                }
                Advance::Finish(outcome) => {
                    self.finish(run, outcome).await?;
                    return Ok(DriveExit::Finished);
                }
            }
        }
    }

    async fn finish(&self, mut run: RunContext, outcome: RunOutcome) -> Result<()> {
        run.finish(outcome, self.inner.clock.now_ms());
        self.inner.store.save(&run).await?;
        let event = if run.status == RunStatus::Completed {
            "run_completed"
        } else {
            "run_failed"
        };
        if let Some(outcome) = &run.outcome {
            info!(
                workflow_id = %run.run.workflow_id,
                result = %outcome.summary(),
                "Workflow finished"
            );
        }
        self.record(event, &run, None);
        self.notify_observers(&run);
        Ok(())
    }

    async fn expire(&self, claimed: ClaimedStep) -> Result<()> {
        let ClaimedStep { mut run, pending } = claimed;
        let deadline = pending.deadline_ms;
        let err = Error::Timeout {
            step: pending.step.name().to_string(),
            after: self.inner.workflow.timeouts().decision,
        };
        warn!(
            workflow_id = %run.run.workflow_id,
            expense_id = %run.expense_id,
            deadline_ms = deadline,
            "Suspended step passed its deadline"
        );
        run.finish(RunOutcome::failed(&err), self.inner.clock.now_ms());
        self.inner.store.save(&run).await?;
        self.record("run_timed_out", &run, Some(pending.step));
        self.notify_observers(&run);
        Ok(())
    }

    fn notify_observers(&self, run: &RunContext) {
        for observer in self.observers() {
            observer.run_terminated(run);
        }
    }

    fn notify_restored(&self, run: &RunContext) {
        for observer in self.observers() {
            observer.run_restored(run);
        }
    }

    fn observers(&self) -> Vec<Arc<dyn RunObserver>> {
        self.inner
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, event: &str, run: &RunContext, step: Option<StepKind>) {
        let mut props = HashMap::new();
        props.insert("workflow_id".to_string(), run.run.workflow_id.clone());
        props.insert("run_id".to_string(), run.run.run_id.clone());
        props.insert("expense_id".to_string(), run.expense_id.clone());
        props.insert("stage".to_string(), run.stage.as_str().to_string());
        if let Some(step) = step {
            props.insert("step".to_string(), step.name().to_string());
        }
        if let Some(outcome) = &run.outcome {
            props.insert("result".to_string(), outcome.summary());
        }
        self.inner.telemetry.record_event(event, props);
    }

    async fn run_with_retry(&self, activity: &dyn Activity, ctx: &ActivityContext) -> StepOutcome {
        let policy = &self.inner.options.retry;
        let mut attempt = 1;
        loop {
            match activity.execute(ctx).await {
                StepOutcome::Failed(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        expense_id = %ctx.expense_id,
                        step = activity.kind().name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying step"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

#[async_trait]
impl StepExecutor for Engine {
    async fn execute_step(
        &self,
        run: &mut RunContext,
        step: StepKind,
        timeout: Duration,
    ) -> Result<StepOutcome> {
        run.attempts += 1;
        let attempt = run.attempts;

        // The token and its deadline are durable before anyone can see the token.
        let token = if step.suspends() {
            let token = ContinuationToken::issue(&run.run, attempt);
            run.pending = Some(PendingStep {
                step,
                token: token.clone(),
                deadline_ms: self
                    .inner
                    .clock
                    .now_ms()
                    .saturating_add(timeout.as_millis() as u64),
                confirmed: false,
            });
            run.status = RunStatus::Running;
            run.updated_at_ms = self.inner.clock.now_ms();
            self.inner.store.save(run).await?;
            Some(token)
        } else {
            None
        };

        let activity = self.inner.activities.get(step)?;
        let ctx = ActivityContext {
            run: run.run.clone(),
            expense_id: run.expense_id.clone(),
            attempt,
            task_token: token.clone(),
        };
        debug!(expense_id = %ctx.expense_id, step = step.name(), attempt, "Executing step");
        let outcome =
            match tokio::time::timeout(timeout, self.run_with_retry(activity.as_ref(), &ctx)).await
            {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::Failed(Error::Timeout {
                    step: step.name().to_string(),
                    after: timeout,
                }),
            };

        if let Some(token) = token
            && !matches!(outcome, StepOutcome::Pending(_))
        {
            // The step will not suspend; retire its token so it can never resume.
            let _active = self.inner.shard(run.workflow_id()).lock().await;
            if self.inner.store.claim_pending(&token).await?.is_none() {
                warn!(expense_id = %run.expense_id, "Token was completed before its step failed");
            }
            run.pending = None;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl WorkflowClient for Engine {
    async fn complete_step(
        &self,
        token: &ContinuationToken,
        resumption: Resumption,
    ) -> Result<()> {
        let not_pending = || Error::NotFound(format!("no step pending on token {token}"));
        let workflow_id = token.workflow_id().ok_or_else(not_pending)?;
        let mut active = self.inner.shard(workflow_id).lock().await;
        let ClaimedStep { mut run, pending } = self
            .inner
            .store
            .claim_pending(token)
            .await?
            .ok_or_else(not_pending)?;

        if self.inner.clock.now_ms() > pending.deadline_ms {
            drop(active);
            let workflow_id = run.run.workflow_id.clone();
            self.expire(ClaimedStep { run, pending }).await?;
            return Err(Error::Timeout {
                step: format!("{workflow_id}/{}", StepKind::WaitForDecision.name()),
                after: self.inner.workflow.timeouts().decision,
            });
        }

        run.resumed = Some(resumption);
        run.status = RunStatus::Running;
        run.updated_at_ms = self.inner.clock.now_ms();
        self.inner.store.save(&run).await?;
        info!(
            workflow_id = %run.run.workflow_id,
            step = pending.step.name(),
            "Step resumed"
        );
        self.record("step_resumed", &run, Some(pending.step));
        // A driver still inside phase A picks the resumption up when it confirms.
        self.spawn_driver(&mut active, &run.run.workflow_id);
        Ok(())
    }
}
