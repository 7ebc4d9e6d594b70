//! Workflow execution engine.
//!
//! `Engine` is the central orchestrator:
//! 1. Loads and re-validates the workflow, then creates a `pending` Execution.
//! 2. Walks `definition.tasks` strictly in declared order.
//! 3. Resolves `${...}` placeholders against the trigger input and the
//!    outputs of earlier tasks in the same run.
//! 4. Dispatches each task through the `AgentRegistry`, with bounded retry
//!    (`AgentError::Retryable`) and no retry for fatal/definitional errors.
//! 5. Persists every Task and Execution transition via the `db` crate.
//! 6. Applies each task's `on_error` policy and finalises the Execution.
//!
//! Every run owns a cancellation token (a child of the engine's shutdown
//! token). A user cancel lets the in-flight `invoke` finish and stops before
//! the next task; shutdown also interrupts the in-flight call.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use agents::{AgentHandler, AgentOutput, AgentRegistry, InvokeContext, Params};
use db::models::{
    ExecutionRow, ExecutionStatus, ExecutionUpdate, NewExecution, NewTask, TaskRow, TaskUpdate,
    WorkflowStatus,
};
use db::repository::{executions, tasks, workflows};
use db::{DbError, DbPool};

use crate::models::{ExecutionRequest, NewWorkflow, OnError, TaskDef, Workflow};
use crate::retry::{execute_with_retry, RetryError};
use crate::variables::{resolve_parameters, Scope};
use crate::{EngineConfig, EngineError, TaskError};

/// Deadlines further out than this are clamped (avoids `Instant` overflow).
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

fn workflow_error(id: Uuid) -> impl FnOnce(DbError) -> EngineError {
    move |err| if err.is_not_found() { EngineError::WorkflowNotFound(id) } else { err.into() }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

fn execution_error(id: Uuid) -> impl FnOnce(DbError) -> EngineError {
    move |err| if err.is_not_found() { EngineError::ExecutionNotFound(id) } else { err.into() }
}

// ---------------------------------------------------------------------------
// Per-run bookkeeping
// ---------------------------------------------------------------------------

struct RunHandle {
    workflow_id: Uuid,
    cancel: CancellationToken,
}

/// Everything a run needs, captured before the first task starts.
struct PreparedRun {
    workflow: Workflow,
    execution: ExecutionRow,
    cancel: CancellationToken,
}

/// Drops the run from the live table when `drive` ends, including when its
/// future is dropped or unwinds.
struct RunGuard<'a> {
    engine: &'a Engine,
    execution_id: Uuid,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let engine = self.engine;
        if let Some((_, handle)) = engine.runs.remove(&self.execution_id) {
            engine.release_workflow(handle.workflow_id, self.execution_id);
        }
        if engine.runs.is_empty() {
            engine.idle.notify_waiters();
        }
    }
}

enum TaskOutcome {
    Completed(AgentOutput),
    Failed(TaskError),
}

/// Per-run task counts reported when the execution finishes.
#[derive(Debug, Clone, Copy, Default)]
struct TaskTally {
    completed: u32,
    failed: u32,
}

#[derive(Debug, Clone, Copy)]
struct Deadlines {
    task_timeout: Duration,
    workflow_deadline: Instant,
    workflow_timeout_secs: u64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs workflows and owns every Execution/Task mutation.
///
/// Construct one engine per process with an explicit registry, and share it
/// behind an `Arc` when runs are started in the background.
pub struct Engine {
    pool: DbPool,
    registry: Arc<AgentRegistry>,
    config: EngineConfig,
    /// Live runs in this process, keyed by execution id.
    runs: DashMap<Uuid, RunHandle>,
    /// workflow id → execution id; only maintained when overlapping runs are disallowed.
    live_workflows: DashMap<Uuid, Uuid>,
    shutdown: CancellationToken,
    idle: Notify,
}

impl Engine {
    pub fn new(pool: DbPool, registry: Arc<AgentRegistry>, config: EngineConfig) -> Self {
        Self {
            pool,
            registry,
            config,
            runs: DashMap::new(),
            live_workflows: DashMap::new(),
            shutdown: CancellationToken::new(),
            idle: Notify::new(),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execution ids with a live run in this process.
    pub fn active_executions(&self) -> Vec<Uuid> {
        self.runs.iter().map(|entry| *entry.key()).collect()
    }

    // -----------------------------------------------------------------------
    // Workflow CRUD
    // -----------------------------------------------------------------------

    /// Validate and store a new workflow.
    #[instrument(skip(self, new), fields(name = %new.name))]
    pub async fn create_workflow(&self, new: NewWorkflow) -> Result<Workflow, EngineError> {
        new.validate()?;
        let row = workflows::create_workflow(&self.pool, new.into_row()?).await?;
        Workflow::try_from(row)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        let row = workflows::get_workflow(&self.pool, id)
            .await
            .map_err(workflow_error(id))?;
        Workflow::try_from(row)
    }

    pub async fn list_workflows(&self, owner_id: Option<&str>) -> Result<Vec<Workflow>, EngineError> {
        workflows::list_workflows(&self.pool, owner_id)
            .await?
            .into_iter()
            .map(Workflow::try_from)
            .collect()
    }

    /// Delete a workflow with its finished executions.
    ///
    /// Fails with `Database(ConstraintViolation)` while any execution of it is
    /// still pending or running.
    #[instrument(skip(self))]
    pub async fn delete_workflow(&self, id: Uuid) -> Result<(), EngineError> {
        workflows::delete_workflow(&self.pool, id)
            .await
            .map_err(workflow_error(id))
    }

    /// Archived workflows stay readable but refuse new executions.
    pub async fn archive_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        self.set_workflow_status(id, WorkflowStatus::Archived).await
    }

    pub async fn activate_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        self.set_workflow_status(id, WorkflowStatus::Active).await
    }

    async fn set_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> Result<Workflow, EngineError> {
        let row = workflows::set_workflow_status(&self.pool, id, status)
            .await
            .map_err(workflow_error(id))?;
        Workflow::try_from(row)
    }

    // -----------------------------------------------------------------------
    // Execution queries
    // -----------------------------------------------------------------------

    pub async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, EngineError> {
        executions::get_execution(&self.pool, id)
            .await
            .map_err(execution_error(id))
    }

    /// Newest first, optionally limited to one workflow.
    pub async fn list_executions(&self, workflow_id: Option<Uuid>) -> Result<Vec<ExecutionRow>, EngineError> {
        Ok(executions::list_executions(&self.pool, workflow_id).await?)
    }

    /// Task rows of an execution in definition order.
    pub async fn list_tasks(&self, execution_id: Uuid) -> Result<Vec<TaskRow>, EngineError> {
        self.get_execution(execution_id).await?;
        Ok(tasks::list_tasks_by_execution(&self.pool, execution_id).await?)
    }

    // -----------------------------------------------------------------------
    // Running workflows
    // -----------------------------------------------------------------------

    /// Run a workflow to completion and return the final Execution record.
    ///
    /// Task failures do not surface as `Err`; they are recorded on the
    /// returned record. `Err` means the run could not be set up (unknown or
    /// archived workflow, invalid definition) or persistence failed.
    #[instrument(skip(self, request), fields(workflow_id = %workflow_id))]
    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        request: ExecutionRequest,
    ) -> Result<ExecutionRow, EngineError> {
        let run = self.prepare(workflow_id, request).await?;
        self.drive(run).await
    }

    /// Create the Execution, run it in the background and return its id
    /// immediately. Poll [`Engine::get_execution`] for progress.
    #[instrument(skip(self, request), fields(workflow_id = %workflow_id))]
    pub async fn start_workflow(
        self: &Arc<Self>,
        workflow_id: Uuid,
        request: ExecutionRequest,
    ) -> Result<Uuid, EngineError> {
        let run = self.prepare(workflow_id, request).await?;
        let execution_id = run.execution.id;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = engine.drive(run).await {
                error!(%execution_id, "background execution aborted: {err}");
            }
        });

        Ok(execution_id)
    }

    async fn prepare(&self, workflow_id: Uuid, request: ExecutionRequest) -> Result<PreparedRun, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let workflow = self.get_workflow(workflow_id).await?;
        if workflow.status == WorkflowStatus::Archived {
            return Err(EngineError::WorkflowArchived(workflow_id));
        }
        workflow.validate()?;

        self.claim_workflow(workflow_id)?;
        let created = executions::create_execution(
            &self.pool,
            NewExecution {
                workflow_id,
                trigger_type: request.trigger_type,
                triggered_by: request.triggered_by,
                variables: request.variables,
            },
        )
        .await;
        let execution = match created {
            Ok(execution) => execution,
            Err(err) => {
                self.release_workflow(workflow_id, Uuid::nil());
                return Err(workflow_error(workflow_id)(err));
            }
        };

        let cancel = self.shutdown.child_token();
        self.runs.insert(execution.id, RunHandle { workflow_id, cancel: cancel.clone() });
        if !self.config.allow_overlapping_runs {
            self.live_workflows.insert(workflow_id, execution.id);
        }

        info!(execution_id = %execution.id, trigger = %execution.trigger_type, "execution created");
        Ok(PreparedRun { workflow, execution, cancel })
    }

    fn claim_workflow(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        if self.config.allow_overlapping_runs {
            return Ok(());
        }
        match self.live_workflows.entry(workflow_id) {
            Entry::Occupied(entry) => Err(EngineError::ExecutionInProgress {
                workflow_id,
                execution_id: *entry.get(),
            }),
            Entry::Vacant(entry) => {
                // nil until the execution row exists
                entry.insert(Uuid::nil());
                Ok(())
            }
        }
    }

    fn release_workflow(&self, workflow_id: Uuid, execution_id: Uuid) {
        if !self.config.allow_overlapping_runs {
            self.live_workflows
                .remove_if(&workflow_id, |_, owner| *owner == execution_id);
        }
    }

    #[instrument(
        name = "execution",
        skip_all,
        fields(workflow_id = %run.workflow.id, execution_id = %run.execution.id)
    )]
    async fn drive(&self, run: PreparedRun) -> Result<ExecutionRow, EngineError> {
        let _guard = RunGuard { engine: self, execution_id: run.execution.id };
        let result = self.run_tasks(&run).await;

        if let Err(err) = &result {
            error!("execution left in its last persisted state: {err}");
        }
        result
    }

    async fn run_tasks(&self, run: &PreparedRun) -> Result<ExecutionRow, EngineError> {
        let execution_id = run.execution.id;
        let mut outputs = Map::new();
        let mut tally = TaskTally::default();

        if run.cancel.is_cancelled() {
            return self
                .finalize(execution_id, tally, ExecutionStatus::Cancelled, outputs, Some("cancelled before start".into()))
                .await;
        }

        match executions::update_execution_status(
            &self.pool,
            execution_id,
            ExecutionUpdate::status(ExecutionStatus::Running),
        )
        .await
        {
            Ok(_) => {}
            // Closed as an orphan before the run was registered.
            Err(DbError::ConstraintViolation(reason)) => {
                warn!("execution could not start: {reason}");
                return self.get_execution(execution_id).await;
            }
            Err(err) => return Err(err.into()),
        }

        let workflow_deadline = deadline_after(Duration::from_secs(run.workflow.timeout_seconds));
        info!(tasks = run.workflow.definition.tasks.len(), "execution running");

        for (position, def) in run.workflow.definition.tasks.iter().enumerate() {
            if run.cancel.is_cancelled() {
                info!(next_task = %def.name, "cancellation requested, stopping");
                return self
                    .finalize(execution_id, tally, ExecutionStatus::Cancelled, outputs, Some("cancelled".into()))
                    .await;
            }

            match self.run_task(run, position, def, &outputs, workflow_deadline).await? {
                TaskOutcome::Completed(output) => {
                    tally.completed += 1;
                    outputs.insert(def.name.clone(), Value::Object(output));
                }
                TaskOutcome::Failed(err) => {
                    tally.failed += 1;
                    let message = format!("task '{}' failed: {err}", def.name);
                    match err {
                        TaskError::Cancelled | TaskError::Interrupted => {
                            return self
                                .finalize(execution_id, tally, ExecutionStatus::Cancelled, outputs, Some(message))
                                .await;
                        }
                        // A cancel requested while the task ran wins over its failure.
                        _ if run.cancel.is_cancelled() => {
                            return self
                                .finalize(execution_id, tally, ExecutionStatus::Cancelled, outputs, Some(message))
                                .await;
                        }
                        _ if err.aborts_execution() || def.on_error == OnError::Stop => {
                            return self
                                .finalize(execution_id, tally, ExecutionStatus::Failed, outputs, Some(message))
                                .await;
                        }
                        _ => warn!(task = %def.name, "continuing after failure: {err}"),
                    }
                }
            }
        }

        if run.cancel.is_cancelled() {
            return self
                .finalize(execution_id, tally, ExecutionStatus::Cancelled, outputs, Some("cancelled".into()))
                .await;
        }
        self.finalize(execution_id, tally, ExecutionStatus::Completed, outputs, None).await
    }

    async fn finalize(
        &self,
        execution_id: Uuid,
        tally: TaskTally,
        status: ExecutionStatus,
        outputs: Map<String, Value>,
        error_message: Option<String>,
    ) -> Result<ExecutionRow, EngineError> {
        let mut update = ExecutionUpdate::status(status).with_output(outputs);
        if let Some(message) = error_message {
            update = update.with_error(message);
        }

        let row = executions::update_execution_status(&self.pool, execution_id, update).await?;
        info!(
            status = %row.status,
            duration_ms = ?row.duration_ms,
            tasks_completed = tally.completed,
            tasks_failed = tally.failed,
            "execution finished"
        );
        Ok(row)
    }

    #[instrument(name = "task", skip_all, fields(task = %def.name, position = position))]
    async fn run_task(
        &self,
        run: &PreparedRun,
        position: usize,
        def: &TaskDef,
        outputs: &Map<String, Value>,
        workflow_deadline: Instant,
    ) -> Result<TaskOutcome, EngineError> {
        let scope = Scope::new(&run.execution.variables, outputs);
        let resolved = resolve_parameters(&def.parameters, &scope);

        let task = tasks::create_task(
            &self.pool,
            NewTask {
                execution_id: run.execution.id,
                position: u32::try_from(position).unwrap_or(u32::MAX),
                name: def.name.clone(),
                agent_type: def.agent_type.clone(),
                action: def.action.clone(),
                parameters: resolved.as_ref().unwrap_or(&def.parameters).clone(),
            },
        )
        .await?;

        let params = match resolved {
            Ok(params) => params,
            Err(err) => return self.fail_task(&task, TaskError::Variable(err)).await,
        };
        let handler = match self.registry.resolve(&def.agent_type) {
            Ok(handler) => handler,
            Err(err) => return self.fail_task(&task, TaskError::UnknownAgent(err)).await,
        };

        tasks::update_task(&self.pool, task.id, TaskUpdate::running()).await?;
        debug!(agent_type = %def.agent_type, action = %def.action, "dispatching task");

        let policy = self.config.retry_policy(run.workflow.max_retries_for(def));
        let deadlines = Deadlines {
            task_timeout: def
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or_else(|| self.config.default_task_timeout()),
            workflow_deadline,
            workflow_timeout_secs: run.workflow.timeout_seconds,
        };

        let result = {
            let handler: &dyn AgentHandler = &*handler;
            let params = &params;
            let task_id = task.id;
            execute_with_retry(&policy, &run.cancel, TaskError::is_retryable, move |attempt| async move {
                if attempt > 0 {
                    tasks::update_task(&self.pool, task_id, TaskUpdate::retry(attempt)).await?;
                }
                let ctx = InvokeContext {
                    workflow_id: run.workflow.id,
                    execution_id: run.execution.id,
                    task_name: def.name.clone(),
                    attempt,
                };
                self.invoke(handler, &def.action, params, &ctx, deadlines).await
            })
            .await
        };

        match result {
            Ok(output) => {
                tasks::update_task(&self.pool, task.id, TaskUpdate::completed(output.clone())).await?;
                info!("task completed");
                Ok(TaskOutcome::Completed(output))
            }
            Err(err) => {
                debug!(attempts = err.attempts(), "task gave up");
                let failure = match err {
                    RetryError::Exhausted { attempts, last_error } => TaskError::RetriesExhausted {
                        attempts,
                        last_error: last_error.to_string(),
                    },
                    RetryError::Aborted { error: TaskError::Database(db_err), .. } => {
                        return Err(db_err.into());
                    }
                    RetryError::Aborted { error, .. } => error,
                    RetryError::Cancelled { .. } if self.shutdown.is_cancelled() => TaskError::Interrupted,
                    RetryError::Cancelled { .. } => TaskError::Cancelled,
                };
                self.fail_task(&task, failure).await
            }
        }
    }

    async fn fail_task(&self, task: &TaskRow, err: TaskError) -> Result<TaskOutcome, EngineError> {
        warn!(task = %task.name, "task failed: {err}");
        tasks::update_task(&self.pool, task.id, TaskUpdate::failed(err.to_string())).await?;
        Ok(TaskOutcome::Failed(err))
    }

    /// One bounded agent call. The bound is the task timeout or the
    /// remaining workflow time, whichever ends first. A panic inside the
    /// agent becomes a non-retryable task failure.
    async fn invoke(
        &self,
        handler: &dyn AgentHandler,
        action: &str,
        params: &Params,
        ctx: &InvokeContext,
        deadlines: Deadlines,
    ) -> Result<AgentOutput, TaskError> {
        let now = Instant::now();
        if now >= deadlines.workflow_deadline {
            return Err(TaskError::ExecutionTimeout(deadlines.workflow_timeout_secs));
        }
        let task_deadline = now
            .checked_add(deadlines.task_timeout)
            .unwrap_or(deadlines.workflow_deadline);
        let bounded_by_workflow = deadlines.workflow_deadline <= task_deadline;
        let attempt_deadline = task_deadline.min(deadlines.workflow_deadline);
        let call = AssertUnwindSafe(handler.invoke(action, params, ctx)).catch_unwind();

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TaskError::Interrupted),
            result = tokio::time::timeout_at(attempt_deadline, call) => {
                match result {
                    Ok(Ok(Ok(output))) => Ok(output),
                    Ok(Ok(Err(err))) => Err(TaskError::Agent(err)),
                    Ok(Err(payload)) => {
                        let message = panic_message(&*payload);
                        error!(task = %ctx.task_name, "agent panicked: {message}");
                        Err(TaskError::Panicked(message))
                    }
                    Err(_) if bounded_by_workflow => {
                        Err(TaskError::ExecutionTimeout(deadlines.workflow_timeout_secs))
                    }
                    Err(_) => Err(TaskError::Timeout(deadlines.task_timeout)),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation, recovery, shutdown
    // -----------------------------------------------------------------------

    /// Request cancellation of an execution.
    ///
    /// Returns `false` when the execution is already terminal. A live run
    /// finishes its in-flight task and stops; an execution with no live run
    /// in this process is marked `cancelled` directly.
    #[instrument(skip(self))]
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        let execution = self.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            debug!(status = %execution.status, "execution already finished");
            return Ok(false);
        }

        let live = self.runs.get(&execution_id).map(|run| run.cancel.clone());
        if let Some(cancel) = live {
            cancel.cancel();
            info!("cancellation requested");
            return Ok(true);
        }

        self.close_orphan(&execution, ExecutionStatus::Cancelled, "cancelled").await
    }

    /// Fail every pending/running execution that has no live run in this
    /// process (left behind by a crash or restart). Returns their ids.
    #[instrument(skip(self))]
    pub async fn recover_interrupted(&self) -> Result<Vec<Uuid>, EngineError> {
        let mut recovered = Vec::new();
        for execution in executions::list_unfinished_executions(&self.pool).await? {
            if self.runs.contains_key(&execution.id) {
                continue;
            }
            let reason = "interrupted: the engine stopped before the execution finished";
            if self.close_orphan(&execution, ExecutionStatus::Failed, reason).await? {
                recovered.push(execution.id);
            }
        }

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "marked interrupted executions as failed");
        }
        Ok(recovered)
    }

    async fn close_orphan(
        &self,
        execution: &ExecutionRow,
        status: ExecutionStatus,
        reason: &str,
    ) -> Result<bool, EngineError> {
        for task in tasks::list_tasks_by_execution(&self.pool, execution.id).await? {
            if task.status.is_terminal() {
                continue;
            }
            match tasks::update_task(&self.pool, task.id, TaskUpdate::failed(reason)).await {
                Ok(_) | Err(DbError::ConstraintViolation(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let update = ExecutionUpdate::status(status).with_error(reason);
        match executions::update_execution_status(&self.pool, execution.id, update).await {
            Ok(row) => {
                info!(execution_id = %execution.id, status = %row.status, "closed execution without a live run");
                Ok(true)
            }
            Err(DbError::ConstraintViolation(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Cancel every live run, interrupting in-flight agent calls, and wait up
    /// to `grace` for them to persist their final state. New runs are refused
    /// from here on. Returns the number of runs still live.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.shutdown.cancel();
        info!(live = self.runs.len(), "engine shutting down");

        let drained = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.runs.is_empty() {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(grace, drained).await.is_err() {
            warn!(live = self.runs.len(), "shutdown grace period elapsed");
        }
        self.runs.len()
    }
}
