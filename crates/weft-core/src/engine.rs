//! Event-driven run scheduler.
//!
//! One `Driver` owns a run from start to terminal status. It keeps the live
//! step states in memory, recomputes the ready-set after every transition,
//! and pushes agent invocations into a `JoinSet` so independent branches
//! overlap freely. Every state change is appended to the run store before
//! the local copy is updated; crash recovery replays the log and resumes.
//!
//! Failure handling is delegated to `policy`: the driver records the
//! decision's side effects (retry sleeps, fallback re-dispatch, cascade
//! skips, run failure) but never decides on its own.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use weft_types::error::StoreError;
use weft_types::run::{
    FailureReport, LogLevel, RunEvent, RunLogEntry, RunStatus, StepState, StepStatus,
};
use weft_types::workflow::{RunLimits, StepDefinition, WorkflowDefinition};

use crate::context::RunContext;
use crate::dag::StepGraph;
use crate::definition::{self, ValidationError};
use crate::dispatch::{AgentDispatcher, DispatchError};
use crate::expr::{self, EvalError};
use crate::policy::{self, Decision, StepFailure};
use crate::store::RunStore;

/// Step timeout applied when the definition does not set one.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run {0} is already being driven")]
    AlreadyRunning(Uuid),

    #[error("run {0} cannot be resumed from status {1}")]
    NotResumable(Uuid, RunStatus),

    #[error("scheduler invariant violated: {0}")]
    InvariantViolation(String),
}

/// Result of a driven run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Final expression scope, including all succeeded step outputs.
    pub variables: Value,
    pub error: Option<FailureReport>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Workflow run engine. Cheap to share behind an `Arc`; one engine drives
/// any number of concurrent runs.
pub struct Engine<S, D> {
    store: Arc<S>,
    dispatcher: Arc<D>,
    limits: RunLimits,
    /// Environment snapshot exposed to expressions as `env`.
    env: Value,
    cancel_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: RunStore, D: AgentDispatcher> Engine<S, D> {
    pub fn new(store: Arc<S>, dispatcher: Arc<D>, limits: RunLimits) -> Self {
        Self {
            store,
            dispatcher,
            limits,
            env: json!({}),
            cancel_tokens: DashMap::new(),
        }
    }

    pub fn with_env(mut self, env: Value) -> Self {
        self.env = env;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Start a run and drive it to a terminal status.
    pub async fn execute(
        self: &Arc<Self>,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<RunOutcome, EngineError> {
        let run_id = self.create_run(definition, inputs).await?;
        let driver = Driver::new(Arc::clone(self), Arc::new(definition.clone()), run_id).await?;
        driver.run().await
    }

    /// Start a run in the background and return its ID immediately.
    pub async fn start_run(
        self: &Arc<Self>,
        definition: Arc<WorkflowDefinition>,
        inputs: Map<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let run_id = self.create_run(&definition, inputs).await?;
        let driver = Driver::new(Arc::clone(self), definition, run_id).await?;
        tokio::spawn(async move {
            if let Err(err) = driver.run().await {
                error!(run_id = %run_id, error = %err, "run driver failed");
            }
        });
        Ok(run_id)
    }

    /// Request cancellation of a running run. Steps in flight are signalled
    /// and the run settles as `Cancelled`.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        match self.cancel_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(EngineError::RunNotFound(run_id)),
        }
    }

    /// Resume a parked or failed run: successful and skipped steps keep
    /// their outcomes, everything else is reset to pending and the run is
    /// driven again.
    pub async fn resume(
        self: &Arc<Self>,
        run_id: Uuid,
        definition: Arc<WorkflowDefinition>,
    ) -> Result<RunOutcome, EngineError> {
        let run = self.store.get_run(run_id).await?;
        let resumable = matches!(run.status, RunStatus::Pending | RunStatus::Running)
            || run.status.can_resume();
        if !resumable {
            return Err(EngineError::NotResumable(run_id, run.status));
        }

        for (step_id, state) in &run.step_states {
            if state.status.can_reset() {
                self.store
                    .append(
                        run_id,
                        RunEvent::StepTransition {
                            step_id: step_id.clone(),
                            state: StepState::pending(),
                            at: Utc::now(),
                        },
                    )
                    .await?;
            }
        }
        if run.status.can_resume() {
            self.store
                .append(
                    run_id,
                    RunEvent::RunStatusChanged {
                        status: RunStatus::Running,
                        error: None,
                        at: Utc::now(),
                    },
                )
                .await?;
        }
        info!(run_id = %run_id, from = %run.status, "run resumed");

        let driver = Driver::new(Arc::clone(self), definition, run_id).await?;
        driver.run().await
    }

    async fn create_run(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<Uuid, EngineError> {
        definition::validate_definition(definition)?;
        let resolved = definition::resolve_inputs(definition, &inputs)?;
        let run_id = Uuid::now_v7();
        self.store
            .create_run(RunEvent::RunCreated {
                run_id,
                workflow: definition.name.clone(),
                inputs: resolved,
                env: self.env.clone(),
                steps: definition.steps.iter().map(|s| s.id.clone()).collect(),
                at: Utc::now(),
            })
            .await?;
        info!(run_id = %run_id, workflow = %definition.name, "run created");
        Ok(run_id)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum LoopEvent {
    Finished {
        step_id: String,
        attempt: u32,
        outcome: Result<Value, StepFailure>,
    },
    RetryDue {
        step_id: String,
    },
}

enum Prepared {
    Single(Value),
    FanOut {
        inputs: Vec<Value>,
        worker_count: usize,
    },
}

struct Driver<S: RunStore, D: AgentDispatcher> {
    engine: Arc<Engine<S, D>>,
    def: Arc<WorkflowDefinition>,
    graph: StepGraph,
    run_id: Uuid,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    ctx: RunContext,
    states: BTreeMap<String, StepState>,
    tasks: JoinSet<LoopEvent>,
    used_fallbacks: BTreeMap<String, BTreeSet<String>>,
    agent_override: BTreeMap<String, String>,
    actions_tried: BTreeMap<String, Vec<String>>,
    total_attempts: BTreeMap<String, u32>,
    failing: Option<FailureReport>,
    timed_out: bool,
}

impl<S: RunStore, D: AgentDispatcher> Driver<S, D> {
    async fn new(
        engine: Arc<Engine<S, D>>,
        def: Arc<WorkflowDefinition>,
        run_id: Uuid,
    ) -> Result<Self, EngineError> {
        let graph = StepGraph::build(&def)?;
        let run = engine.store.get_run(run_id).await?;

        let mut ctx = RunContext::new(
            &run.workflow,
            run_id,
            run.variables["inputs"].clone(),
            run.variables["env"].clone(),
        );
        let mut states = BTreeMap::new();
        for step in &def.steps {
            let state = run
                .step_states
                .get(&step.id)
                .cloned()
                .unwrap_or_else(StepState::pending);
            if state.status == StepStatus::Succeeded {
                if let Some(output) = &state.output {
                    ctx.record_output(&step.id, output.clone())
                        .map_err(|err| EngineError::InvariantViolation(err.to_string()))?;
                }
            }
            states.insert(step.id.clone(), state);
        }

        let cap = match (
            engine.limits.max_concurrent_steps,
            def.resources.max_concurrent_steps,
        ) {
            (Some(a), Some(b)) => Some(a.min(b as usize)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b as usize),
            (None, None) => None,
        };
        let semaphore = Arc::new(Semaphore::new(cap.unwrap_or(Semaphore::MAX_PERMITS)));

        let cancel = match engine.cancel_tokens.entry(run_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::AlreadyRunning(run_id));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let token = CancellationToken::new();
                vacant.insert(token.clone());
                token
            }
        };

        Ok(Self {
            engine,
            def,
            graph,
            run_id,
            cancel,
            semaphore,
            ctx,
            states,
            tasks: JoinSet::new(),
            used_fallbacks: BTreeMap::new(),
            agent_override: BTreeMap::new(),
            actions_tried: BTreeMap::new(),
            total_attempts: BTreeMap::new(),
            failing: None,
            timed_out: false,
        })
    }

    async fn run(mut self) -> Result<RunOutcome, EngineError> {
        let result = self.drive().await;
        self.engine.cancel_tokens.remove(&self.run_id);
        result
    }

    async fn drive(&mut self) -> Result<RunOutcome, EngineError> {
        let snapshot = self.engine.store.get_run(self.run_id).await?;
        if snapshot.status != RunStatus::Running {
            self.engine
                .store
                .append(
                    self.run_id,
                    RunEvent::RunStatusChanged {
                        status: RunStatus::Running,
                        error: None,
                        at: Utc::now(),
                    },
                )
                .await?;
        }
        info!(run_id = %self.run_id, workflow = %self.def.name, "run started");
        self.log(
            None,
            LogLevel::Info,
            format!("run started for workflow '{}'", self.def.name),
        )
        .await?;

        let budget = Duration::from_secs(self.engine.limits.run_timeout_secs);
        let looped = tokio::time::timeout(budget, self.event_loop()).await;
        match looped {
            Ok(result) => result?,
            Err(_) => {
                self.timed_out = true;
                self.cancel.cancel();
                warn!(run_id = %self.run_id, timeout_secs = budget.as_secs(), "run timed out");
                self.log(
                    None,
                    LogLevel::Error,
                    format!("run exceeded timeout of {}s", budget.as_secs()),
                )
                .await?;
                self.tasks.shutdown().await;
            }
        }
        self.finalize().await
    }

    async fn event_loop(&mut self) -> Result<(), EngineError> {
        loop {
            if self.should_schedule() {
                self.schedule_ready().await?;
            }
            let Some(joined) = self.tasks.join_next().await else {
                return Ok(());
            };
            match joined {
                Ok(event) => self.handle_event(event).await?,
                Err(err) if err.is_panic() => {
                    error!(run_id = %self.run_id, "step task panicked");
                    self.failing.get_or_insert(FailureReport {
                        step_id: None,
                        error_kind: "internal".to_string(),
                        message: "step task panicked".to_string(),
                        attempts: 0,
                        actions_tried: Vec::new(),
                        timestamp: Utc::now(),
                    });
                    self.cancel.cancel();
                }
                Err(_) => {}
            }
        }
    }

    fn should_schedule(&self) -> bool {
        !self.cancel.is_cancelled() && self.failing.is_none() && !self.timed_out
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Dispatch everything ready, re-deriving the ready-set until it is
    /// empty. Conditional skips made here can unblock further steps within
    /// the same pass.
    async fn schedule_ready(&mut self) -> Result<(), EngineError> {
        loop {
            if !self.should_schedule() {
                return Ok(());
            }
            let ready = self.graph.ready_steps(&self.states);
            if ready.is_empty() {
                return Ok(());
            }
            for step_id in ready {
                if !self.should_schedule() {
                    return Ok(());
                }
                self.schedule_step(&step_id).await?;
            }
        }
    }

    async fn schedule_step(&mut self, step_id: &str) -> Result<(), EngineError> {
        // A failure cascade earlier in the same pass may have already moved
        // this step out of pending.
        if self.state(step_id)?.status != StepStatus::Pending {
            return Ok(());
        }
        let step = self.step_def(step_id)?.clone();

        let deps_satisfied = self.graph.dependencies(step_id).iter().all(|dep| {
            self.states
                .get(dep)
                .is_some_and(|s| s.status.satisfies_dependents())
        });
        if !deps_satisfied {
            return Err(EngineError::InvariantViolation(format!(
                "step '{step_id}' scheduled before its dependencies completed"
            )));
        }

        // Conditions are evaluated lazily, only once dependencies are in.
        if let Some(condition) = &step.condition {
            match expr::eval_condition(condition, &self.ctx.scope()) {
                Ok(true) => {}
                Ok(false) => {
                    self.transition(step_id, |s| {
                        s.status = StepStatus::Skipped;
                        s.finished_at = Some(Utc::now());
                    })
                    .await?;
                    debug!(run_id = %self.run_id, step = %step_id, "condition false, step skipped");
                    self.log(
                        Some(step_id),
                        LogLevel::Info,
                        format!("step '{step_id}' skipped: condition evaluated to false"),
                    )
                    .await?;
                    return Ok(());
                }
                Err(err) => {
                    self.begin_attempt(&step).await?;
                    return self.handle_failure(&step, StepFailure::Expr(err)).await;
                }
            }
        }

        self.dispatch(&step).await
    }

    async fn dispatch(&mut self, step: &StepDefinition) -> Result<(), EngineError> {
        let attempt = self.begin_attempt(step).await?;
        match self.prepare_invocation(step) {
            Ok(prepared) => {
                self.spawn_invocation(step, attempt, prepared);
                Ok(())
            }
            Err(failure) => self.handle_failure(step, failure).await,
        }
    }

    /// Record the start of one invocation: `Running` transition with a
    /// bumped attempt counter.
    async fn begin_attempt(&mut self, step: &StepDefinition) -> Result<u32, EngineError> {
        let attempt = self.state(&step.id)?.attempt + 1;
        let agent = self.agent_for(step);
        self.transition(&step.id, |s| {
            s.status = StepStatus::Running;
            s.attempt = attempt;
            s.started_at = Some(Utc::now());
            s.last_error = None;
        })
        .await?;
        *self.total_attempts.entry(step.id.clone()).or_insert(0) += 1;
        debug!(run_id = %self.run_id, step = %step.id, agent = %agent, attempt, "step dispatched");
        self.log(
            Some(&step.id),
            LogLevel::Info,
            format!("step '{}' started (attempt {attempt}, agent '{agent}')", step.id),
        )
        .await?;
        Ok(attempt)
    }

    /// Resolve everything the invocation needs from the current scope.
    fn prepare_invocation(&self, step: &StepDefinition) -> Result<Prepared, StepFailure> {
        match &step.parallel {
            Some(parallel) => {
                let items = expr::interpolate(&parallel.items, &self.ctx.scope())
                    .map_err(StepFailure::Expr)?;
                let Value::Array(items) = items else {
                    return Err(StepFailure::Expr(EvalError::TypeMismatch {
                        expected: "array for parallel items".to_string(),
                        found: value_type_name(&items).to_string(),
                    }));
                };
                let mut inputs = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let scope = self.ctx.scope_with_item(item, index);
                    inputs.push(resolve_input_map(&step.input, &scope)?);
                }
                Ok(Prepared::FanOut {
                    inputs,
                    worker_count: parallel.worker_count as usize,
                })
            }
            None => Ok(Prepared::Single(resolve_input_map(
                &step.input,
                &self.ctx.scope(),
            )?)),
        }
    }

    fn spawn_invocation(&mut self, step: &StepDefinition, attempt: u32, prepared: Prepared) {
        let dispatcher = Arc::clone(&self.engine.dispatcher);
        let semaphore = Arc::clone(&self.semaphore);
        let cancel = self.cancel.clone();
        let step_id = step.id.clone();
        let agent = self.agent_for(step);
        let timeout =
            Duration::from_secs(step.timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS));

        match prepared {
            Prepared::Single(input) => {
                self.tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let outcome =
                        invoke_with_limits(dispatcher.as_ref(), &agent, input, timeout, &cancel)
                            .await;
                    LoopEvent::Finished {
                        step_id,
                        attempt,
                        outcome: outcome.map_err(StepFailure::Dispatch),
                    }
                });
            }
            Prepared::FanOut {
                inputs,
                worker_count,
            } => {
                self.tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    // The step timeout bounds the fan-out's total wall
                    // clock; queued items do not extend the budget.
                    let fanned = tokio::time::timeout(
                        timeout,
                        run_fan_out(
                            dispatcher,
                            agent.clone(),
                            inputs,
                            worker_count,
                            timeout,
                            cancel,
                        ),
                    )
                    .await;
                    let outcome = match fanned {
                        Ok(outcome) => outcome,
                        Err(_) => Err(StepFailure::Dispatch(DispatchError::Timeout(agent))),
                    };
                    LoopEvent::Finished {
                        step_id,
                        attempt,
                        outcome,
                    }
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    async fn handle_event(&mut self, event: LoopEvent) -> Result<(), EngineError> {
        match event {
            LoopEvent::RetryDue { step_id } => {
                if !self.should_schedule() {
                    return Ok(());
                }
                let step = self.step_def(&step_id)?.clone();
                self.dispatch(&step).await
            }
            LoopEvent::Finished {
                step_id,
                attempt,
                outcome,
            } => {
                if self.state(&step_id)?.status != StepStatus::Running {
                    // Stale completion (e.g. step already cancelled).
                    return Ok(());
                }
                let step = self.step_def(&step_id)?.clone();
                match outcome {
                    Ok(output) => match self.ctx.record_output(&step_id, output.clone()) {
                        Ok(()) => {
                            self.transition(&step_id, |s| {
                                s.status = StepStatus::Succeeded;
                                s.finished_at = Some(Utc::now());
                                s.output = Some(output);
                            })
                            .await?;
                            debug!(run_id = %self.run_id, step = %step_id, attempt, "step succeeded");
                            self.log(
                                Some(&step_id),
                                LogLevel::Info,
                                format!("step '{step_id}' succeeded (attempt {attempt})"),
                            )
                            .await
                        }
                        Err(err) => {
                            self.handle_failure(&step, StepFailure::Output(err.to_string()))
                                .await
                        }
                    },
                    Err(StepFailure::Dispatch(DispatchError::Cancelled)) => {
                        self.transition(&step_id, |s| {
                            s.status = StepStatus::Cancelled;
                            s.finished_at = Some(Utc::now());
                        })
                        .await
                    }
                    Err(failure) => self.handle_failure(&step, failure).await,
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    async fn handle_failure(
        &mut self,
        step: &StepDefinition,
        mut failure: StepFailure,
    ) -> Result<(), EngineError> {
        let step_policy = policy::effective_policy(step, &self.def);
        loop {
            let attempt = self.state(&step.id)?.attempt;
            let used = self
                .used_fallbacks
                .get(&step.id)
                .cloned()
                .unwrap_or_default();
            let outcome = policy::decide(&step_policy, &failure, attempt, &used);
            let message = failure.message();

            self.actions_tried
                .entry(step.id.clone())
                .or_default()
                .extend(outcome.actions.iter().cloned());
            for action in &outcome.actions {
                match action.as_str() {
                    "log" => {
                        self.log(
                            Some(&step.id),
                            LogLevel::Error,
                            format!("step '{}' failed: {message}", step.id),
                        )
                        .await?;
                    }
                    "notify" => {
                        warn!(
                            run_id = %self.run_id,
                            step = %step.id,
                            error = %message,
                            "step failure notification"
                        );
                        self.log(
                            Some(&step.id),
                            LogLevel::Warn,
                            format!("notification emitted for step '{}'", step.id),
                        )
                        .await?;
                    }
                    _ => {}
                }
            }

            match outcome.decision {
                Decision::Retry { delay } => {
                    self.transition(&step.id, |s| {
                        s.status = StepStatus::Retrying;
                        s.last_error = Some(message.clone());
                    })
                    .await?;
                    self.log(
                        Some(&step.id),
                        LogLevel::Warn,
                        format!(
                            "step '{}' failed (attempt {attempt}): {message}; retrying in {}s",
                            step.id,
                            delay.as_secs()
                        ),
                    )
                    .await?;
                    let step_id = step.id.clone();
                    let cancel = self.cancel.clone();
                    self.tasks.spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(delay) => {}
                        }
                        LoopEvent::RetryDue { step_id }
                    });
                    return Ok(());
                }
                Decision::Fallback { agent } => {
                    self.used_fallbacks
                        .entry(step.id.clone())
                        .or_default()
                        .insert(agent.clone());
                    self.agent_override.insert(step.id.clone(), agent.clone());
                    self.log(
                        Some(&step.id),
                        LogLevel::Warn,
                        format!("step '{}' falling back to agent '{agent}'", step.id),
                    )
                    .await?;
                    // The fallback agent gets a fresh attempt sequence.
                    if let Some(state) = self.states.get_mut(&step.id) {
                        state.attempt = 0;
                    }
                    let next_attempt = self.begin_attempt(step).await?;
                    match self.prepare_invocation(step) {
                        Ok(prepared) => {
                            self.spawn_invocation(step, next_attempt, prepared);
                            return Ok(());
                        }
                        Err(next_failure) => {
                            failure = next_failure;
                            continue;
                        }
                    }
                }
                Decision::Skip => {
                    self.transition(&step.id, |s| {
                        s.status = StepStatus::Skipped;
                        s.finished_at = Some(Utc::now());
                        s.last_error = Some(message.clone());
                    })
                    .await?;
                    self.log(
                        Some(&step.id),
                        LogLevel::Warn,
                        format!("step '{}' skipped after failure", step.id),
                    )
                    .await?;
                    return Ok(());
                }
                Decision::Escalate => {
                    self.transition(&step.id, |s| {
                        s.status = StepStatus::FailedPendingReview;
                        s.finished_at = Some(Utc::now());
                        s.last_error = Some(message.clone());
                    })
                    .await?;
                    warn!(run_id = %self.run_id, step = %step.id, "step escalated for human review");
                    self.log(
                        Some(&step.id),
                        LogLevel::Warn,
                        format!("step '{}' escalated for human review", step.id),
                    )
                    .await?;
                    return Ok(());
                }
                Decision::FailRun => {
                    self.transition(&step.id, |s| {
                        s.status = StepStatus::Failed;
                        s.finished_at = Some(Utc::now());
                        s.last_error = Some(message.clone());
                    })
                    .await?;
                    self.log(
                        Some(&step.id),
                        LogLevel::Error,
                        format!("step '{}' failed permanently; failing run", step.id),
                    )
                    .await?;
                    self.fail_run_from(step, &failure).await?;
                    return Ok(());
                }
            }
        }
    }

    /// A step failure became a run failure: cascade-skip everything
    /// downstream and signal in-flight work to stop.
    async fn fail_run_from(
        &mut self,
        step: &StepDefinition,
        failure: &StepFailure,
    ) -> Result<(), EngineError> {
        for dep_id in self.graph.transitive_dependents(&step.id) {
            if self.state(&dep_id)?.status == StepStatus::Pending {
                self.transition(&dep_id, |s| {
                    s.status = StepStatus::SkippedDueToFailure;
                    s.finished_at = Some(Utc::now());
                })
                .await?;
                self.log(
                    Some(&dep_id),
                    LogLevel::Warn,
                    format!("step '{dep_id}' skipped: upstream step '{}' failed", step.id),
                )
                .await?;
            }
        }
        self.failing = Some(FailureReport {
            step_id: Some(step.id.clone()),
            error_kind: failure.kind().to_string(),
            message: failure.message(),
            attempts: self.total_attempts.get(&step.id).copied().unwrap_or(0),
            actions_tried: self
                .actions_tried
                .get(&step.id)
                .cloned()
                .unwrap_or_default(),
            timestamp: Utc::now(),
        });
        self.cancel.cancel();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    async fn finalize(&mut self) -> Result<RunOutcome, EngineError> {
        // The store snapshot is the source of truth here: the event loop
        // may have been cut short mid-update by the run timeout.
        let snapshot = self.engine.store.get_run(self.run_id).await?;

        let (status, error) = if self.failing.is_some() {
            (RunStatus::Failed, self.failing.clone())
        } else if self.timed_out {
            (
                RunStatus::Failed,
                Some(FailureReport {
                    step_id: None,
                    error_kind: "run_timeout".to_string(),
                    message: format!(
                        "run exceeded timeout of {}s",
                        self.engine.limits.run_timeout_secs
                    ),
                    attempts: 0,
                    actions_tried: Vec::new(),
                    timestamp: Utc::now(),
                }),
            )
        } else if self.cancel.is_cancelled() {
            (RunStatus::Cancelled, None)
        } else if snapshot
            .step_states
            .values()
            .any(|s| s.status == StepStatus::FailedPendingReview)
        {
            (RunStatus::PendingReview, None)
        } else {
            (RunStatus::Succeeded, None)
        };

        // Close out anything the run leaves behind. A pending-review run
        // keeps its blocked steps pending for the eventual resume.
        if matches!(status, RunStatus::Failed | RunStatus::Cancelled) {
            for step in &self.def.steps {
                let current = snapshot
                    .step_states
                    .get(&step.id)
                    .cloned()
                    .unwrap_or_else(StepState::pending);
                if !current.status.is_terminal() {
                    let mut state = current;
                    state.status = StepStatus::Cancelled;
                    state.finished_at = Some(Utc::now());
                    self.engine
                        .store
                        .append(
                            self.run_id,
                            RunEvent::StepTransition {
                                step_id: step.id.clone(),
                                state,
                                at: Utc::now(),
                            },
                        )
                        .await?;
                }
            }
        }

        self.log(None, LogLevel::Info, format!("run finished: {status}"))
            .await?;
        self.engine
            .store
            .append(
                self.run_id,
                RunEvent::RunStatusChanged {
                    status,
                    error: error.clone(),
                    at: Utc::now(),
                },
            )
            .await?;
        info!(run_id = %self.run_id, status = %status, "run finished");

        let run = self.engine.store.get_run(self.run_id).await?;
        Ok(RunOutcome {
            run_id: self.run_id,
            status: run.status,
            variables: run.variables,
            error: run.error,
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn step_def(&self, step_id: &str) -> Result<&StepDefinition, EngineError> {
        self.def
            .steps
            .iter()
            .find(|s| s.id == step_id)
            .ok_or_else(|| EngineError::InvariantViolation(format!("unknown step '{step_id}'")))
    }

    fn state(&self, step_id: &str) -> Result<&StepState, EngineError> {
        self.states
            .get(step_id)
            .ok_or_else(|| EngineError::InvariantViolation(format!("unknown step '{step_id}'")))
    }

    fn agent_for(&self, step: &StepDefinition) -> String {
        self.agent_override
            .get(&step.id)
            .cloned()
            .unwrap_or_else(|| step.agent.clone())
    }

    /// Record a step transition: store first, local state second.
    async fn transition(
        &mut self,
        step_id: &str,
        mutate: impl FnOnce(&mut StepState),
    ) -> Result<(), EngineError> {
        let mut state = self.state(step_id)?.clone();
        mutate(&mut state);
        self.engine
            .store
            .append(
                self.run_id,
                RunEvent::StepTransition {
                    step_id: step_id.to_string(),
                    state: state.clone(),
                    at: Utc::now(),
                },
            )
            .await?;
        self.states.insert(step_id.to_string(), state);
        Ok(())
    }

    async fn log(
        &self,
        step_id: Option<&str>,
        level: LogLevel,
        message: String,
    ) -> Result<(), EngineError> {
        self.engine
            .store
            .append(
                self.run_id,
                RunEvent::LogAppended {
                    entry: RunLogEntry {
                        seq: 0, // assigned by the store
                        timestamp: Utc::now(),
                        step_id: step_id.map(str::to_string),
                        level,
                        message,
                    },
                },
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Invocation plumbing
// ---------------------------------------------------------------------------

fn resolve_input_map(
    templates: &BTreeMap<String, String>,
    scope: &Value,
) -> Result<Value, StepFailure> {
    let mut out = Map::new();
    for (param, template) in templates {
        let value = expr::interpolate(template, scope).map_err(StepFailure::Expr)?;
        out.insert(param.clone(), value);
    }
    Ok(Value::Object(out))
}

async fn invoke_with_limits<D: AgentDispatcher>(
    dispatcher: &D,
    agent: &str,
    input: Value,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Value, DispatchError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        result = tokio::time::timeout(timeout, dispatcher.invoke(agent, input, cancel.clone())) => {
            match result {
                Ok(inner) => inner,
                Err(_) => Err(DispatchError::Timeout(agent.to_string())),
            }
        }
    }
}

/// Run a fan-out step: one invocation per item, capped at `worker_count`
/// in flight, results in item order. Any item failure fails the whole
/// fan-out (the earliest item's error wins for determinism).
async fn run_fan_out<D: AgentDispatcher>(
    dispatcher: Arc<D>,
    agent: String,
    inputs: Vec<Value>,
    worker_count: usize,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<Value, StepFailure> {
    let total = inputs.len();
    let workers = Arc::new(Semaphore::new(worker_count));
    let mut items: JoinSet<(usize, Result<Value, DispatchError>)> = JoinSet::new();

    for (index, input) in inputs.into_iter().enumerate() {
        let dispatcher = Arc::clone(&dispatcher);
        let workers = Arc::clone(&workers);
        let cancel = cancel.clone();
        let agent = agent.clone();
        items.spawn(async move {
            let _permit = workers.acquire_owned().await.ok();
            let result =
                invoke_with_limits(dispatcher.as_ref(), &agent, input, timeout, &cancel).await;
            (index, result)
        });
    }

    let mut outputs: Vec<Option<Value>> = (0..total).map(|_| None).collect();
    let mut failure: Option<(usize, DispatchError)> = None;
    while let Some(joined) = items.join_next().await {
        match joined {
            Ok((index, Ok(value))) => outputs[index] = Some(value),
            Ok((index, Err(err))) => {
                if failure.as_ref().map_or(true, |(i, _)| index < *i) {
                    failure = Some((index, err));
                }
            }
            Err(_) => {
                failure.get_or_insert((
                    usize::MAX,
                    DispatchError::Transient("fan-out worker failed".to_string()),
                ));
            }
        }
    }

    match failure {
        Some((_, err)) => Err(StepFailure::Dispatch(err)),
        None => Ok(Value::Array(outputs.into_iter().flatten().collect())),
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse_workflow_yaml;
    use crate::store::MemoryRunStore;

    /// Echoes the resolved input back as the step output.
    struct EchoDispatcher;

    impl AgentDispatcher for EchoDispatcher {
        async fn invoke(
            &self,
            _agent: &str,
            input: Value,
            _cancel: CancellationToken,
        ) -> Result<Value, DispatchError> {
            Ok(input)
        }
    }

    /// Sleeps longer than any test timeout.
    struct SlowDispatcher;

    impl AgentDispatcher for SlowDispatcher {
        async fn invoke(
            &self,
            _agent: &str,
            _input: Value,
            cancel: CancellationToken,
        ) -> Result<Value, DispatchError> {
            tokio::select! {
                _ = cancel.cancelled() => Err(DispatchError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(json!({})),
            }
        }
    }

    fn engine_with<D: AgentDispatcher>(
        dispatcher: D,
        limits: RunLimits,
    ) -> Arc<Engine<MemoryRunStore, D>> {
        Arc::new(Engine::new(
            Arc::new(MemoryRunStore::new()),
            Arc::new(dispatcher),
            limits,
        ))
    }

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_execute_linear_workflow() {
        let def = parse_workflow_yaml(
            r#"
name: linear
version: "1.0"
inputs:
  topic:
    type: string
    required: true
steps:
  - id: fetch
    agent: researcher
    input:
      topic: "${{ inputs.topic }}"
  - id: report
    agent: writer
    depends_on: [fetch]
    input:
      upstream: "${{ steps.fetch.output.topic }}"
"#,
        )
        .unwrap();
        let engine = engine_with(EchoDispatcher, RunLimits::default());

        let outcome = engine
            .execute(&def, inputs(json!({"topic": "rust"})))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert!(outcome.error.is_none());
        // The writer step saw the fetch step's echoed output.
        assert_eq!(
            outcome.variables["steps"]["report"]["output"]["upstream"],
            json!("rust")
        );

        let run = engine.store().get_run(outcome.run_id).await.unwrap();
        assert_eq!(run.step_states["fetch"].status, StepStatus::Succeeded);
        assert_eq!(run.step_states["report"].status, StepStatus::Succeeded);
        assert_eq!(run.step_states["fetch"].attempt, 1);
    }

    #[tokio::test]
    async fn test_condition_false_skips_step() {
        let def = parse_workflow_yaml(
            r#"
name: conditional
version: "1.0"
inputs:
  go:
    type: boolean
    required: true
steps:
  - id: gate
    agent: echo
    input:
      go: "${{ inputs.go }}"
  - id: guarded
    agent: echo
    depends_on: [gate]
    condition: "steps.gate.output.go == true"
  - id: after
    agent: echo
    depends_on: [guarded]
"#,
        )
        .unwrap();
        let engine = engine_with(EchoDispatcher, RunLimits::default());

        let outcome = engine
            .execute(&def, inputs(json!({"go": false})))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);

        let run = engine.store().get_run(outcome.run_id).await.unwrap();
        assert_eq!(run.step_states["guarded"].status, StepStatus::Skipped);
        // A skipped dependency still unblocks downstream steps.
        assert_eq!(run.step_states["after"].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_missing_required_input_is_rejected() {
        let def = parse_workflow_yaml(
            "name: strict\nversion: \"1.0\"\ninputs:\n  topic:\n    type: string\n    required: true\nsteps:\n  - id: a\n    agent: x\n",
        )
        .unwrap();
        let engine = engine_with(EchoDispatcher, RunLimits::default());
        let err = engine.execute(&def, Map::new()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::MissingInput(_))
        ));
    }

    #[tokio::test]
    async fn test_run_timeout_fails_run() {
        let def = parse_workflow_yaml(
            "name: slow\nversion: \"1.0\"\nsteps:\n  - id: a\n    agent: sleeper\n",
        )
        .unwrap();
        let engine = engine_with(
            SlowDispatcher,
            RunLimits {
                max_concurrent_steps: None,
                run_timeout_secs: 1,
            },
        );
        let outcome = engine.execute(&def, Map::new()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        let report = outcome.error.unwrap();
        assert_eq!(report.error_kind, "run_timeout");
        assert_eq!(report.step_id, None);

        let run = engine.store().get_run(outcome.run_id).await.unwrap();
        assert_eq!(run.step_states["a"].status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let engine = engine_with(EchoDispatcher, RunLimits::default());
        let err = engine.cancel(Uuid::now_v7()).unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_running_run() {
        let def = Arc::new(
            parse_workflow_yaml(
                "name: cancellable\nversion: \"1.0\"\nsteps:\n  - id: a\n    agent: sleeper\n",
            )
            .unwrap(),
        );
        let engine = engine_with(SlowDispatcher, RunLimits::default());
        let run_id = engine.start_run(Arc::clone(&def), Map::new()).await.unwrap();

        // Give the driver a moment to dispatch.
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.cancel(run_id).unwrap();

        // Wait for the driver to settle.
        let mut status = RunStatus::Running;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = engine.store().get_run(run_id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
        }
        assert_eq!(status, RunStatus::Cancelled);

        let run = engine.store().get_run(run_id).await.unwrap();
        assert_eq!(run.step_states["a"].status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_resume_succeeded_run_is_rejected() {
        let def = parse_workflow_yaml(
            "name: oneshot\nversion: \"1.0\"\nsteps:\n  - id: a\n    agent: echo\n",
        )
        .unwrap();
        let engine = engine_with(EchoDispatcher, RunLimits::default());
        let outcome = engine.execute(&def, Map::new()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);

        let err = engine
            .resume(outcome.run_id, Arc::new(def))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::NotResumable(_, RunStatus::Succeeded)
        ));
    }
}
