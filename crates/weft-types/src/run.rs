//! Run execution records and the append-only run event log.
//!
//! A `WorkflowRun` is never written directly: it is the fold of a run's
//! `RunEvent` sequence. Stores persist events; readers replay them. Replaying
//! the same sequence always yields the same run state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet scheduled.
    Pending,
    /// At least one step has been dispatched.
    Running,
    /// All non-skipped steps succeeded.
    Succeeded,
    /// A step failure escalated to run failure.
    Failed,
    /// Cancelled by an external request.
    Cancelled,
    /// No steps left to schedule, but at least one step is parked for human
    /// review. Resumable after intervention.
    PendingReview,
}

impl RunStatus {
    /// Terminal for automatic scheduling. `PendingReview` counts as terminal
    /// here; only an explicit resume restarts the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded
                | RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::PendingReview
        )
    }

    /// Terminal statuses a run can be resumed out of. Succeeded runs are
    /// sealed for good.
    pub fn can_resume(&self) -> bool {
        matches!(
            self,
            RunStatus::PendingReview | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::PendingReview => "pending_review",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a single step within a run.
///
/// Readiness is not a persisted status: a `Pending` step whose dependencies
/// are all satisfied is ready, and the scheduler derives that on the fly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting on dependencies (or on scheduling capacity).
    Pending,
    /// Dispatched to an agent.
    Running,
    /// Failed, waiting out the backoff delay before the next attempt.
    Retrying,
    /// Condition evaluated false, or an on-failure `skip` fired.
    Skipped,
    /// An upstream dependency failed the run; this step never ran.
    SkippedDueToFailure,
    /// Agent invocation returned a valid output.
    Succeeded,
    /// Failed with no recovery path.
    Failed,
    /// Failed and parked for human review; the run continues around it.
    FailedPendingReview,
    /// Cancelled while pending or in flight.
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Skipped
                | StepStatus::SkippedDueToFailure
                | StepStatus::Succeeded
                | StepStatus::Failed
                | StepStatus::FailedPendingReview
                | StepStatus::Cancelled
        )
    }

    /// Whether this status unblocks steps that depend on it. A skipped step
    /// satisfies its dependents; a failed one does not.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }

    /// Statuses a resume resets back to `Pending`. Successful and
    /// deliberately skipped steps keep their outcome across resumes.
    pub fn can_reset(&self) -> bool {
        matches!(
            self,
            StepStatus::Running
                | StepStatus::Retrying
                | StepStatus::Failed
                | StepStatus::FailedPendingReview
                | StepStatus::SkippedDueToFailure
                | StepStatus::Cancelled
        )
    }

    /// Legal transition check. Stores reject appends that would regress a
    /// step (e.g. terminal back to running).
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        match self {
            Pending => matches!(
                next,
                Running | Skipped | SkippedDueToFailure | Cancelled
            ),
            Running => matches!(
                next,
                Succeeded | Failed | FailedPendingReview | Retrying | Skipped | Cancelled
            ),
            Retrying => matches!(next, Running | Cancelled),
            // Terminal statuses admit no further transitions.
            Skipped | SkippedDueToFailure | Succeeded | Failed | FailedPendingReview
            | Cancelled => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Retrying => "retrying",
            StepStatus::Skipped => "skipped",
            StepStatus::SkippedDueToFailure => "skipped_due_to_failure",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::FailedPendingReview => "failed_pending_review",
            StepStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step state
// ---------------------------------------------------------------------------

/// Live state of a step within a run, as folded from the event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepState {
    pub status: StepStatus,
    /// 1-based number of the current invocation. 0 before the first
    /// dispatch; equal to the failure count when the step is retrying.
    #[serde(default)]
    pub attempt: u32,
    /// Message of the most recent failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Agent output, present once the step succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl StepState {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempt: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
            output: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Failure report
// ---------------------------------------------------------------------------

/// Structured record of the failure that ended a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureReport {
    /// Step whose failure terminated the run; `None` for run-level
    /// failures such as a run timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Error classification (e.g. "timeout", "invalid_input").
    pub error_kind: String,
    pub message: String,
    /// Total attempts made against the step, including fallback attempts.
    pub attempts: u32,
    /// On-failure actions that ran before the run failed.
    pub actions_tried: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run event log
// ---------------------------------------------------------------------------

/// One entry in a run's append-only event log.
///
/// Ordering within a run is the append order; stores must linearize
/// concurrent appends to the same run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// First event of every run. Carries the resolved inputs, the
    /// environment snapshot the run's expressions see, and the definition's
    /// step IDs so replay seeds a pending state for every step up front.
    RunCreated {
        run_id: Uuid,
        workflow: String,
        inputs: Value,
        env: Value,
        #[serde(default)]
        steps: Vec<String>,
        at: DateTime<Utc>,
    },
    /// Run-level status change. The failure report accompanies the
    /// transition to `Failed`.
    RunStatusChanged {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FailureReport>,
        at: DateTime<Utc>,
    },
    /// A step moved to a new state. Carries the full post-transition
    /// `StepState` so replay needs no out-of-band lookups.
    StepTransition {
        step_id: String,
        state: StepState,
        at: DateTime<Utc>,
    },
    /// A log line was emitted during the run.
    LogAppended { entry: RunLogEntry },
}

/// Severity of a run log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One line of a run's log stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunLogEntry {
    /// Monotonic sequence number within the run, assigned by the store.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Step the entry relates to, if any; run-level entries carry `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Workflow run (replayed state)
// ---------------------------------------------------------------------------

/// Materialized state of a workflow run, produced by folding its event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    /// Name of the workflow definition this run executes.
    pub workflow: String,
    pub status: RunStatus,
    /// Expression scope object: `{ inputs, env, steps: { id: { output } },
    /// workflow: { name, run_id } }`. Step outputs are merged in as steps
    /// succeed.
    pub variables: Value,
    pub step_states: BTreeMap<String, StepState>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure report, set when the run ends `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReport>,
}

impl WorkflowRun {
    /// Fold an event sequence into run state. Returns `None` for an empty
    /// sequence or one that does not begin with `RunCreated`.
    pub fn replay(events: &[RunEvent]) -> Option<Self> {
        let mut iter = events.iter();
        let mut run = match iter.next()? {
            RunEvent::RunCreated {
                run_id,
                workflow,
                inputs,
                env,
                steps,
                at,
            } => WorkflowRun {
                run_id: *run_id,
                workflow: workflow.clone(),
                status: RunStatus::Pending,
                variables: json!({
                    "inputs": inputs,
                    "env": env,
                    "steps": {},
                    "workflow": {
                        "name": workflow,
                        "run_id": run_id.to_string(),
                    },
                }),
                // Every declared step is visible from the start, so status
                // reports cover steps that never dispatched.
                step_states: steps
                    .iter()
                    .map(|id| (id.clone(), StepState::pending()))
                    .collect(),
                started_at: *at,
                ended_at: None,
                error: None,
            },
            _ => return None,
        };
        for event in iter {
            run.apply(event);
        }
        Some(run)
    }

    /// Apply a single event to this run state.
    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::RunCreated { .. } => {
                // Only valid as the first event; replay handles it.
            }
            RunEvent::RunStatusChanged { status, error, at } => {
                self.status = *status;
                if status.is_terminal() {
                    self.ended_at = Some(*at);
                }
                if let Some(report) = error {
                    self.error = Some(report.clone());
                }
            }
            RunEvent::StepTransition { step_id, state, .. } => {
                if state.status == StepStatus::Succeeded {
                    if let Some(output) = &state.output {
                        self.merge_step_output(step_id, output.clone());
                    }
                }
                self.step_states.insert(step_id.clone(), state.clone());
            }
            RunEvent::LogAppended { .. } => {
                // Log entries do not alter run state.
            }
        }
    }

    /// Merge a succeeded step's output into the expression scope under
    /// `steps.<id>.output`.
    fn merge_step_output(&mut self, step_id: &str, output: Value) {
        if let Some(steps) = self
            .variables
            .get_mut("steps")
            .and_then(Value::as_object_mut)
        {
            let mut entry = Map::new();
            entry.insert("output".to_string(), output);
            steps.insert(step_id.to_string(), Value::Object(entry));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
