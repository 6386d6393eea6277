//! Run state persistence.
//!
//! Runs are append-only event logs. [`RunStore`] is the persistence seam;
//! [`MemoryRunStore`] is the in-process implementation backing tests and
//! single-node deployments. Every append for a run goes through that run's
//! mutex, so concurrent writers from different step tasks are linearized
//! and the event order is total per run.
//!
//! The store validates transitions on append: an event that would regress a
//! step out of a terminal state, or touch an already-terminal run, is
//! rejected rather than recorded.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;
use weft_types::error::StoreError;
use weft_types::run::{RunEvent, RunLogEntry, RunStatus, StepStatus, WorkflowRun};

/// Capacity of the per-run live log channel. Slow subscribers that fall
/// further behind than this miss entries (they still see the recorded
/// backlog on subscribe).
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Filter for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow: Option<String>,
    pub status: Option<RunStatus>,
}

/// Log subscription: the recorded backlog plus a live receiver. The
/// receiver is `None` when the run is already terminal.
pub struct LogSubscription {
    pub recorded: Vec<RunLogEntry>,
    pub live: Option<broadcast::Receiver<RunLogEntry>>,
}

/// Append-only run state store.
pub trait RunStore: Send + Sync + 'static {
    /// Register a new run. The event must be `RunCreated`.
    fn create_run(
        &self,
        event: RunEvent,
    ) -> impl std::future::Future<Output = Result<Uuid, StoreError>> + Send;

    /// Append an event to a run's log. Log entries get their sequence
    /// number assigned here.
    fn append(
        &self,
        run_id: Uuid,
        event: RunEvent,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Full event log of a run, in append order.
    fn events(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<RunEvent>, StoreError>> + Send;

    /// Materialized state of a run (the fold of its event log).
    fn get_run(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<WorkflowRun, StoreError>> + Send;

    /// Runs matching a filter, most recently started first.
    fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, StoreError>> + Send;

    /// Subscribe to a run's log: recorded entries so far plus a live
    /// channel for the rest. Snapshot and subscription are atomic, so no
    /// entry is missed or duplicated at the boundary.
    fn subscribe_logs(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<LogSubscription, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct RunSlot {
    events: Vec<RunEvent>,
    /// Incrementally maintained fold of `events`.
    snapshot: WorkflowRun,
    next_log_seq: u64,
    /// Dropped when the run reaches a terminal status, which closes all
    /// live subscriptions.
    logs_tx: Option<broadcast::Sender<RunLogEntry>>,
}

/// In-memory run store.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: DashMap<Uuid, Arc<Mutex<RunSlot>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, run_id: Uuid) -> Result<Arc<Mutex<RunSlot>>, StoreError> {
        self.runs
            .get(&run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StoreError::RunNotFound(run_id))
    }
}

impl RunStore for MemoryRunStore {
    async fn create_run(&self, event: RunEvent) -> Result<Uuid, StoreError> {
        let RunEvent::RunCreated { run_id, .. } = &event else {
            return Err(StoreError::InvalidEvent {
                run_id: Uuid::nil(),
                reason: "first event must be run_created".to_string(),
            });
        };
        let run_id = *run_id;
        let snapshot =
            WorkflowRun::replay(std::slice::from_ref(&event)).ok_or_else(|| {
                StoreError::InvalidEvent {
                    run_id,
                    reason: "malformed run_created event".to_string(),
                }
            })?;
        let slot = Arc::new(Mutex::new(RunSlot {
            events: vec![event],
            snapshot,
            next_log_seq: 0,
            logs_tx: Some(broadcast::channel(LOG_CHANNEL_CAPACITY).0),
        }));
        match self.runs.entry(run_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::RunExists(run_id)),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(run_id)
            }
        }
    }

    async fn append(&self, run_id: Uuid, mut event: RunEvent) -> Result<(), StoreError> {
        let slot = self.slot(run_id)?;
        let mut slot = slot.lock().await;

        match &mut event {
            RunEvent::RunCreated { .. } => {
                return Err(StoreError::InvalidEvent {
                    run_id,
                    reason: "run_created may only start a log".to_string(),
                });
            }
            RunEvent::RunStatusChanged { status, .. } => {
                let current = slot.snapshot.status;
                let resuming = *status == RunStatus::Running && current.can_resume();
                if current.is_terminal() && !resuming {
                    return Err(StoreError::InvalidEvent {
                        run_id,
                        reason: format!("run is already terminal ({current})"),
                    });
                }
            }
            RunEvent::StepTransition { step_id, state, .. } => {
                let current = slot
                    .snapshot
                    .step_states
                    .get(step_id.as_str())
                    .map(|s| s.status)
                    .unwrap_or(StepStatus::Pending);
                let allowed = if current == state.status {
                    // Re-entering the same phase is only meaningful for
                    // attempt bumps (fallback re-dispatch).
                    matches!(current, StepStatus::Running | StepStatus::Retrying)
                } else if state.status == StepStatus::Pending {
                    // Resume resets.
                    current.can_reset()
                } else {
                    current.can_transition_to(state.status)
                };
                if !allowed {
                    return Err(StoreError::InvalidTransition {
                        step_id: step_id.clone(),
                        from: current,
                        to: state.status,
                    });
                }
            }
            RunEvent::LogAppended { entry } => {
                entry.seq = slot.next_log_seq;
                slot.next_log_seq += 1;
            }
        }

        slot.snapshot.apply(&event);
        if let RunEvent::LogAppended { entry } = &event {
            if let Some(tx) = &slot.logs_tx {
                // A send error only means no live subscribers.
                let _ = tx.send(entry.clone());
            }
        }
        let terminal = slot.snapshot.status.is_terminal();
        slot.events.push(event);
        if terminal {
            slot.logs_tx = None;
        }
        Ok(())
    }

    async fn events(&self, run_id: Uuid) -> Result<Vec<RunEvent>, StoreError> {
        let slot = self.slot(run_id)?;
        let slot = slot.lock().await;
        Ok(slot.events.clone())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        let slot = self.slot(run_id)?;
        let slot = slot.lock().await;
        Ok(slot.snapshot.clone())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, StoreError> {
        let slots: Vec<Arc<Mutex<RunSlot>>> = self
            .runs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut runs = Vec::new();
        for slot in slots {
            let slot = slot.lock().await;
            let run = &slot.snapshot;
            if let Some(workflow) = &filter.workflow {
                if &run.workflow != workflow {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if run.status != status {
                    continue;
                }
            }
            runs.push(run.clone());
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn subscribe_logs(&self, run_id: Uuid) -> Result<LogSubscription, StoreError> {
        let slot = self.slot(run_id)?;
        let slot = slot.lock().await;
        let recorded = slot
            .events
            .iter()
            .filter_map(|event| match event {
                RunEvent::LogAppended { entry } => Some(entry.clone()),
                _ => None,
            })
            .collect();
        let live = slot.logs_tx.as_ref().map(|tx| tx.subscribe());
        Ok(LogSubscription { recorded, live })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
