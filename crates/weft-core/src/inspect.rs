//! Run inspection: status reports and log streaming.

use std::sync::Arc;

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;
use weft_types::error::StoreError;
use weft_types::run::{FailureReport, RunLogEntry, RunStatus, StepStatus};

use crate::store::RunStore;

/// Point-in-time status of one run, with per-step detail.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepStatusReport>,
    pub error: Option<FailureReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepStatusReport {
    pub step_id: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Current status of a run.
pub async fn run_status<S: RunStore>(
    store: &S,
    run_id: Uuid,
) -> Result<RunStatusReport, StoreError> {
    let run = store.get_run(run_id).await?;
    let steps = run
        .step_states
        .iter()
        .map(|(step_id, state)| StepStatusReport {
            step_id: step_id.clone(),
            status: state.status,
            attempt: state.attempt,
            last_error: state.last_error.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at,
        })
        .collect();
    Ok(RunStatusReport {
        run_id: run.run_id,
        workflow: run.workflow,
        status: run.status,
        started_at: run.started_at,
        ended_at: run.ended_at,
        steps,
        error: run.error,
    })
}

/// Stream a run's log: everything recorded so far, then live entries until
/// the run reaches a terminal status. The stream ends on its own once the
/// run is done; for an already-terminal run it yields the recorded entries
/// and closes.
pub fn stream_run_logs<S: RunStore>(
    store: Arc<S>,
    run_id: Uuid,
) -> impl Stream<Item = Result<RunLogEntry, StoreError>> {
    try_stream! {
        let mut subscription = store.subscribe_logs(run_id).await?;
        let mut last_seq: Option<u64> = None;
        for entry in subscription.recorded.drain(..) {
            last_seq = Some(entry.seq);
            yield entry;
        }
        if let Some(mut live) = subscription.live {
            loop {
                match live.recv().await {
                    Ok(entry) => {
                        // seq guard against duplicates at the backlog/live
                        // boundary.
                        if last_seq.is_none_or(|seq| entry.seq > seq) {
                            last_seq = Some(entry.seq);
                            yield entry;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::{StreamExt, pin_mut};
    use serde_json::json;
    use weft_types::run::{LogLevel, RunEvent, StepState};

    use crate::store::MemoryRunStore;

    async fn seeded_run(store: &MemoryRunStore) -> Uuid {
        let run_id = Uuid::now_v7();
        store
            .create_run(RunEvent::RunCreated {
                run_id,
                workflow: "wf".to_string(),
                inputs: json!({}),
                env: json!({}),
                steps: vec!["a".to_string(), "b".to_string()],
                at: Utc::now(),
            })
            .await
            .unwrap();
        run_id
    }

    fn log_event(message: &str) -> RunEvent {
        RunEvent::LogAppended {
            entry: RunLogEntry {
                seq: 0,
                timestamp: Utc::now(),
                step_id: None,
                level: LogLevel::Info,
                message: message.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_run_status_report() {
        let store = MemoryRunStore::new();
        let run_id = seeded_run(&store).await;
        store
            .append(
                run_id,
                RunEvent::StepTransition {
                    step_id: "a".to_string(),
                    state: StepState {
                        status: StepStatus::Running,
                        attempt: 1,
                        ..StepState::pending()
                    },
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let report = run_status(&store, run_id).await.unwrap();
        assert_eq!(report.run_id, run_id);
        assert_eq!(report.workflow, "wf");
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[0].step_id, "a");
        assert_eq!(report.steps[0].status, StepStatus::Running);
        assert_eq!(report.steps[0].attempt, 1);
        // A step that never dispatched still shows up, as pending.
        assert_eq!(report.steps[1].step_id, "b");
        assert_eq!(report.steps[1].status, StepStatus::Pending);
        assert_eq!(report.steps[1].attempt, 0);
    }

    #[tokio::test]
    async fn test_stream_recorded_then_live() {
        let store = Arc::new(MemoryRunStore::new());
        let run_id = seeded_run(&store).await;
        store.append(run_id, log_event("first")).await.unwrap();

        let stream = stream_run_logs(Arc::clone(&store), run_id);
        pin_mut!(stream);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.message, "first");

        store.append(run_id, log_event("second")).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.message, "second");

        // Terminal status ends the stream.
        store
            .append(
                run_id,
                RunEvent::RunStatusChanged {
                    status: RunStatus::Succeeded,
                    error: None,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_terminal_run_yields_backlog_and_closes() {
        let store = Arc::new(MemoryRunStore::new());
        let run_id = seeded_run(&store).await;
        store.append(run_id, log_event("one")).await.unwrap();
        store.append(run_id, log_event("two")).await.unwrap();
        store
            .append(
                run_id,
                RunEvent::RunStatusChanged {
                    status: RunStatus::Failed,
                    error: None,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let stream = stream_run_logs(Arc::clone(&store), run_id);
        pin_mut!(stream);
        let mut messages = Vec::new();
        while let Some(entry) = stream.next().await {
            messages.push(entry.unwrap().message);
        }
        assert_eq!(messages, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_stream_unknown_run_errors() {
        let store = Arc::new(MemoryRunStore::new());
        let stream = stream_run_logs(store, Uuid::now_v7());
        pin_mut!(stream);
        assert!(matches!(
            stream.next().await,
            Some(Err(StoreError::RunNotFound(_)))
        ));
    }
}
