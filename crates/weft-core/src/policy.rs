//! Retry and error policy engine.
//!
//! Pure decision logic, no IO: given a step's policy, the failure that just
//! happened, and how many attempts have been made, produce the next move.
//! The run loop in `engine` owns all side effects (sleeps, transitions,
//! events) that the decision implies.

use std::collections::BTreeSet;
use std::time::Duration;

use weft_types::workflow::{
    Backoff, ErrorPolicy, OnFailure, StepDefinition, WorkflowDefinition,
};

use crate::dispatch::DispatchError;
use crate::expr::EvalError;

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Why a step attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum StepFailure {
    /// The agent invocation failed.
    Dispatch(DispatchError),
    /// An input template, items expression, or condition failed to
    /// evaluate. Deterministic, so never retried.
    Expr(EvalError),
    /// The invocation succeeded but its output broke a context size limit.
    Output(String),
}

impl StepFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            StepFailure::Dispatch(err) => err.is_retryable(),
            StepFailure::Expr(_) | StepFailure::Output(_) => false,
        }
    }

    /// Stable short name for failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            StepFailure::Dispatch(err) => err.kind(),
            StepFailure::Expr(_) => "expression",
            StepFailure::Output(_) => "output_too_large",
        }
    }

    pub fn message(&self) -> String {
        match self {
            StepFailure::Dispatch(err) => err.to_string(),
            StepFailure::Expr(err) => err.to_string(),
            StepFailure::Output(msg) => msg.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// What the run loop should do with a failed step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Schedule another attempt after the backoff delay.
    Retry { delay: Duration },
    /// Re-dispatch the same input to a different agent, with a fresh
    /// attempt budget.
    Fallback { agent: String },
    /// Mark the step skipped; dependents proceed.
    Skip,
    /// Park the step for human review; the run continues around it.
    Escalate,
    /// Fail the run.
    FailRun,
}

/// A decision plus the side-effect actions that fired on the way to it.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    pub decision: Decision,
    /// Names of actions processed, in order ("log", "notify", ...).
    pub actions: Vec<String>,
}

// ---------------------------------------------------------------------------
// Policy resolution
// ---------------------------------------------------------------------------

/// The policy in force for a step: its own, or a synthesized one from the
/// workflow's `error_handling` block (no retries, log, then the configured
/// critical-failure action).
pub fn effective_policy(
    step: &StepDefinition,
    definition: &WorkflowDefinition,
) -> ErrorPolicy {
    match &step.error_policy {
        Some(policy) => policy.clone(),
        None => ErrorPolicy {
            retry_attempts: 0,
            backoff: Backoff::None,
            on_failure: vec![
                OnFailure::Log,
                definition.error_handling.on_critical_failure.clone(),
            ],
        },
    }
}

/// Delay before retry number `attempt + 1`, where `attempt` is the 1-based
/// count of failures so far.
pub fn backoff_delay(backoff: &Backoff, attempt: u32) -> Duration {
    debug_assert!(attempt >= 1);
    let secs = match backoff {
        Backoff::None => 0,
        Backoff::Linear { base_secs } => base_secs.saturating_mul(attempt as u64),
        Backoff::Exponential {
            base_secs,
            multiplier,
            max_backoff_secs,
        } => {
            let factor = (*multiplier as u64).saturating_pow(attempt.saturating_sub(1));
            base_secs.saturating_mul(factor).min(*max_backoff_secs)
        }
    };
    Duration::from_secs(secs)
}

/// Decide what happens after a failed attempt.
///
/// `attempt` is the 1-based number of the invocation that just failed.
/// `used_fallbacks` holds agents already tried via `fallback_agent`, so a
/// policy never bounces between the same two agents forever.
pub fn decide(
    policy: &ErrorPolicy,
    failure: &StepFailure,
    attempt: u32,
    used_fallbacks: &BTreeSet<String>,
) -> PolicyOutcome {
    if failure.is_retryable() && attempt <= policy.retry_attempts {
        return PolicyOutcome {
            decision: Decision::Retry {
                delay: backoff_delay(&policy.backoff, attempt),
            },
            actions: Vec::new(),
        };
    }

    // Budget exhausted or non-retryable: walk the on_failure list. Side
    // effects fall through; the first applicable control-flow action wins.
    let mut actions = Vec::new();
    for action in &policy.on_failure {
        match action {
            OnFailure::Log => actions.push("log".to_string()),
            OnFailure::Notify => actions.push("notify".to_string()),
            OnFailure::FallbackAgent { agent } => {
                if used_fallbacks.contains(agent) {
                    continue;
                }
                actions.push("fallback_agent".to_string());
                return PolicyOutcome {
                    decision: Decision::Fallback {
                        agent: agent.clone(),
                    },
                    actions,
                };
            }
            OnFailure::Skip => {
                actions.push("skip".to_string());
                return PolicyOutcome {
                    decision: Decision::Skip,
                    actions,
                };
            }
            OnFailure::Escalate | OnFailure::HumanReview => {
                actions.push("escalate".to_string());
                return PolicyOutcome {
                    decision: Decision::Escalate,
                    actions,
                };
            }
            OnFailure::Fail => {
                actions.push("fail".to_string());
                return PolicyOutcome {
                    decision: Decision::FailRun,
                    actions,
                };
            }
        }
    }

    // No control-flow action applied.
    PolicyOutcome {
        decision: Decision::FailRun,
        actions,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse_workflow_yaml;

    fn transient() -> StepFailure {
        StepFailure::Dispatch(DispatchError::Transient("connection reset".into()))
    }

    fn policy(retries: u32, backoff: Backoff, on_failure: Vec<OnFailure>) -> ErrorPolicy {
        ErrorPolicy {
            retry_attempts: retries,
            backoff,
            on_failure,
        }
    }

    fn no_fallbacks() -> BTreeSet<String> {
        BTreeSet::new()
    }

    // -----------------------------------------------------------------------
    // Backoff math
    // -----------------------------------------------------------------------

    #[test]
    fn test_exponential_backoff_sequence() {
        let backoff = Backoff::Exponential {
            base_secs: 1,
            multiplier: 2,
            max_backoff_secs: 60,
        };
        assert_eq!(backoff_delay(&backoff, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&backoff, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&backoff, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&backoff, 4), Duration::from_secs(8));
    }

    #[test]
    fn test_exponential_backoff_cap() {
        let backoff = Backoff::Exponential {
            base_secs: 1,
            multiplier: 2,
            max_backoff_secs: 5,
        };
        assert_eq!(backoff_delay(&backoff, 4), Duration::from_secs(5));
        assert_eq!(backoff_delay(&backoff, 30), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_and_none_backoff() {
        assert_eq!(
            backoff_delay(&Backoff::Linear { base_secs: 5 }, 3),
            Duration::from_secs(15)
        );
        assert_eq!(backoff_delay(&Backoff::None, 3), Duration::ZERO);
    }

    // -----------------------------------------------------------------------
    // Retry decisions
    // -----------------------------------------------------------------------

    #[test]
    fn test_retry_within_budget() {
        let p = policy(3, Backoff::Linear { base_secs: 2 }, vec![OnFailure::Fail]);
        let outcome = decide(&p, &transient(), 1, &no_fallbacks());
        assert_eq!(
            outcome.decision,
            Decision::Retry {
                delay: Duration::from_secs(2)
            }
        );
        assert!(outcome.actions.is_empty());

        let outcome = decide(&p, &transient(), 3, &no_fallbacks());
        assert!(matches!(outcome.decision, Decision::Retry { .. }));
    }

    #[test]
    fn test_budget_exhausted_falls_to_actions() {
        let p = policy(3, Backoff::None, vec![OnFailure::Log, OnFailure::Fail]);
        let outcome = decide(&p, &transient(), 4, &no_fallbacks());
        assert_eq!(outcome.decision, Decision::FailRun);
        assert_eq!(outcome.actions, vec!["log", "fail"]);
    }

    #[test]
    fn test_non_retryable_skips_retry_budget() {
        let p = policy(5, Backoff::None, vec![OnFailure::Skip]);
        let failure = StepFailure::Dispatch(DispatchError::InvalidInput("schema".into()));
        let outcome = decide(&p, &failure, 1, &no_fallbacks());
        assert_eq!(outcome.decision, Decision::Skip);

        let failure = StepFailure::Dispatch(DispatchError::AgentRejected("refused".into()));
        let outcome = decide(&p, &failure, 1, &no_fallbacks());
        assert_eq!(outcome.decision, Decision::Skip);
    }

    #[test]
    fn test_expression_failure_never_retries() {
        let p = policy(5, Backoff::None, vec![OnFailure::Fail]);
        let failure = StepFailure::Expr(EvalError::UndefinedReference("steps.typo".into()));
        let outcome = decide(&p, &failure, 1, &no_fallbacks());
        assert_eq!(outcome.decision, Decision::FailRun);
    }

    // -----------------------------------------------------------------------
    // On-failure sequencing
    // -----------------------------------------------------------------------

    #[test]
    fn test_side_effects_fall_through_to_control_flow() {
        let p = policy(
            0,
            Backoff::None,
            vec![OnFailure::Log, OnFailure::Notify, OnFailure::Escalate],
        );
        let outcome = decide(&p, &transient(), 1, &no_fallbacks());
        assert_eq!(outcome.decision, Decision::Escalate);
        assert_eq!(outcome.actions, vec!["log", "notify", "escalate"]);
    }

    #[test]
    fn test_first_control_flow_action_wins() {
        let p = policy(
            0,
            Backoff::None,
            vec![OnFailure::Skip, OnFailure::Fail],
        );
        let outcome = decide(&p, &transient(), 1, &no_fallbacks());
        assert_eq!(outcome.decision, Decision::Skip);
        assert_eq!(outcome.actions, vec!["skip"]);
    }

    #[test]
    fn test_fallback_agent_once() {
        let p = policy(
            0,
            Backoff::None,
            vec![
                OnFailure::Log,
                OnFailure::FallbackAgent {
                    agent: "backup".into(),
                },
                OnFailure::Escalate,
            ],
        );
        let outcome = decide(&p, &transient(), 1, &no_fallbacks());
        assert_eq!(
            outcome.decision,
            Decision::Fallback {
                agent: "backup".into()
            }
        );

        // Once the fallback has been burned, the walk continues past it.
        let used = BTreeSet::from(["backup".to_string()]);
        let outcome = decide(&p, &transient(), 1, &used);
        assert_eq!(outcome.decision, Decision::Escalate);
        assert_eq!(outcome.actions, vec!["log", "escalate"]);
    }

    #[test]
    fn test_empty_action_list_fails_run() {
        let p = policy(0, Backoff::None, vec![]);
        let outcome = decide(&p, &transient(), 1, &no_fallbacks());
        assert_eq!(outcome.decision, Decision::FailRun);
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn test_only_side_effects_fails_run() {
        let p = policy(0, Backoff::None, vec![OnFailure::Log, OnFailure::Notify]);
        let outcome = decide(&p, &transient(), 1, &no_fallbacks());
        assert_eq!(outcome.decision, Decision::FailRun);
        assert_eq!(outcome.actions, vec!["log", "notify"]);
    }

    // -----------------------------------------------------------------------
    // Effective policy
    // -----------------------------------------------------------------------

    #[test]
    fn test_effective_policy_synthesized_from_global() {
        let def = parse_workflow_yaml(
            r#"
name: unconfigured
version: "1.0"
error_handling:
  on_critical_failure: escalate_to_human
steps:
  - id: a
    agent: x
"#,
        )
        .unwrap();
        let p = effective_policy(&def.steps[0], &def);
        assert_eq!(p.retry_attempts, 0);
        assert_eq!(p.on_failure, vec![OnFailure::Log, OnFailure::Escalate]);

        let outcome = decide(&p, &transient(), 1, &no_fallbacks());
        assert_eq!(outcome.decision, Decision::Escalate);
    }
}
