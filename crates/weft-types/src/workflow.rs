//! Workflow definition types for Weft.
//!
//! `WorkflowDefinition` is the canonical representation of a workflow: YAML
//! files deserialize into it, and the engine only ever consumes the validated
//! struct. Also contains the error-handling policy model (retries, backoff,
//! on-failure actions) and run-level resource limits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Immutable once validated; loaded once per run-start. The engine treats it
/// as the single source of truth for a workflow's shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// Workflow name (lowercase alphanumeric and hyphens).
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared inputs: parameter name -> spec.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSpec>,
    /// Declared outputs: name -> type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, ValueType>,
    /// Trigger configurations. Opaque to the engine beyond validation that
    /// they parse; trigger adapters live outside the core.
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Ordered list of step definitions forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
    /// Fallback error handling for steps without an explicit policy.
    #[serde(default)]
    pub error_handling: GlobalErrorPolicy,
    /// Per-workflow resource limits.
    #[serde(default)]
    pub resources: ResourceLimits,
}

/// Declared input parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSpec {
    /// Expected value type.
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Whether the input must be provided at run-start.
    #[serde(default)]
    pub required: bool,
    /// Default value applied when the input is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// JSON value types used for input/output declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ValueType {
    /// Whether `value` conforms to this declared type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Array => "array",
            ValueType::Object => "object",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    /// User-defined step ID (e.g. "gather-news"). Unique within a workflow.
    pub id: String,
    /// Agent reference, resolved by the external dispatcher.
    pub agent: String,
    /// Input mapping: parameter name -> expression template
    /// (`${{ steps.analyze.output.score }}`-style markers are resolved
    /// against the run scope before dispatch).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input: BTreeMap<String, String>,
    /// Declared result shape of the step output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ValueType>,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional boolean expression; evaluated lazily once dependencies are
    /// satisfied. A false result marks the step skipped, not failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Step-level timeout in seconds (default 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Error handling for this step. Falls back to the workflow's
    /// `error_handling` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicy>,
    /// Parallel fan-out configuration. When present, the step's input
    /// template is expanded once per item of the `items` collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelSpec>,
}

/// Parallel fan-out configuration for a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelSpec {
    /// Hard cap on concurrently in-flight item invocations.
    pub worker_count: u32,
    /// Expression that must evaluate to an array; each element is bound as
    /// `item` (with `item_index`) in the per-item input scope.
    pub items: String,
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// Error handling policy for a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ErrorPolicy {
    /// Number of retries after the first failure (0 = no retries).
    #[serde(default)]
    pub retry_attempts: u32,
    /// Delay strategy between retry attempts.
    #[serde(default)]
    pub backoff: Backoff,
    /// Ordered actions processed once retries are exhausted. Side-effect
    /// actions (`log`, `notify`) always run and fall through; the first
    /// control-flow action decides the step's fate. An empty list fails
    /// the run.
    #[serde(default)]
    pub on_failure: Vec<OnFailure>,
}

/// Delay strategy applied between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Delay grows linearly: `base * attempt`.
    Linear { base_secs: u64 },
    /// Delay doubles (or multiplies): `base * multiplier^(attempt-1)`,
    /// capped at `max_backoff_secs`.
    Exponential {
        base_secs: u64,
        multiplier: u32,
        max_backoff_secs: u64,
    },
}

/// A recovery action in a step's `on_failure` list.
///
/// Unit variants are plain YAML strings (`on_failure: [log, escalate]`);
/// `fallback_agent` is a single-key mapping carrying its target, either
/// nested (`fallback_agent: {agent: backup}`) or as a bare agent name
/// (`fallback_agent: backup`). Serde is hand-written because the YAML
/// surface mixes scalars and mappings in one list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnFailure {
    /// Record the failure in the run log and continue to the next action.
    Log,
    /// Emit a notification event and continue to the next action.
    Notify,
    /// Re-dispatch the same input to a different agent (fresh attempt
    /// sequence against that agent).
    FallbackAgent { agent: String },
    /// Mark the step skipped; downstream steps proceed.
    Skip,
    /// Park the step for human review without failing the run.
    Escalate,
    /// Alias shape for escalation used by some workflow documents.
    HumanReview,
    /// Fail the run immediately.
    Fail,
}

impl OnFailure {
    /// Side-effect actions fall through to the next entry in the list;
    /// control-flow actions decide the step's fate.
    pub fn is_side_effect(&self) -> bool {
        matches!(self, OnFailure::Log | OnFailure::Notify)
    }
}

const ON_FAILURE_NAMES: &[&str] = &[
    "log",
    "notify",
    "fallback_agent",
    "skip",
    "escalate",
    "human_review",
    "fail",
];

impl Serialize for OnFailure {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            OnFailure::Log => serializer.serialize_str("log"),
            OnFailure::Notify => serializer.serialize_str("notify"),
            OnFailure::Skip => serializer.serialize_str("skip"),
            OnFailure::Escalate => serializer.serialize_str("escalate"),
            OnFailure::HumanReview => serializer.serialize_str("human_review"),
            OnFailure::Fail => serializer.serialize_str("fail"),
            OnFailure::FallbackAgent { agent } => {
                #[derive(Serialize)]
                struct Target<'a> {
                    agent: &'a str,
                }
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("fallback_agent", &Target { agent })?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for OnFailure {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::{self, MapAccess, Visitor};

        /// Accepts `fallback_agent: backup` and `fallback_agent: {agent: backup}`.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum FallbackTarget {
            Name(String),
            Spec { agent: String },
        }

        struct OnFailureVisitor;

        impl<'de> Visitor<'de> for OnFailureVisitor {
            type Value = OnFailure;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an on_failure action name or a `fallback_agent` mapping")
            }

            fn visit_str<E: de::Error>(self, name: &str) -> Result<OnFailure, E> {
                match name {
                    "log" => Ok(OnFailure::Log),
                    "notify" => Ok(OnFailure::Notify),
                    "skip" => Ok(OnFailure::Skip),
                    "escalate" | "escalate_to_human" => Ok(OnFailure::Escalate),
                    "human_review" => Ok(OnFailure::HumanReview),
                    "fail" | "exit" => Ok(OnFailure::Fail),
                    other => Err(E::unknown_variant(other, ON_FAILURE_NAMES)),
                }
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<OnFailure, A::Error> {
                let Some(key) = map.next_key::<String>()? else {
                    return Err(de::Error::custom("on_failure mapping cannot be empty"));
                };
                if key != "fallback_agent" {
                    return Err(de::Error::unknown_variant(&key, &["fallback_agent"]));
                }
                let agent = match map.next_value::<FallbackTarget>()? {
                    FallbackTarget::Name(agent) => agent,
                    FallbackTarget::Spec { agent } => agent,
                };
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom(
                        "on_failure mapping must have exactly one key",
                    ));
                }
                Ok(OnFailure::FallbackAgent { agent })
            }
        }

        deserializer.deserialize_any(OnFailureVisitor)
    }
}

/// Workflow-level fallback used when a step defines no `error_policy`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalErrorPolicy {
    /// Action taken when an unconfigured step exhausts its (zero) retries.
    pub on_critical_failure: OnFailure,
}

impl Default for GlobalErrorPolicy {
    fn default() -> Self {
        Self {
            on_critical_failure: OnFailure::Escalate,
        }
    }
}

// ---------------------------------------------------------------------------
// Resource limits
// ---------------------------------------------------------------------------

/// Per-workflow resource limits declared in the definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceLimits {
    /// Hard cap on concurrently running steps within one run.
    /// None = unlimited (parallel blocks still honor `worker_count`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_steps: Option<u32>,
}

/// Engine-level run limits, passed into the scheduler's constructor.
///
/// Never package-level state: multiple engine instances with different
/// limits can coexist in one process.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLimits {
    /// Engine-wide cap on concurrently running steps per run. Combined with
    /// the definition's `resources.max_concurrent_steps` (the lower wins).
    pub max_concurrent_steps: Option<usize>,
    /// Wall-clock ceiling for a whole run, in seconds.
    pub run_timeout_secs: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_concurrent_steps: None,
            run_timeout_secs: 1800,
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger Configuration
// ---------------------------------------------------------------------------

/// How a workflow can be triggered.
///
/// The engine validates these parse but never interprets them: trigger
/// adapters resolve events into a flat input map and call the engine's
/// run-start surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Manually triggered via CLI or API.
    Manual {},
    /// Schedule trigger (cron expression, interpreted externally).
    Schedule { cron: String },
    /// Incoming webhook trigger.
    Webhook { path: String },
    /// Internal event bus trigger.
    Event { source: String, event_type: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
