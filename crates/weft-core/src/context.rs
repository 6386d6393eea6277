//! Per-run variable context.
//!
//! Holds the data expressions can see: resolved inputs, the environment
//! snapshot, succeeded step outputs, and workflow metadata. The scheduler
//! keeps one `RunContext` per driven run and rebuilds it from the event log
//! on resume.
//!
//! Oversized outputs are rejected up front so one runaway agent cannot blow
//! up run memory or the event log.

use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Maximum serialized size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum serialized size of all step outputs in one run (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("output of step '{step_id}' is {size} bytes, exceeds limit of {limit}")]
    OutputTooLarge {
        step_id: String,
        size: usize,
        limit: usize,
    },

    #[error("run context would reach {size} bytes with step '{step_id}', exceeds limit of {limit}")]
    ContextTooLarge {
        step_id: String,
        size: usize,
        limit: usize,
    },
}

/// Live expression scope for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    inputs: Value,
    env: Value,
    step_outputs: Map<String, Value>,
    workflow: Value,
    outputs_size: usize,
}

impl RunContext {
    pub fn new(workflow_name: &str, run_id: Uuid, inputs: Value, env: Value) -> Self {
        Self {
            inputs,
            env,
            step_outputs: Map::new(),
            workflow: json!({
                "name": workflow_name,
                "run_id": run_id.to_string(),
            }),
            outputs_size: 0,
        }
    }

    /// Record a succeeded step's output, enforcing size limits.
    pub fn record_output(&mut self, step_id: &str, output: Value) -> Result<(), ContextError> {
        let size = serialized_size(&output);
        if size > MAX_STEP_OUTPUT_SIZE {
            return Err(ContextError::OutputTooLarge {
                step_id: step_id.to_string(),
                size,
                limit: MAX_STEP_OUTPUT_SIZE,
            });
        }
        let total = self.outputs_size + size;
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::ContextTooLarge {
                step_id: step_id.to_string(),
                size: total,
                limit: MAX_CONTEXT_SIZE,
            });
        }
        self.outputs_size = total;
        self.step_outputs
            .insert(step_id.to_string(), json!({ "output": output }));
        Ok(())
    }

    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.step_outputs.get(step_id).and_then(|e| e.get("output"))
    }

    /// Build the scope object expressions evaluate against.
    pub fn scope(&self) -> Value {
        json!({
            "inputs": self.inputs,
            "env": self.env,
            "steps": Value::Object(self.step_outputs.clone()),
            "workflow": self.workflow,
        })
    }

    /// Scope extended with `item` / `item_index` bindings for one fan-out
    /// invocation.
    pub fn scope_with_item(&self, item: &Value, index: usize) -> Value {
        let mut scope = self.scope();
        if let Some(obj) = scope.as_object_mut() {
            obj.insert("item".to_string(), item.clone());
            obj.insert("item_index".to_string(), json!(index));
        }
        scope
    }
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
