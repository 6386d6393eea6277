//! Workflow definition parsing, validation, and file IO.
//!
//! Definitions are YAML documents deserialized into
//! [`weft_types::workflow::WorkflowDefinition`] and validated structurally
//! before a run ever starts: ID uniqueness, dependency references, graph
//! acyclicity, and static parsability of every condition and input template.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};
use weft_types::workflow::{StepDefinition, WorkflowDefinition};

use crate::dag::StepGraph;
use crate::expr::{self, EvalError};

/// Errors raised while loading or validating a workflow definition, or while
/// resolving run inputs against it.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("failed to parse workflow YAML: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("invalid workflow definition: {0}")]
    Invalid(String),

    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    #[error("workflow contains a dependency cycle involving step '{0}'")]
    Cycle(String),

    #[error("step '{step_id}' has an invalid expression in {location}: {source}")]
    BadExpression {
        step_id: String,
        location: String,
        #[source]
        source: EvalError,
    },

    #[error("required input missing: {0}")]
    MissingInput(String),

    #[error("input '{name}' expected {expected}, got incompatible value")]
    InputTypeMismatch { name: String, expected: String },

    #[error("unknown input: {0}")]
    UnknownInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parse / serialize
// ---------------------------------------------------------------------------

/// Parse a workflow definition from YAML and validate it.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, ValidationError> {
    let definition: WorkflowDefinition = serde_yaml_ng::from_str(yaml)?;
    validate_definition(&definition)?;
    Ok(definition)
}

/// Serialize a workflow definition to YAML.
pub fn serialize_workflow_yaml(
    definition: &WorkflowDefinition,
) -> Result<String, ValidationError> {
    Ok(serde_yaml_ng::to_string(definition)?)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the structure of a workflow definition.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    if definition.name.is_empty() {
        return Err(ValidationError::Invalid(
            "workflow name cannot be empty".to_string(),
        ));
    }
    if !definition
        .name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ValidationError::Invalid(format!(
            "workflow name '{}' must be lowercase alphanumeric with hyphens",
            definition.name
        )));
    }
    if definition.version.is_empty() {
        return Err(ValidationError::Invalid(
            "workflow version cannot be empty".to_string(),
        ));
    }
    if definition.steps.is_empty() {
        return Err(ValidationError::Invalid(
            "workflow must define at least one step".to_string(),
        ));
    }
    if definition.resources.max_concurrent_steps == Some(0) {
        return Err(ValidationError::Invalid(
            "resources.max_concurrent_steps must be at least 1".to_string(),
        ));
    }

    let mut seen = BTreeSet::new();
    for step in &definition.steps {
        if step.id.is_empty() {
            return Err(ValidationError::Invalid(
                "step id cannot be empty".to_string(),
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
        if step.agent.is_empty() {
            return Err(ValidationError::Invalid(format!(
                "step '{}' has an empty agent reference",
                step.id
            )));
        }
        validate_step(step)?;
    }

    for step in &definition.steps {
        for dep in &step.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    step_id: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
            if dep == &step.id {
                return Err(ValidationError::Cycle(step.id.clone()));
            }
        }
    }

    // Cycle detection delegates to the graph builder.
    StepGraph::build(definition)?;

    debug!(workflow = %definition.name, steps = definition.steps.len(), "definition validated");
    Ok(())
}

fn validate_step(step: &StepDefinition) -> Result<(), ValidationError> {
    if let Some(condition) = &step.condition {
        check_expression(&step.id, "condition", condition, true)?;
    }
    for (param, template) in &step.input {
        check_expression(&step.id, &format!("input '{param}'"), template, false)?;
    }
    if let Some(parallel) = &step.parallel {
        if parallel.worker_count == 0 {
            return Err(ValidationError::Invalid(format!(
                "step '{}': parallel.worker_count must be at least 1",
                step.id
            )));
        }
        check_expression(&step.id, "parallel.items", &parallel.items, false)?;
    }
    if let Some(timeout) = step.timeout_secs {
        if timeout == 0 {
            return Err(ValidationError::Invalid(format!(
                "step '{}': timeout_secs must be at least 1",
                step.id
            )));
        }
    }
    Ok(())
}

/// Statically parse an expression or template so syntax errors surface at
/// load time rather than mid-run.
fn check_expression(
    step_id: &str,
    location: &str,
    text: &str,
    bare: bool,
) -> Result<(), ValidationError> {
    let result = if bare {
        let trimmed = text.trim();
        let src = trimmed
            .strip_prefix("${{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed);
        expr::parse(src).map(|_| ())
    } else {
        parse_template(text)
    };
    result.map_err(|source| ValidationError::BadExpression {
        step_id: step_id.to_string(),
        location: location.to_string(),
        source,
    })
}

/// Parse every `${{ }}` marker in a template without evaluating.
fn parse_template(template: &str) -> Result<(), EvalError> {
    let mut rest = template;
    while let Some(start) = rest.find("${{") {
        let after = &rest[start + 3..];
        let end = after
            .find("}}")
            .ok_or_else(|| EvalError::Parse("unterminated '${{' marker".to_string()))?;
        expr::parse(after[..end].trim())?;
        rest = &after[end + 2..];
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Input resolution
// ---------------------------------------------------------------------------

/// Resolve provided run inputs against the definition's declarations:
/// defaults applied, required inputs enforced, types checked, unknown
/// names rejected.
pub fn resolve_inputs(
    definition: &WorkflowDefinition,
    provided: &Map<String, Value>,
) -> Result<Value, ValidationError> {
    for name in provided.keys() {
        if !definition.inputs.contains_key(name) {
            return Err(ValidationError::UnknownInput(name.clone()));
        }
    }

    let mut resolved = Map::new();
    for (name, spec) in &definition.inputs {
        match provided.get(name) {
            Some(value) => {
                if !spec.value_type.matches(value) {
                    return Err(ValidationError::InputTypeMismatch {
                        name: name.clone(),
                        expected: spec.value_type.to_string(),
                    });
                }
                resolved.insert(name.clone(), value.clone());
            }
            None => {
                if let Some(default) = &spec.default {
                    resolved.insert(name.clone(), default.clone());
                } else if spec.required {
                    return Err(ValidationError::MissingInput(name.clone()));
                }
            }
        }
    }
    Ok(Value::Object(resolved))
}

// ---------------------------------------------------------------------------
// File IO
// ---------------------------------------------------------------------------

/// Load and validate a workflow definition from a YAML file.
pub fn load_workflow(path: &Path) -> Result<WorkflowDefinition, ValidationError> {
    let yaml = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&yaml)
}

/// Save a workflow definition to a YAML file.
pub fn save_workflow(
    definition: &WorkflowDefinition,
    path: &Path,
) -> Result<(), ValidationError> {
    validate_definition(definition)?;
    let yaml = serialize_workflow_yaml(definition)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover workflow definitions in a directory (non-recursive). Files that
/// fail to parse or validate are skipped with a warning.
pub fn discover_workflows(
    dir: &Path,
) -> Result<HashMap<PathBuf, WorkflowDefinition>, ValidationError> {
    let mut found = HashMap::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if !is_yaml {
            continue;
        }
        match load_workflow(&path) {
            Ok(definition) => {
                found.insert(path, definition);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping invalid workflow file");
            }
        }
    }
    Ok(found)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
