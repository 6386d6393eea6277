//! Expression mini-DSL for workflow data flow.
//!
//! Input templates reference run data through `${{ ... }}` markers
//! (`${{ steps.analyze.output.score }}`); step conditions are bare
//! expressions. The language is a pure, side-effect-free subset: path
//! references into the run scope, literals, comparisons, boolean operators,
//! and pipeline transforms (`steps.fetch.output | first(100)`).
//!
//! Evaluation is strict about missing data: a path that does not resolve is
//! an [`EvalError::UndefinedReference`], never a silent `null`. Misspelled
//! step IDs surface at the step that references them instead of corrupting
//! downstream inputs.

mod eval;
mod parse;

pub use eval::{eval_condition, evaluate, interpolate};
pub use parse::parse;

use serde_json::Value;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value (number, string, boolean, null).
    Literal(Value),
    /// Path reference into the run scope (`steps.fetch.output[0].title`).
    Path(Vec<PathSeg>),
    /// Boolean negation.
    Not(Box<Expr>),
    /// Binary operation.
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Pipeline: an input expression piped through transform calls.
    Pipeline { input: Box<Expr>, calls: Vec<Call> },
}

/// One segment of a path reference.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSeg {
    /// Object key (`.title` or `["title"]`).
    Key(String),
    /// Array index (`[0]`).
    Index(usize),
}

/// A single transform invocation within a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: String,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("undefined reference: {0}")]
    UndefinedReference(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("invalid argument to {function}: {reason}")]
    InvalidArgument { function: String, reason: String },
}

/// Parse and evaluate a bare expression against a scope object.
pub fn eval_str(src: &str, scope: &Value) -> Result<Value, EvalError> {
    evaluate(&parse(src)?, scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "inputs": {"topic": "rust", "limit": 5},
            "steps": {
                "fetch": {"output": [{"title": "a"}, {"title": "b"}, {"title": "c"}]},
                "analyze": {"output": {"score": 0.87, "summary": "fine"}},
            },
            "env": {"REGION": "eu"},
        })
    }

    #[test]
    fn test_eval_str_path_and_comparison() {
        let s = scope();
        assert_eq!(
            eval_str("steps.analyze.output.score > 0.5", &s).unwrap(),
            json!(true)
        );
        assert_eq!(eval_str("inputs.topic == 'rust'", &s).unwrap(), json!(true));
    }

    #[test]
    fn test_eval_str_pipeline_with_comparison() {
        let s = scope();
        // Pipelines bind tighter than comparisons.
        assert_eq!(
            eval_str("steps.fetch.output | length > 2", &s).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_eval_str_word_operators() {
        let s = scope();
        assert_eq!(
            eval_str("inputs.limit == 5 and inputs.topic == 'rust'", &s).unwrap(),
            json!(true)
        );
        assert_eq!(
            eval_str("inputs.limit == 99 or inputs.topic == 'rust'", &s).unwrap(),
            json!(true)
        );
        assert_eq!(
            eval_str("not (inputs.limit == 99)", &s).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_eval_str_undefined_reference() {
        let err = eval_str("steps.missing.output", &scope()).unwrap_err();
        assert_eq!(
            err,
            EvalError::UndefinedReference("steps.missing".to_string())
        );
    }
}
