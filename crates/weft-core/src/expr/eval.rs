//! Tree-walking evaluator and template interpolation.

use serde_json::{Number, Value};

use super::{BinaryOp, Call, EvalError, Expr, PathSeg, eval_str};

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate an expression against a scope object.
pub fn evaluate(expr: &Expr, scope: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segs) => resolve_path(segs, scope),
        Expr::Not(inner) => {
            let v = evaluate(inner, scope)?;
            Ok(Value::Bool(!is_truthy(&v)))
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, scope),
        Expr::Pipeline { input, calls } => {
            let mut value = evaluate(input, scope)?;
            for call in calls {
                value = apply_call(value, call, scope)?;
            }
            Ok(value)
        }
    }
}

/// Evaluate a step condition to a boolean using truthiness rules.
///
/// Conditions are written bare (`steps.fetch.output | length > 0`) but a
/// single wrapping `${{ }}` marker is tolerated.
pub fn eval_condition(src: &str, scope: &Value) -> Result<bool, EvalError> {
    let trimmed = src.trim();
    let expr_src = single_marker(trimmed).unwrap_or(trimmed);
    Ok(is_truthy(&eval_str(expr_src, scope)?))
}

fn resolve_path(segs: &[PathSeg], scope: &Value) -> Result<Value, EvalError> {
    let mut current = scope;
    for (depth, seg) in segs.iter().enumerate() {
        let next = match seg {
            PathSeg::Key(key) => current.get(key.as_str()),
            PathSeg::Index(idx) => current.get(idx),
        };
        match next {
            Some(v) => current = v,
            None => {
                return Err(EvalError::UndefinedReference(path_display(
                    &segs[..=depth],
                )));
            }
        }
    }
    Ok(current.clone())
}

fn path_display(segs: &[PathSeg]) -> String {
    let mut out = String::new();
    for seg in segs {
        match seg {
            PathSeg::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            PathSeg::Index(idx) => {
                out.push('[');
                out.push_str(&idx.to_string());
                out.push(']');
            }
        }
    }
    out
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, scope: &Value) -> Result<Value, EvalError> {
    // Boolean operators short-circuit.
    match op {
        BinaryOp::And => {
            let l = evaluate(lhs, scope)?;
            if !is_truthy(&l) {
                return Ok(Value::Bool(false));
            }
            let r = evaluate(rhs, scope)?;
            return Ok(Value::Bool(is_truthy(&r)));
        }
        BinaryOp::Or => {
            let l = evaluate(lhs, scope)?;
            if is_truthy(&l) {
                return Ok(Value::Bool(true));
            }
            let r = evaluate(rhs, scope)?;
            return Ok(Value::Bool(is_truthy(&r)));
        }
        _ => {}
    }

    let l = evaluate(lhs, scope)?;
    let r = evaluate(rhs, scope)?;
    let result = match op {
        BinaryOp::Eq => values_equal(&l, &r),
        BinaryOp::Ne => !values_equal(&l, &r),
        BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le => {
            let ordering = compare_ordered(&l, &r)?;
            match op {
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Ge => ordering.is_ge(),
                BinaryOp::Le => ordering.is_le(),
                _ => unreachable!(),
            }
        }
        BinaryOp::And | BinaryOp::Or => unreachable!(),
    };
    Ok(Value::Bool(result))
}

/// Equality that treats all JSON numbers uniformly (5 == 5.0).
fn values_equal(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn compare_ordered(l: &Value, r: &Value) -> Result<std::cmp::Ordering, EvalError> {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| EvalError::TypeMismatch {
                expected: "comparable numbers".to_string(),
                found: "NaN".to_string(),
            });
    }
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(a.cmp(b));
    }
    Err(EvalError::TypeMismatch {
        expected: "two numbers or two strings".to_string(),
        found: format!("{} and {}", type_name(l), type_name(r)),
    })
}

/// Truthiness used by conditions and boolean operators: null and empty
/// collections are false, zero is false, everything else is true.
pub(crate) fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn type_name(v: &Value) -> &'static str {
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
// Pipeline transforms
// ---------------------------------------------------------------------------

fn apply_call(input: Value, call: &Call, scope: &Value) -> Result<Value, EvalError> {
    let args: Vec<Value> = call
        .args
        .iter()
        .map(|a| evaluate(a, scope))
        .collect::<Result<_, _>>()?;

    match call.name.as_str() {
        "length" => {
            expect_arity(call, &args, 0)?;
            let len = match &input {
                Value::Array(a) => a.len(),
                Value::String(s) => s.chars().count(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(EvalError::TypeMismatch {
                        expected: "array, string, or object".to_string(),
                        found: type_name(other).to_string(),
                    });
                }
            };
            Ok(Value::Number(Number::from(len)))
        }
        "first" => {
            expect_arity(call, &args, 1)?;
            let n = arg_as_usize(call, &args[0])?;
            let mut items = expect_array(&call.name, input)?;
            items.truncate(n);
            Ok(Value::Array(items))
        }
        "last" => {
            expect_arity(call, &args, 1)?;
            let n = arg_as_usize(call, &args[0])?;
            let items = expect_array(&call.name, input)?;
            let skip = items.len().saturating_sub(n);
            Ok(Value::Array(items.into_iter().skip(skip).collect()))
        }
        "slice" => {
            expect_arity(call, &args, 2)?;
            let start = arg_as_usize(call, &args[0])?;
            let end = arg_as_usize(call, &args[1])?;
            if end < start {
                return Err(EvalError::InvalidArgument {
                    function: call.name.clone(),
                    reason: format!("end {end} precedes start {start}"),
                });
            }
            let items = expect_array(&call.name, input)?;
            let start = start.min(items.len());
            let end = end.min(items.len());
            Ok(Value::Array(items[start..end].to_vec()))
        }
        "join" => {
            expect_arity(call, &args, 1)?;
            let sep = match &args[0] {
                Value::String(s) => s.clone(),
                other => {
                    return Err(EvalError::InvalidArgument {
                        function: call.name.clone(),
                        reason: format!("separator must be a string, got {}", type_name(other)),
                    });
                }
            };
            let items = expect_array(&call.name, input)?;
            let parts: Vec<String> = items.iter().map(stringify).collect();
            Ok(Value::String(parts.join(&sep)))
        }
        "lower" => {
            expect_arity(call, &args, 0)?;
            let s = expect_string(&call.name, input)?;
            Ok(Value::String(s.to_lowercase()))
        }
        "upper" => {
            expect_arity(call, &args, 0)?;
            let s = expect_string(&call.name, input)?;
            Ok(Value::String(s.to_uppercase()))
        }
        "trim" => {
            expect_arity(call, &args, 0)?;
            let s = expect_string(&call.name, input)?;
            Ok(Value::String(s.trim().to_string()))
        }
        other => Err(EvalError::UnknownFunction(other.to_string())),
    }
}

fn expect_arity(call: &Call, args: &[Value], want: usize) -> Result<(), EvalError> {
    if args.len() == want {
        Ok(())
    } else {
        Err(EvalError::InvalidArgument {
            function: call.name.clone(),
            reason: format!("expected {want} argument(s), got {}", args.len()),
        })
    }
}

fn arg_as_usize(call: &Call, arg: &Value) -> Result<usize, EvalError> {
    match arg.as_f64() {
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        _ => Err(EvalError::InvalidArgument {
            function: call.name.clone(),
            reason: format!("expected a non-negative integer, got {arg}"),
        }),
    }
}

fn expect_array(function: &str, input: Value) -> Result<Vec<Value>, EvalError> {
    match input {
        Value::Array(a) => Ok(a),
        other => Err(EvalError::TypeMismatch {
            expected: format!("array input to '{function}'"),
            found: type_name(&other).to_string(),
        }),
    }
}

fn expect_string(function: &str, input: Value) -> Result<String, EvalError> {
    match input {
        Value::String(s) => Ok(s),
        other => Err(EvalError::TypeMismatch {
            expected: format!("string input to '{function}'"),
            found: type_name(&other).to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

/// Resolve `${{ ... }}` markers in a template string against a scope.
///
/// A template that is exactly one marker preserves the evaluated value's
/// type (`"${{ steps.fetch.output }}"` stays an array). Mixed text and
/// markers produce a string, with non-string values rendered as compact
/// JSON. A template with no markers is returned as a string verbatim.
pub fn interpolate(template: &str, scope: &Value) -> Result<Value, EvalError> {
    let trimmed = template.trim();
    if let Some(inner) = single_marker(trimmed) {
        return eval_str(inner, scope);
    }

    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after
            .find("}}")
            .ok_or_else(|| EvalError::Parse("unterminated '${{' marker".to_string()))?;
        let value = eval_str(after[..end].trim(), scope)?;
        out.push_str(&stringify(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// The whole string is a single `${{ ... }}` marker.
fn single_marker(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${{")?.strip_suffix("}}")?;
    if inner.contains("${{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Render a value for embedding into surrounding text.
fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "inputs": {"topic": "Rust", "limit": 5},
            "steps": {
                "fetch": {
                    "output": [
                        {"title": "alpha"},
                        {"title": "beta"},
                        {"title": "gamma"},
                    ]
                },
                "analyze": {"output": {"score": 0.87, "tags": ["a", "b"]}},
            },
            "env": {"REGION": "eu"},
            "item": {"title": "beta"},
            "item_index": 1,
        })
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    #[test]
    fn test_path_resolution() {
        let s = scope();
        assert_eq!(eval_str("inputs.topic", &s).unwrap(), json!("Rust"));
        assert_eq!(
            eval_str("steps.fetch.output[1].title", &s).unwrap(),
            json!("beta")
        );
        assert_eq!(eval_str("env[\"REGION\"]", &s).unwrap(), json!("eu"));
    }

    #[test]
    fn test_undefined_reference_reports_failing_prefix() {
        let s = scope();
        let err = eval_str("steps.fetch.output[9].title", &s).unwrap_err();
        assert_eq!(
            err,
            EvalError::UndefinedReference("steps.fetch.output[9]".to_string())
        );

        let err = eval_str("inputs.missing", &s).unwrap_err();
        assert_eq!(
            err,
            EvalError::UndefinedReference("inputs.missing".to_string())
        );
    }

    // -----------------------------------------------------------------------
    // Operators
    // -----------------------------------------------------------------------

    #[test]
    fn test_numeric_equality_ignores_representation() {
        let s = scope();
        // Literal 5 lexes as a float; scope holds an integer.
        assert_eq!(eval_str("inputs.limit == 5", &s).unwrap(), json!(true));
        assert_eq!(eval_str("inputs.limit != 6", &s).unwrap(), json!(true));
    }

    #[test]
    fn test_ordering_comparisons() {
        let s = scope();
        assert_eq!(
            eval_str("steps.analyze.output.score >= 0.5", &s).unwrap(),
            json!(true)
        );
        assert_eq!(eval_str("'apple' < 'banana'", &s).unwrap(), json!(true));
    }

    #[test]
    fn test_ordering_type_mismatch() {
        let err = eval_str("'apple' < 3", &scope()).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
    }

    #[test]
    fn test_boolean_operators_and_truthiness() {
        let s = scope();
        assert_eq!(
            eval_str("inputs.topic && inputs.limit > 3", &s).unwrap(),
            json!(true)
        );
        assert_eq!(eval_str("!inputs.topic", &s).unwrap(), json!(false));
        // Short-circuit: rhs of a satisfied || never evaluates.
        assert_eq!(
            eval_str("true || steps.missing.output", &s).unwrap(),
            json!(true)
        );
    }

    // -----------------------------------------------------------------------
    // Pipelines
    // -----------------------------------------------------------------------

    #[test]
    fn test_pipeline_transforms() {
        let s = scope();
        assert_eq!(
            eval_str("steps.fetch.output | length", &s).unwrap(),
            json!(3)
        );
        assert_eq!(
            eval_str("steps.fetch.output | first(2) | length", &s).unwrap(),
            json!(2)
        );
        assert_eq!(
            eval_str("steps.fetch.output | last(1)", &s).unwrap(),
            json!([{"title": "gamma"}])
        );
        assert_eq!(
            eval_str("steps.fetch.output | slice(1, 3) | length", &s).unwrap(),
            json!(2)
        );
        assert_eq!(
            eval_str("steps.analyze.output.tags | join(', ')", &s).unwrap(),
            json!("a, b")
        );
        assert_eq!(eval_str("inputs.topic | lower", &s).unwrap(), json!("rust"));
        assert_eq!(
            eval_str("'  padded  ' | trim | upper", &s).unwrap(),
            json!("PADDED")
        );
    }

    #[test]
    fn test_pipeline_first_beyond_length() {
        let s = scope();
        assert_eq!(
            eval_str("steps.fetch.output | first(100) | length", &s).unwrap(),
            json!(3)
        );
    }

    #[test]
    fn test_pipeline_errors() {
        let s = scope();
        assert!(matches!(
            eval_str("steps.fetch.output | shuffle", &s).unwrap_err(),
            EvalError::UnknownFunction(_)
        ));
        assert!(matches!(
            eval_str("inputs.limit | length", &s).unwrap_err(),
            EvalError::TypeMismatch { .. }
        ));
        assert!(matches!(
            eval_str("steps.fetch.output | first(-1)", &s).unwrap_err(),
            EvalError::InvalidArgument { .. }
        ));
        assert!(matches!(
            eval_str("steps.fetch.output | first", &s).unwrap_err(),
            EvalError::InvalidArgument { .. }
        ));
    }

    // -----------------------------------------------------------------------
    // Conditions
    // -----------------------------------------------------------------------

    #[test]
    fn test_eval_condition() {
        let s = scope();
        assert!(eval_condition("steps.fetch.output | length > 0", &s).unwrap());
        assert!(!eval_condition("steps.analyze.output.score > 0.9", &s).unwrap());
        // Single wrapping marker is tolerated.
        assert!(eval_condition("${{ inputs.limit == 5 }}", &s).unwrap());
    }

    #[test]
    fn test_eval_condition_undefined_is_an_error() {
        let err = eval_condition("steps.nope.output", &scope()).unwrap_err();
        assert!(matches!(err, EvalError::UndefinedReference(_)));
    }

    // -----------------------------------------------------------------------
    // Interpolation
    // -----------------------------------------------------------------------

    #[test]
    fn test_interpolate_single_marker_preserves_type() {
        let s = scope();
        let v = interpolate("${{ steps.fetch.output }}", &s).unwrap();
        assert!(v.is_array());
        assert_eq!(v.as_array().unwrap().len(), 3);

        let v = interpolate("${{ inputs.limit }}", &s).unwrap();
        assert_eq!(v, json!(5));
    }

    #[test]
    fn test_interpolate_mixed_text_stringifies() {
        let s = scope();
        let v = interpolate(
            "Topic ${{ inputs.topic }}: ${{ steps.fetch.output | length }} articles",
            &s,
        )
        .unwrap();
        assert_eq!(v, json!("Topic Rust: 3 articles"));
    }

    #[test]
    fn test_interpolate_plain_string_passthrough() {
        let v = interpolate("no markers here", &scope()).unwrap();
        assert_eq!(v, json!("no markers here"));
    }

    #[test]
    fn test_interpolate_undefined_reference_propagates() {
        let err = interpolate("${{ steps.typo.output }}", &scope()).unwrap_err();
        assert_eq!(
            err,
            EvalError::UndefinedReference("steps.typo".to_string())
        );
    }

    #[test]
    fn test_interpolate_unterminated_marker() {
        let err = interpolate("${{ inputs.topic", &scope()).unwrap_err();
        assert!(matches!(err, EvalError::Parse(_)));
    }

    #[test]
    fn test_interpolate_item_scope() {
        let s = scope();
        let v = interpolate("${{ item.title }} (#${{ item_index }})", &s).unwrap();
        assert_eq!(v, json!("beta (#1)"));
    }
}
