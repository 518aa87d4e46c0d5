//! C1 — the expression evaluator.
//!
//! A small, total expression language for edge conditions and node exit
//! conditions: identifiers, literals, the comparators `== != < <= > >= in
//! contains matches`, and the logical connectives `&& || !` with
//! parenthesization. No function calls, no assignment, no side effects, no
//! loops — `evaluate` always terminates and never mutates its context.

use crate::error::{CoreError, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

mod lexer;
mod parser;

pub use parser::Expr;

/// The compact view handed to the evaluator (spec §4.1): `status`,
/// `iteration`, `max_iterations`, `confidence`, `has_errors`, plus the
/// flattened `receipt.*`, `envelope.*`, and `run.step_count` namespaces.
///
/// Backed by a `serde_json::Value` so dotted paths the author opts into
/// (arbitrary `envelope.*`/`receipt.*` fields) resolve without the
/// evaluator knowing their shape ahead of time.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    fields: HashMap<String, Value>,
}

impl RoutingContext {
    /// Start from an empty context and fill it with [`RoutingContext::set`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a top-level field (`status`, `iteration`, ...) or a namespaced
    /// root (`receipt`, `envelope`, `run`) whose nested fields are reached
    /// via dotted paths.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Resolve a dotted path (`envelope.confidence`, `status`) against the
    /// context. Returns `None` for unresolved identifiers — callers turn
    /// that into [`CoreError::UnresolvedIdentifier`].
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let root = parts.next()?;
        let mut current = self.fields.get(root)?.clone();
        for part in parts {
            current = current.as_object()?.get(part)?.clone();
        }
        Some(current)
    }
}

/// Caches parsed expressions by source text (spec §4.1: "compiled
/// expressions are cached by source text"). Owned by whichever component
/// evaluates expressions repeatedly — the router and the per-node exit
/// condition check — rather than a process-global static, so tests can use
/// an isolated cache per case.
#[derive(Debug, Default)]
pub struct ExprCache {
    compiled: Mutex<HashMap<String, Arc<Expr>>>,
}

impl ExprCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `source`, or return the cached AST if this exact source text
    /// was parsed before.
    pub fn compile(&self, source: &str) -> Result<Arc<Expr>> {
        if let Some(cached) = self.compiled.lock().unwrap().get(source) {
            return Ok(Arc::clone(cached));
        }
        let expr = Arc::new(parser::parse(source)?);
        self.compiled
            .lock()
            .unwrap()
            .insert(source.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    /// Parse and evaluate `source` against `context` in one step, using the
    /// cache.
    pub fn evaluate(&self, source: &str, context: &RoutingContext) -> Result<bool> {
        let expr = self.compile(source)?;
        eval(&expr, context)
    }
}

/// Evaluate an already-parsed expression against `context`.
pub fn eval(expr: &Expr, ctx: &RoutingContext) -> Result<bool> {
    Ok(eval_value(expr, ctx)?.as_bool_strict()?)
}

/// Internal evaluated value: either a boolean result of a sub-expression or
/// a scalar looked up from a literal/identifier, pending comparison.
#[derive(Debug, Clone)]
enum EvalValue {
    Bool(bool),
    Scalar(Value),
}

impl EvalValue {
    fn as_bool_strict(self) -> Result<bool> {
        match self {
            EvalValue::Bool(b) => Ok(b),
            EvalValue::Scalar(Value::Bool(b)) => Ok(b),
            other => Err(CoreError::TypeMismatch(format!(
                "expected boolean, found {:?}",
                other
            ))),
        }
    }
}

fn eval_value(expr: &Expr, ctx: &RoutingContext) -> Result<EvalValue> {
    match expr {
        Expr::Literal(v) => Ok(EvalValue::Scalar(v.clone())),
        Expr::Ident(path) => ctx
            .resolve(path)
            .map(EvalValue::Scalar)
            .ok_or_else(|| CoreError::UnresolvedIdentifier(path.clone())),
        Expr::Not(inner) => Ok(EvalValue::Bool(!eval(inner, ctx)?)),
        Expr::And(l, r) => Ok(EvalValue::Bool(eval(l, ctx)? && eval(r, ctx)?)),
        Expr::Or(l, r) => Ok(EvalValue::Bool(eval(l, ctx)? || eval(r, ctx)?)),
        Expr::Compare(op, l, r) => {
            let lv = as_scalar(eval_value(l, ctx)?)?;
            let rv = as_scalar(eval_value(r, ctx)?)?;
            Ok(EvalValue::Bool(compare(*op, &lv, &rv)?))
        }
    }
}

fn as_scalar(v: EvalValue) -> Result<Value> {
    match v {
        EvalValue::Scalar(s) => Ok(s),
        EvalValue::Bool(b) => Ok(Value::Bool(b)),
    }
}

/// Comparison operators (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    Matches,
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool> {
    match op {
        CompareOp::Eq => Ok(values_equal(lhs, rhs)),
        CompareOp::Ne => Ok(!values_equal(lhs, rhs)),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let (a, b) = (as_f64(lhs)?, as_f64(rhs)?);
            Ok(match op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
                _ => unreachable!(),
            })
        }
        CompareOp::In => match rhs {
            Value::Array(items) => Ok(items.iter().any(|item| values_equal(lhs, item))),
            other => Err(CoreError::TypeMismatch(format!(
                "right-hand side of 'in' must be an array, found {other}"
            ))),
        },
        CompareOp::Contains => match lhs {
            Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, rhs))),
            Value::String(s) => {
                let needle = as_str(rhs)?;
                Ok(s.contains(needle))
            }
            other => Err(CoreError::TypeMismatch(format!(
                "left-hand side of 'contains' must be an array or string, found {other}"
            ))),
        },
        CompareOp::Matches => {
            let haystack = as_str(lhs)?;
            let pattern = as_str(rhs)?;
            let re = Regex::new(pattern)?;
            Ok(re.is_match(haystack))
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn as_f64(v: &Value) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| CoreError::TypeMismatch(format!("expected number, found {v}")))
}

fn as_str(v: &Value) -> Result<&str> {
    v.as_str()
        .ok_or_else(|| CoreError::TypeMismatch(format!("expected string, found {v}")))
}

/// Validate an expression's syntax and regex literals eagerly, as spec §4.1
/// requires ("regex-compile failure is surfaced once at graph-load time").
/// Does not require a [`RoutingContext`].
pub fn validate(source: &str) -> Result<()> {
    let expr = parser::parse(source)?;
    validate_regexes(&expr)
}

fn validate_regexes(expr: &Expr) -> Result<()> {
    match expr {
        Expr::Literal(_) | Expr::Ident(_) => Ok(()),
        Expr::Not(inner) => validate_regexes(inner),
        Expr::And(l, r) | Expr::Or(l, r) => {
            validate_regexes(l)?;
            validate_regexes(r)
        }
        Expr::Compare(CompareOp::Matches, _, r) => {
            if let Expr::Literal(Value::String(pattern)) = r.as_ref() {
                Regex::new(pattern)?;
            }
            Ok(())
        }
        Expr::Compare(_, l, r) => {
            validate_regexes(l)?;
            validate_regexes(r)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_status(status: &str, confidence: f64) -> RoutingContext {
        let mut ctx = RoutingContext::new();
        ctx.set("status", status);
        ctx.set("confidence", confidence);
        ctx
    }

    #[test]
    fn equality_on_string_literal() {
        let cache = ExprCache::new();
        let ctx = ctx_with_status("VERIFIED", 0.9);
        assert!(cache.evaluate(r#"status == "VERIFIED""#, &ctx).unwrap());
        assert!(!cache.evaluate(r#"status == "UNVERIFIED""#, &ctx).unwrap());
    }

    #[test]
    fn numeric_comparison() {
        let cache = ExprCache::new();
        let ctx = ctx_with_status("VERIFIED", 0.9);
        assert!(cache.evaluate("confidence >= 0.5", &ctx).unwrap());
        assert!(!cache.evaluate("confidence > 0.95", &ctx).unwrap());
    }

    #[test]
    fn logical_and_or_not() {
        let cache = ExprCache::new();
        let ctx = ctx_with_status("VERIFIED", 0.9);
        assert!(cache
            .evaluate(r#"status == "VERIFIED" && confidence > 0.5"#, &ctx)
            .unwrap());
        assert!(cache
            .evaluate(r#"!(status == "UNVERIFIED") || confidence < 0.1"#, &ctx)
            .unwrap());
    }

    #[test]
    fn in_and_contains() {
        let cache = ExprCache::new();
        let mut ctx = RoutingContext::new();
        ctx.set("status", "B");
        ctx.set("tags", serde_json::json!(["a", "b", "c"]));
        assert!(cache.evaluate(r#"status in ["A", "B"]"#, &ctx).unwrap());
        assert!(cache.evaluate(r#"tags contains "b""#, &ctx).unwrap());
    }

    #[test]
    fn matches_regex() {
        let cache = ExprCache::new();
        let mut ctx = RoutingContext::new();
        ctx.set("summary", "build #42 passed");
        assert!(cache
            .evaluate(r#"summary matches "passed$""#, &ctx)
            .unwrap());
    }

    #[test]
    fn unresolved_identifier_errors() {
        let cache = ExprCache::new();
        let ctx = RoutingContext::new();
        let err = cache.evaluate("missing == 1", &ctx).unwrap_err();
        assert!(matches!(err, CoreError::UnresolvedIdentifier(_)));
    }

    #[test]
    fn type_mismatch_errors() {
        let cache = ExprCache::new();
        let mut ctx = RoutingContext::new();
        ctx.set("status", "A");
        let err = cache.evaluate("status > 3", &ctx).unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch(_)));
    }

    #[test]
    fn dotted_path_into_envelope() {
        let cache = ExprCache::new();
        let mut ctx = RoutingContext::new();
        ctx.set("envelope", serde_json::json!({"confidence": 0.8}));
        assert!(cache.evaluate("envelope.confidence > 0.5", &ctx).unwrap());
    }

    #[test]
    fn purity_same_input_same_output() {
        let cache = ExprCache::new();
        let ctx = ctx_with_status("VERIFIED", 0.9);
        let a = cache.evaluate(r#"status == "VERIFIED""#, &ctx).unwrap();
        let b = cache.evaluate(r#"status == "VERIFIED""#, &ctx).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cache_reuses_parsed_expression() {
        let cache = ExprCache::new();
        let first = cache.compile("confidence > 0.5").unwrap();
        let second = cache.compile("confidence > 0.5").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn validate_catches_bad_regex_at_load_time() {
        let err = validate(r#"summary matches "(unclosed""#).unwrap_err();
        assert!(matches!(err, CoreError::InvalidRegex(_)));
    }
}
