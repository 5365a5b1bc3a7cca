//! # Predicate Evaluator
//!
//! Link conditions are written in a small expression language evaluated
//! against a name-to-value environment derived from the tracker's slots.
//! The grammar (see `predicate.pest`) covers boolean connectives
//! (`and`/`or`/`not` with `&&`/`||`/`!` aliases), relational operators,
//! arithmetic, parentheses, and literals for numbers, strings, booleans
//! and `null`.
//!
//! Evaluation semantics:
//! - identifiers resolve from the environment; unknown names are `null`
//! - equality is numeric-aware (`1` equals `1.0`)
//! - relational operators compare numbers numerically and strings
//!   lexicographically; any other operand pairing makes the comparison
//!   false rather than erroring, so conditions over unfilled slots simply
//!   fail to match
//! - arithmetic on non-numbers, logical connectives on non-booleans,
//!   parse failures and non-boolean results are [`PredicateError`]s
//!
//! The environment itself is built with [`slot_env`], which applies the
//! same coercions the rest of the engine expects: `null`, booleans and
//! numbers pass through, the strings `"true"`/`"false"` become booleans,
//! all-digit strings become numbers, and everything else stays text.

use crate::domain::Domain;
use crate::tracker::Tracker;
use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;
use serde_json::{Number, Value};
use std::collections::HashMap;

#[derive(Parser)]
#[grammar = "predicate.pest"]
struct PredicateParser;

/// Name-to-value environment a predicate is evaluated against.
pub type PredicateEnv = HashMap<String, Value>;

/// Errors from parsing or evaluating a predicate.
#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("Failed to parse predicate '{predicate}': {message}")]
    Parse { predicate: String, message: String },

    #[error("Type error in predicate: {0}")]
    Type(String),

    #[error("Predicate '{0}' did not evaluate to a boolean")]
    NotBoolean(String),
}

/// Evaluate a predicate source string against the given environment.
pub fn evaluate(source: &str, env: &PredicateEnv) -> Result<bool, PredicateError> {
    let mut pairs =
        PredicateParser::parse(Rule::predicate, source).map_err(|error| PredicateError::Parse {
            predicate: source.to_string(),
            message: error.to_string(),
        })?;

    let root = pairs.next().ok_or_else(|| PredicateError::Parse {
        predicate: source.to_string(),
        message: "empty parse result".to_string(),
    })?;

    for pair in root.into_inner() {
        if pair.as_rule() == Rule::disjunction {
            return match eval_disjunction(pair, env)? {
                Value::Bool(result) => Ok(result),
                _ => Err(PredicateError::NotBoolean(source.to_string())),
            };
        }
    }

    Err(PredicateError::Parse {
        predicate: source.to_string(),
        message: "no expression found".to_string(),
    })
}

/// Build the evaluation environment from the tracker's current slot
/// values, one entry per domain slot.
pub fn slot_env(tracker: &Tracker, domain: &Domain) -> PredicateEnv {
    domain
        .slots()
        .iter()
        .map(|slot| {
            let value = tracker
                .get_slot(&slot.name)
                .cloned()
                .unwrap_or(Value::Null);
            (slot.name.clone(), coerce_slot_value(value))
        })
        .collect()
}

fn coerce_slot_value(value: Value) -> Value {
    let text = match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => return value,
        Value::String(text) => text,
        other => other.to_string(),
    };

    let lowered = text.to_lowercase();
    if lowered == "true" || lowered == "false" {
        return Value::Bool(lowered == "true");
    }
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(parsed) = text.parse::<f64>() {
            if let Some(number) = Number::from_f64(parsed) {
                return Value::Number(number);
            }
        }
    }
    Value::String(text)
}

fn eval_disjunction(pair: Pair<'_, Rule>, env: &PredicateEnv) -> Result<Value, PredicateError> {
    let mut inner = pair.into_inner();
    let first = inner.next().ok_or_else(|| malformed("disjunction"))?;
    let mut accumulator = eval_conjunction(first, env)?;

    while let Some(op) = inner.next() {
        debug_assert_eq!(op.as_rule(), Rule::or_op);
        let operand = inner.next().ok_or_else(|| malformed("disjunction"))?;
        let lhs = as_bool(&accumulator)?;
        if lhs {
            // short-circuit; the remaining operands are not evaluated
            accumulator = Value::Bool(true);
            continue;
        }
        let rhs = as_bool(&eval_conjunction(operand, env)?)?;
        accumulator = Value::Bool(rhs);
    }

    Ok(accumulator)
}

fn eval_conjunction(pair: Pair<'_, Rule>, env: &PredicateEnv) -> Result<Value, PredicateError> {
    let mut inner = pair.into_inner();
    let first = inner.next().ok_or_else(|| malformed("conjunction"))?;
    let mut accumulator = eval_negation(first, env)?;

    while let Some(op) = inner.next() {
        debug_assert_eq!(op.as_rule(), Rule::and_op);
        let operand = inner.next().ok_or_else(|| malformed("conjunction"))?;
        let lhs = as_bool(&accumulator)?;
        if !lhs {
            accumulator = Value::Bool(false);
            continue;
        }
        let rhs = as_bool(&eval_negation(operand, env)?)?;
        accumulator = Value::Bool(rhs);
    }

    Ok(accumulator)
}

fn eval_negation(pair: Pair<'_, Rule>, env: &PredicateEnv) -> Result<Value, PredicateError> {
    let pairs: Vec<Pair<'_, Rule>> = pair.into_inner().collect();
    let (comparison, negations) = pairs.split_last().ok_or_else(|| malformed("negation"))?;
    let mut value = eval_comparison(comparison.clone(), env)?;

    for _ in negations {
        value = Value::Bool(!as_bool(&value)?);
    }

    Ok(value)
}

fn eval_comparison(pair: Pair<'_, Rule>, env: &PredicateEnv) -> Result<Value, PredicateError> {
    let mut inner = pair.into_inner();
    let first = inner.next().ok_or_else(|| malformed("comparison"))?;
    let lhs = eval_sum(first, env)?;

    let Some(op) = inner.next() else {
        return Ok(lhs);
    };
    let operand = inner.next().ok_or_else(|| malformed("comparison"))?;
    let rhs = eval_sum(operand, env)?;

    Ok(Value::Bool(compare(&lhs, op.as_str(), &rhs)))
}

fn eval_sum(pair: Pair<'_, Rule>, env: &PredicateEnv) -> Result<Value, PredicateError> {
    eval_arithmetic(pair, env, eval_product)
}

fn eval_product(pair: Pair<'_, Rule>, env: &PredicateEnv) -> Result<Value, PredicateError> {
    eval_arithmetic(pair, env, eval_atom)
}

fn eval_arithmetic(
    pair: Pair<'_, Rule>,
    env: &PredicateEnv,
    eval_operand: fn(Pair<'_, Rule>, &PredicateEnv) -> Result<Value, PredicateError>,
) -> Result<Value, PredicateError> {
    let mut inner = pair.into_inner();
    let first = inner.next().ok_or_else(|| malformed("arithmetic"))?;
    let mut accumulator = eval_operand(first, env)?;

    while let Some(op) = inner.next() {
        let operand = inner.next().ok_or_else(|| malformed("arithmetic"))?;
        let lhs = as_number(&accumulator)?;
        let rhs = as_number(&eval_operand(operand, env)?)?;
        let result = match op.as_str() {
            "+" => lhs + rhs,
            "-" => lhs - rhs,
            "*" => lhs * rhs,
            "/" => lhs / rhs,
            other => return Err(PredicateError::Type(format!("unknown operator '{other}'"))),
        };
        let number = Number::from_f64(result)
            .ok_or_else(|| PredicateError::Type("non-finite arithmetic result".to_string()))?;
        accumulator = Value::Number(number);
    }

    Ok(accumulator)
}

fn eval_atom(pair: Pair<'_, Rule>, env: &PredicateEnv) -> Result<Value, PredicateError> {
    let inner = pair.into_inner().next().ok_or_else(|| malformed("atom"))?;
    match inner.as_rule() {
        Rule::boolean => Ok(Value::Bool(inner.as_str() == "true")),
        Rule::null => Ok(Value::Null),
        Rule::number => {
            let parsed: f64 = inner
                .as_str()
                .parse()
                .map_err(|_| PredicateError::Type(format!("bad number '{}'", inner.as_str())))?;
            Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or_else(|| PredicateError::Type("non-finite number".to_string()))
        }
        Rule::string => {
            let content = inner
                .into_inner()
                .next()
                .map(|p| p.as_str().to_string())
                .unwrap_or_default();
            Ok(Value::String(content))
        }
        Rule::identifier => Ok(env.get(inner.as_str()).cloned().unwrap_or(Value::Null)),
        Rule::disjunction => eval_disjunction(inner, env),
        rule => Err(PredicateError::Type(format!(
            "unexpected token '{rule:?}' in expression"
        ))),
    }
}

fn compare(lhs: &Value, op: &str, rhs: &Value) -> bool {
    match op {
        "==" => loose_eq(lhs, rhs),
        "!=" => !loose_eq(lhs, rhs),
        _ => {
            if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
                ordered(op, a.partial_cmp(&b))
            } else if let (Some(a), Some(b)) = (lhs.as_str(), rhs.as_str()) {
                ordered(op, a.partial_cmp(b))
            } else {
                // a relation over null or mismatched types simply fails
                false
            }
        }
    }
}

fn ordered(op: &str, ordering: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::{Equal, Greater, Less};
    match (op, ordering) {
        (">", Some(Greater)) => true,
        (">=", Some(Greater) | Some(Equal)) => true,
        ("<", Some(Less)) => true,
        ("<=", Some(Less) | Some(Equal)) => true,
        _ => false,
    }
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        a == b
    } else {
        lhs == rhs
    }
}

fn as_bool(value: &Value) -> Result<bool, PredicateError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(PredicateError::Type(format!(
            "expected a boolean operand, got {other}"
        ))),
    }
}

fn as_number(value: &Value) -> Result<f64, PredicateError> {
    value.as_f64().ok_or_else(|| {
        PredicateError::Type(format!("expected a numeric operand, got {value}"))
    })
}

fn malformed(rule: &str) -> PredicateError {
    PredicateError::Type(format!("malformed {rule} expression"))
}
