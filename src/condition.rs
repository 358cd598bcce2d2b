//! Condition evaluation.
//!
//! Pure predicate evaluator used by condition nodes and automation filters:
//! given a value, an operator and a comparison value, produce a boolean.
//! Numeric operators parse both sides as floats (a comma is tolerated as the
//! decimal separator) and evaluate to false when either side does not parse.

use serde::{Deserialize, Serialize};

/// Comparison operators available to condition nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Empty,
    NotEmpty,
    Regex,
}

/// Parse a numeric operand, accepting `3,5` as well as `3.5`.
fn parse_number(raw: &str) -> Option<f64> {
    let normalized = raw.trim().replace(',', ".");
    normalized.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn numeric(value: &str, expected: &str, cmp: fn(f64, f64) -> bool) -> bool {
    match (parse_number(value), parse_number(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Evaluate `value <operator> expected`.
///
/// String comparisons are case-insensitive, matching how inbound WhatsApp
/// text is compared everywhere else in the engine.
pub fn evaluate(value: &str, operator: Operator, expected: &str) -> bool {
    let lhs = value.trim().to_lowercase();
    let rhs = expected.trim().to_lowercase();

    match operator {
        Operator::Equals => lhs == rhs,
        Operator::NotEquals => lhs != rhs,
        Operator::Contains => lhs.contains(&rhs),
        Operator::NotContains => !lhs.contains(&rhs),
        Operator::StartsWith => lhs.starts_with(&rhs),
        Operator::EndsWith => lhs.ends_with(&rhs),
        Operator::Greater => numeric(value, expected, |a, b| a > b),
        Operator::GreaterEqual => numeric(value, expected, |a, b| a >= b),
        Operator::Less => numeric(value, expected, |a, b| a < b),
        Operator::LessEqual => numeric(value, expected, |a, b| a <= b),
        Operator::Empty => lhs.is_empty(),
        Operator::NotEmpty => !lhs.is_empty(),
        Operator::Regex => regex::Regex::new(expected)
            .map(|re| re.is_match(value))
            .unwrap_or(false),
    }
}
