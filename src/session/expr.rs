// Branch condition evaluator
//
// Page actions branch on expressions of the fixed form
//
//   user_state.<path> OP <literal>      OP in { ==, !=, <, <=, >, >= }
//
// with integer, float, boolean, and quoted-string literals. The grammar is
// deliberately this small and parsed by hand: conditions come from uploaded
// configs, and nothing here may ever evaluate arbitrary code.
//
// Semantics match the renderer: a missing key is undefined and equals
// nothing; ordering comparisons are false unless both sides are numeric.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::paths::get_path;

/// One branch of a page action: take `target` when `when` holds. A branch
/// without a condition is the default arm.
#[derive(Debug, Clone, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub when: Option<String>,
    pub target: String,
}

/// Pick the first branch whose condition holds (or the first unconditional
/// branch). Returns the target page id.
pub fn resolve_branches<'a>(branches: &'a [Branch], state: &Map<String, Value>) -> Option<&'a str> {
    branches
        .iter()
        .find(|branch| match &branch.when {
            None => true,
            Some(expr) => evaluate(expr, state),
        })
        .map(|branch| branch.target.as_str())
}

/// Evaluate a condition against user state. Unparseable expressions are
/// false; configs are validated upstream, so this only guards drift.
pub fn evaluate(expr: &str, state: &Map<String, Value>) -> bool {
    let Some(condition) = parse(expr) else {
        tracing::warn!(expr, "Unparseable branch condition treated as false");
        return false;
    };
    condition.holds(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone)]
struct Condition {
    path: String,
    op: Op,
    literal: Literal,
}

/// Split an expression into (path, op, literal). Two-character operators are
/// matched before their one-character prefixes.
fn parse(expr: &str) -> Option<Condition> {
    const OPS: [(&str, Op); 6] = [
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("<", Op::Lt),
        (">", Op::Gt),
    ];

    let expr = expr.trim();
    for (symbol, op) in OPS {
        let Some(position) = expr.find(symbol) else {
            continue;
        };
        let lhs = expr[..position].trim();
        let rhs = expr[position + symbol.len()..].trim();

        let path = lhs.strip_prefix("user_state.")?;
        if path.is_empty() || rhs.is_empty() {
            return None;
        }
        return Some(Condition {
            path: path.to_string(),
            op,
            literal: parse_literal(rhs)?,
        });
    }
    None
}

fn parse_literal(text: &str) -> Option<Literal> {
    match text {
        "true" => return Some(Literal::Bool(true)),
        "false" => return Some(Literal::Bool(false)),
        _ => {}
    }

    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return Some(Literal::Str(text[1..text.len() - 1].to_string()));
        }
    }

    if let Ok(int) = text.parse::<i64>() {
        return Some(Literal::Int(int));
    }
    if let Ok(float) = text.parse::<f64>() {
        return Some(Literal::Float(float));
    }
    None
}

impl Condition {
    fn holds(&self, state: &Map<String, Value>) -> bool {
        let value = get_path(state, &self.path);
        match self.op {
            Op::Eq => equals(value, &self.literal),
            Op::Ne => !equals(value, &self.literal),
            Op::Lt | Op::Le | Op::Gt | Op::Ge => self.compare_numeric(value),
        }
    }

    fn compare_numeric(&self, value: Option<&Value>) -> bool {
        let (Some(lhs), Some(rhs)) = (value.and_then(as_number), literal_number(&self.literal))
        else {
            return false;
        };
        match self.op {
            Op::Lt => lhs < rhs,
            Op::Le => lhs <= rhs,
            Op::Gt => lhs > rhs,
            Op::Ge => lhs >= rhs,
            Op::Eq | Op::Ne => unreachable!("equality handled separately"),
        }
    }
}

/// Equality across the value/literal divide. Undefined equals nothing;
/// numbers compare numerically regardless of int/float representation.
fn equals(value: Option<&Value>, literal: &Literal) -> bool {
    let Some(value) = value else {
        return false;
    };
    match (value, literal) {
        (Value::Bool(a), Literal::Bool(b)) => a == b,
        (Value::String(a), Literal::Str(b)) => a == b,
        (Value::Number(_), Literal::Int(_) | Literal::Float(_)) => {
            match (as_number(value), literal_number(literal)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn literal_number(literal: &Literal) -> Option<f64> {
    match literal {
        Literal::Int(i) => Some(*i as f64),
        Literal::Float(f) => Some(*f),
        Literal::Bool(_) | Literal::Str(_) => None,
    }
}
