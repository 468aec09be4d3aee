//! `SandboxExpr`: the restricted expression language record-resident
//! `function`/`policy` code is written in. Arithmetic, comparisons,
//! dotted field access into the input JSON, a ternary, array/object
//! literals, and a fixed set of builtin predicates — no loops, no
//! assignment, no ambient access.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    Compile { detail: String },
    Runtime { detail: String },
    Timeout,
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Compile { detail } => write!(f, "compile error: {detail}"),
            SandboxError::Runtime { detail } => write!(f, "runtime error: {detail}"),
            SandboxError::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::error::Error for SandboxError {}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    /// Dotted path into the `input` environment, e.g. `input.order.qty`.
    Field(Vec<String>),
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    /// Fixed builtin predicates: `contains`, `len`, `abs`.
    Call { name: String, args: Vec<Expr> },
    /// `[a, b, c]` — a policy action list, most commonly.
    Array(Vec<Expr>),
    /// `{ "key": expr, ... }` — a policy action object, most commonly.
    Object(Vec<(String, Expr)>),
    /// `cond ? then : else` — the only branching this language has.
    If { cond: Box<Expr>, then: Box<Expr>, or_else: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// The resource bound enforced while evaluating one `SandboxExpr`: every
/// AST node visited costs one step; exceeding `max_steps` is a runtime
/// error, never a silent truncation.
pub struct StepBudget {
    pub max_steps: u64,
    spent: u64,
}

impl StepBudget {
    pub fn new(max_steps: u64) -> Self {
        Self { max_steps, spent: 0 }
    }

    fn tick(&mut self) -> Result<(), SandboxError> {
        self.spent += 1;
        if self.spent > self.max_steps {
            return Err(SandboxError::Runtime {
                detail: format!("step limit of {} exceeded", self.max_steps),
            });
        }
        Ok(())
    }
}

pub fn eval(expr: &Expr, input: &Value, budget: &mut StepBudget) -> Result<Value, SandboxError> {
    budget.tick()?;
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(serde_json::json!(n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Field(path) => {
            let mut cur = input;
            for segment in path {
                cur = cur.get(segment).unwrap_or(&Value::Null);
            }
            Ok(cur.clone())
        }
        Expr::Unary { op, expr } => {
            let v = eval(expr, input, budget)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                UnaryOp::Neg => {
                    let n = as_number(&v)?;
                    Ok(serde_json::json!(-n))
                }
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            // Short-circuit && / || before evaluating the right side.
            if matches!(op, BinaryOp::And) {
                let l = eval(lhs, input, budget)?;
                if !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                let r = eval(rhs, input, budget)?;
                return Ok(Value::Bool(truthy(&r)));
            }
            if matches!(op, BinaryOp::Or) {
                let l = eval(lhs, input, budget)?;
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                let r = eval(rhs, input, budget)?;
                return Ok(Value::Bool(truthy(&r)));
            }

            let l = eval(lhs, input, budget)?;
            let r = eval(rhs, input, budget)?;
            match op {
                BinaryOp::Add => Ok(serde_json::json!(as_number(&l)? + as_number(&r)?)),
                BinaryOp::Sub => Ok(serde_json::json!(as_number(&l)? - as_number(&r)?)),
                BinaryOp::Mul => Ok(serde_json::json!(as_number(&l)? * as_number(&r)?)),
                BinaryOp::Div => {
                    let denom = as_number(&r)?;
                    if denom == 0.0 {
                        return Err(SandboxError::Runtime {
                            detail: "division by zero".into(),
                        });
                    }
                    Ok(serde_json::json!(as_number(&l)? / denom))
                }
                BinaryOp::Eq => Ok(Value::Bool(l == r)),
                BinaryOp::Ne => Ok(Value::Bool(l != r)),
                BinaryOp::Lt => Ok(Value::Bool(as_number(&l)? < as_number(&r)?)),
                BinaryOp::Le => Ok(Value::Bool(as_number(&l)? <= as_number(&r)?)),
                BinaryOp::Gt => Ok(Value::Bool(as_number(&l)? > as_number(&r)?)),
                BinaryOp::Ge => Ok(Value::Bool(as_number(&l)? >= as_number(&r)?)),
                BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
            }
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval(a, input, budget)?);
            }
            call_builtin(name, &values)
        }
        Expr::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, input, budget)?);
            }
            Ok(Value::Array(values))
        }
        Expr::Object(fields) => {
            let mut map = serde_json::Map::with_capacity(fields.len());
            for (key, value_expr) in fields {
                map.insert(key.clone(), eval(value_expr, input, budget)?);
            }
            Ok(Value::Object(map))
        }
        Expr::If { cond, then, or_else } => {
            if truthy(&eval(cond, input, budget)?) {
                eval(then, input, budget)
            } else {
                eval(or_else, input, budget)
            }
        }
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, SandboxError> {
    match name {
        "len" => match args.first() {
            Some(Value::Array(a)) => Ok(serde_json::json!(a.len())),
            Some(Value::String(s)) => Ok(serde_json::json!(s.chars().count())),
            Some(Value::Null) | None => Ok(serde_json::json!(0)),
            Some(other) => Err(SandboxError::Runtime {
                detail: format!("len() does not accept {other}"),
            }),
        },
        "abs" => {
            let n = args.first().map(as_number).transpose()?.unwrap_or(0.0);
            Ok(serde_json::json!(n.abs()))
        }
        "contains" => match (args.first(), args.get(1)) {
            (Some(Value::Array(a)), Some(needle)) => Ok(Value::Bool(a.contains(needle))),
            (Some(Value::String(s)), Some(Value::String(needle))) => {
                Ok(Value::Bool(s.contains(needle.as_str())))
            }
            _ => Err(SandboxError::Runtime {
                detail: "contains(haystack, needle) requires an array/string haystack".into(),
            }),
        },
        other => Err(SandboxError::Runtime {
            detail: format!("unknown builtin '{other}'"),
        }),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(v: &Value) -> Result<f64, SandboxError> {
    v.as_f64().ok_or_else(|| SandboxError::Runtime {
        detail: format!("expected a number, got {v}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_access_reads_nested_input() {
        let input = serde_json::json!({"order": {"qty": 3}});
        let expr = Expr::Field(vec!["order".into(), "qty".into()]);
        let mut budget = StepBudget::new(1000);
        assert_eq!(eval(&expr, &input, &mut budget).unwrap(), serde_json::json!(3));
    }

    #[test]
    fn missing_field_evaluates_to_null_not_an_error() {
        let input = serde_json::json!({});
        let expr = Expr::Field(vec!["missing".into()]);
        let mut budget = StepBudget::new(1000);
        assert_eq!(eval(&expr, &input, &mut budget).unwrap(), Value::Null);
    }

    #[test]
    fn step_budget_is_exhausted_by_deeply_nested_expressions() {
        let mut expr = Expr::Number(1.0);
        for _ in 0..10 {
            expr = Expr::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(expr),
                rhs: Box::new(Expr::Number(1.0)),
            };
        }
        let input = Value::Null;
        let mut budget = StepBudget::new(5);
        let err = eval(&expr, &input, &mut budget).unwrap_err();
        assert!(matches!(err, SandboxError::Runtime { .. }));
    }

    #[test]
    fn and_short_circuits_without_evaluating_rhs() {
        let expr = Expr::Binary {
            op: BinaryOp::And,
            lhs: Box::new(Expr::Bool(false)),
            rhs: Box::new(Expr::Call {
                name: "unknown_would_error".into(),
                args: vec![],
            }),
        };
        let input = Value::Null;
        let mut budget = StepBudget::new(1000);
        assert_eq!(eval(&expr, &input, &mut budget).unwrap(), Value::Bool(false));
    }

    #[test]
    fn object_and_array_literals_build_action_shapes() {
        let input = serde_json::json!({"id": "abc"});
        let expr = Expr::Array(vec![Expr::Object(vec![
            ("run".into(), Expr::Str("run_code".into())),
            ("span_id".into(), Expr::Field(vec!["id".into()])),
        ])]);
        let mut budget = StepBudget::new(1000);
        assert_eq!(
            eval(&expr, &input, &mut budget).unwrap(),
            serde_json::json!([{"run": "run_code", "span_id": "abc"}])
        );
    }

    #[test]
    fn if_expr_selects_branch_without_evaluating_the_other() {
        let expr = Expr::If {
            cond: Box::new(Expr::Bool(true)),
            then: Box::new(Expr::Str("taken".into())),
            or_else: Box::new(Expr::Call { name: "unknown_would_error".into(), args: vec![] }),
        };
        let input = Value::Null;
        let mut budget = StepBudget::new(1000);
        assert_eq!(eval(&expr, &input, &mut budget).unwrap(), serde_json::json!("taken"));
    }
}
