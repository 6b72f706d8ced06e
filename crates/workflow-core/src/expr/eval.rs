//! Evaluator: walks an `Expr` against a `Scope` and produces a `Value`.
//!
//! Evaluation is side-effect-free: no builtin or method call may mutate
//! state. Writes only ever happen through the step executor's explicit
//! `state.*` assignment handling, never through expression evaluation.

use std::collections::HashMap;

use chrono::Utc;

use super::ast::{BinOp, Expr, UnOp};
use crate::error::{EngineError, Result};
use crate::value::{partial_cmp, values_equal, Value};

/// The binding environment an expression is evaluated against: the three
/// state tiers plus whatever loop/local variables are currently in scope
/// (`item`, `index`, `total`, `attempt_number`, lambda parameters, ...).
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub inputs: Value,
    pub state: Value,
    pub computed: Value,
    pub locals: HashMap<String, Value>,
}

impl Scope {
    pub fn child_with(&self, name: &str, value: Value) -> Scope {
        let mut locals = self.locals.clone();
        locals.insert(name.to_string(), value);
        Scope {
            inputs: self.inputs.clone(),
            state: self.state.clone(),
            computed: self.computed.clone(),
            locals,
        }
    }

    pub fn child_with2(&self, a: &str, av: Value, b: &str, bv: Value) -> Scope {
        let mut locals = self.locals.clone();
        locals.insert(a.to_string(), av);
        locals.insert(b.to_string(), bv);
        Scope {
            inputs: self.inputs.clone(),
            state: self.state.clone(),
            computed: self.computed.clone(),
            locals,
        }
    }
}

pub fn eval(expr: &Expr, scope: &Scope) -> Result<Value> {
    match expr {
        Expr::Null => Ok(Value::null()),
        Expr::Bool(b) => Ok(Value::bool(*b)),
        Expr::Number(n) => Ok(Value::number(*n)),
        Expr::Str(s) => Ok(Value::string(s.clone())),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, scope)?);
            }
            Ok(Value::array(out))
        }
        Expr::Object(fields) => {
            let mut map = std::collections::BTreeMap::new();
            for (k, v) in fields {
                map.insert(k.clone(), eval(v, scope)?);
            }
            Ok(Value::object(map))
        }
        Expr::Ident(name) => resolve_ident(name, scope),
        Expr::Member(base, name) => {
            // `Math.floor`, `JSON.stringify`, etc. are resolved lazily at the
            // call site so the bare member access (e.g. `Math` alone) never
            // needs its own value representation.
            if is_builtin_namespace(base, name) {
                return Ok(Value::string(format!("__builtin_ns__{name}")));
            }
            let base_val = eval(base, scope)?;
            base_val
                .get(name)
                .ok_or_else(|| EngineError::Expression(format!("no such field '{name}'")))
        }
        Expr::Index(base, index) => {
            let base_val = eval(base, scope)?;
            let index_val = eval(index, scope)?;
            if let Some(i) = index_val.as_f64() {
                base_val
                    .index(i as usize)
                    .ok_or_else(|| EngineError::Expression(format!("index {i} out of bounds")))
            } else if let Some(key) = index_val.as_str() {
                base_val
                    .get(key)
                    .ok_or_else(|| EngineError::Expression(format!("no such field '{key}'")))
            } else {
                Err(EngineError::Expression(
                    "index must be a number or string".to_string(),
                ))
            }
        }
        Expr::Call(callee, args) => eval_call(callee, args, scope),
        Expr::Lambda(..) => Err(EngineError::Expression(
            "lambda cannot be evaluated outside a method call".to_string(),
        )),
        Expr::Unary(op, inner) => eval_unary(*op, inner, scope),
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, scope),
        Expr::Ternary(cond, then_branch, else_branch) => {
            if eval(cond, scope)?.is_truthy() {
                eval(then_branch, scope)
            } else {
                eval(else_branch, scope)
            }
        }
    }
}

fn is_builtin_namespace(base: &Expr, _member: &str) -> bool {
    matches!(base, Expr::Ident(n) if n == "Math" || n == "JSON")
}

fn resolve_ident(name: &str, scope: &Scope) -> Result<Value> {
    match name {
        "inputs" => Ok(scope.inputs.clone()),
        "state" => Ok(scope.state.clone()),
        "computed" => Ok(scope.computed.clone()),
        "Math" | "JSON" => Ok(Value::string(format!("__builtin_ns__{name}"))),
        _ => scope
            .locals
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Expression(format!("undefined reference '{name}'"))),
    }
}

fn eval_unary(op: UnOp, inner: &Expr, scope: &Scope) -> Result<Value> {
    let val = eval(inner, scope)?;
    match op {
        UnOp::Not => Ok(Value::bool(!val.is_truthy())),
        UnOp::Neg => {
            let n = val
                .as_f64()
                .ok_or_else(|| EngineError::Expression("cannot negate a non-number".to_string()))?;
            Ok(Value::number(-n))
        }
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, scope: &Scope) -> Result<Value> {
    // Short-circuit logical operators evaluate the right side lazily.
    match op {
        BinOp::And => {
            let l = eval(lhs, scope)?;
            if !l.is_truthy() {
                return Ok(l);
            }
            return eval(rhs, scope);
        }
        BinOp::Or => {
            let l = eval(lhs, scope)?;
            if l.is_truthy() {
                return Ok(l);
            }
            return eval(rhs, scope);
        }
        _ => {}
    }

    let l = eval(lhs, scope)?;
    let r = eval(rhs, scope)?;

    match op {
        BinOp::Add => match (l.as_str(), r.as_str()) {
            (Some(a), Some(b)) => Ok(Value::string(format!("{a}{b}"))),
            _ => {
                if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
                    Ok(Value::number(a + b))
                } else {
                    Ok(Value::string(format!(
                        "{}{}",
                        l.to_template_string(),
                        r.to_template_string()
                    )))
                }
            }
        },
        BinOp::Sub => numeric_op(&l, &r, |a, b| a - b),
        BinOp::Mul => numeric_op(&l, &r, |a, b| a * b),
        BinOp::Div => {
            let (a, b) = numeric_pair(&l, &r)?;
            if b == 0.0 {
                return Err(EngineError::Expression("division by zero".to_string()));
            }
            Ok(Value::number(a / b))
        }
        BinOp::Mod => {
            let (a, b) = numeric_pair(&l, &r)?;
            if b == 0.0 {
                return Err(EngineError::Expression("division by zero".to_string()));
            }
            Ok(Value::number(a % b))
        }
        BinOp::Eq => Ok(Value::bool(values_equal(&l, &r))),
        BinOp::Ne => Ok(Value::bool(!values_equal(&l, &r))),
        BinOp::Lt => cmp_op(&l, &r, std::cmp::Ordering::is_lt),
        BinOp::Le => cmp_op(&l, &r, std::cmp::Ordering::is_le),
        BinOp::Gt => cmp_op(&l, &r, std::cmp::Ordering::is_gt),
        BinOp::Ge => cmp_op(&l, &r, std::cmp::Ordering::is_ge),
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn numeric_pair(l: &Value, r: &Value) -> Result<(f64, f64)> {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(EngineError::Expression(
            "arithmetic operator requires numeric operands".to_string(),
        )),
    }
}

fn numeric_op(l: &Value, r: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value> {
    let (a, b) = numeric_pair(l, r)?;
    Ok(Value::number(f(a, b)))
}

fn cmp_op(l: &Value, r: &Value, pred: impl Fn(std::cmp::Ordering) -> bool) -> Result<Value> {
    let ord = partial_cmp(l, r)
        .ok_or_else(|| EngineError::Expression("values are not comparable".to_string()))?;
    Ok(Value::bool(pred(ord)))
}

fn eval_call(callee: &Expr, args: &[Expr], scope: &Scope) -> Result<Value> {
    match callee {
        // `now()`
        Expr::Ident(name) if name == "now" => {
            if !args.is_empty() {
                return Err(EngineError::Expression("now() takes no arguments".to_string()));
            }
            Ok(Value::string(Utc::now().to_rfc3339()))
        }
        // `Math.*` / `JSON.*`
        Expr::Member(base, method) if is_builtin_namespace(base, method) => {
            let ns = match base.as_ref() {
                Expr::Ident(n) => n.as_str(),
                _ => unreachable!(),
            };
            let evaluated: Vec<Value> = args
                .iter()
                .map(|a| eval(a, scope))
                .collect::<Result<_>>()?;
            call_namespace_builtin(ns, method, &evaluated)
        }
        // `<expr>.<method>(args...)` on strings, arrays, or objects.
        Expr::Member(base, method) => {
            let receiver = eval(base, scope)?;
            call_method(&receiver, method, args, scope)
        }
        _ => Err(EngineError::Expression(
            "expression is not callable".to_string(),
        )),
    }
}

fn call_namespace_builtin(ns: &str, method: &str, args: &[Value]) -> Result<Value> {
    match (ns, method) {
        ("Math", "floor") => Ok(Value::number(arg_f64(args, 0)?.floor())),
        ("Math", "ceil") => Ok(Value::number(arg_f64(args, 0)?.ceil())),
        ("Math", "round") => Ok(Value::number(arg_f64(args, 0)?.round())),
        ("Math", "abs") => Ok(Value::number(arg_f64(args, 0)?.abs())),
        ("Math", "min") => Ok(Value::number(args.iter().filter_map(|v| v.as_f64()).fold(
            f64::INFINITY,
            f64::min,
        ))),
        ("Math", "max") => Ok(Value::number(args.iter().filter_map(|v| v.as_f64()).fold(
            f64::NEG_INFINITY,
            f64::max,
        ))),
        ("JSON", "stringify") => {
            let v = args.first().cloned().unwrap_or_else(Value::null);
            Ok(Value::string(
                serde_json::to_string(&v.clone().into_json()).unwrap_or_default(),
            ))
        }
        ("JSON", "parse") => {
            let s = args
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| EngineError::Expression("JSON.parse expects a string".to_string()))?;
            let parsed: serde_json::Value = serde_json::from_str(s)
                .map_err(|e| EngineError::Expression(format!("invalid JSON: {e}")))?;
            Ok(Value::from_json(parsed))
        }
        _ => Err(EngineError::Expression(format!("unknown builtin {ns}.{method}"))),
    }
}

fn arg_f64(args: &[Value], i: usize) -> Result<f64> {
    args.get(i)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| EngineError::Expression("expected a numeric argument".to_string()))
}

fn call_method(receiver: &Value, method: &str, args: &[Expr], scope: &Scope) -> Result<Value> {
    if let Some(s) = receiver.as_str() {
        return call_string_method(s, method, args, scope);
    }
    if let Some(arr) = receiver.as_array() {
        return call_array_method(arr, method, args, scope);
    }
    Err(EngineError::Expression(format!(
        "no method '{method}' on a {}",
        receiver.type_name()
    )))
}

fn call_string_method(s: &str, method: &str, args: &[Expr], scope: &Scope) -> Result<Value> {
    match method {
        "toUpperCase" => Ok(Value::string(s.to_uppercase())),
        "toLowerCase" => Ok(Value::string(s.to_lowercase())),
        "trim" => Ok(Value::string(s.trim().to_string())),
        "includes" => {
            let needle = eval(args.first().ok_or_else(|| {
                EngineError::Expression("includes() requires one argument".to_string())
            })?, scope)?;
            let needle = needle
                .as_str()
                .ok_or_else(|| EngineError::Expression("includes() expects a string".to_string()))?;
            Ok(Value::bool(s.contains(needle)))
        }
        "split" => {
            let sep = eval(args.first().ok_or_else(|| {
                EngineError::Expression("split() requires one argument".to_string())
            })?, scope)?;
            let sep = sep
                .as_str()
                .ok_or_else(|| EngineError::Expression("split() expects a string".to_string()))?;
            let parts: Vec<Value> = s.split(sep).map(Value::string).collect();
            Ok(Value::array(parts))
        }
        "startsWith" => {
            let needle = eval(args.first().ok_or_else(|| {
                EngineError::Expression("startsWith() requires one argument".to_string())
            })?, scope)?;
            let needle = needle
                .as_str()
                .ok_or_else(|| EngineError::Expression("startsWith() expects a string".to_string()))?;
            Ok(Value::bool(s.starts_with(needle)))
        }
        "endsWith" => {
            let needle = eval(args.first().ok_or_else(|| {
                EngineError::Expression("endsWith() requires one argument".to_string())
            })?, scope)?;
            let needle = needle
                .as_str()
                .ok_or_else(|| EngineError::Expression("endsWith() expects a string".to_string()))?;
            Ok(Value::bool(s.ends_with(needle)))
        }
        "substring" => {
            let chars: Vec<char> = s.chars().collect();
            let start = eval(args.first().ok_or_else(|| {
                EngineError::Expression("substring() requires at least one argument".to_string())
            })?, scope)?;
            let start = start
                .as_f64()
                .ok_or_else(|| EngineError::Expression("substring() expects numeric arguments".to_string()))?;
            let end = match args.get(1) {
                Some(expr) => eval(expr, scope)?
                    .as_f64()
                    .ok_or_else(|| EngineError::Expression("substring() expects numeric arguments".to_string()))?,
                None => chars.len() as f64,
            };
            let clamp = |n: f64| (n.max(0.0) as usize).min(chars.len());
            let (mut start, mut end) = (clamp(start), clamp(end));
            if start > end {
                std::mem::swap(&mut start, &mut end);
            }
            Ok(Value::string(chars[start..end].iter().collect::<String>()))
        }
        "length" => Ok(Value::number(s.chars().count() as f64)),
        _ => Err(EngineError::Expression(format!(
            "unknown string method '{method}'"
        ))),
    }
}

fn call_array_method(
    arr: &[serde_json::Value],
    method: &str,
    args: &[Expr],
    scope: &Scope,
) -> Result<Value> {
    let items: Vec<Value> = arr.iter().cloned().map(Value::from_json).collect();

    match method {
        "length" => Ok(Value::number(items.len() as f64)),
        "filter" => {
            let lambda = single_lambda(args)?;
            let mut out = Vec::new();
            for (i, item) in items.iter().enumerate() {
                if apply_lambda(lambda, &[item.clone(), Value::number(i as f64)], scope)?.is_truthy()
                {
                    out.push(item.clone());
                }
            }
            Ok(Value::array(out))
        }
        "map" => {
            let lambda = single_lambda(args)?;
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(apply_lambda(
                    lambda,
                    &[item.clone(), Value::number(i as f64)],
                    scope,
                )?);
            }
            Ok(Value::array(out))
        }
        "some" => {
            let lambda = single_lambda(args)?;
            for (i, item) in items.iter().enumerate() {
                if apply_lambda(lambda, &[item.clone(), Value::number(i as f64)], scope)?.is_truthy()
                {
                    return Ok(Value::bool(true));
                }
            }
            Ok(Value::bool(false))
        }
        "every" => {
            let lambda = single_lambda(args)?;
            for (i, item) in items.iter().enumerate() {
                if !apply_lambda(lambda, &[item.clone(), Value::number(i as f64)], scope)?
                    .is_truthy()
                {
                    return Ok(Value::bool(false));
                }
            }
            Ok(Value::bool(true))
        }
        "findIndex" => {
            let lambda = single_lambda(args)?;
            for (i, item) in items.iter().enumerate() {
                if apply_lambda(lambda, &[item.clone(), Value::number(i as f64)], scope)?.is_truthy()
                {
                    return Ok(Value::number(i as f64));
                }
            }
            Ok(Value::number(-1.0))
        }
        "reduce" => {
            let lambda_expr = args
                .first()
                .ok_or_else(|| EngineError::Expression("reduce() requires a callback".to_string()))?;
            let (params, body) = match lambda_expr {
                Expr::Lambda(params, body) => (params, body.as_ref()),
                _ => {
                    return Err(EngineError::Expression(
                        "reduce() requires an arrow callback".to_string(),
                    ))
                }
            };
            let mut acc = if let Some(init_expr) = args.get(1) {
                eval(init_expr, scope)?
            } else {
                items
                    .first()
                    .cloned()
                    .ok_or_else(|| EngineError::Expression("reduce() of empty array with no initial value".to_string()))?
            };
            let start = if args.len() > 1 { 0 } else { 1 };
            for (i, item) in items.iter().enumerate().skip(start) {
                let child_scope = match params.as_slice() {
                    [acc_name, item_name] => {
                        scope.child_with2(acc_name, acc.clone(), item_name, item.clone())
                    }
                    [acc_name] => scope.child_with(acc_name, acc.clone()),
                    _ => {
                        return Err(EngineError::Expression(
                            "reduce() callback takes one or two parameters".to_string(),
                        ))
                    }
                };
                let _ = i;
                acc = eval(body, &child_scope)?;
            }
            Ok(acc)
        }
        "includes" => {
            let needle = eval(args.first().ok_or_else(|| {
                EngineError::Expression("includes() requires one argument".to_string())
            })?, scope)?;
            Ok(Value::bool(items.iter().any(|v| values_equal(v, &needle))))
        }
        "join" => {
            let sep = match args.first() {
                Some(expr) => eval(expr, scope)?.as_str().unwrap_or(",").to_string(),
                None => ",".to_string(),
            };
            let strs: Vec<String> = items.iter().map(|v| v.to_template_string()).collect();
            Ok(Value::string(strs.join(&sep)))
        }
        _ => Err(EngineError::Expression(format!(
            "unknown array method '{method}'"
        ))),
    }
}

fn single_lambda(args: &[Expr]) -> Result<&Expr> {
    args.first()
        .ok_or_else(|| EngineError::Expression("expected an arrow callback argument".to_string()))
}

fn apply_lambda(lambda: &Expr, bindings: &[Value], scope: &Scope) -> Result<Value> {
    let (params, body) = match lambda {
        Expr::Lambda(params, body) => (params, body.as_ref()),
        _ => return Err(EngineError::Expression("expected an arrow callback".to_string())),
    };
    let child_scope = match params.as_slice() {
        [item_name] => scope.child_with(item_name, bindings[0].clone()),
        [item_name, index_name] => {
            scope.child_with2(item_name, bindings[0].clone(), index_name, bindings[1].clone())
        }
        _ => {
            return Err(EngineError::Expression(
                "arrow callback takes one or two parameters".to_string(),
            ))
        }
    };
    eval(body, &child_scope)
}
