//! Evaluator for compiled programs.
//!
//! Evaluation is pure: the only inputs are the program, the request context
//! and a cancellation token. `&&` and `||` absorb errors the same way CEL
//! does, so `false && <error>` is `false` and `true || <error>` is `true`.
//! Cancellation is never absorbed.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::policy::checker::{CmpOp, Node, Program, StringOp};
use crate::policy::context::RequestContext;
use crate::policy::errors::EvalError;
use crate::policy::types::Value;

/// Evaluate `program` against `context`, producing the policy decision.
pub fn evaluate(
    program: &Program,
    context: &RequestContext,
    cancel: &CancellationToken,
) -> Result<bool, EvalError> {
    match eval_node(&program.root, context, cancel)?.as_ref() {
        Value::Bool(b) => Ok(*b),
        other => Err(EvalError::failed(format!(
            "program produced {} instead of bool",
            other.type_name()
        ))),
    }
}

type Eval<'a> = Result<Cow<'a, Value>, EvalError>;

fn eval_node<'a>(node: &'a Node, ctx: &'a RequestContext, cancel: &CancellationToken) -> Eval<'a> {
    if cancel.is_cancelled() {
        return Err(EvalError::Cancelled);
    }

    match node {
        Node::Const(value) => Ok(Cow::Borrowed(value)),
        Node::Var(var) => Ok(Cow::Borrowed(ctx.get(*var))),
        Node::List(items) => {
            let values = items
                .iter()
                .map(|item| eval_node(item, ctx, cancel).map(Cow::into_owned))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Cow::Owned(Value::List(values)))
        }
        Node::Select {
            operand,
            field,
            test_only,
        } => {
            let container = eval_node(operand, ctx, cancel)?;
            if *test_only {
                return match container.as_ref() {
                    Value::Map(map) => Ok(Cow::Owned(Value::Bool(map.contains_key(field)))),
                    other => Err(type_fault("has()", other)),
                };
            }
            child(container, Key::Field(field))
        }
        Node::Index { operand, index } => {
            let container = eval_node(operand, ctx, cancel)?;
            let key = eval_node(index, ctx, cancel)?;
            child(container, Key::Index(key.as_ref()))
        }
        Node::In {
            element,
            collection,
        } => {
            let elem = eval_node(element, ctx, cancel)?;
            let coll = eval_node(collection, ctx, cancel)?;
            let found = match (coll.as_ref(), elem.as_ref()) {
                (Value::List(items), needle) => items.contains(needle),
                (Value::Map(map), Value::String(key)) => map.contains_key(key),
                (other, _) => return Err(type_fault("`in`", other)),
            };
            Ok(Cow::Owned(Value::Bool(found)))
        }
        Node::Not(inner) => {
            let b = as_bool(eval_node(inner, ctx, cancel)?.as_ref(), "`!`")?;
            Ok(Cow::Owned(Value::Bool(!b)))
        }
        Node::Negate(inner) => match eval_node(inner, ctx, cancel)?.as_ref() {
            Value::Int(n) => n
                .checked_neg()
                .map(|v| Cow::Owned(Value::Int(v)))
                .ok_or_else(|| EvalError::failed("integer overflow")),
            other => Err(type_fault("`-`", other)),
        },
        Node::And(l, r) => logical(l, r, false, ctx, cancel),
        Node::Or(l, r) => logical(l, r, true, ctx, cancel),
        Node::Compare { op, left, right } => {
            let l = eval_node(left, ctx, cancel)?;
            let r = eval_node(right, ctx, cancel)?;
            Ok(Cow::Owned(Value::Bool(compare(*op, &l, &r)?)))
        }
        Node::Size(inner) => {
            let len = match eval_node(inner, ctx, cancel)?.as_ref() {
                Value::String(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                other => return Err(type_fault("size()", other)),
            };
            let len = i64::try_from(len).map_err(|_| EvalError::failed("size overflows int"))?;
            Ok(Cow::Owned(Value::Int(len)))
        }
        Node::StringTest { op, target, arg } => {
            let target = eval_node(target, ctx, cancel)?;
            let arg = eval_node(arg, ctx, cancel)?;
            let (Value::String(s), Value::String(t)) = (target.as_ref(), arg.as_ref()) else {
                return Err(type_fault("string function", target.as_ref()));
            };
            let result = match op {
                StringOp::StartsWith => s.starts_with(t.as_str()),
                StringOp::EndsWith => s.ends_with(t.as_str()),
                StringOp::Contains => s.contains(t.as_str()),
            };
            Ok(Cow::Owned(Value::Bool(result)))
        }
    }
}

/// `&&` (`short == false`) or `||` (`short == true`) with error absorption:
/// a side equal to `short` decides the result even if the other side failed.
fn logical<'a>(
    l: &'a Node,
    r: &'a Node,
    short: bool,
    ctx: &'a RequestContext,
    cancel: &CancellationToken,
) -> Eval<'a> {
    let left = side(eval_node(l, ctx, cancel))?;
    if left == Ok(short) {
        return Ok(Cow::Owned(Value::Bool(short)));
    }
    let right = side(eval_node(r, ctx, cancel))?;
    if right == Ok(short) {
        return Ok(Cow::Owned(Value::Bool(short)));
    }
    left?;
    right?;
    Ok(Cow::Owned(Value::Bool(!short)))
}

/// Lift a logical operand; the outer `Err` carries cancellation, which is never absorbed.
fn side(result: Eval<'_>) -> Result<Result<bool, EvalError>, EvalError> {
    match result {
        Err(EvalError::Cancelled) => Err(EvalError::Cancelled),
        Err(e) => Ok(Err(e)),
        Ok(value) => Ok(as_bool(value.as_ref(), "logical operator")),
    }
}

fn as_bool(value: &Value, what: &str) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(type_fault(what, other)),
    }
}

fn type_fault(what: &str, found: &Value) -> EvalError {
    EvalError::failed(format!("{what} not applicable to {}", found.type_name()))
}

pub(crate) fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => return Ok(l == r),
        CmpOp::Ne => return Ok(l != r),
        _ => {}
    }
    let ordering = match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            return Err(EvalError::failed(format!(
                "cannot order {} and {}",
                l.type_name(),
                r.type_name()
            )))
        }
    };
    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
    })
}

enum Key<'k> {
    Field(&'k str),
    Index(&'k Value),
}

/// Project into a map or list, borrowing from the context when possible.
fn child<'a>(container: Cow<'a, Value>, key: Key<'_>) -> Eval<'a> {
    match container {
        Cow::Borrowed(value) => lookup(value, key).map(Cow::Borrowed),
        Cow::Owned(value) => lookup(&value, key).cloned().map(Cow::Owned),
    }
}

fn lookup<'v>(value: &'v Value, key: Key<'_>) -> Result<&'v Value, EvalError> {
    match (value, key) {
        (Value::Map(map), Key::Field(name)) => map_entry(map, name),
        (Value::Map(map), Key::Index(Value::String(name))) => map_entry(map, name),
        (Value::List(items), Key::Index(Value::Int(i))) => usize::try_from(*i)
            .ok()
            .and_then(|idx| items.get(idx))
            .ok_or_else(|| {
                EvalError::failed(format!(
                    "index {i} out of range for list of length {}",
                    items.len()
                ))
            }),
        (other, _) => Err(type_fault("indexing", other)),
    }
}

fn map_entry<'v>(map: &'v BTreeMap<String, Value>, name: &str) -> Result<&'v Value, EvalError> {
    map.get(name)
        .ok_or_else(|| EvalError::failed(format!("no such key: {name}")))
}
