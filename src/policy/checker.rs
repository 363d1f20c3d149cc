//! Name resolution, type checking and constant folding.
//!
//! The checker turns the untyped parse tree into a [`Program`] whose root is
//! statically known to produce a `bool`.

use crate::policy::condition::{parse_condition, BinOp, Expr, ExprKind, LitValue};
use crate::policy::errors::CompileError;
use crate::policy::types::{Type, Value, Variable};

/// Resolved, type-checked expression tree executed by the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Const(Value),
    Var(Variable),
    List(Vec<Node>),
    /// Field selection on a map. With `test_only` set this is `has(m.f)`.
    Select {
        operand: Box<Node>,
        field: String,
        test_only: bool,
    },
    Index {
        operand: Box<Node>,
        index: Box<Node>,
    },
    In {
        element: Box<Node>,
        collection: Box<Node>,
    },
    Not(Box<Node>),
    Negate(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare {
        op: CmpOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Size(Box<Node>),
    StringTest {
        op: StringOp,
        target: Box<Node>,
        arg: Box<Node>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    StartsWith,
    EndsWith,
    Contains,
}

/// A compiled policy expression. Its output type is always `bool`.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub(crate) root: Node,
}

/// Parse, check and optimize `source` into an executable program.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    let expr = parse_condition(source)?;
    let (root, ty) = check(&expr)?;
    if ty != Type::Bool {
        return Err(CompileError::NonBooleanOutput {
            found: ty.to_string(),
        });
    }
    Ok(Program { root: fold(root) })
}

fn mismatch(column: usize, message: impl Into<String>) -> CompileError {
    CompileError::TypeMismatch {
        column,
        message: message.into(),
    }
}

/// Flatten `a.b.c` into `["a", "b", "c"]` when the chain is rooted at an identifier.
fn qualified_name(expr: &Expr) -> Option<Vec<&str>> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(vec![name.as_str()]),
        ExprKind::Select { operand, field } => {
            let mut segments = qualified_name(operand)?;
            segments.push(field.as_str());
            Some(segments)
        }
        _ => None,
    }
}

/// Resolve a dotted name against the declared variables, longest prefix first.
/// Remaining segments become field selections.
fn resolve(expr: &Expr) -> Option<Result<(Node, Type), CompileError>> {
    let segments = qualified_name(expr)?;
    for split in (1..=segments.len()).rev() {
        let name = segments[..split].join(".");
        if let Some(var) = Variable::from_name(&name) {
            let mut node = Node::Var(var);
            let mut ty = var.ty();
            for field in &segments[split..] {
                match select_type(&ty, field, expr.column) {
                    Ok(value_ty) => {
                        node = Node::Select {
                            operand: Box::new(node),
                            field: field.to_string(),
                            test_only: false,
                        };
                        ty = value_ty;
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            return Some(Ok((node, ty)));
        }
    }
    Some(Err(CompileError::UndeclaredIdentifier {
        column: name_column(expr),
        name: segments.join("."),
    }))
}

/// Column of the leftmost identifier in a selection chain.
fn name_column(expr: &Expr) -> usize {
    match &expr.kind {
        ExprKind::Select { operand, .. } => name_column(operand),
        _ => expr.column,
    }
}

fn select_type(operand: &Type, field: &str, column: usize) -> Result<Type, CompileError> {
    match operand {
        Type::Map(value) => Ok((**value).clone()),
        other => Err(mismatch(
            column,
            format!("cannot select field `{field}` on {other}"),
        )),
    }
}

fn check(expr: &Expr) -> Result<(Node, Type), CompileError> {
    let column = expr.column;
    match &expr.kind {
        ExprKind::Literal(lit) => Ok(match lit {
            LitValue::Int(n) => (Node::Const(Value::Int(*n)), Type::Int),
            LitValue::Str(s) => (Node::Const(Value::String(s.clone())), Type::String),
            LitValue::Bool(b) => (Node::Const(Value::Bool(*b)), Type::Bool),
        }),
        ExprKind::Ident(_) => resolve(expr).unwrap_or_else(|| unreachable_name(column)),
        ExprKind::Select { operand, field } => {
            if let Some(resolved) = resolve(expr) {
                return resolved;
            }
            let (node, ty) = check(operand)?;
            let value_ty = select_type(&ty, field, column)?;
            Ok((
                Node::Select {
                    operand: Box::new(node),
                    field: field.clone(),
                    test_only: false,
                },
                value_ty,
            ))
        }
        ExprKind::List(items) => {
            let Some((first, rest)) = items.split_first() else {
                return Err(mismatch(column, "empty list literal has no element type"));
            };
            let (head, elem_ty) = check(first)?;
            let mut nodes = vec![head];
            for item in rest {
                let (node, ty) = check(item)?;
                if ty != elem_ty {
                    return Err(mismatch(
                        item.column,
                        format!("list elements must share one type, found {elem_ty} and {ty}"),
                    ));
                }
                nodes.push(node);
            }
            Ok((Node::List(nodes), Type::list(elem_ty)))
        }
        ExprKind::Index { operand, index } => {
            let (container, container_ty) = check(operand)?;
            let (key, key_ty) = check(index)?;
            let value_ty = match (&container_ty, &key_ty) {
                (Type::Map(value), Type::String) => (**value).clone(),
                (Type::List(elem), Type::Int) => (**elem).clone(),
                (Type::Map(_), other) => {
                    return Err(mismatch(column, format!("map index must be string, found {other}")))
                }
                (Type::List(_), other) => {
                    return Err(mismatch(column, format!("list index must be int, found {other}")))
                }
                (other, _) => return Err(mismatch(column, format!("cannot index into {other}"))),
            };
            Ok((
                Node::Index {
                    operand: Box::new(container),
                    index: Box::new(key),
                },
                value_ty,
            ))
        }
        ExprKind::In {
            element,
            collection,
        } => {
            let (elem, elem_ty) = check(element)?;
            let (coll, coll_ty) = check(collection)?;
            match &coll_ty {
                Type::List(inner) if **inner == elem_ty => {}
                Type::Map(_) if elem_ty == Type::String => {}
                Type::List(inner) => {
                    return Err(mismatch(
                        column,
                        format!("`in` on {coll_ty} requires a {inner} element, found {elem_ty}"),
                    ))
                }
                Type::Map(_) => {
                    return Err(mismatch(
                        column,
                        format!("`in` on a map tests keys, which are string, found {elem_ty}"),
                    ))
                }
                other => {
                    return Err(mismatch(
                        column,
                        format!("`in` requires a list or map on the right side, found {other}"),
                    ))
                }
            }
            Ok((
                Node::In {
                    element: Box::new(elem),
                    collection: Box::new(coll),
                },
                Type::Bool,
            ))
        }
        ExprKind::UnaryNot(inner) => {
            let node = expect_type(inner, Type::Bool, "`!` operand")?;
            Ok((Node::Not(Box::new(node)), Type::Bool))
        }
        ExprKind::Negate(inner) => {
            let node = expect_type(inner, Type::Int, "`-` operand")?;
            Ok((Node::Negate(Box::new(node)), Type::Int))
        }
        ExprKind::BinOp { op, left, right } => check_binary(*op, left, right, column),
        ExprKind::Call {
            target,
            function,
            args,
        } => check_call(target.as_deref(), function, args, column),
    }
}

fn unreachable_name(column: usize) -> Result<(Node, Type), CompileError> {
    Err(CompileError::SyntaxError {
        column,
        message: "malformed identifier".into(),
    })
}

fn expect_type(expr: &Expr, want: Type, what: &str) -> Result<Node, CompileError> {
    let (node, ty) = check(expr)?;
    if ty != want {
        return Err(mismatch(
            expr.column,
            format!("{what} must be {want}, found {ty}"),
        ));
    }
    Ok(node)
}

fn check_binary(
    op: BinOp,
    left: &Expr,
    right: &Expr,
    column: usize,
) -> Result<(Node, Type), CompileError> {
    if matches!(op, BinOp::And | BinOp::Or) {
        let what = format!("`{}` operand", op.symbol());
        let l = expect_type(left, Type::Bool, &what)?;
        let r = expect_type(right, Type::Bool, &what)?;
        let node = if op == BinOp::And {
            Node::And(Box::new(l), Box::new(r))
        } else {
            Node::Or(Box::new(l), Box::new(r))
        };
        return Ok((node, Type::Bool));
    }

    let (l, lt) = check(left)?;
    let (r, rt) = check(right)?;
    if lt != rt {
        return Err(mismatch(
            column,
            format!("no `{}` between {lt} and {rt}", op.symbol()),
        ));
    }
    let cmp = match op {
        BinOp::Eq => CmpOp::Eq,
        BinOp::Ne => CmpOp::Ne,
        ordering => {
            if !matches!(lt, Type::Int | Type::String) {
                return Err(mismatch(
                    column,
                    format!("`{}` requires int or string operands, found {lt}", ordering.symbol()),
                ));
            }
            match ordering {
                BinOp::Lt => CmpOp::Lt,
                BinOp::Le => CmpOp::Le,
                BinOp::Gt => CmpOp::Gt,
                _ => CmpOp::Ge,
            }
        }
    };
    Ok((
        Node::Compare {
            op: cmp,
            left: Box::new(l),
            right: Box::new(r),
        },
        Type::Bool,
    ))
}

fn check_call(
    target: Option<&Expr>,
    function: &str,
    args: &[Expr],
    column: usize,
) -> Result<(Node, Type), CompileError> {
    let arity = |want: usize| {
        if args.len() == want {
            Ok(())
        } else {
            Err(mismatch(
                column,
                format!("`{function}` takes {want} argument(s), found {}", args.len()),
            ))
        }
    };

    match (function, target) {
        ("size", _) => {
            let subject = match target {
                Some(t) => {
                    arity(0)?;
                    t
                }
                None => {
                    arity(1)?;
                    &args[0]
                }
            };
            let (node, ty) = check(subject)?;
            if !matches!(ty, Type::String | Type::List(_) | Type::Map(_)) {
                return Err(mismatch(
                    subject.column,
                    format!("`size` requires a string, list or map, found {ty}"),
                ));
            }
            Ok((Node::Size(Box::new(node)), Type::Int))
        }
        ("has", None) => {
            arity(1)?;
            let arg = &args[0];
            if !matches!(arg.kind, ExprKind::Select { .. }) {
                return Err(mismatch(
                    arg.column,
                    "`has` requires a field selection such as has(url.params.id)",
                ));
            }
            match check(arg)? {
                (
                    Node::Select {
                        operand, field, ..
                    },
                    _,
                ) => Ok((
                    Node::Select {
                        operand,
                        field,
                        test_only: true,
                    },
                    Type::Bool,
                )),
                // `url.params` itself resolves to a variable, not a selection
                _ => Err(mismatch(
                    arg.column,
                    "`has` requires a field selection on a map",
                )),
            }
        }
        ("startsWith" | "endsWith" | "contains", Some(t)) => {
            arity(1)?;
            let op = match function {
                "startsWith" => StringOp::StartsWith,
                "endsWith" => StringOp::EndsWith,
                _ => StringOp::Contains,
            };
            let target = expect_type(t, Type::String, &format!("`{function}` receiver"))?;
            let arg = expect_type(&args[0], Type::String, &format!("`{function}` argument"))?;
            Ok((
                Node::StringTest {
                    op,
                    target: Box::new(target),
                    arg: Box::new(arg),
                },
                Type::Bool,
            ))
        }
        _ => Err(CompileError::UndeclaredIdentifier {
            column,
            name: match target {
                Some(_) => format!(".{function}()"),
                None => format!("{function}()"),
            },
        }),
    }
}

// ─── Constant folding ───────────────────────────────────────────────────

fn as_bool(node: &Node) -> Option<bool> {
    match node {
        Node::Const(Value::Bool(b)) => Some(*b),
        _ => None,
    }
}

/// Fold constant sub-expressions bottom-up.
///
/// `&&` and `||` only fold where error absorption gives the same answer:
/// `false && e` is `false` and `true || e` is `true` for any `e`.
pub fn fold(node: Node) -> Node {
    match node {
        Node::Not(inner) => match fold(*inner) {
            Node::Const(Value::Bool(b)) => Node::Const(Value::Bool(!b)),
            other => Node::Not(Box::new(other)),
        },
        Node::Negate(inner) => match fold(*inner) {
            Node::Const(Value::Int(n)) if n.checked_neg().is_some() => {
                Node::Const(Value::Int(-n))
            }
            other => Node::Negate(Box::new(other)),
        },
        Node::And(l, r) => {
            let (l, r) = (fold(*l), fold(*r));
            match (as_bool(&l), as_bool(&r)) {
                (Some(false), _) | (_, Some(false)) => Node::Const(Value::Bool(false)),
                (Some(true), _) => r,
                (_, Some(true)) => l,
                _ => Node::And(Box::new(l), Box::new(r)),
            }
        }
        Node::Or(l, r) => {
            let (l, r) = (fold(*l), fold(*r));
            match (as_bool(&l), as_bool(&r)) {
                (Some(true), _) | (_, Some(true)) => Node::Const(Value::Bool(true)),
                (Some(false), _) => r,
                (_, Some(false)) => l,
                _ => Node::Or(Box::new(l), Box::new(r)),
            }
        }
        Node::Compare { op, left, right } => {
            let (left, right) = (fold(*left), fold(*right));
            match (&left, &right) {
                (Node::Const(a), Node::Const(b)) => match crate::policy::eval::compare(op, a, b) {
                    Ok(result) => Node::Const(Value::Bool(result)),
                    Err(_) => Node::Compare {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                },
                _ => Node::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            }
        }
        Node::List(items) => Node::List(items.into_iter().map(fold).collect()),
        Node::Select {
            operand,
            field,
            test_only,
        } => Node::Select {
            operand: Box::new(fold(*operand)),
            field,
            test_only,
        },
        Node::Index { operand, index } => Node::Index {
            operand: Box::new(fold(*operand)),
            index: Box::new(fold(*index)),
        },
        Node::In {
            element,
            collection,
        } => Node::In {
            element: Box::new(fold(*element)),
            collection: Box::new(fold(*collection)),
        },
        Node::Size(inner) => Node::Size(Box::new(fold(*inner))),
        Node::StringTest { op, target, arg } => Node::StringTest {
            op,
            target: Box::new(fold(*target)),
            arg: Box::new(fold(*arg)),
        },
        leaf @ (Node::Const(_) | Node::Var(_)) => leaf,
    }
}
