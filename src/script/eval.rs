//! Tree-walking interpreter over `serde_json::Value`.
//!
//! Missing properties read as `null`. Reading a property of `null` or of a
//! primitive is a runtime error, as is arithmetic on non-numbers.

use super::parser::{BinOp, Expr, Function, Place, Stmt, UnOp};
use super::ScriptError;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Outcome of running a block.
enum Flow {
    Normal,
    Return(Value),
}

/// Variables of one function invocation.
pub(crate) struct Scope {
    vars: HashMap<String, Value>,
}

impl Scope {
    pub fn bind(function: &Function, args: Vec<Value>) -> Self {
        let mut vars = HashMap::new();
        let mut args = args.into_iter();
        for param in &function.params {
            vars.insert(param.clone(), args.next().unwrap_or(Value::Null));
        }
        Self { vars }
    }

    /// Take a variable's final value out of the scope.
    pub fn take(&mut self, name: &str) -> Value {
        self.vars.remove(name).unwrap_or(Value::Null)
    }
}

/// Run a function body, returning its `return` value (or `null`).
pub(crate) fn call(function: &Function, scope: &mut Scope) -> Result<Value, ScriptError> {
    match exec_block(&function.body, scope)? {
        Flow::Return(value) => Ok(value),
        Flow::Normal => Ok(Value::Null),
    }
}

fn exec_block(stmts: &[Stmt], scope: &mut Scope) -> Result<Flow, ScriptError> {
    for stmt in stmts {
        if let Flow::Return(value) = exec(stmt, scope)? {
            return Ok(Flow::Return(value));
        }
    }
    Ok(Flow::Normal)
}

fn exec(stmt: &Stmt, scope: &mut Scope) -> Result<Flow, ScriptError> {
    match stmt {
        Stmt::Return(expr) => {
            let value = match expr {
                Some(e) => eval(e, scope)?,
                None => Value::Null,
            };
            Ok(Flow::Return(value))
        }
        Stmt::Declare(name, init) => {
            let value = match init {
                Some(e) => eval(e, scope)?,
                None => Value::Null,
            };
            scope.vars.insert(name.clone(), value);
            Ok(Flow::Normal)
        }
        Stmt::Assign(place, expr) => {
            let value = eval(expr, scope)?;
            assign(place, value, scope)?;
            Ok(Flow::Normal)
        }
        Stmt::Delete(place) => {
            delete(place, scope)?;
            Ok(Flow::Normal)
        }
        Stmt::If(cond, then, otherwise) => {
            if truthy(&eval(cond, scope)?) {
                exec_block(then, scope)
            } else {
                exec_block(otherwise, scope)
            }
        }
        Stmt::Expr(expr) => {
            eval(expr, scope)?;
            Ok(Flow::Normal)
        }
    }
}

fn eval(expr: &Expr, scope: &Scope) -> Result<Value, ScriptError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => scope
            .vars
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::Runtime(format!("{} is not defined", name))),
        Expr::Member(object, key) => {
            let object = eval(object, scope)?;
            let key = eval(key, scope)?;
            member(&object, &key)
        }
        Expr::Object(fields) => {
            let mut map = Map::new();
            for (key, value) in fields {
                map.insert(key.clone(), eval(value, scope)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Unary(UnOp::Not, operand) => Ok(Value::Bool(!truthy(&eval(operand, scope)?))),
        Expr::Unary(UnOp::Neg, operand) => {
            let value = eval(operand, scope)?;
            number(-as_number(&value, "-")?)
        }
        Expr::And(left, right) => {
            let left = eval(left, scope)?;
            if truthy(&left) {
                eval(right, scope)
            } else {
                Ok(left)
            }
        }
        Expr::Or(left, right) => {
            let left = eval(left, scope)?;
            if truthy(&left) {
                Ok(left)
            } else {
                eval(right, scope)
            }
        }
        Expr::Conditional(cond, then, otherwise) => {
            if truthy(&eval(cond, scope)?) {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            binary(*op, &left, &right)
        }
    }
}

fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, ScriptError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(equals(left, right))),
        BinOp::NotEq => Ok(Value::Bool(!equals(left, right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => None,
                },
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let result = match ordering {
                Some(o) => match op {
                    BinOp::Lt => o.is_lt(),
                    BinOp::Le => o.is_le(),
                    BinOp::Gt => o.is_gt(),
                    _ => o.is_ge(),
                },
                None => false,
            };
            Ok(Value::Bool(result))
        }
        BinOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => {
                number(a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN))
            }
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", to_text(left), to_text(right))))
            }
            _ => Err(ScriptError::Runtime(format!(
                "cannot add {} and {}",
                type_name(left),
                type_name(right)
            ))),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            let symbol = match op {
                BinOp::Sub => "-",
                BinOp::Mul => "*",
                BinOp::Div => "/",
                _ => "%",
            };
            let a = as_number(left, symbol)?;
            let b = as_number(right, symbol)?;
            number(match op {
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                _ => a % b,
            })
        }
    }
}

fn member(object: &Value, key: &Value) -> Result<Value, ScriptError> {
    match (object, key) {
        (Value::Object(map), Value::String(k)) => Ok(map.get(k).cloned().unwrap_or(Value::Null)),
        (Value::Array(items), Value::Number(n)) => Ok(index_of(n)
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null)),
        (Value::Array(items), Value::String(k)) if k == "length" => Ok(Value::from(items.len())),
        (Value::String(s), Value::String(k)) if k == "length" => {
            Ok(Value::from(s.chars().count()))
        }
        (Value::Object(_), Value::Number(n)) => member(object, &Value::String(n.to_string())),
        (Value::Null, _) => Err(ScriptError::Runtime(format!(
            "cannot read property '{}' of null",
            to_text(key)
        ))),
        _ => Ok(Value::Null),
    }
}

fn assign(place: &Place, value: Value, scope: &mut Scope) -> Result<(), ScriptError> {
    let keys = place
        .path
        .iter()
        .map(|k| eval(k, scope))
        .collect::<Result<Vec<_>, _>>()?;

    let Some((last, parents)) = keys.split_last() else {
        scope.vars.insert(place.root.clone(), value);
        return Ok(());
    };

    let target = resolve_mut(&place.root, parents, scope)?;
    match (target, last) {
        (Value::Object(map), key) => {
            map.insert(to_text(key), value);
            Ok(())
        }
        (Value::Array(items), Value::Number(n)) => {
            let i = index_of(n)
                .ok_or_else(|| ScriptError::Runtime(format!("invalid array index {}", n)))?;
            // Arrays only grow by one element per assignment.
            match i.cmp(&items.len()) {
                Ordering::Less => items[i] = value,
                Ordering::Equal => items.push(value),
                Ordering::Greater => {
                    return Err(ScriptError::Runtime(format!(
                        "array index {} out of bounds for length {}",
                        i,
                        items.len()
                    )))
                }
            }
            Ok(())
        }
        (other, key) => Err(ScriptError::Runtime(format!(
            "cannot set property '{}' of {}",
            to_text(key),
            type_name(other)
        ))),
    }
}

fn delete(place: &Place, scope: &mut Scope) -> Result<(), ScriptError> {
    let keys = place
        .path
        .iter()
        .map(|k| eval(k, scope))
        .collect::<Result<Vec<_>, _>>()?;

    let Some((last, parents)) = keys.split_last() else {
        return Err(ScriptError::Runtime(format!(
            "cannot delete variable {}",
            place.root
        )));
    };

    if let Value::Object(map) = resolve_mut(&place.root, parents, scope)? {
        map.remove(&to_text(last));
    }
    Ok(())
}

fn resolve_mut<'a>(
    root: &str,
    path: &[Value],
    scope: &'a mut Scope,
) -> Result<&'a mut Value, ScriptError> {
    let mut current = scope
        .vars
        .get_mut(root)
        .ok_or_else(|| ScriptError::Runtime(format!("{} is not defined", root)))?;

    for key in path {
        current = match (current, key) {
            (Value::Object(map), key) => map.get_mut(&to_text(key)).ok_or_else(|| {
                ScriptError::Runtime(format!("cannot set property of undefined '{}'", to_text(key)))
            })?,
            (Value::Array(items), Value::Number(n)) => index_of(n)
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| ScriptError::Runtime(format!("array index {} out of range", n)))?,
            (other, key) => {
                return Err(ScriptError::Runtime(format!(
                    "cannot read property '{}' of {}",
                    to_text(key),
                    type_name(other)
                )))
            }
        };
    }
    Ok(current)
}

/// JavaScript truthiness.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Structural equality that treats `1` and `1.0` as equal.
fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equals(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map(|w| equals(v, w)).unwrap_or(false))
        }
        _ => left == right,
    }
}

/// Convert an f64 into a JSON number, keeping integral values integral.
pub(crate) fn number(value: f64) -> Result<Value, ScriptError> {
    if value.fract() == 0.0 && value.abs() < 9.007_199_254_740_992e15 {
        return Ok(Value::from(value as i64));
    }
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| ScriptError::Runtime(format!("non-finite number {}", value)))
}

fn as_number(value: &Value, op: &str) -> Result<f64, ScriptError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ScriptError::Runtime("number out of range".into())),
        other => Err(ScriptError::Runtime(format!(
            "operator {} expects numbers, got {}",
            op,
            type_name(other)
        ))),
    }
}

fn index_of(n: &Number) -> Option<usize> {
    n.as_u64().map(|i| i as usize).or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0)
            .map(|f| f as usize)
    })
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".into(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
