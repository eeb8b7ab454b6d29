use crate::debugger::{ExceptionInfo, ExceptionKind, RenderedValue};
use crate::parser::{BinOp, Expr};
use std::fmt;
use std::sync::Arc;

/// A raised exception; shared by every frame it propagates through.
#[derive(Debug, PartialEq)]
pub struct ExceptionObject {
    pub id: u64,
    pub kind: ExceptionKind,
    pub message: String,
    /// Raised on a line marked `@IgnoreException`.
    pub ignored: bool,
}

impl ExceptionObject {
    pub fn info(&self) -> ExceptionInfo {
        ExceptionInfo {
            object_id: self.id,
            kind: self.kind.clone(),
            description: self.to_string(),
        }
    }
}

impl fmt::Display for ExceptionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind.name)
        } else {
            write!(f, "{}: {}", self.kind.name, self.message)
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
    None,
    Exception(Arc<ExceptionObject>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::None, Value::None) => true,
            (Value::Exception(a), Value::Exception(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &str {
        match self {
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::Bool(_) => "bool",
            Value::None => "NoneType",
            Value::Exception(e) => &e.kind.name,
        }
    }

    /// Source-like form shown to the controller.
    pub fn repr(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::None => "None".to_string(),
            Value::Exception(e) => format!("{}('{}')", e.kind.name, e.message),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::None => false,
            Value::Exception(_) => true,
        }
    }

    pub fn children(&self) -> Vec<(String, Value)> {
        match self {
            Value::Exception(e) => vec![
                ("kind".to_string(), Value::Str(e.kind.name.clone())),
                ("message".to_string(), Value::Str(e.message.clone())),
                (
                    "ancestors".to_string(),
                    Value::Str(e.kind.ancestors.join(", ")),
                ),
            ],
            _ => Vec::new(),
        }
    }

    pub fn render(&self, name: &str) -> RenderedValue {
        RenderedValue {
            name: name.to_string(),
            type_tag: self.type_name().to_string(),
            qualifier: "builtins".to_string(),
            value: self.repr(),
            has_children: matches!(self, Value::Exception(_)),
            is_error: false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{}", s),
            Value::Exception(e) => write!(f, "{}", e.message),
            other => write!(f, "{}", other.repr()),
        }
    }
}

/// Failure while evaluating an expression; becomes a script exception or a
/// rendered error value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    Name(String),
    Type(String),
}

impl EvalError {
    pub fn kind(&self) -> &'static str {
        match self {
            EvalError::Name(_) => "NameError",
            EvalError::Type(_) => "TypeError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            EvalError::Name(m) | EvalError::Type(m) => m,
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

pub fn undefined(name: &str) -> EvalError {
    EvalError::Name(format!("name '{}' is not defined", name))
}

pub fn eval(expr: &Expr, lookup: &dyn Fn(&str) -> Option<Value>) -> Result<Value, EvalError> {
    match expr {
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::None => Ok(Value::None),
        Expr::Var(name) => lookup(name).ok_or_else(|| undefined(name)),
        Expr::Binary(left, op, right) => {
            let left = eval(left, lookup)?;
            let right = eval(right, lookup)?;
            binary(&left, *op, &right)
        }
    }
}

fn binary(left: &Value, op: BinOp, right: &Value) -> Result<Value, EvalError> {
    let symbol = match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
    };
    let unsupported = || {
        EvalError::Type(format!(
            "unsupported operand types for {}: '{}' and '{}'",
            symbol,
            left.type_name(),
            right.type_name()
        ))
    };

    match (op, left, right) {
        (BinOp::Eq, a, b) => Ok(Value::Bool(a == b)),
        (BinOp::Ne, a, b) => Ok(Value::Bool(a != b)),
        (BinOp::Add, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
        (BinOp::Sub, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
        (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, Value::Int(a), Value::Int(b)) => {
            Ok(Value::Bool(compare(op, a.cmp(b))))
        }
        (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, Value::Str(a), Value::Str(b)) => {
            Ok(Value::Bool(compare(op, a.cmp(b))))
        }
        _ => Err(unsupported()),
    }
}

fn compare(op: BinOp, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        BinOp::Lt => ordering == Less,
        BinOp::Le => ordering != Greater,
        BinOp::Gt => ordering == Greater,
        BinOp::Ge => ordering != Less,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expr;

    fn run(text: &str) -> Result<Value, EvalError> {
        let lookup = |name: &str| match name {
            "count" => Some(Value::Int(3)),
            "label" => Some(Value::Str("a".into())),
            _ => None,
        };
        eval(&parse_expr(text).unwrap(), &lookup)
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        assert_eq!(run("count + 1").unwrap(), Value::Int(4));
        assert_eq!(run("count - 5").unwrap(), Value::Int(-2));
        assert_eq!(run("label + 'b'").unwrap(), Value::Str("ab".into()));
        assert_eq!(run("count >= 3").unwrap(), Value::Bool(true));
        assert_eq!(run("label < 'b'").unwrap(), Value::Bool(true));
        assert_eq!(run("count == 'x'").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_errors() {
        assert_eq!(run("missing").unwrap_err().kind(), "NameError");
        let err = run("count + label").unwrap_err();
        assert_eq!(err.kind(), "TypeError");
        assert!(err.to_string().contains("'int' and 'str'"));
        assert_eq!(run("label - 'a'").unwrap_err().kind(), "TypeError");
    }

    #[test]
    fn test_rendering() {
        assert_eq!(Value::Str("it's".into()).repr(), "'it\\'s'");
        assert_eq!(Value::Bool(true).render("flag").value, "True");
        assert!(!Value::None.truthy());
        let exception = Value::Exception(Arc::new(ExceptionObject {
            id: 1,
            kind: ExceptionKind::new("ValueError", vec!["Exception".into()]),
            message: "bad".into(),
            ignored: false,
        }));
        let rendered = exception.render("err");
        assert_eq!(rendered.type_tag, "ValueError");
        assert!(rendered.has_children);
        assert_eq!(exception.children().len(), 3);
    }
}
