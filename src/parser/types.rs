use crate::debugger::FunctionLayout;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Exception kinds every script knows, with their parent kind.
pub const BUILTIN_EXCEPTIONS: &[(&str, &str)] = &[
    ("BaseException", ""),
    ("Exception", "BaseException"),
    ("ArithmeticError", "Exception"),
    ("ZeroDivisionError", "ArithmeticError"),
    ("LookupError", "Exception"),
    ("KeyError", "LookupError"),
    ("IndexError", "LookupError"),
    ("NameError", "Exception"),
    ("RuntimeError", "Exception"),
    ("TypeError", "Exception"),
    ("ValueError", "Exception"),
];

#[derive(Error, Debug, Clone, PartialEq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl ParseError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl From<ParseError> for crate::error::Error {
    fn from(err: ParseError) -> Self {
        crate::error::Error::InvalidMessage(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Str(String),
    Bool(bool),
    None,
    Var(String),
    Binary(Box<Expr>, BinOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Set { name: String, expr: Expr },
    Call { function: String },
    Print { stream: Stream, words: Vec<String> },
    Raise { kind: String, message: Option<String> },
    Reraise,
    /// Enter a try body. `handler` is the first instruction of the catch body.
    Try {
        handler: usize,
        kinds: Vec<String>,
        binding: Option<String>,
    },
    /// `catch` reached by falling off the try body: jump past the handler.
    SkipHandler { end: usize },
    /// `end` of a catch body.
    EndHandler,
    Loop { count: Expr, end: usize },
    LoopEnd { body: usize },
    Spawn { function: String, name: Option<String> },
    Join,
    Fork { function: String },
    Return,
    Pass,
}

/// One compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub line: u32,
    /// Block ids enclosing the statement, outermost first.
    pub scope: Vec<u32>,
    pub op: Op,
    /// Structural instruction without a line event of its own.
    pub silent: bool,
    /// Line carries the `@IgnoreException` marker.
    pub ignore_exceptions: bool,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub def_line: u32,
    pub dont_trace: bool,
    pub body: Vec<Instr>,
    pub layout: Arc<FunctionLayout>,
}

impl Function {
    /// Index of the instruction that produces a line event for `line`.
    pub fn index_of_line(&self, line: u32) -> Option<usize> {
        self.body.iter().position(|i| !i.silent && i.line == line)
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    pub file: String,
    pub module: Arc<Function>,
    pub functions: HashMap<String, Arc<Function>>,
    /// Declared exception kinds mapped to their parent kind.
    pub exceptions: HashMap<String, String>,
}

impl Program {
    pub fn parent_of(&self, kind: &str) -> Option<&str> {
        self.exceptions
            .get(kind)
            .map(String::as_str)
            .or_else(|| {
                BUILTIN_EXCEPTIONS
                    .iter()
                    .find(|(name, _)| *name == kind)
                    .map(|(_, parent)| *parent)
            })
            .filter(|parent| !parent.is_empty())
    }

    pub fn is_exception_kind(&self, kind: &str) -> bool {
        self.exceptions.contains_key(kind) || BUILTIN_EXCEPTIONS.iter().any(|(name, _)| *name == kind)
    }

    /// Ancestors of an exception kind, nearest first.
    pub fn ancestors(&self, kind: &str) -> Vec<String> {
        let mut ancestors = Vec::new();
        let mut current = kind;
        while let Some(parent) = self.parent_of(current) {
            if ancestors.iter().any(|a: &String| a.as_str() == parent) || parent == kind {
                break;
            }
            ancestors.push(parent.to_string());
            current = parent;
        }
        ancestors
    }
}
