mod compiler;
mod lexer;
mod types;

pub use compiler::parse_program;
pub use lexer::{parse_expr, split_assignment, IGNORE_EXCEPTION_MARKER};
pub use types::{
    BinOp, Expr, Function, Instr, Op, ParseError, Program, Stream, BUILTIN_EXCEPTIONS,
};
