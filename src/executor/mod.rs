mod runner;
mod value;

pub use runner::{ForkHandler, Runtime, MAIN_THREAD_NAME};
pub use value::{EvalError, ExceptionObject, Value};
