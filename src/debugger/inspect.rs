use super::frame::FrameHandle;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One value as the controller sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedValue {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Where the type comes from, e.g. `builtins`.
    pub qualifier: String,
    pub value: String,
    pub has_children: bool,
    /// The value is the text of an evaluation failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl RenderedValue {
    pub fn error(name: impl Into<String>, kind: &str, message: &str) -> Self {
        Self {
            name: name.into(),
            type_tag: kind.to_string(),
            qualifier: "builtins".to_string(),
            value: format!("{}: {}", kind, message),
            has_children: false,
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Frame index or variable path does not resolve.
    Unresolvable(String),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::Unresolvable(what) => write!(f, "cannot resolve {}", what),
        }
    }
}

impl From<RenderError> for Error {
    fn from(err: RenderError) -> Self {
        Error::TargetNotFound(err.to_string())
    }
}

/// Frame inspection implemented by the instrumentation source.
///
/// Only ever called on the debuggee thread that owns the frames, while it is
/// blocked at a suspension point or deciding on a breakpoint. `frame` is an
/// index into the chain passed to `Session::trace`, 0 being innermost.
/// Evaluation failures come back as values with `is_error` set.
pub trait FrameInspector {
    fn variables(&self, frame: usize) -> Result<Vec<RenderedValue>, RenderError>;

    /// Children of the variable reached by following `path` from the frame.
    fn children(&self, frame: usize, path: &[String]) -> Result<Vec<RenderedValue>, RenderError>;

    fn evaluate(&mut self, frame: usize, expression: &str) -> Result<RenderedValue, RenderError>;

    fn change_variable(&mut self, frame: usize, name: &str, expression: &str) -> Result<RenderedValue, RenderError>;

    /// `Err` carries the text of the evaluation failure.
    fn evaluate_condition(&mut self, frame: usize, expression: &str) -> Result<bool, String>;
}

/// Thread-directed requests executed by the suspended thread itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectRequest {
    Stack,
    Variables { frame: FrameHandle },
    Variable { frame: FrameHandle, path: Vec<String> },
    Evaluate { frame: FrameHandle, expression: String },
    ChangeVariable { frame: FrameHandle, name: String, value: String },
    NextStatementTargets { frame: FrameHandle },
    ExceptionDetails,
}
