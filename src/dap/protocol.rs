use crate::debugger::{
    CaughtNotify, ExceptionBreakpoint, ExceptionGlobals, FrameHandle, FunctionFilter, HitCondition,
    NewLineBreakpoint, SuspendPolicy, ThreadId,
};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DapMessage {
    pub seq: u64,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(flatten)]
    pub content: DapMessageContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
// Untagged: variants are tried in order, and a response also carries
// `command`, so it has to come before `Request`.
#[serde(untagged)]
pub enum DapMessageContent {
    Response {
        request_seq: u64,
        success: bool,
        command: String,
        message: Option<String>,
        body: Option<Value>,
    },
    Event {
        event: String,
        body: Option<Value>,
    },
    Request {
        command: String,
        arguments: Option<Value>,
    },
}

impl DapMessage {
    pub fn request(seq: u64, command: &str, arguments: Value) -> Self {
        Self {
            seq,
            msg_type: "request".to_string(),
            content: DapMessageContent::Request {
                command: command.to_string(),
                arguments: Some(arguments),
            },
        }
    }
}

/// Decode request arguments; a missing `arguments` object reads as `{}`.
pub fn args<T: DeserializeOwned>(arguments: Option<Value>) -> Result<T> {
    let value = arguments.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|e| Error::InvalidMessage(e.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBreakpointArgs {
    pub file: String,
    pub line: u32,
    /// Absent: any function. Empty: module level only.
    pub function: Option<String>,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
    #[serde(default)]
    pub suspend_policy: SuspendPolicy,
}

impl AddBreakpointArgs {
    pub fn into_breakpoint(self) -> Result<NewLineBreakpoint> {
        let hit_condition = match self.hit_condition.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(text) => Some(HitCondition::parse(text)?),
        };
        Ok(NewLineBreakpoint {
            function: FunctionFilter::from_wire(self.function.as_deref()),
            condition: self.condition,
            hit_condition,
            log_expression: self.log_message.filter(|m| !m.is_empty()),
            suspend_policy: self.suspend_policy,
            ..NewLineBreakpoint::at(self.file, self.line)
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct BreakpointIdArgs {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChangeBreakpointArgs {
    pub id: u64,
    /// Empty string clears the condition.
    pub condition: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionBreakpointArgs {
    pub kind: String,
    #[serde(default)]
    pub notify_on_caught: CaughtNotify,
    #[serde(default)]
    pub notify_on_uncaught: bool,
    #[serde(default)]
    pub ignore_libraries: bool,
    pub suspend_policy: Option<SuspendPolicy>,
}

impl ExceptionBreakpointArgs {
    pub fn into_policy(self, default_policy: SuspendPolicy) -> ExceptionBreakpoint {
        ExceptionBreakpoint {
            kind: self.kind,
            notify_on_caught: self.notify_on_caught,
            notify_on_uncaught: self.notify_on_uncaught,
            ignore_libraries: self.ignore_libraries,
            suspend_policy: self.suspend_policy.unwrap_or(default_policy),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExceptionKindArgs {
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct ExceptionGlobalsArgs {
    #[serde(flatten)]
    pub globals: ExceptionGlobals,
    #[serde(default)]
    pub breakpoints: Vec<ExceptionBreakpointArgs>,
}

#[derive(Debug, Deserialize)]
pub struct RootsArgs {
    pub roots: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct FilesArgs {
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnabledArgs {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadArgs {
    pub thread_id: ThreadId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineArgs {
    pub thread_id: ThreadId,
    pub line: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameArgs {
    pub thread_id: ThreadId,
    pub frame_id: FrameHandle,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableArgs {
    pub thread_id: ThreadId,
    pub frame_id: FrameHandle,
    pub path: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArgs {
    pub thread_id: ThreadId,
    pub frame_id: FrameHandle,
    pub expression: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeVariableArgs {
    pub thread_id: ThreadId,
    pub frame_id: FrameHandle,
    pub name: String,
    pub value: String,
}

/// `threadId` of a suspend request: a thread id or `"*"` for every thread.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ThreadTarget {
    One(ThreadId),
    Pattern(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendArgs {
    pub thread_id: ThreadTarget,
}

impl SuspendArgs {
    pub fn target(&self) -> Result<Option<ThreadId>> {
        match &self.thread_id {
            ThreadTarget::One(id) => Ok(Some(*id)),
            ThreadTarget::Pattern(p) if p == "*" => Ok(None),
            ThreadTarget::Pattern(p) => Err(Error::InvalidMessage(format!("invalid thread id '{}'", p))),
        }
    }
}
