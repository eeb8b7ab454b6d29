use super::frame::FrameView;
use super::{StopReason, ThreadId};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::mpsc::Sender;
use tracing::trace;

/// Body of a successful reply. `None` sends no body.
pub type ReplyBody = Option<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Engine-generated text such as log point output.
    Console,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionSummary {
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopEvent {
    pub thread_id: ThreadId,
    pub reason: StopReason,
    pub frames: Vec<FrameView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionSummary>,
}

/// Everything the engine sends to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ThreadCreated { thread_id: ThreadId, name: String },
    ThreadKilled { thread_id: ThreadId },
    Stopped(StopEvent),
    Output { stream: OutputStream, text: String },
    ProcessCreated { name: String, pid: u32 },
    /// Last message of a session; the writer stops after sending it.
    Exited { code: i32 },
    Response {
        request_seq: u64,
        command: String,
        result: Result<ReplyBody>,
    },
}

/// Cloneable handle used by any thread to queue outbound messages for the
/// writer thread.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: Sender<Outbound>,
}

impl Reporter {
    pub fn new(tx: Sender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: Outbound) {
        // The writer is gone after detach; later events have nowhere to go.
        if let Err(err) = self.tx.send(message) {
            trace!(message = ?err.0, "Dropping outbound message after detach");
        }
    }

    pub fn reply(&self, request_seq: u64, command: &str, result: Result<ReplyBody>) {
        self.send(Outbound::Response {
            request_seq,
            command: command.to_string(),
            result,
        });
    }

    pub fn output(&self, stream: OutputStream, text: impl Into<String>) {
        self.send(Outbound::Output {
            stream,
            text: text.into(),
        });
    }
}
