use super::protocol::{
    args, AddBreakpointArgs, BreakpointIdArgs, ChangeBreakpointArgs, ChangeVariableArgs, DapMessage,
    DapMessageContent, EnabledArgs, EvaluateArgs, ExceptionBreakpointArgs, ExceptionGlobalsArgs,
    ExceptionKindArgs, FilesArgs, FrameArgs, LineArgs, PathArgs, RootsArgs, SuspendArgs, ThreadArgs,
    VariableArgs,
};
use crate::debugger::{Dispatched, InspectRequest, ResumeAction, Session, StepMode, ThreadId};
use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes controller requests to the session.
///
/// Requests that target a suspended thread are queued on it and answered by
/// that thread; everything else is answered here.
pub struct DapServer {
    session: Arc<Session>,
}

impl DapServer {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Handle one inbound message. Returns false after `disconnect`.
    pub fn handle_message(&self, msg: DapMessage) -> bool {
        let (command, arguments) = match msg.content {
            DapMessageContent::Request { command, arguments } => (command, arguments),
            other => {
                debug!(?other, "Ignoring non-request message");
                return true;
            }
        };
        debug!(seq = msg.seq, %command, "Request");

        match self.dispatch(msg.seq, &command, arguments) {
            Ok(Dispatched::Reply(body)) => self.session.reporter().reply(msg.seq, &command, Ok(body)),
            Ok(Dispatched::Deferred) => {}
            Err(err) => {
                warn!(seq = msg.seq, %command, error = %err, "Request failed");
                self.session.reporter().reply(msg.seq, &command, Err(err));
            }
        }
        command != "disconnect"
    }

    fn resume(&self, seq: u64, command: &str, arguments: Option<Value>, action: ResumeAction) -> Result<Dispatched> {
        let thread: ThreadArgs = args(arguments)?;
        self.session.resume(thread.thread_id, seq, command, action)?;
        Ok(Dispatched::Deferred)
    }

    fn step(&self, seq: u64, command: &str, arguments: Option<Value>, mode: StepMode) -> Result<Dispatched> {
        self.resume(seq, command, arguments, ResumeAction::Step(mode))
    }

    fn inspect(&self, seq: u64, command: &str, thread: ThreadId, request: InspectRequest) -> Result<Dispatched> {
        self.session.inspect(thread, seq, command, request)?;
        Ok(Dispatched::Deferred)
    }

    fn dispatch(&self, seq: u64, command: &str, arguments: Option<Value>) -> Result<Dispatched> {
        let session = &self.session;
        let done = || Ok(Dispatched::Reply(None));

        match command {
            "version" => Ok(Dispatched::Reply(session.version())),
            "run" => {
                session.release_run();
                done()
            }

            "addBreakpoint" => {
                let breakpoint = args::<AddBreakpointArgs>(arguments)?.into_breakpoint()?;
                let id = session.add_breakpoint(breakpoint);
                Ok(Dispatched::Reply(Some(json!({ "id": id }))))
            }
            "removeBreakpoint" => {
                let target: BreakpointIdArgs = args(arguments)?;
                session.remove_breakpoint(target.id)?;
                done()
            }
            "changeBreakpoint" => {
                let change: ChangeBreakpointArgs = args(arguments)?;
                session.change_breakpoint(change.id, change.condition, change.enabled)?;
                done()
            }
            "setExceptionBreakpoint" => {
                let policy: ExceptionBreakpointArgs = args(arguments)?;
                session.set_exception_breakpoint(policy.into_policy(session.config().exception_suspend_policy));
                done()
            }
            "removeExceptionBreakpoint" => {
                let target: ExceptionKindArgs = args(arguments)?;
                session.remove_exception_breakpoint(&target.kind)?;
                done()
            }
            "setExceptionGlobals" => {
                let request: ExceptionGlobalsArgs = args(arguments)?;
                let default_policy = session.config().exception_suspend_policy;
                let policies = request
                    .breakpoints
                    .into_iter()
                    .map(|p| p.into_policy(default_policy))
                    .collect();
                session.set_exception_globals(request.globals, policies);
                done()
            }
            "setProjectRoots" => {
                let request: RootsArgs = args(arguments)?;
                session.set_project_roots(&request.roots);
                done()
            }
            "setDontTrace" => {
                let request: EnabledArgs = args(arguments)?;
                session.set_dont_trace(request.enabled);
                done()
            }
            "setDontTraceFiles" => {
                let request: FilesArgs = args(arguments)?;
                session.set_dont_trace_files(&request.files);
                done()
            }
            "startRedirect" => {
                session.start_redirect();
                done()
            }
            "stopOnStart" => {
                let request: EnabledArgs = args(arguments)?;
                session.set_stop_on_start(request.enabled);
                done()
            }

            "resume" => self.resume(seq, command, arguments, ResumeAction::Run),
            "stepInto" => self.step(seq, command, arguments, StepMode::StepInto),
            "stepOver" => self.step(seq, command, arguments, StepMode::StepOver),
            "stepReturn" => self.step(seq, command, arguments, StepMode::StepReturn),
            "stepIntoMyCode" => self.step(seq, command, arguments, StepMode::StepIntoMyCode),
            "runToLine" => {
                let target: LineArgs = args(arguments)?;
                let action = ResumeAction::Step(StepMode::RunToLine { line: target.line });
                session.resume(target.thread_id, seq, command, action)?;
                Ok(Dispatched::Deferred)
            }
            "setNextStatement" => {
                let target: LineArgs = args(arguments)?;
                session.resume(target.thread_id, seq, command, ResumeAction::Jump(target.line))?;
                Ok(Dispatched::Deferred)
            }
            "suspendThread" => {
                let request: SuspendArgs = args(arguments)?;
                session.suspend_thread(request.target()?)?;
                done()
            }

            "getThreadStack" => {
                let thread: ThreadArgs = args(arguments)?;
                session.thread_stack(thread.thread_id, seq, command)
            }
            "getFrame" => {
                let frame: FrameArgs = args(arguments)?;
                self.inspect(seq, command, frame.thread_id, InspectRequest::Variables { frame: frame.frame_id })
            }
            "getVariable" => {
                let request: VariableArgs = args(arguments)?;
                let inspect = InspectRequest::Variable {
                    frame: request.frame_id,
                    path: request.path,
                };
                self.inspect(seq, command, request.thread_id, inspect)
            }
            "evaluate" => {
                let request: EvaluateArgs = args(arguments)?;
                let inspect = InspectRequest::Evaluate {
                    frame: request.frame_id,
                    expression: request.expression,
                };
                self.inspect(seq, command, request.thread_id, inspect)
            }
            "changeVariable" => {
                let request: ChangeVariableArgs = args(arguments)?;
                let inspect = InspectRequest::ChangeVariable {
                    frame: request.frame_id,
                    name: request.name,
                    value: request.value,
                };
                self.inspect(seq, command, request.thread_id, inspect)
            }
            "getNextStatementTargets" => {
                let frame: FrameArgs = args(arguments)?;
                let inspect = InspectRequest::NextStatementTargets { frame: frame.frame_id };
                self.inspect(seq, command, frame.thread_id, inspect)
            }
            "getExceptionDetails" => {
                let thread: ThreadArgs = args(arguments)?;
                self.inspect(seq, command, thread.thread_id, InspectRequest::ExceptionDetails)
            }

            "listThreads" => Ok(Dispatched::Reply(Some(json!({ "threads": session.list_threads() })))),
            "dumpThreads" => Ok(Dispatched::Reply(Some(json!({ "threads": session.dump_threads() })))),
            "loadSource" => {
                let request: PathArgs = args(arguments)?;
                let content = session.load_source(&request.path)?;
                Ok(Dispatched::Reply(Some(json!({ "path": request.path, "content": content }))))
            }
            "disconnect" => {
                session.detach();
                done()
            }
            other => Err(Error::Protocol(format!("unknown command '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::debugger::{Outbound, Reporter};
    use std::sync::mpsc::{self, Receiver};
    use std::time::Duration;

    fn server() -> (DapServer, Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel();
        let session = Arc::new(Session::new(EngineConfig::default(), Reporter::new(tx)));
        (DapServer::new(session), rx)
    }

    fn reply(rx: &Receiver<Outbound>) -> (u64, Result<Option<Value>>) {
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            Outbound::Response { request_seq, result, .. } => (request_seq, result),
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_breakpoint_commands() {
        let (server, rx) = server();
        assert!(server.handle_message(DapMessage::request(
            1,
            "addBreakpoint",
            json!({"file": "/work/app.trace", "line": 6}),
        )));
        let (seq, body) = reply(&rx);
        assert_eq!(seq, 1);
        let id = body.unwrap().unwrap()["id"].as_u64().unwrap();

        server.handle_message(DapMessage::request(2, "removeBreakpoint", json!({ "id": id })));
        assert!(reply(&rx).1.is_ok());
        server.handle_message(DapMessage::request(3, "removeBreakpoint", json!({ "id": id })));
        let (seq, result) = reply(&rx);
        assert_eq!(seq, 3);
        assert_eq!(result.unwrap_err().kind(), "target_not_found");
    }

    #[test]
    fn test_bad_requests_get_error_replies() {
        let (server, rx) = server();
        server.handle_message(DapMessage::request(7, "launchRockets", json!({})));
        assert_eq!(reply(&rx).1.unwrap_err().kind(), "protocol");

        server.handle_message(DapMessage::request(8, "resume", json!({"threadId": 42})));
        assert_eq!(reply(&rx).1.unwrap_err().kind(), "target_not_found");

        server.handle_message(DapMessage::request(9, "addBreakpoint", json!({"line": 1})));
        assert_eq!(reply(&rx).1.unwrap_err().kind(), "invalid_message");
    }

    #[test]
    fn test_disconnect_ends_the_loop() {
        let (server, rx) = server();
        assert!(!server.handle_message(DapMessage::request(1, "disconnect", json!({}))));
        assert!(reply(&rx).1.is_ok());
    }
}
