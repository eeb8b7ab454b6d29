use super::breakpoints::{BreakpointRegistry, ExceptionBreakpoint, LineBreakpoint, NewLineBreakpoint};
use super::coordinator::{ResumeAction, Resumed, Suspension, ThreadCoordinator, ThreadSnapshot};
use super::events::{Outbound, OutputStream, ReplyBody, Reporter};
use super::exceptions::{ExceptionClass, ExceptionEvent, ExceptionGlobals, ExceptionPolicyEngine};
use super::filters::Filters;
use super::frame::FrameInfo;
use super::inspect::{FrameInspector, InspectRequest};
use super::stepping::StepDecision;
use super::{lock, read, write, StopReason, SuspendPolicy, ThreadId, ThreadStatus};
use crate::config::EngineConfig;
use crate::error::Result;
use serde_json::json;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// One execution event reported by the instrumentation source.
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent<'a> {
    Call,
    Line,
    Return,
    Exception(&'a ExceptionEvent),
}

/// What the instrumentation source does after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    /// Move the innermost frame to this line before executing anything else.
    JumpTo(u32),
}

/// Result of a command that may be answered by a suspended thread later.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Reply(ReplyBody),
    /// The owning thread sends the reply once it reaches the command.
    Deferred,
}

/// Process-wide debugging state, from attach to detach.
pub struct Session {
    config: EngineConfig,
    registry: RwLock<BreakpointRegistry>,
    exceptions: ExceptionPolicyEngine,
    filters: Arc<RwLock<Filters>>,
    coordinator: ThreadCoordinator,
    reporter: Reporter,
    run_released: Mutex<bool>,
    run_gate: Condvar,
    stop_on_start: AtomicBool,
    redirect_output: AtomicBool,
    detached: AtomicBool,
}

impl Session {
    pub fn new(config: EngineConfig, reporter: Reporter) -> Self {
        let filters = Arc::new(RwLock::new(Filters::from_config(&config)));
        Self {
            stop_on_start: AtomicBool::new(config.stop_on_start),
            registry: RwLock::new(BreakpointRegistry::new()),
            exceptions: ExceptionPolicyEngine::new(),
            coordinator: ThreadCoordinator::new(reporter.clone(), Arc::clone(&filters)),
            filters,
            reporter,
            run_released: Mutex::new(false),
            run_gate: Condvar::new(),
            redirect_output: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    // ---- instrumentation side ----

    pub fn thread_started(&self, thread: ThreadId, name: &str) -> Result<()> {
        self.coordinator.register(thread, name)
    }

    pub fn thread_exited(&self, thread: ThreadId) {
        self.exceptions.thread_exited(thread);
        self.coordinator.unregister(thread);
    }

    /// Announce this session as a child process of another debuggee.
    pub fn process_created(&self, name: &str) {
        self.reporter.send(Outbound::ProcessCreated {
            name: name.to_string(),
            pid: std::process::id(),
        });
    }

    /// Block until the controller sends `run`.
    pub fn wait_for_run(&self) {
        let mut released = lock(&self.run_released);
        while !*released {
            released = self
                .run_gate
                .wait(released)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Debuggee output. Goes to the controller once redirection has started,
    /// and to the process's own streams when echo is on or nothing redirects.
    pub fn write_output(&self, stream: OutputStream, text: &str) {
        let redirected = self.redirect_output.load(Ordering::SeqCst);
        if redirected {
            self.reporter.output(stream, text);
        }
        if self.config.echo_output || !redirected {
            let result = match stream {
                OutputStream::Stderr => std::io::stderr().write_all(text.as_bytes()),
                _ => {
                    let mut out = std::io::stdout();
                    out.write_all(text.as_bytes()).and_then(|_| out.flush())
                }
            };
            if let Err(err) = result {
                debug!(error = %err, "Could not echo debuggee output");
            }
        }
    }

    /// Entry point for every execution event. Blocks while the thread is
    /// suspended.
    pub fn trace(
        &self,
        thread: ThreadId,
        event: TraceEvent<'_>,
        frames: &[FrameInfo],
        inspector: &mut dyn FrameInspector,
    ) -> Directive {
        let Some(suspension) = self.decide(thread, event, frames, inspector) else {
            return Directive::Continue;
        };
        match self.coordinator.suspend(thread, suspension, inspector) {
            Ok(Resumed { jump_to: Some(line) }) => Directive::JumpTo(line),
            Ok(_) => Directive::Continue,
            Err(err) => {
                warn!(thread = %thread, error = %err, "Could not suspend thread");
                Directive::Continue
            }
        }
    }

    fn decide(
        &self,
        thread: ThreadId,
        event: TraceEvent<'_>,
        frames: &[FrameInfo],
        inspector: &mut dyn FrameInspector,
    ) -> Option<Suspension> {
        if self.detached.load(Ordering::SeqCst) {
            return None;
        }
        let frame = frames.first()?;
        if !self.coordinator.is_known(thread) {
            warn!(thread = %thread, "Event for unknown thread ignored");
            return None;
        }

        let is_line = matches!(event, TraceEvent::Line);
        let (dont_trace, user_code) = {
            let filters = read(&self.filters);
            (filters.is_dont_trace(frame), filters.is_user_code(frame))
        };
        if is_line && dont_trace {
            return None;
        }

        if is_line {
            let first_line = self.coordinator.take_first_event(thread);
            if user_code && self.stop_on_start.swap(false, Ordering::SeqCst) {
                debug!(thread = %thread, line = frame.line, "Stopping on start");
                return Some(Suspension::new(
                    StopReason::StepIntoMyCode,
                    frames,
                    self.config.step_suspend_policy,
                ));
            }
            if first_line && self.config.stop_on_thread_create {
                return Some(Suspension::new(StopReason::ThreadCreate, frames, SuspendPolicy::One));
            }
            if self.coordinator.take_pending_suspend(thread) {
                return Some(Suspension::new(StopReason::ThreadSuspend, frames, SuspendPolicy::One));
            }
            if let Some(breakpoint) = self.check_breakpoint(frame, inspector) {
                let mut suspension = Suspension::new(StopReason::Breakpoint, frames, breakpoint.suspend_policy);
                suspension.breakpoint_id = Some(breakpoint.id);
                return Some(suspension);
            }
        }

        if let Some(step) = self.coordinator.step(thread) {
            let decision = step.evaluate(&event, frames, &read(&self.filters));
            if let StepDecision::Complete { reason, skip_innermost } = decision {
                let mut suspension = Suspension::new(reason, frames, self.config.step_suspend_policy);
                suspension.skip_innermost = skip_innermost;
                return Some(suspension);
            }
        }

        if let TraceEvent::Exception(raised) = event {
            return self.check_exception(thread, raised, frames);
        }
        None
    }

    // First breakpoint at the location whose condition holds and whose hit
    // condition is met. Log points print and never suspend.
    fn check_breakpoint(&self, frame: &FrameInfo, inspector: &mut dyn FrameInspector) -> Option<Arc<LineBreakpoint>> {
        let candidates = read(&self.registry).find_line_matches(&frame.file, frame.line, &frame.function);
        candidates
            .into_iter()
            .find(|breakpoint| self.breakpoint_fires(breakpoint, inspector))
    }

    fn breakpoint_fires(&self, breakpoint: &LineBreakpoint, inspector: &mut dyn FrameInspector) -> bool {
        if let Some(condition) = &breakpoint.condition {
            match inspector.evaluate_condition(0, condition) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(message) => self.reporter.output(
                    OutputStream::Stderr,
                    format!("Error while evaluating condition '{}': {}\n", condition, message),
                ),
            }
        }

        let hits = breakpoint.record_hit();
        if let Some(hit_condition) = breakpoint.hit_condition {
            if !hit_condition.is_met(hits) {
                return false;
            }
        }

        if let Some(template) = &breakpoint.log_expression {
            let text = render_log_message(template, inspector);
            self.reporter.output(OutputStream::Console, format!("{}\n", text));
            return false;
        }
        true
    }

    fn check_exception(&self, thread: ThreadId, raised: &ExceptionEvent, frames: &[FrameInfo]) -> Option<Suspension> {
        let policy = {
            let registry = read(&self.registry);
            if !registry.has_exception_policies() {
                return None;
            }
            registry.find_exception_policy(&raised.info.kind)
        };
        let class = self
            .exceptions
            .classify(thread, raised, frames, policy.as_ref(), &read(&self.filters));

        let reason = match class {
            ExceptionClass::Caught => StopReason::CaughtException,
            ExceptionClass::Uncaught => StopReason::UncaughtException,
            ExceptionClass::None => return None,
        };
        let suspend_policy = policy.map_or(self.config.exception_suspend_policy, |p| p.suspend_policy);
        let mut suspension = Suspension::new(reason, frames, suspend_policy);
        suspension.exception = Some(raised.info.clone());
        Some(suspension)
    }

    // ---- controller side ----

    pub fn version(&self) -> ReplyBody {
        Some(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "pid": std::process::id(),
        }))
    }

    /// Release the program's main thread.
    pub fn release_run(&self) {
        let mut released = lock(&self.run_released);
        if !*released {
            *released = true;
            info!("Run released");
        }
        self.run_gate.notify_all();
    }

    pub fn add_breakpoint(&self, mut request: NewLineBreakpoint) -> u64 {
        request.file = read(&self.filters).translator.to_debuggee(&request.file);
        write(&self.registry).add(request)
    }

    pub fn remove_breakpoint(&self, id: u64) -> Result<()> {
        write(&self.registry).remove(id)
    }

    pub fn change_breakpoint(&self, id: u64, condition: Option<String>, enabled: Option<bool>) -> Result<()> {
        write(&self.registry).change(id, condition, enabled)
    }

    pub fn set_exception_breakpoint(&self, policy: ExceptionBreakpoint) {
        write(&self.registry).set_exception(policy);
    }

    pub fn remove_exception_breakpoint(&self, kind: &str) -> Result<()> {
        write(&self.registry).remove_exception(kind)
    }

    pub fn set_exception_globals(&self, globals: ExceptionGlobals, policies: Vec<ExceptionBreakpoint>) {
        {
            let mut registry = write(&self.registry);
            for policy in policies {
                registry.set_exception(policy);
            }
        }
        self.exceptions.set_globals(globals);
    }

    pub fn set_project_roots(&self, roots: &[String]) {
        write(&self.filters).set_project_roots(roots);
        debug!(?roots, "Project roots updated");
    }

    pub fn set_dont_trace(&self, enabled: bool) {
        write(&self.filters).set_dont_trace_enabled(enabled);
    }

    pub fn set_dont_trace_files(&self, files: &[String]) {
        write(&self.filters).set_dont_trace_files(files);
    }

    pub fn start_redirect(&self) {
        self.redirect_output.store(true, Ordering::SeqCst);
    }

    pub fn set_stop_on_start(&self, enabled: bool) {
        self.stop_on_start.store(enabled, Ordering::SeqCst);
    }

    pub fn resume(&self, thread: ThreadId, request_seq: u64, command: &str, action: ResumeAction) -> Result<()> {
        self.coordinator.submit_resume(thread, request_seq, command, action)
    }

    pub fn inspect(&self, thread: ThreadId, request_seq: u64, command: &str, request: InspectRequest) -> Result<()> {
        self.coordinator.submit_inspect(thread, request_seq, command, request)
    }

    /// A running thread has no frames to report; say so right away.
    pub fn thread_stack(&self, thread: ThreadId, request_seq: u64, command: &str) -> Result<Dispatched> {
        match self.coordinator.status(thread)? {
            ThreadStatus::Running => Ok(Dispatched::Reply(Some(json!({
                "threadId": thread,
                "status": ThreadStatus::Running,
                "frames": [],
            })))),
            ThreadStatus::Suspended => {
                self.inspect(thread, request_seq, command, InspectRequest::Stack)?;
                Ok(Dispatched::Deferred)
            }
        }
    }

    pub fn suspend_thread(&self, target: Option<ThreadId>) -> Result<()> {
        self.coordinator.request_suspend(target)
    }

    pub fn list_threads(&self) -> Vec<ThreadSnapshot> {
        self.coordinator.list()
    }

    pub fn dump_threads(&self) -> Vec<ThreadSnapshot> {
        self.coordinator.dump()
    }

    pub fn load_source(&self, path: &str) -> Result<String> {
        let local = read(&self.filters).translator.to_debuggee(path);
        Ok(std::fs::read_to_string(local)?)
    }

    /// Drop breakpoints, exception policies, steps and pending suspends; no
    /// event suspends a thread afterwards. Suspended threads stay suspended;
    /// a program still waiting for `run` is released.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.coordinator.clear_requests();
        write(&self.registry).clear();
        self.exceptions.set_globals(ExceptionGlobals::default());
        self.stop_on_start.store(false, Ordering::SeqCst);
        self.release_run();
        info!("Controller detached");
    }
}

/// Expand `{expression}` placeholders against the innermost frame. `{{` and
/// `}}` are literal braces.
fn render_log_message(template: &str, inspector: &mut dyn FrameInspector) -> String {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let expression: String = chars.by_ref().take_while(|c| *c != '}').collect();
                match inspector.evaluate(0, expression.trim()) {
                    Ok(value) => out.push_str(&value.value),
                    Err(err) => out.push_str(&format!("<{}>", err)),
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::{HitCondition, RenderError, RenderedValue, StepMode};

    struct Fixed;

    impl FrameInspector for Fixed {
        fn variables(&self, _frame: usize) -> std::result::Result<Vec<RenderedValue>, RenderError> {
            Ok(Vec::new())
        }
        fn children(&self, _frame: usize, _path: &[String]) -> std::result::Result<Vec<RenderedValue>, RenderError> {
            Ok(Vec::new())
        }
        fn evaluate(&mut self, _frame: usize, expression: &str) -> std::result::Result<RenderedValue, RenderError> {
            if expression == "missing" {
                return Err(RenderError::Unresolvable(expression.to_string()));
            }
            Ok(RenderedValue {
                name: expression.to_string(),
                type_tag: "int".into(),
                qualifier: "builtins".into(),
                value: "42".into(),
                has_children: false,
                is_error: false,
            })
        }
        fn change_variable(&mut self, _frame: usize, name: &str, _e: &str) -> std::result::Result<RenderedValue, RenderError> {
            Err(RenderError::Unresolvable(name.to_string()))
        }
        fn evaluate_condition(&mut self, _frame: usize, expression: &str) -> std::result::Result<bool, String> {
            match expression {
                "yes" => Ok(true),
                "no" => Ok(false),
                other => Err(format!("NameError: {}", other)),
            }
        }
    }

    fn session() -> (Session, std::sync::mpsc::Receiver<Outbound>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Session::new(EngineConfig::default(), Reporter::new(tx)), rx)
    }

    #[test]
    fn test_log_message_template() {
        assert_eq!(render_log_message("x={x} {{literal}}", &mut Fixed), "x=42 {literal}");
        assert_eq!(render_log_message("{missing}", &mut Fixed), "<cannot resolve missing>");
    }

    #[test]
    fn test_false_condition_does_not_count_a_hit() {
        let (session, _rx) = session();
        let mut request = NewLineBreakpoint::at("/work/a.trace", 4);
        request.condition = Some("no".into());
        let id = session.add_breakpoint(request);

        let frame = FrameInfo::new("f", "/work/a.trace", 4);
        assert!(session.check_breakpoint(&frame, &mut Fixed).is_none());
        assert_eq!(read(&session.registry).get(id).unwrap().hit_count(), 0);
    }

    #[test]
    fn test_second_breakpoint_on_a_line_still_fires() {
        let (session, _rx) = session();
        let mut unmet = NewLineBreakpoint::at("/work/a.trace", 4);
        unmet.condition = Some("no".into());
        session.add_breakpoint(unmet);
        let mut later = NewLineBreakpoint::at("/work/a.trace", 4);
        later.hit_condition = Some(HitCondition::AtLeast(2));
        session.add_breakpoint(later);
        let plain = session.add_breakpoint(NewLineBreakpoint::at("/work/a.trace", 4));

        let frame = FrameInfo::new("f", "/work/a.trace", 4);
        let fired = session.check_breakpoint(&frame, &mut Fixed).map(|bp| bp.id);
        assert_eq!(fired, Some(plain));
    }

    #[test]
    fn test_condition_error_counts_as_hit_and_reports() {
        let (session, rx) = session();
        let mut request = NewLineBreakpoint::at("/work/a.trace", 4);
        request.condition = Some("broken".into());
        session.add_breakpoint(request);

        let frame = FrameInfo::new("f", "/work/a.trace", 4);
        assert!(session.check_breakpoint(&frame, &mut Fixed).is_some());
        match rx.try_recv().unwrap() {
            Outbound::Output { stream, text } => {
                assert_eq!(stream, OutputStream::Stderr);
                assert!(text.contains("NameError"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_logpoint_prints_and_never_suspends() {
        let (session, rx) = session();
        let mut request = NewLineBreakpoint::at("/work/a.trace", 4);
        request.log_expression = Some("value is {x}".into());
        session.add_breakpoint(request);

        let frame = FrameInfo::new("f", "/work/a.trace", 4);
        assert!(session.check_breakpoint(&frame, &mut Fixed).is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Output { stream: OutputStream::Console, text: "value is 42\n".into() }
        );
    }

    #[test]
    fn test_running_thread_stack_is_empty() {
        let (session, _rx) = session();
        session.thread_started(ThreadId(1), "MainThread").unwrap();
        let reply = session.thread_stack(ThreadId(1), 3, "getThreadStack").unwrap();
        match reply {
            Dispatched::Reply(Some(body)) => {
                assert_eq!(body["status"], "running");
                assert_eq!(body["frames"].as_array().map(Vec::len), Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_detach_cancels_a_step_in_flight() {
        let (session, rx) = session();
        let session = Arc::new(session);
        session.thread_started(ThreadId(1), "MainThread").unwrap();
        session.add_breakpoint(NewLineBreakpoint::at("/work/a.trace", 4));

        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                let line = |n| vec![FrameInfo::new("f", "/work/a.trace", n)];
                session.trace(ThreadId(1), TraceEvent::Line, &line(4), &mut Fixed);
                // Next event only once the controller is gone.
                go_rx.recv().unwrap();
                session.trace(ThreadId(1), TraceEvent::Line, &line(5), &mut Fixed);
                session.trace(ThreadId(1), TraceEvent::Line, &line(6), &mut Fixed);
                done_tx.send(()).unwrap();
            });
        }

        loop {
            match rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap() {
                Outbound::Stopped(stop) => {
                    assert_eq!(stop.reason, StopReason::Breakpoint);
                    break;
                }
                _ => continue,
            }
        }
        session
            .resume(ThreadId(1), 2, "stepOver", ResumeAction::Step(StepMode::StepOver))
            .unwrap();
        session.detach();
        go_tx.send(()).unwrap();

        assert!(done_rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok());
        assert_eq!(session.coordinator.status(ThreadId(1)).unwrap(), ThreadStatus::Running);
    }

    #[test]
    fn test_events_for_unknown_threads_are_ignored() {
        let (session, _rx) = session();
        let frames = vec![FrameInfo::new("f", "/work/a.trace", 1)];
        assert_eq!(session.trace(ThreadId(5), TraceEvent::Line, &frames, &mut Fixed), Directive::Continue);
    }
}
