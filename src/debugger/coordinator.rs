use super::events::{ExceptionSummary, Outbound, ReplyBody, Reporter, StopEvent};
use super::exceptions::ExceptionInfo;
use super::filters::Filters;
use super::frame::{FrameHandle, FrameInfo, FrameView};
use super::inspect::{FrameInspector, InspectRequest};
use super::stepping::{compute_next_statement_targets, StepMode, StepRequest};
use super::{lock, read, write, StopReason, SuspendPolicy, ThreadId, ThreadStatus};
use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// How a suspended thread continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    Run,
    Step(StepMode),
    /// Relocate the innermost frame to this line, then stop there.
    Jump(u32),
}

enum ThreadCommand {
    Inspect {
        request_seq: u64,
        command: String,
        request: InspectRequest,
    },
    Resume {
        request_seq: u64,
        command: String,
        action: ResumeAction,
    },
}

/// A suspend decision handed over by the session.
#[derive(Debug, Clone)]
pub struct Suspension {
    pub reason: StopReason,
    /// Chain exactly as the instrumentation source reported it.
    pub frames: Vec<FrameInfo>,
    pub skip_innermost: bool,
    pub breakpoint_id: Option<u64>,
    pub exception: Option<ExceptionInfo>,
    pub policy: SuspendPolicy,
}

impl Suspension {
    pub fn new(reason: StopReason, frames: &[FrameInfo], policy: SuspendPolicy) -> Self {
        Self {
            reason,
            frames: frames.to_vec(),
            skip_innermost: false,
            breakpoint_id: None,
            exception: None,
            policy,
        }
    }
}

/// What the released thread must do before continuing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resumed {
    pub jump_to: Option<u32>,
}

struct StopState {
    reason: StopReason,
    /// Reported chain; `offset` frames of the real chain are hidden above it.
    frames: Vec<FrameInfo>,
    offset: usize,
    exception: Option<ExceptionInfo>,
}

struct ThreadState {
    status: ThreadStatus,
    generation: u64,
    step: Option<StepRequest>,
    resume_pending: bool,
    commands: VecDeque<ThreadCommand>,
    stop: Option<StopState>,
    first_event_seen: bool,
}

struct ThreadSlot {
    id: ThreadId,
    name: String,
    state: Mutex<ThreadState>,
    wake: Condvar,
    observed_epoch: AtomicU64,
    suspend_requested: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSnapshot {
    pub thread_id: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StopReason>,
    pub frames: Vec<FrameView>,
}

/// Owns the suspended/running state of every known thread.
///
/// Debuggee threads block inside `suspend` on their own condvar. Commands
/// for a suspended thread are queued on it and executed by that thread in
/// arrival order. Suspend-all bumps a session-wide epoch that every running
/// thread notices at its next event.
pub struct ThreadCoordinator {
    threads: RwLock<BTreeMap<ThreadId, Arc<ThreadSlot>>>,
    suspend_epoch: AtomicU64,
    reporter: Reporter,
    filters: Arc<RwLock<Filters>>,
}

impl ThreadCoordinator {
    pub fn new(reporter: Reporter, filters: Arc<RwLock<Filters>>) -> Self {
        Self {
            threads: RwLock::new(BTreeMap::new()),
            suspend_epoch: AtomicU64::new(0),
            reporter,
            filters,
        }
    }

    fn slot(&self, id: ThreadId) -> Result<Arc<ThreadSlot>> {
        read(&self.threads)
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::TargetNotFound(format!("thread {}", id)))
    }

    pub fn register(&self, id: ThreadId, name: &str) -> Result<()> {
        let slot = Arc::new(ThreadSlot {
            id,
            name: name.to_string(),
            state: Mutex::new(ThreadState {
                status: ThreadStatus::Running,
                generation: 0,
                step: None,
                resume_pending: false,
                commands: VecDeque::new(),
                stop: None,
                first_event_seen: false,
            }),
            wake: Condvar::new(),
            observed_epoch: AtomicU64::new(self.suspend_epoch.load(Ordering::SeqCst)),
            suspend_requested: AtomicBool::new(false),
        });

        {
            let mut threads = write(&self.threads);
            if threads.contains_key(&id) {
                return Err(Error::Instrumentation(format!("thread {} started twice", id)));
            }
            threads.insert(id, slot);
        }
        debug!(thread = %id, name, "Thread registered");
        self.reporter.send(Outbound::ThreadCreated {
            thread_id: id,
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn unregister(&self, id: ThreadId) {
        if write(&self.threads).remove(&id).is_some() {
            debug!(thread = %id, "Thread finished");
            self.reporter.send(Outbound::ThreadKilled { thread_id: id });
        }
    }

    pub fn is_known(&self, id: ThreadId) -> bool {
        read(&self.threads).contains_key(&id)
    }

    pub fn status(&self, id: ThreadId) -> Result<ThreadStatus> {
        let slot = self.slot(id)?;
        let status = lock(&slot.state).status;
        Ok(status)
    }

    pub fn step(&self, id: ThreadId) -> Option<StepRequest> {
        let slot = self.slot(id).ok()?;
        let step = lock(&slot.state).step.clone();
        step
    }

    /// Forget every step in progress and every suspend not yet applied.
    /// Threads already suspended stay suspended.
    pub fn clear_requests(&self) {
        let epoch = self.suspend_epoch.load(Ordering::SeqCst);
        for slot in read(&self.threads).values() {
            let mut state = lock(&slot.state);
            state.step = None;
            slot.observed_epoch.store(epoch, Ordering::SeqCst);
            slot.suspend_requested.store(false, Ordering::SeqCst);
        }
        debug!(epoch, "Pending steps and suspends cleared");
    }

    /// True exactly once per thread, at its first traced line.
    pub fn take_first_event(&self, id: ThreadId) -> bool {
        match self.slot(id) {
            Ok(slot) => !std::mem::replace(&mut lock(&slot.state).first_event_seen, true),
            Err(_) => false,
        }
    }

    /// Whether a suspend-all or explicit suspend is waiting for this thread.
    /// Consumes the request.
    pub fn take_pending_suspend(&self, id: ThreadId) -> bool {
        let Ok(slot) = self.slot(id) else {
            return false;
        };
        let current = self.suspend_epoch.load(Ordering::SeqCst);
        let seen = slot.observed_epoch.swap(current, Ordering::SeqCst);
        let requested = slot.suspend_requested.swap(false, Ordering::SeqCst);
        seen != current || requested
    }

    /// Explicit suspend: one running thread, or every thread with `None`.
    pub fn request_suspend(&self, target: Option<ThreadId>) -> Result<()> {
        match target {
            Some(id) => {
                let slot = self.slot(id)?;
                if lock(&slot.state).status == ThreadStatus::Suspended {
                    return Err(Error::Protocol(format!("thread {} is already suspended", id)));
                }
                slot.suspend_requested.store(true, Ordering::SeqCst);
                debug!(thread = %id, "Suspend requested");
            }
            None => self.bump_epoch(None),
        }
        Ok(())
    }

    // Every thread not already suspended (and not `trigger`) stops at its
    // next event.
    fn bump_epoch(&self, trigger: Option<ThreadId>) {
        let epoch = self.suspend_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for slot in read(&self.threads).values() {
            let suspended = lock(&slot.state).status == ThreadStatus::Suspended;
            if suspended || Some(slot.id) == trigger {
                slot.observed_epoch.store(epoch, Ordering::SeqCst);
            }
        }
        debug!(epoch, "Suspend epoch advanced");
    }

    fn views(&self, generation: u64, frames: &[FrameInfo]) -> Vec<FrameView> {
        let filters = read(&self.filters);
        frames
            .iter()
            .enumerate()
            .map(|(index, frame)| FrameView {
                id: FrameHandle::new(generation, index),
                name: frame.function.clone(),
                file: filters.translator.to_client(&frame.file),
                line: frame.line,
            })
            .collect()
    }

    /// Block the calling debuggee thread until a resume command arrives,
    /// serving queued inspection commands in the meantime.
    pub fn suspend(
        &self,
        id: ThreadId,
        suspension: Suspension,
        inspector: &mut dyn FrameInspector,
    ) -> Result<Resumed> {
        let slot = self.slot(id)?;
        let offset = usize::from(suspension.skip_innermost && suspension.frames.len() > 1);
        let reported = suspension.frames[offset..].to_vec();

        let event = {
            let mut state = lock(&slot.state);
            if state.status == ThreadStatus::Suspended {
                return Err(Error::Instrumentation(format!(
                    "event for thread {} while it is suspended",
                    id
                )));
            }
            state.status = ThreadStatus::Suspended;
            // Under the state lock, so a concurrent `bump_epoch` either sees
            // this thread suspended or has already advanced the epoch read here.
            slot.observed_epoch
                .store(self.suspend_epoch.load(Ordering::SeqCst), Ordering::SeqCst);
            slot.suspend_requested.store(false, Ordering::SeqCst);
            state.resume_pending = false;
            state.step = None;
            let event = StopEvent {
                thread_id: id,
                reason: suspension.reason,
                frames: self.views(state.generation, &reported),
                breakpoint_id: suspension.breakpoint_id,
                exception: suspension.exception.as_ref().map(|e| ExceptionSummary {
                    kind: e.kind.name.clone(),
                    description: e.description.clone(),
                }),
            };
            state.stop = Some(StopState {
                reason: suspension.reason,
                frames: reported,
                offset,
                exception: suspension.exception,
            });
            event
        };

        info!(thread = %id, reason = ?suspension.reason, "Thread suspended");
        self.reporter.send(Outbound::Stopped(event));
        if suspension.policy == SuspendPolicy::All {
            self.bump_epoch(Some(id));
        }

        loop {
            let command = {
                let mut state = lock(&slot.state);
                loop {
                    if let Some(command) = state.commands.pop_front() {
                        break command;
                    }
                    state = slot.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            };

            match command {
                ThreadCommand::Inspect {
                    request_seq,
                    command,
                    request,
                } => {
                    let result = self.inspect(&slot, request, inspector);
                    self.reporter.reply(request_seq, &command, result);
                }
                ThreadCommand::Resume {
                    request_seq,
                    command,
                    action,
                } => {
                    let jump_to = {
                        let mut state = lock(&slot.state);
                        let depth = state.stop.as_ref().map_or(0, |stop| stop.frames.len());
                        let (step, jump_to) = match action {
                            ResumeAction::Run => (None, None),
                            ResumeAction::Step(mode) => (Some(StepRequest::new(mode, depth)), None),
                            ResumeAction::Jump(line) => (
                                Some(StepRequest::new(StepMode::SetNextStatement { line }, depth)),
                                Some(line),
                            ),
                        };
                        state.status = ThreadStatus::Running;
                        state.generation += 1;
                        state.resume_pending = false;
                        state.stop = None;
                        state.step = step;
                        jump_to
                    };
                    info!(thread = %id, ?action, "Thread resumed");
                    self.reporter.reply(request_seq, &command, Ok(None));
                    return Ok(Resumed { jump_to });
                }
            }
        }
    }

    fn inspect(
        &self,
        slot: &ThreadSlot,
        request: InspectRequest,
        inspector: &mut dyn FrameInspector,
    ) -> Result<ReplyBody> {
        let (generation, frames, offset, exception) = {
            let state = lock(&slot.state);
            let stop = state
                .stop
                .as_ref()
                .ok_or_else(|| Error::Protocol(format!("thread {} is not suspended", slot.id)))?;
            (state.generation, stop.frames.clone(), stop.offset, stop.exception.clone())
        };

        let resolve = |handle: FrameHandle| -> Result<usize> {
            if handle.generation() != generation {
                return Err(Error::TargetNotFound(format!(
                    "frame {} is from before the last resume",
                    handle
                )));
            }
            if handle.index() >= frames.len() {
                return Err(Error::TargetNotFound(format!("frame {}", handle)));
            }
            Ok(handle.index())
        };

        let body = match request {
            InspectRequest::Stack => json!({
                "threadId": slot.id,
                "status": ThreadStatus::Suspended,
                "frames": self.views(generation, &frames),
            }),
            InspectRequest::Variables { frame } => {
                let variables = inspector.variables(resolve(frame)? + offset)?;
                json!({ "variables": variables })
            }
            InspectRequest::Variable { frame, path } => {
                let children = inspector.children(resolve(frame)? + offset, &path)?;
                json!({ "variables": children })
            }
            InspectRequest::Evaluate { frame, expression } => {
                let index = resolve(frame)?;
                serde_json::to_value(inspector.evaluate(index + offset, &expression)?)?
            }
            InspectRequest::ChangeVariable { frame, name, value } => {
                let index = resolve(frame)?;
                serde_json::to_value(inspector.change_variable(index + offset, &name, &value)?)?
            }
            InspectRequest::NextStatementTargets { frame } => {
                let index = resolve(frame)?;
                json!({ "lines": compute_next_statement_targets(&frames[index]) })
            }
            InspectRequest::ExceptionDetails => {
                let info = exception.ok_or_else(|| {
                    Error::TargetNotFound(format!("thread {} is not stopped on an exception", slot.id))
                })?;
                json!({
                    "threadId": slot.id,
                    "objectId": info.object_id,
                    "kind": info.kind.name,
                    "ancestors": info.kind.ancestors,
                    "description": info.description,
                })
            }
        };
        Ok(Some(body))
    }

    fn enqueue(&self, id: ThreadId, command: ThreadCommand) -> Result<()> {
        let slot = self.slot(id)?;
        let mut state = lock(&slot.state);
        if state.status != ThreadStatus::Suspended {
            return Err(Error::Protocol(format!("thread {} is not suspended", id)));
        }
        if state.resume_pending {
            return Err(Error::Protocol(format!("thread {} is already resuming", id)));
        }

        if let ThreadCommand::Resume { action, .. } = &command {
            if let ResumeAction::Jump(line) = *action {
                let stop = state
                    .stop
                    .as_ref()
                    .ok_or_else(|| Error::Protocol(format!("thread {} is not suspended", id)))?;
                let valid = stop.offset == 0
                    && stop
                        .frames
                        .first()
                        .is_some_and(|frame| compute_next_statement_targets(frame).contains(&line));
                if !valid {
                    return Err(Error::Protocol(format!(
                        "line {} is not a valid next statement for thread {}",
                        line, id
                    )));
                }
            }
            state.resume_pending = true;
        }

        state.commands.push_back(command);
        slot.wake.notify_one();
        Ok(())
    }

    /// Queue an inspection; the reply is sent by the suspended thread.
    pub fn submit_inspect(&self, id: ThreadId, request_seq: u64, command: &str, request: InspectRequest) -> Result<()> {
        self.enqueue(
            id,
            ThreadCommand::Inspect {
                request_seq,
                command: command.to_string(),
                request,
            },
        )
    }

    /// Queue a resume; later commands for the thread are rejected until it
    /// has actually resumed and stopped again.
    pub fn submit_resume(&self, id: ThreadId, request_seq: u64, command: &str, action: ResumeAction) -> Result<()> {
        self.enqueue(
            id,
            ThreadCommand::Resume {
                request_seq,
                command: command.to_string(),
                action,
            },
        )?;
        debug!(thread = %id, seq = request_seq, ?action, "Resume queued");
        Ok(())
    }

    /// Threads with their status; no frames.
    pub fn list(&self) -> Vec<ThreadSnapshot> {
        self.snapshots(false)
    }

    /// Non-mutating snapshot of every thread, with the frame chain of those
    /// currently suspended.
    pub fn dump(&self) -> Vec<ThreadSnapshot> {
        self.snapshots(true)
    }

    fn snapshots(&self, with_frames: bool) -> Vec<ThreadSnapshot> {
        let slots: Vec<Arc<ThreadSlot>> = read(&self.threads).values().cloned().collect();
        slots
            .iter()
            .map(|slot| {
                let state = lock(&slot.state);
                let frames = match (&state.stop, with_frames) {
                    (Some(stop), true) => self.views(state.generation, &stop.frames),
                    _ => Vec::new(),
                };
                ThreadSnapshot {
                    thread_id: slot.id,
                    name: slot.name.clone(),
                    status: state.status,
                    reason: state.stop.as_ref().map(|stop| stop.reason),
                    frames,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::{RenderError, RenderedValue};
    use std::sync::mpsc::{channel, Receiver};
    use std::thread;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct NoLocals;

    impl FrameInspector for NoLocals {
        fn variables(&self, _frame: usize) -> std::result::Result<Vec<RenderedValue>, RenderError> {
            Ok(Vec::new())
        }
        fn children(&self, _frame: usize, path: &[String]) -> std::result::Result<Vec<RenderedValue>, RenderError> {
            Err(RenderError::Unresolvable(path.join(".")))
        }
        fn evaluate(&mut self, _frame: usize, expression: &str) -> std::result::Result<RenderedValue, RenderError> {
            Ok(RenderedValue::error(expression, "NameError", expression))
        }
        fn change_variable(&mut self, _frame: usize, name: &str, _e: &str) -> std::result::Result<RenderedValue, RenderError> {
            Err(RenderError::Unresolvable(name.to_string()))
        }
        fn evaluate_condition(&mut self, _frame: usize, _e: &str) -> std::result::Result<bool, String> {
            Ok(true)
        }
    }

    fn coordinator() -> (Arc<ThreadCoordinator>, Receiver<Outbound>) {
        let (tx, rx) = channel();
        let filters = Arc::new(RwLock::new(Filters::default()));
        (Arc::new(ThreadCoordinator::new(Reporter::new(tx), filters)), rx)
    }

    fn next_stop(rx: &Receiver<Outbound>) -> StopEvent {
        loop {
            match rx.recv_timeout(TIMEOUT).expect("no outbound message") {
                Outbound::Stopped(event) => return event,
                _ => continue,
            }
        }
    }

    fn next_response(rx: &Receiver<Outbound>) -> (u64, Result<ReplyBody>) {
        loop {
            match rx.recv_timeout(TIMEOUT).expect("no outbound message") {
                Outbound::Response { request_seq, result, .. } => return (request_seq, result),
                _ => continue,
            }
        }
    }

    fn frames() -> Vec<FrameInfo> {
        vec![FrameInfo::new("f", "/work/a.trace", 3), FrameInfo::new("<module>", "/work/a.trace", 9)]
    }

    #[test]
    fn test_commands_rejected_while_running() {
        let (coordinator, _rx) = coordinator();
        coordinator.register(ThreadId(1), "MainThread").unwrap();
        let err = coordinator.submit_resume(ThreadId(1), 4, "resume", ResumeAction::Run).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(matches!(
            coordinator.submit_resume(ThreadId(9), 5, "resume", ResumeAction::Run),
            Err(Error::TargetNotFound(_))
        ));
    }

    #[test]
    fn test_suspend_serves_commands_in_order_then_resumes() {
        let (coordinator, rx) = coordinator();
        coordinator.register(ThreadId(1), "MainThread").unwrap();

        let worker = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                let suspension = Suspension::new(StopReason::Breakpoint, &frames(), SuspendPolicy::One);
                coordinator.suspend(ThreadId(1), suspension, &mut NoLocals).unwrap()
            })
        };

        let stop = next_stop(&rx);
        assert_eq!(stop.frames.len(), 2);
        let handle = stop.frames[0].id;

        coordinator
            .submit_inspect(ThreadId(1), 5, "getFrame", InspectRequest::Variables { frame: handle })
            .unwrap();
        coordinator
            .submit_inspect(ThreadId(1), 6, "evaluate", InspectRequest::Evaluate { frame: handle, expression: "x".into() })
            .unwrap();
        coordinator.submit_resume(ThreadId(1), 7, "resume", ResumeAction::Run).unwrap();
        // A second resume before the first is applied is stale.
        assert!(coordinator.submit_resume(ThreadId(1), 8, "resume", ResumeAction::Run).is_err());

        let order: Vec<u64> = (0..3).map(|_| next_response(&rx).0).collect();
        assert_eq!(order, vec![5, 6, 7]);
        assert_eq!(worker.join().unwrap(), Resumed { jump_to: None });
        assert_eq!(coordinator.status(ThreadId(1)).unwrap(), ThreadStatus::Running);
    }

    #[test]
    fn test_step_return_hides_innermost_frame() {
        let (coordinator, rx) = coordinator();
        coordinator.register(ThreadId(1), "MainThread").unwrap();
        let worker = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                let mut suspension = Suspension::new(StopReason::StepReturn, &frames(), SuspendPolicy::One);
                suspension.skip_innermost = true;
                coordinator.suspend(ThreadId(1), suspension, &mut NoLocals).unwrap()
            })
        };
        let stop = next_stop(&rx);
        assert_eq!(stop.frames.len(), 1);
        assert_eq!(stop.frames[0].name, "<module>");
        coordinator.submit_resume(ThreadId(1), 1, "resume", ResumeAction::Run).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_pending_suspend_is_consumed_once() {
        let (coordinator, _rx) = coordinator();
        coordinator.register(ThreadId(1), "MainThread").unwrap();
        coordinator.register(ThreadId(2), "worker").unwrap();
        assert!(!coordinator.take_pending_suspend(ThreadId(1)));

        coordinator.request_suspend(None).unwrap();
        assert!(coordinator.take_pending_suspend(ThreadId(1)));
        assert!(!coordinator.take_pending_suspend(ThreadId(1)));
        assert!(coordinator.take_pending_suspend(ThreadId(2)));

        coordinator.request_suspend(Some(ThreadId(2))).unwrap();
        assert!(coordinator.take_pending_suspend(ThreadId(2)));
        assert!(!coordinator.take_pending_suspend(ThreadId(1)));
    }

    fn suspend_on(coordinator: &Arc<ThreadCoordinator>, id: ThreadId, policy: SuspendPolicy) -> thread::JoinHandle<Resumed> {
        let coordinator = Arc::clone(coordinator);
        thread::spawn(move || {
            let suspension = Suspension::new(StopReason::Breakpoint, &frames(), policy);
            coordinator.suspend(id, suspension, &mut NoLocals).unwrap()
        })
    }

    #[test]
    fn test_simultaneous_stops_leave_no_stale_suspend() {
        for _ in 0..300 {
            let (coordinator, rx) = coordinator();
            coordinator.register(ThreadId(1), "a").unwrap();
            coordinator.register(ThreadId(2), "b").unwrap();

            let a = suspend_on(&coordinator, ThreadId(1), SuspendPolicy::All);
            let b = suspend_on(&coordinator, ThreadId(2), SuspendPolicy::One);
            next_stop(&rx);
            next_stop(&rx);

            coordinator.submit_resume(ThreadId(1), 1, "resume", ResumeAction::Run).unwrap();
            coordinator.submit_resume(ThreadId(2), 2, "resume", ResumeAction::Run).unwrap();
            a.join().unwrap();
            b.join().unwrap();

            assert!(!coordinator.take_pending_suspend(ThreadId(1)));
            assert!(!coordinator.take_pending_suspend(ThreadId(2)));
        }
    }

    #[test]
    fn test_clear_requests_drops_steps_and_pending_suspends() {
        let (coordinator, rx) = coordinator();
        coordinator.register(ThreadId(1), "MainThread").unwrap();
        coordinator.register(ThreadId(2), "worker").unwrap();

        let worker = suspend_on(&coordinator, ThreadId(1), SuspendPolicy::One);
        next_stop(&rx);
        coordinator
            .submit_resume(ThreadId(1), 3, "stepOver", ResumeAction::Step(StepMode::StepOver))
            .unwrap();
        worker.join().unwrap();
        assert!(coordinator.step(ThreadId(1)).is_some());

        coordinator.request_suspend(None).unwrap();
        coordinator.request_suspend(Some(ThreadId(2))).unwrap();
        coordinator.clear_requests();

        assert!(coordinator.step(ThreadId(1)).is_none());
        assert!(!coordinator.take_pending_suspend(ThreadId(1)));
        assert!(!coordinator.take_pending_suspend(ThreadId(2)));
    }

    #[test]
    fn test_dump_lists_running_threads_without_frames() {
        let (coordinator, _rx) = coordinator();
        coordinator.register(ThreadId(1), "MainThread").unwrap();
        let dump = coordinator.dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].status, ThreadStatus::Running);
        assert!(dump[0].frames.is_empty());
        assert!(coordinator.register(ThreadId(1), "again").is_err());
    }
}
