use super::value::{eval, undefined, EvalError, ExceptionObject, Value};
use crate::debugger::{
    Directive, ExceptionEvent, ExceptionKind, FrameInfo, FrameInspector, OutputStream, RenderError,
    RenderedValue, Session, ThreadId, TraceEvent,
};
use crate::error::Result;
use crate::parser::{parse_expr, split_assignment, Function, Instr, Op, Program, Stream};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub const MAIN_THREAD_NAME: &str = "MainThread";

/// Starts `fn` as a child process with its own debug session.
pub type ForkHandler = Arc<dyn Fn(&str) -> Result<JoinHandle<()>> + Send + Sync>;

type Locals = Arc<Mutex<BTreeMap<String, Value>>>;

fn locked(locals: &Locals) -> MutexGuard<'_, BTreeMap<String, Value>> {
    locals.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One run of a trace script: shared by all of its threads.
pub struct Runtime {
    program: Arc<Program>,
    session: Arc<Session>,
    globals: Locals,
    next_thread: AtomicU64,
    next_object: AtomicU64,
    fork: Option<ForkHandler>,
    forks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(program: Arc<Program>, session: Arc<Session>) -> Self {
        Self {
            program,
            session,
            globals: Arc::new(Mutex::new(BTreeMap::new())),
            next_thread: AtomicU64::new(1),
            next_object: AtomicU64::new(1),
            fork: None,
            forks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fork(mut self, handler: ForkHandler) -> Self {
        self.fork = Some(handler);
        self
    }

    /// Run the module body on the calling thread. Returns the exit code.
    pub fn run_main(self: &Arc<Self>) -> i32 {
        let module = Arc::clone(&self.program.module);
        self.run_entry(module)
    }

    /// Run a named function as the outermost frame, as a forked child does.
    pub fn run_function(self: &Arc<Self>, name: &str) -> Result<i32> {
        let function = self
            .program
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| crate::Error::TargetNotFound(format!("function '{}'", name)))?;
        Ok(self.run_entry(function))
    }

    fn run_entry(self: &Arc<Self>, function: Arc<Function>) -> i32 {
        let id = self.allocate_thread();
        if let Err(err) = self.session.thread_started(id, MAIN_THREAD_NAME) {
            warn!(error = %err, "Could not register main thread");
        }

        let mut runner = ThreadRunner::new(Arc::clone(self), id);
        let completed = runner.run(function, Arc::clone(&self.globals));
        runner.join_children();
        self.session.thread_exited(id);

        let forks = std::mem::take(&mut *self.forks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in forks {
            if handle.join().is_err() {
                warn!("Forked child panicked");
            }
        }
        debug!(completed, "Program finished");
        if completed {
            0
        } else {
            1
        }
    }

    fn allocate_thread(&self) -> ThreadId {
        ThreadId(self.next_thread.fetch_add(1, Ordering::SeqCst))
    }

    fn new_exception(&self, kind: &str, message: impl Into<String>, ignored: bool) -> Arc<ExceptionObject> {
        Arc::new(ExceptionObject {
            id: self.next_object.fetch_add(1, Ordering::SeqCst),
            kind: ExceptionKind::new(kind, self.program.ancestors(kind)),
            message: message.into(),
            ignored,
        })
    }
}

#[derive(Debug, Clone)]
enum Block {
    Try {
        handler: usize,
        kinds: Vec<String>,
        binding: Option<String>,
    },
    Handler {
        exception: Arc<ExceptionObject>,
    },
    Loop {
        remaining: i64,
        body: usize,
    },
}

struct Frame {
    function: Arc<Function>,
    pc: usize,
    line: u32,
    locals: Locals,
    /// Open blocks; always as deep as the current instruction's scope.
    blocks: Vec<Block>,
}

/// Executes one script thread and reports its events to the session.
struct ThreadRunner {
    runtime: Arc<Runtime>,
    id: ThreadId,
    frames: Vec<Frame>,
    children: Vec<JoinHandle<()>>,
}

type Raised = Arc<ExceptionObject>;

impl ThreadRunner {
    fn new(runtime: Arc<Runtime>, id: ThreadId) -> Self {
        Self {
            runtime,
            id,
            frames: Vec::new(),
            children: Vec::new(),
        }
    }

    fn chain(&self) -> Vec<FrameInfo> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                FrameInfo::new(frame.function.name.as_str(), self.runtime.program.file.as_str(), frame.line)
                    .with_dont_trace(frame.function.dont_trace)
                    .with_layout(Arc::clone(&frame.function.layout))
            })
            .collect()
    }

    fn trace(&mut self, event: TraceEvent<'_>) -> Directive {
        let chain = self.chain();
        let session = Arc::clone(&self.runtime.session);
        session.trace(self.id, event, &chain, self)
    }

    /// Returns false when an uncaught exception ended the thread.
    fn run(&mut self, function: Arc<Function>, locals: Locals) -> bool {
        self.enter(function, locals);

        while let Some(frame) = self.frames.last_mut() {
            let function = Arc::clone(&frame.function);
            let Some(instr) = function.body.get(frame.pc) else {
                self.leave();
                continue;
            };
            frame.line = instr.line;

            if !instr.silent {
                if let Directive::JumpTo(line) = self.trace(TraceEvent::Line) {
                    self.relocate(line);
                    continue;
                }
            }

            if let Err(raised) = self.execute(instr) {
                if !self.raise(raised) {
                    return false;
                }
            }
        }
        true
    }

    fn enter(&mut self, function: Arc<Function>, locals: Locals) {
        self.frames.push(Frame {
            line: function.def_line,
            function,
            pc: 0,
            locals,
            blocks: Vec::new(),
        });
        self.trace(TraceEvent::Call);
    }

    fn leave(&mut self) {
        self.trace(TraceEvent::Return);
        self.frames.pop();
    }

    fn relocate(&mut self, line: u32) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        match frame.function.index_of_line(line) {
            Some(index) => {
                frame.blocks.truncate(frame.function.body[index].scope.len());
                frame.pc = index;
                frame.line = line;
                debug!(thread = %self.id, line, "Relocated frame");
            }
            None => warn!(thread = %self.id, line, "Jump target has no statement"),
        }
    }

    fn current(&mut self) -> &mut Frame {
        let index = self.frames.len() - 1;
        &mut self.frames[index]
    }

    fn lookup_in(&self, index: usize, name: &str) -> Option<Value> {
        let frame = self.frames.get(index)?;
        locked(&frame.locals)
            .get(name)
            .cloned()
            .or_else(|| locked(&self.runtime.globals).get(name).cloned())
    }

    fn eval_in(&self, index: usize, expr: &crate::parser::Expr) -> std::result::Result<Value, EvalError> {
        eval(expr, &|name| self.lookup_in(index, name))
    }

    fn eval_error(&self, err: EvalError) -> Raised {
        self.runtime.new_exception(err.kind(), err.message(), false)
    }

    // `$name` anywhere in a word is replaced with the variable's text.
    fn expand(&self, word: &str) -> std::result::Result<String, EvalError> {
        let index = self.frames.len().saturating_sub(1);
        let mut out = String::new();
        let mut chars = word.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let mut name = String::new();
            while let Some(&next) = chars.peek() {
                if !(next.is_alphanumeric() || next == '_') {
                    break;
                }
                name.push(next);
                chars.next();
            }
            if name.is_empty() {
                out.push('$');
                continue;
            }
            let value = self.lookup_in(index, &name).ok_or_else(|| undefined(&name))?;
            out.push_str(&value.to_string());
        }
        Ok(out)
    }

    fn execute(&mut self, instr: &Instr) -> std::result::Result<(), Raised> {
        let top = self.frames.len() - 1;
        match &instr.op {
            Op::Set { name, expr } => {
                let value = self.eval_in(top, expr).map_err(|e| self.eval_error(e))?;
                let frame = self.current();
                locked(&frame.locals).insert(name.clone(), value);
                frame.pc += 1;
            }
            Op::Call { function } => {
                let callee = self
                    .runtime
                    .program
                    .functions
                    .get(function)
                    .cloned()
                    .ok_or_else(|| self.eval_error(undefined(function)))?;
                self.current().pc += 1;
                self.enter(callee, Arc::new(Mutex::new(BTreeMap::new())));
            }
            Op::Print { stream, words } => {
                let expanded = words
                    .iter()
                    .map(|w| self.expand(w))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| self.eval_error(e))?;
                let stream = match stream {
                    Stream::Stdout => OutputStream::Stdout,
                    Stream::Stderr => OutputStream::Stderr,
                };
                self.runtime
                    .session
                    .write_output(stream, &format!("{}\n", expanded.join(" ")));
                self.current().pc += 1;
            }
            Op::Raise { kind, message } => {
                if !self.runtime.program.is_exception_kind(kind) {
                    return Err(self.eval_error(undefined(kind)));
                }
                let message = match message {
                    Some(text) => self.expand(text).map_err(|e| self.eval_error(e))?,
                    None => String::new(),
                };
                return Err(self.runtime.new_exception(kind, message, instr.ignore_exceptions));
            }
            Op::Reraise => {
                let active = self.current().blocks.iter().rev().find_map(|block| match block {
                    Block::Handler { exception } => Some(Arc::clone(exception)),
                    _ => None,
                });
                return Err(active.unwrap_or_else(|| {
                    self.runtime
                        .new_exception("RuntimeError", "no active exception to reraise", false)
                }));
            }
            Op::Try {
                handler,
                kinds,
                binding,
            } => {
                let frame = self.current();
                frame.blocks.push(Block::Try {
                    handler: *handler,
                    kinds: kinds.clone(),
                    binding: binding.clone(),
                });
                frame.pc += 1;
            }
            Op::SkipHandler { end } => {
                let frame = self.current();
                frame.blocks.pop();
                frame.pc = *end;
            }
            Op::EndHandler => {
                let frame = self.current();
                frame.blocks.pop();
                frame.pc += 1;
            }
            Op::Loop { count, end } => {
                let count = match self.eval_in(top, count).map_err(|e| self.eval_error(e))? {
                    Value::Int(n) => n,
                    other => {
                        let message = format!("loop count must be int, not '{}'", other.type_name());
                        return Err(self.runtime.new_exception("TypeError", message, false));
                    }
                };
                let frame = self.current();
                if count > 0 {
                    frame.blocks.push(Block::Loop {
                        remaining: count,
                        body: frame.pc + 1,
                    });
                    frame.pc += 1;
                } else {
                    frame.pc = *end;
                }
            }
            Op::LoopEnd { .. } => {
                let frame = self.current();
                let repeat = match frame.blocks.last_mut() {
                    Some(Block::Loop { remaining, body }) if *remaining > 1 => {
                        *remaining -= 1;
                        Some(*body)
                    }
                    _ => None,
                };
                match repeat {
                    Some(body) => frame.pc = body,
                    None => {
                        frame.blocks.pop();
                        frame.pc += 1;
                    }
                }
            }
            Op::Spawn { function, name } => {
                let target = self
                    .runtime
                    .program
                    .functions
                    .get(function)
                    .cloned()
                    .ok_or_else(|| self.eval_error(undefined(function)))?;
                self.spawn(target, name.clone());
                self.current().pc += 1;
            }
            Op::Join => {
                self.join_children();
                self.current().pc += 1;
            }
            Op::Fork { function } => {
                let handle = match &self.runtime.fork {
                    Some(fork) => fork(function),
                    None => Err(crate::Error::Protocol("no controller address to fork to".into())),
                };
                match handle {
                    Ok(handle) => self
                        .runtime
                        .forks
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(handle),
                    Err(err) => return Err(self.runtime.new_exception("RuntimeError", err.to_string(), false)),
                }
                self.current().pc += 1;
            }
            Op::Return => self.leave(),
            Op::Pass => self.current().pc += 1,
        }
        Ok(())
    }

    fn spawn(&mut self, function: Arc<Function>, name: Option<String>) {
        let id = self.runtime.allocate_thread();
        let name = name.unwrap_or_else(|| format!("Thread-{}", id));
        // Registered here so its creation is reported before any of its events.
        if let Err(err) = self.runtime.session.thread_started(id, &name) {
            warn!(error = %err, "Could not register thread");
            return;
        }

        let runtime = Arc::clone(&self.runtime);
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let session = Arc::clone(&runtime.session);
            let mut runner = ThreadRunner::new(runtime, id);
            runner.run(function, Arc::new(Mutex::new(BTreeMap::new())));
            runner.join_children();
            session.thread_exited(id);
        });
        match spawned {
            Ok(handle) => self.children.push(handle),
            Err(err) => {
                warn!(thread = %id, error = %err, "Could not start thread");
                self.runtime.session.thread_exited(id);
            }
        }
    }

    fn join_children(&mut self) {
        for handle in self.children.drain(..) {
            if handle.join().is_err() {
                warn!("Script thread panicked");
            }
        }
    }

    fn find_handler(&self, raised: &ExceptionObject) -> Option<usize> {
        let frame = self.frames.last()?;
        frame.blocks.iter().rposition(|block| match block {
            Block::Try { kinds, .. } => kinds.is_empty() || kinds.iter().any(|k| raised.kind.is_a(k)),
            _ => false,
        })
    }

    /// Unwind until a handler takes the exception. Returns false if it left
    /// the outermost frame.
    fn raise(&mut self, raised: Raised) -> bool {
        let attach_mode = self.runtime.session.config().attach_mode;
        let mut traceback: Vec<(String, u32)> = Vec::new();

        while !self.frames.is_empty() {
            let handler = self.find_handler(&raised);
            let outermost = self.frames.len() == 1;
            let event = ExceptionEvent {
                info: raised.info(),
                frame_has_handler: handler.is_some(),
                propagating_past_top: outermost && (handler.is_none() || attach_mode),
                raised_on_ignored_line: raised.ignored,
            };
            if let Directive::JumpTo(line) = self.trace(TraceEvent::Exception(&event)) {
                warn!(thread = %self.id, line, "Jump ignored at an exception stop");
            }

            match handler {
                Some(index) => {
                    let frame = self.current();
                    if let Block::Try { handler, binding, .. } = frame.blocks[index].clone() {
                        frame.blocks.truncate(index);
                        frame.blocks.push(Block::Handler {
                            exception: Arc::clone(&raised),
                        });
                        if let Some(name) = binding {
                            locked(&frame.locals).insert(name, Value::Exception(Arc::clone(&raised)));
                        }
                        frame.pc = handler;
                    }
                    return true;
                }
                None => {
                    let frame = self.current();
                    traceback.push((frame.function.name.clone(), frame.line));
                    self.leave();
                }
            }
        }

        let mut text = String::from("Traceback (most recent call last):\n");
        for (function, line) in traceback.iter().rev() {
            text.push_str(&format!(
                "  File \"{}\", line {}, in {}\n",
                self.runtime.program.file, line, function
            ));
        }
        text.push_str(&format!("{}\n", raised));
        self.runtime.session.write_output(OutputStream::Stderr, &text);
        debug!(thread = %self.id, exception = %raised, "Thread ended by uncaught exception");
        false
    }

    fn frame_index(&self, frame: usize) -> std::result::Result<usize, RenderError> {
        self.frames
            .len()
            .checked_sub(frame + 1)
            .ok_or_else(|| RenderError::Unresolvable(format!("frame {}", frame)))
    }

    fn assign(&self, index: usize, name: &str, value: Value) {
        let frame = &self.frames[index];
        let mut locals = locked(&frame.locals);
        if locals.contains_key(name) || Arc::ptr_eq(&frame.locals, &self.runtime.globals) {
            locals.insert(name.to_string(), value);
            return;
        }
        drop(locals);
        let mut globals = locked(&self.runtime.globals);
        if globals.contains_key(name) {
            globals.insert(name.to_string(), value);
        } else {
            drop(globals);
            locked(&frame.locals).insert(name.to_string(), value);
        }
    }
}

impl FrameInspector for ThreadRunner {
    fn variables(&self, frame: usize) -> std::result::Result<Vec<RenderedValue>, RenderError> {
        let index = self.frame_index(frame)?;
        let locals = locked(&self.frames[index].locals);
        Ok(locals.iter().map(|(name, value)| value.render(name)).collect())
    }

    fn children(&self, frame: usize, path: &[String]) -> std::result::Result<Vec<RenderedValue>, RenderError> {
        let index = self.frame_index(frame)?;
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| RenderError::Unresolvable("empty variable path".into()))?;
        let mut value = self
            .lookup_in(index, first)
            .ok_or_else(|| RenderError::Unresolvable(first.clone()))?;
        for segment in rest {
            value = value
                .children()
                .into_iter()
                .find(|(name, _)| name == segment)
                .map(|(_, child)| child)
                .ok_or_else(|| RenderError::Unresolvable(path.join(".")))?;
        }
        Ok(value
            .children()
            .iter()
            .map(|(name, child)| child.render(name))
            .collect())
    }

    fn evaluate(&mut self, frame: usize, expression: &str) -> std::result::Result<RenderedValue, RenderError> {
        let index = self.frame_index(frame)?;
        let (target, text) = match split_assignment(expression) {
            Some((name, rhs)) => (Some(name), rhs),
            None => (None, expression),
        };
        let expr = match parse_expr(text) {
            Ok(expr) => expr,
            Err(message) => return Ok(RenderedValue::error(expression, "SyntaxError", &message)),
        };
        match self.eval_in(index, &expr) {
            Ok(value) => {
                if let Some(name) = target {
                    self.assign(index, name, value.clone());
                    return Ok(value.render(name));
                }
                Ok(value.render(expression))
            }
            Err(err) => Ok(RenderedValue::error(expression, err.kind(), err.message())),
        }
    }

    fn change_variable(
        &mut self,
        frame: usize,
        name: &str,
        expression: &str,
    ) -> std::result::Result<RenderedValue, RenderError> {
        let index = self.frame_index(frame)?;
        if self.lookup_in(index, name).is_none() {
            return Err(RenderError::Unresolvable(name.to_string()));
        }
        let value = match parse_expr(expression) {
            Ok(expr) => self.eval_in(index, &expr),
            Err(message) => return Ok(RenderedValue::error(name, "SyntaxError", &message)),
        };
        match value {
            Ok(value) => {
                self.assign(index, name, value.clone());
                Ok(value.render(name))
            }
            Err(err) => Ok(RenderedValue::error(name, err.kind(), err.message())),
        }
    }

    fn evaluate_condition(&mut self, frame: usize, expression: &str) -> std::result::Result<bool, String> {
        let index = self.frame_index(frame).map_err(|e| e.to_string())?;
        let expr = parse_expr(expression).map_err(|m| format!("SyntaxError: {}", m))?;
        self.eval_in(index, &expr)
            .map(|value| value.truthy())
            .map_err(|err| err.to_string())
    }
}
