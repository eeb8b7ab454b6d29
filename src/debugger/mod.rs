mod breakpoints;
mod coordinator;
mod events;
mod exceptions;
mod filters;
mod frame;
mod inspect;
mod sequence;
mod session;
mod stepping;

pub use breakpoints::{
    BreakpointRegistry, CaughtNotify, ExceptionBreakpoint, FunctionFilter, HitCondition,
    LineBreakpoint, NewLineBreakpoint,
};
pub use coordinator::{ResumeAction, Resumed, Suspension, ThreadCoordinator, ThreadSnapshot};
pub use events::{ExceptionSummary, Outbound, OutputStream, ReplyBody, Reporter, StopEvent};
pub use exceptions::{
    ExceptionClass, ExceptionEvent, ExceptionGlobals, ExceptionInfo, ExceptionKind,
    ExceptionPolicyEngine,
};
pub use filters::{Filters, PathTranslator, ProjectRoots};
pub use frame::{FrameHandle, FrameInfo, FrameView, FunctionLayout, LineScope, MODULE_FUNCTION};
pub use inspect::{FrameInspector, InspectRequest, RenderError, RenderedValue};
pub use sequence::SequenceAllocator;
pub use session::{Directive, Dispatched, Session, TraceEvent};
pub use stepping::{compute_next_statement_targets, StepDecision, StepMode, StepRequest};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Stable identifier of a debuggee thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which threads stop when one thread suspends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendPolicy {
    /// Only the triggering thread.
    #[default]
    One,
    /// Every known running thread, each at its own next event.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Running,
    Suspended,
}

/// Why a thread stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Breakpoint,
    StepInto,
    StepOver,
    StepReturn,
    StepIntoMyCode,
    RunToLine,
    SetNextStatement,
    CaughtException,
    UncaughtException,
    ThreadSuspend,
    ThreadCreate,
}

// Poisoning only means another debuggee thread panicked while holding the
// lock; the protected state is updated in single steps and stays consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
