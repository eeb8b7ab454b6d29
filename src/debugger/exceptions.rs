use super::breakpoints::{CaughtNotify, ExceptionBreakpoint};
use super::filters::Filters;
use super::frame::FrameInfo;
use super::{lock, read, write, ThreadId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use tracing::{debug, trace};

/// Per-thread cap on remembered exception objects.
const TRACKED_PER_THREAD: usize = 32;

/// Exception kind name plus its ancestor kinds, nearest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionKind {
    pub name: String,
    pub ancestors: Vec<String>,
}

impl ExceptionKind {
    pub fn new(name: impl Into<String>, ancestors: Vec<String>) -> Self {
        Self {
            name: name.into(),
            ancestors,
        }
    }

    /// The kind's own name followed by its ancestors.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.ancestors.iter().map(String::as_str))
    }

    pub fn is_a(&self, name: &str) -> bool {
        self.names().any(|n| n == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    /// Identity of the exception object; stable while it propagates.
    pub object_id: u64,
    pub kind: ExceptionKind,
    pub description: String,
}

/// What the instrumentation source reports for an exception event in the
/// innermost frame of the chain.
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub info: ExceptionInfo,
    /// The innermost frame has a handler that will intercept it.
    pub frame_has_handler: bool,
    /// The exception leaves the outermost reported frame still active.
    pub propagating_past_top: bool,
    /// The raising line carries the ignore-exception marker.
    pub raised_on_ignored_line: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionClass {
    None,
    Caught,
    Uncaught,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExceptionGlobals {
    /// Report a caught exception only in a caller, not in the raising frame.
    pub skip_same_context: bool,
    /// Never report exceptions raised on lines marked to be ignored.
    pub ignore_marked_lines: bool,
}

/// Raw classification, before any policy is consulted. Leaving the top of
/// the reported chain counts as uncaught even when the frame has a handler.
pub fn classify_raw(event: &ExceptionEvent) -> ExceptionClass {
    if event.propagating_past_top {
        ExceptionClass::Uncaught
    } else if event.frame_has_handler {
        ExceptionClass::Caught
    } else {
        ExceptionClass::None
    }
}

struct Facts {
    class: ExceptionClass,
    has_policy: bool,
    notify_caught: CaughtNotify,
    notify_uncaught: bool,
    caught_reported: bool,
    uncaught_reported: bool,
    library_origin: bool,
    ignore_libraries: bool,
    ignored_line: bool,
    ignore_marked_lines: bool,
    same_context: bool,
    skip_same_context: bool,
    dont_trace_frame: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Skip,
    Report,
}

struct Rule {
    name: &'static str,
    applies: fn(&Facts) -> bool,
    outcome: Outcome,
}

// First matching rule wins; the last rule always matches.
const RULES: &[Rule] = &[
    Rule {
        name: "not-an-interception-point",
        applies: |f| f.class == ExceptionClass::None,
        outcome: Outcome::Skip,
    },
    Rule {
        name: "no-policy",
        applies: |f| !f.has_policy,
        outcome: Outcome::Skip,
    },
    Rule {
        name: "dont-trace-frame",
        applies: |f| f.dont_trace_frame,
        outcome: Outcome::Skip,
    },
    Rule {
        name: "ignored-line",
        applies: |f| f.ignored_line && f.ignore_marked_lines,
        outcome: Outcome::Skip,
    },
    Rule {
        name: "library-origin",
        applies: |f| f.library_origin && f.ignore_libraries,
        outcome: Outcome::Skip,
    },
    Rule {
        name: "uncaught-not-requested",
        applies: |f| f.class == ExceptionClass::Uncaught && !f.notify_uncaught,
        outcome: Outcome::Skip,
    },
    Rule {
        name: "uncaught-already-reported",
        applies: |f| f.class == ExceptionClass::Uncaught && f.uncaught_reported,
        outcome: Outcome::Skip,
    },
    Rule {
        name: "uncaught",
        applies: |f| f.class == ExceptionClass::Uncaught,
        outcome: Outcome::Report,
    },
    Rule {
        name: "caught-not-requested",
        applies: |f| f.notify_caught == CaughtNotify::Never,
        outcome: Outcome::Skip,
    },
    Rule {
        name: "caught-same-context",
        applies: |f| f.skip_same_context && f.same_context,
        outcome: Outcome::Skip,
    },
    Rule {
        name: "caught-once-already-reported",
        applies: |f| f.notify_caught == CaughtNotify::Once && f.caught_reported,
        outcome: Outcome::Skip,
    },
    Rule {
        name: "caught",
        applies: |_| true,
        outcome: Outcome::Report,
    },
];

fn evaluate(facts: &Facts) -> (&'static str, Outcome) {
    RULES
        .iter()
        .find(|rule| (rule.applies)(facts))
        .map(|rule| (rule.name, rule.outcome))
        .unwrap_or(("fallthrough", Outcome::Skip))
}

#[derive(Debug)]
struct Tracked {
    object_id: u64,
    origin_depth: usize,
    origin_function: String,
    origin_is_user: bool,
    caught_reported: bool,
    uncaught_reported: bool,
}

/// Decides whether an exception event is reported as caught, uncaught or
/// not at all, and remembers per-thread which objects were already reported.
#[derive(Debug, Default)]
pub struct ExceptionPolicyEngine {
    globals: RwLock<ExceptionGlobals>,
    tracked: Mutex<HashMap<ThreadId, VecDeque<Tracked>>>,
}

impl ExceptionPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn globals(&self) -> ExceptionGlobals {
        *read(&self.globals)
    }

    pub fn set_globals(&self, globals: ExceptionGlobals) {
        *write(&self.globals) = globals;
    }

    /// Classify one exception event for `thread`. `frames[0]` is the frame
    /// the event was delivered in; `policy` is the registry's match for the
    /// exception kind, if any.
    pub fn classify(
        &self,
        thread: ThreadId,
        event: &ExceptionEvent,
        frames: &[FrameInfo],
        policy: Option<&ExceptionBreakpoint>,
        filters: &Filters,
    ) -> ExceptionClass {
        let Some(innermost) = frames.first() else {
            return ExceptionClass::None;
        };
        let globals = self.globals();
        let mut tracked = lock(&self.tracked);
        let entries = tracked.entry(thread).or_default();

        let position = match entries.iter().position(|t| t.object_id == event.info.object_id) {
            Some(position) => position,
            None => {
                if entries.len() == TRACKED_PER_THREAD {
                    entries.pop_front();
                }
                entries.push_back(Tracked {
                    object_id: event.info.object_id,
                    origin_depth: frames.len(),
                    origin_function: innermost.function.clone(),
                    origin_is_user: filters.is_user_code(innermost),
                    caught_reported: false,
                    uncaught_reported: false,
                });
                entries.len() - 1
            }
        };
        let entry = &mut entries[position];

        let class = classify_raw(event);
        let facts = Facts {
            class,
            has_policy: policy.is_some(),
            notify_caught: policy.map(|p| p.notify_on_caught).unwrap_or_default(),
            notify_uncaught: policy.map(|p| p.notify_on_uncaught).unwrap_or(false),
            caught_reported: entry.caught_reported,
            uncaught_reported: entry.uncaught_reported,
            library_origin: !entry.origin_is_user,
            ignore_libraries: policy.map(|p| p.ignore_libraries).unwrap_or(false),
            ignored_line: event.raised_on_ignored_line,
            ignore_marked_lines: globals.ignore_marked_lines,
            same_context: entry.origin_depth == frames.len()
                && entry.origin_function == innermost.function,
            skip_same_context: globals.skip_same_context,
            dont_trace_frame: filters.is_dont_trace(innermost),
        };

        let (rule, outcome) = evaluate(&facts);
        trace!(thread = %thread, object = event.info.object_id, kind = %event.info.kind.name,
               ?class, rule, "Exception rule matched");

        if outcome == Outcome::Skip {
            return ExceptionClass::None;
        }
        match class {
            ExceptionClass::Caught => entry.caught_reported = true,
            ExceptionClass::Uncaught => entry.uncaught_reported = true,
            ExceptionClass::None => {}
        }
        debug!(thread = %thread, object = event.info.object_id, ?class, "Reporting exception");
        class
    }

    /// Forget everything remembered for a thread that has ended.
    pub fn thread_exited(&self, thread: ThreadId) {
        lock(&self.tracked).remove(&thread);
    }

    #[cfg(test)]
    fn tracked_count(&self, thread: ThreadId) -> usize {
        lock(&self.tracked).get(&thread).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::debugger::SuspendPolicy;

    const T1: ThreadId = ThreadId(1);

    fn policy(caught: CaughtNotify, uncaught: bool) -> ExceptionBreakpoint {
        ExceptionBreakpoint {
            kind: "ValueError".into(),
            notify_on_caught: caught,
            notify_on_uncaught: uncaught,
            ignore_libraries: false,
            suspend_policy: SuspendPolicy::One,
        }
    }

    fn event(object_id: u64, handler: bool, past_top: bool) -> ExceptionEvent {
        ExceptionEvent {
            info: ExceptionInfo {
                object_id,
                kind: ExceptionKind::new("ValueError", vec!["Exception".into()]),
                description: "bad value".into(),
            },
            frame_has_handler: handler,
            propagating_past_top: past_top,
            raised_on_ignored_line: false,
        }
    }

    fn chain(names: &[&str]) -> Vec<FrameInfo> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| FrameInfo::new(*name, "/work/app.trace", 10 + i as u32))
            .collect()
    }

    #[test]
    fn test_raw_classification() {
        assert_eq!(classify_raw(&event(1, true, false)), ExceptionClass::Caught);
        assert_eq!(classify_raw(&event(1, false, false)), ExceptionClass::None);
        assert_eq!(classify_raw(&event(1, true, true)), ExceptionClass::Uncaught);
    }

    #[test]
    fn test_once_policy_reports_single_caught_across_frames() {
        let engine = ExceptionPolicyEngine::new();
        let filters = Filters::default();
        let policy = policy(CaughtNotify::Once, true);
        let frames = chain(&["inner", "middle", "outer", "<module>"]);

        let reports: Vec<_> = (0..3)
            .map(|depth| engine.classify(T1, &event(7, true, false), &frames[depth..], Some(&policy), &filters))
            .filter(|class| *class != ExceptionClass::None)
            .collect();
        assert_eq!(reports, vec![ExceptionClass::Caught]);

        // The same object may still be reported once as uncaught.
        let top = engine.classify(T1, &event(7, false, true), &frames[3..], Some(&policy), &filters);
        assert_eq!(top, ExceptionClass::Uncaught);
        let again = engine.classify(T1, &event(7, false, true), &frames[3..], Some(&policy), &filters);
        assert_eq!(again, ExceptionClass::None);
    }

    #[test]
    fn test_every_time_reports_each_handler_frame() {
        let engine = ExceptionPolicyEngine::new();
        let filters = Filters::default();
        let policy = policy(CaughtNotify::EveryTime, false);
        let frames = chain(&["inner", "outer"]);
        for depth in 0..2 {
            let class = engine.classify(T1, &event(3, true, false), &frames[depth..], Some(&policy), &filters);
            assert_eq!(class, ExceptionClass::Caught);
        }
    }

    #[test]
    fn test_no_policy_and_uncaught_disabled() {
        let engine = ExceptionPolicyEngine::new();
        let filters = Filters::default();
        let frames = chain(&["f"]);
        assert_eq!(engine.classify(T1, &event(1, true, false), &frames, None, &filters), ExceptionClass::None);

        let caught_only = policy(CaughtNotify::Once, false);
        assert_eq!(
            engine.classify(T1, &event(2, false, true), &frames, Some(&caught_only), &filters),
            ExceptionClass::None
        );
    }

    #[test]
    fn test_library_origin_is_ignored_when_requested() {
        let engine = ExceptionPolicyEngine::new();
        let mut config = EngineConfig::default();
        config.project_roots = vec!["/work/project".into()];
        let filters = Filters::from_config(&config);
        let mut policy = policy(CaughtNotify::EveryTime, true);
        policy.ignore_libraries = true;

        let frames = chain(&["lib_fn"]);
        assert_eq!(engine.classify(T1, &event(1, true, false), &frames, Some(&policy), &filters), ExceptionClass::None);

        policy.ignore_libraries = false;
        assert_eq!(engine.classify(T1, &event(1, true, false), &frames, Some(&policy), &filters), ExceptionClass::Caught);
    }

    #[test]
    fn test_globals_skip_same_context_and_marked_lines() {
        let engine = ExceptionPolicyEngine::new();
        let filters = Filters::default();
        let policy = policy(CaughtNotify::EveryTime, true);
        engine.set_globals(ExceptionGlobals {
            skip_same_context: true,
            ignore_marked_lines: true,
        });

        let frames = chain(&["raiser", "caller"]);
        assert_eq!(engine.classify(T1, &event(5, true, false), &frames, Some(&policy), &filters), ExceptionClass::None);
        assert_eq!(engine.classify(T1, &event(5, true, false), &frames[1..], Some(&policy), &filters), ExceptionClass::Caught);

        let mut marked = event(6, true, true);
        marked.raised_on_ignored_line = true;
        assert_eq!(engine.classify(T1, &marked, &frames, Some(&policy), &filters), ExceptionClass::None);
    }

    #[test]
    fn test_tracking_is_bounded_and_dropped_on_exit() {
        let engine = ExceptionPolicyEngine::new();
        let filters = Filters::default();
        let frames = chain(&["f"]);
        for object in 0..(TRACKED_PER_THREAD as u64 + 10) {
            engine.classify(T1, &event(object, false, false), &frames, None, &filters);
        }
        assert_eq!(engine.tracked_count(T1), TRACKED_PER_THREAD);
        engine.thread_exited(T1);
        assert_eq!(engine.tracked_count(T1), 0);
    }

    #[test]
    fn test_kind_names_order() {
        let kind = ExceptionKind::new("KeyError", vec!["LookupError".into(), "Exception".into()]);
        assert_eq!(kind.names().collect::<Vec<_>>(), vec!["KeyError", "LookupError", "Exception"]);
        assert!(kind.is_a("Exception"));
        assert!(!kind.is_a("ValueError"));
    }
}
