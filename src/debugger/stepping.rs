use super::filters::Filters;
use super::frame::FrameInfo;
use super::session::TraceEvent;
use super::StopReason;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    StepInto,
    StepOver,
    StepReturn,
    StepIntoMyCode,
    RunToLine { line: u32 },
    SetNextStatement { line: u32 },
}

impl StepMode {
    pub fn reason(&self) -> StopReason {
        match self {
            StepMode::StepInto => StopReason::StepInto,
            StepMode::StepOver => StopReason::StepOver,
            StepMode::StepReturn => StopReason::StepReturn,
            StepMode::StepIntoMyCode => StopReason::StepIntoMyCode,
            StepMode::RunToLine { .. } => StopReason::RunToLine,
            StepMode::SetNextStatement { .. } => StopReason::SetNextStatement,
        }
    }
}

/// Outcome of feeding one execution event to an active step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Continue,
    /// Stop here. With `skip_innermost` the reported chain starts at the
    /// caller of the event's frame.
    Complete { reason: StopReason, skip_innermost: bool },
}

/// A step in progress on one thread, anchored at the frame it was issued from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    pub mode: StepMode,
    /// Chain length of the issuing frame.
    pub origin_depth: usize,
}

impl StepRequest {
    /// `depth` is the chain length at the suspension point the step is issued
    /// from. A step-return from the outermost frame has nowhere to return to
    /// and behaves as a step-into.
    pub fn new(mode: StepMode, depth: usize) -> Self {
        let mode = match mode {
            StepMode::StepReturn if depth <= 1 => StepMode::StepInto,
            other => other,
        };
        Self {
            mode,
            origin_depth: depth,
        }
    }

    pub fn evaluate(&self, event: &TraceEvent<'_>, frames: &[FrameInfo], filters: &Filters) -> StepDecision {
        let Some(frame) = frames.first() else {
            return StepDecision::Continue;
        };
        let depth = frames.len();
        let complete = StepDecision::Complete {
            reason: self.mode.reason(),
            skip_innermost: false,
        };
        let is_line = matches!(event, TraceEvent::Line);

        if is_line && filters.is_dont_trace(frame) {
            return StepDecision::Continue;
        }

        match self.mode {
            StepMode::StepInto | StepMode::SetNextStatement { .. } if is_line => complete,
            StepMode::StepIntoMyCode if is_line && filters.is_user_code(frame) => complete,
            StepMode::StepOver if is_line && depth <= self.origin_depth => complete,
            StepMode::StepReturn => match event {
                TraceEvent::Return if depth == self.origin_depth => StepDecision::Complete {
                    reason: StopReason::StepReturn,
                    skip_innermost: true,
                },
                TraceEvent::Line if depth < self.origin_depth => complete,
                _ => StepDecision::Continue,
            },
            StepMode::RunToLine { line } if is_line => {
                if depth < self.origin_depth || (depth == self.origin_depth && frame.line == line) {
                    complete
                } else {
                    StepDecision::Continue
                }
            }
            _ => StepDecision::Continue,
        }
    }
}

/// Lines of the frame's function that a set-next-statement may jump to:
/// those whose scope equals or encloses the current line's scope.
pub fn compute_next_statement_targets(frame: &FrameInfo) -> BTreeSet<u32> {
    let Some(layout) = frame.layout.as_ref() else {
        return BTreeSet::new();
    };
    let Some(current) = layout.scope_of(frame.line) else {
        return BTreeSet::new();
    };
    layout
        .lines
        .iter()
        .filter(|entry| current.starts_with(&entry.scope))
        .map(|entry| entry.line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::{FunctionLayout, LineScope};
    use std::sync::Arc;

    fn chain(depth: usize, line: u32) -> Vec<FrameInfo> {
        (0..depth)
            .map(|i| FrameInfo::new(format!("f{}", depth - i), "/work/app.trace", line + i as u32))
            .collect()
    }

    #[test]
    fn test_step_over_never_stops_deeper() {
        let step = StepRequest::new(StepMode::StepOver, 2);
        let filters = Filters::default();
        assert_eq!(step.evaluate(&TraceEvent::Line, &chain(3, 10), &filters), StepDecision::Continue);
        assert_eq!(step.evaluate(&TraceEvent::Call, &chain(2, 10), &filters), StepDecision::Continue);
        assert!(matches!(
            step.evaluate(&TraceEvent::Line, &chain(2, 11), &filters),
            StepDecision::Complete { reason: StopReason::StepOver, .. }
        ));
        assert!(matches!(
            step.evaluate(&TraceEvent::Line, &chain(1, 5), &filters),
            StepDecision::Complete { .. }
        ));
    }

    #[test]
    fn test_step_into_skips_dont_trace_frames() {
        let step = StepRequest::new(StepMode::StepInto, 1);
        let filters = Filters::default();
        let mut frames = chain(2, 3);
        frames[0].dont_trace = true;
        assert_eq!(step.evaluate(&TraceEvent::Line, &frames, &filters), StepDecision::Continue);

        // A traced function called from untraced code is still a stop.
        let mut deeper = chain(3, 3);
        deeper[1].dont_trace = true;
        assert!(matches!(step.evaluate(&TraceEvent::Line, &deeper, &filters), StepDecision::Complete { .. }));
    }

    #[test]
    fn test_step_return_stops_in_caller() {
        let step = StepRequest::new(StepMode::StepReturn, 2);
        let filters = Filters::default();
        assert_eq!(step.evaluate(&TraceEvent::Return, &chain(3, 1), &filters), StepDecision::Continue);
        assert_eq!(
            step.evaluate(&TraceEvent::Return, &chain(2, 1), &filters),
            StepDecision::Complete { reason: StopReason::StepReturn, skip_innermost: true }
        );
    }

    #[test]
    fn test_step_return_without_caller_degrades() {
        assert_eq!(StepRequest::new(StepMode::StepReturn, 1).mode, StepMode::StepInto);
    }

    #[test]
    fn test_run_to_line_target_or_frame_exit() {
        let step = StepRequest::new(StepMode::RunToLine { line: 20 }, 2);
        let filters = Filters::default();
        assert_eq!(step.evaluate(&TraceEvent::Line, &chain(2, 19), &filters), StepDecision::Continue);
        assert_eq!(step.evaluate(&TraceEvent::Line, &chain(3, 20), &filters), StepDecision::Continue);
        assert!(matches!(step.evaluate(&TraceEvent::Line, &chain(2, 20), &filters), StepDecision::Complete { .. }));
        assert!(matches!(step.evaluate(&TraceEvent::Line, &chain(1, 7), &filters), StepDecision::Complete { .. }));
    }

    #[test]
    fn test_next_statement_targets_exclude_nested_blocks() {
        // 1: fn body, 2: try (scope [1]), 3: inside loop ([1, 2]), 4: body again.
        let layout = Arc::new(FunctionLayout {
            lines: vec![
                LineScope { line: 1, scope: vec![] },
                LineScope { line: 2, scope: vec![1] },
                LineScope { line: 3, scope: vec![1, 2] },
                LineScope { line: 4, scope: vec![] },
            ],
        });
        let at_two = FrameInfo::new("f", "a", 2).with_layout(Arc::clone(&layout));
        assert_eq!(compute_next_statement_targets(&at_two).into_iter().collect::<Vec<_>>(), vec![1, 2, 4]);

        let at_four = FrameInfo::new("f", "a", 4).with_layout(layout);
        assert_eq!(compute_next_statement_targets(&at_four).into_iter().collect::<Vec<_>>(), vec![1, 4]);

        assert!(compute_next_statement_targets(&FrameInfo::new("f", "a", 1)).is_empty());
    }
}
