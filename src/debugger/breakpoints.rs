use super::exceptions::ExceptionKind;
use super::filters::normalize_path;
use super::frame::MODULE_FUNCTION;
use super::sequence::SequenceAllocator;
use super::SuspendPolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Restricts a line breakpoint to hits inside a particular function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionFilter {
    /// Only module-level code.
    TopLevel,
    Any,
    Named(String),
}

impl FunctionFilter {
    /// `""` selects module level, absent or `"None"` selects any function.
    pub fn from_wire(value: Option<&str>) -> Self {
        match value {
            None | Some("None") => FunctionFilter::Any,
            Some("") => FunctionFilter::TopLevel,
            Some(name) => FunctionFilter::Named(name.to_string()),
        }
    }

    pub fn matches(&self, function: &str) -> bool {
        match self {
            FunctionFilter::TopLevel => function == MODULE_FUNCTION,
            FunctionFilter::Any => true,
            FunctionFilter::Named(name) => name == function,
        }
    }
}

/// Gate applied to the hit count after it has been incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    Equal(u64),
    AtLeast(u64),
    Greater(u64),
    Multiple(u64),
}

impl HitCondition {
    /// Accepts `N`, `== N`, `>= N`, `> N` and `% N`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (ctor, rest): (fn(u64) -> HitCondition, &str) =
            if let Some(rest) = text.strip_prefix("==") {
                (HitCondition::Equal, rest)
            } else if let Some(rest) = text.strip_prefix(">=") {
                (HitCondition::AtLeast, rest)
            } else if let Some(rest) = text.strip_prefix('>') {
                (HitCondition::Greater, rest)
            } else if let Some(rest) = text.strip_prefix('%') {
                (HitCondition::Multiple, rest)
            } else {
                (HitCondition::Equal, text)
            };

        let n: u64 = rest
            .trim()
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid hit condition '{}'", text)))?;
        if matches!(ctor(n), HitCondition::Multiple(0)) {
            return Err(Error::Protocol("hit condition '% 0'".to_string()));
        }
        Ok(ctor(n))
    }

    pub fn is_met(&self, hits: u64) -> bool {
        match *self {
            HitCondition::Equal(n) => hits == n,
            HitCondition::AtLeast(n) => hits >= n,
            HitCondition::Greater(n) => hits > n,
            HitCondition::Multiple(n) => hits % n == 0,
        }
    }
}

/// Arguments of an add-breakpoint command after wire decoding.
#[derive(Debug, Clone)]
pub struct NewLineBreakpoint {
    pub file: String,
    pub line: u32,
    pub function: FunctionFilter,
    pub condition: Option<String>,
    pub hit_condition: Option<HitCondition>,
    /// Present for log points: rendered and printed instead of suspending.
    pub log_expression: Option<String>,
    pub suspend_policy: SuspendPolicy,
}

impl NewLineBreakpoint {
    pub fn at(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            function: FunctionFilter::Any,
            condition: None,
            hit_condition: None,
            log_expression: None,
            suspend_policy: SuspendPolicy::One,
        }
    }
}

#[derive(Debug)]
pub struct LineBreakpoint {
    pub id: u64,
    pub file: String,
    pub line: u32,
    pub function: FunctionFilter,
    pub condition: Option<String>,
    pub hit_condition: Option<HitCondition>,
    pub log_expression: Option<String>,
    pub suspend_policy: SuspendPolicy,
    pub enabled: bool,
    hits: AtomicU64,
}

impl LineBreakpoint {
    /// Count one hit and return the new total.
    pub fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaughtNotify {
    #[default]
    Never,
    Once,
    EveryTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionBreakpoint {
    pub kind: String,
    pub notify_on_caught: CaughtNotify,
    pub notify_on_uncaught: bool,
    /// Ignore exceptions whose origin frame is outside the project roots.
    pub ignore_libraries: bool,
    pub suspend_policy: SuspendPolicy,
}

/// Line and exception breakpoints of one session.
///
/// Lives behind the session's `RwLock`: matching happens under the read
/// lock from debuggee threads, and hit counts are atomics for that reason.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    ids: SequenceAllocator,
    lines: BTreeMap<u64, Arc<LineBreakpoint>>,
    by_location: HashMap<(String, u32), Vec<u64>>,
    exceptions: HashMap<String, ExceptionBreakpoint>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, request: NewLineBreakpoint) -> u64 {
        let id = self.ids.next();
        let file = normalize_path(&request.file);
        debug!(id, file = %file, line = request.line, "Breakpoint added");

        self.by_location
            .entry((file.clone(), request.line))
            .or_default()
            .push(id);
        self.lines.insert(
            id,
            Arc::new(LineBreakpoint {
                id,
                file,
                line: request.line,
                function: request.function,
                condition: request.condition.filter(|c| !c.trim().is_empty()),
                hit_condition: request.hit_condition,
                log_expression: request.log_expression,
                suspend_policy: request.suspend_policy,
                enabled: true,
                hits: AtomicU64::new(0),
            }),
        );
        id
    }

    pub fn remove(&mut self, id: u64) -> Result<()> {
        let removed = self
            .lines
            .remove(&id)
            .ok_or_else(|| Error::TargetNotFound(format!("breakpoint {}", id)))?;

        let key = (removed.file.clone(), removed.line);
        if let Some(ids) = self.by_location.get_mut(&key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_location.remove(&key);
            }
        }
        debug!(id, "Breakpoint removed");
        Ok(())
    }

    /// Replace the condition and/or enabled flag. An empty condition clears it.
    pub fn change(&mut self, id: u64, condition: Option<String>, enabled: Option<bool>) -> Result<()> {
        let current = self
            .lines
            .get(&id)
            .ok_or_else(|| Error::TargetNotFound(format!("breakpoint {}", id)))?;

        let updated = LineBreakpoint {
            id,
            file: current.file.clone(),
            line: current.line,
            function: current.function.clone(),
            condition: match condition {
                Some(text) if text.trim().is_empty() => None,
                Some(text) => Some(text),
                None => current.condition.clone(),
            },
            hit_condition: current.hit_condition,
            log_expression: current.log_expression.clone(),
            suspend_policy: current.suspend_policy,
            enabled: enabled.unwrap_or(current.enabled),
            hits: AtomicU64::new(current.hit_count()),
        };
        debug!(id, enabled = updated.enabled, "Breakpoint changed");
        self.lines.insert(id, Arc::new(updated));
        Ok(())
    }

    /// Enabled breakpoints at `file:line` whose function filter accepts
    /// `function`, oldest first. Conditions are left to the caller.
    pub fn find_line_matches(&self, file: &str, line: u32, function: &str) -> Vec<Arc<LineBreakpoint>> {
        let Some(ids) = self.by_location.get(&(normalize_path(file), line)) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.lines.get(id))
            .filter(|bp| bp.enabled && bp.function.matches(function))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<Arc<LineBreakpoint>> {
        self.lines.get(&id).cloned()
    }

    pub fn set_exception(&mut self, policy: ExceptionBreakpoint) {
        debug!(kind = %policy.kind, caught = ?policy.notify_on_caught,
               uncaught = policy.notify_on_uncaught, "Exception breakpoint set");
        self.exceptions.insert(policy.kind.clone(), policy);
    }

    pub fn remove_exception(&mut self, kind: &str) -> Result<()> {
        self.exceptions
            .remove(kind)
            .map(|_| ())
            .ok_or_else(|| Error::TargetNotFound(format!("exception breakpoint {}", kind)))
    }

    /// Policy registered for the kind itself, else for its nearest ancestor.
    pub fn find_exception_policy(&self, kind: &ExceptionKind) -> Option<ExceptionBreakpoint> {
        kind.names().find_map(|name| self.exceptions.get(name)).cloned()
    }

    pub fn has_exception_policies(&self) -> bool {
        !self.exceptions.is_empty()
    }

    /// Drop everything. Ids keep counting up so none is reused.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.by_location.clear();
        self.exceptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(file: &str, line: u32, function: FunctionFilter) -> (BreakpointRegistry, u64) {
        let mut registry = BreakpointRegistry::new();
        let mut request = NewLineBreakpoint::at(file, line);
        request.function = function;
        let id = registry.add(request);
        (registry, id)
    }

    fn ids(found: &[Arc<LineBreakpoint>]) -> Vec<u64> {
        found.iter().map(|bp| bp.id).collect()
    }

    #[test]
    fn test_function_filter_from_wire() {
        assert_eq!(FunctionFilter::from_wire(Some("")), FunctionFilter::TopLevel);
        assert_eq!(FunctionFilter::from_wire(Some("None")), FunctionFilter::Any);
        assert_eq!(FunctionFilter::from_wire(None), FunctionFilter::Any);
        assert!(FunctionFilter::TopLevel.matches(MODULE_FUNCTION));
        assert!(!FunctionFilter::TopLevel.matches("set_up"));
    }

    #[test]
    fn test_named_filter_only_matches_that_function() {
        let (registry, id) = registry_with("app.trace", 6, FunctionFilter::Named("set_up".into()));
        assert_eq!(ids(&registry.find_line_matches("app.trace", 6, "set_up")), vec![id]);
        assert!(registry.find_line_matches("app.trace", 6, "tear_down").is_empty());
    }

    #[test]
    fn test_every_breakpoint_on_a_line_is_returned() {
        let (mut registry, first) = registry_with("app.trace", 6, FunctionFilter::Any);
        let mut second = NewLineBreakpoint::at("app.trace", 6);
        second.condition = Some("x > 1".into());
        let second = registry.add(second);
        let third = registry.add(NewLineBreakpoint::at("app.trace", 6));
        registry.change(third, None, Some(false)).unwrap();

        assert_eq!(ids(&registry.find_line_matches("app.trace", 6, "f")), vec![first, second]);
    }

    #[test]
    fn test_windows_separators_are_normalized() {
        let (registry, _) = registry_with("C:\\src\\app.trace", 3, FunctionFilter::Any);
        assert!(!registry.find_line_matches("C:/src/app.trace", 3, "f").is_empty());
    }

    #[test]
    fn test_remove_twice_reports_missing() {
        let (mut registry, id) = registry_with("app.trace", 6, FunctionFilter::Any);
        assert!(registry.remove(id).is_ok());
        assert!(matches!(registry.remove(id), Err(Error::TargetNotFound(_))));
        assert!(registry.find_line_matches("app.trace", 6, "f").is_empty());
    }

    #[test]
    fn test_ids_never_reused_after_clear() {
        let (mut registry, first) = registry_with("a", 1, FunctionFilter::Any);
        registry.clear();
        let second = registry.add(NewLineBreakpoint::at("a", 1));
        assert!(second > first);
    }

    #[test]
    fn test_change_keeps_hit_count_and_disables() {
        let (mut registry, id) = registry_with("a", 1, FunctionFilter::Any);
        registry.get(id).unwrap().record_hit();
        registry.change(id, Some("x > 1".into()), Some(false)).unwrap();

        let bp = registry.get(id).unwrap();
        assert_eq!(bp.hit_count(), 1);
        assert_eq!(bp.condition.as_deref(), Some("x > 1"));
        assert!(registry.find_line_matches("a", 1, "f").is_empty());

        registry.change(id, Some(String::new()), Some(true)).unwrap();
        assert!(registry.get(id).unwrap().condition.is_none());
        assert!(!registry.find_line_matches("a", 1, "f").is_empty());
    }

    #[test]
    fn test_hit_condition_parse() {
        assert_eq!(HitCondition::parse("3").unwrap(), HitCondition::Equal(3));
        assert_eq!(HitCondition::parse(">= 2").unwrap(), HitCondition::AtLeast(2));
        assert!(HitCondition::parse("% 2").unwrap().is_met(4));
        assert!(!HitCondition::parse("> 2").unwrap().is_met(2));
        assert!(HitCondition::parse("% 0").is_err());
        assert!(HitCondition::parse("often").is_err());
    }

    #[test]
    fn test_exception_policy_matches_ancestors() {
        let mut registry = BreakpointRegistry::new();
        registry.set_exception(ExceptionBreakpoint {
            kind: "LookupError".into(),
            notify_on_caught: CaughtNotify::Once,
            notify_on_uncaught: true,
            ignore_libraries: false,
            suspend_policy: SuspendPolicy::One,
        });

        let key_error = ExceptionKind::new("KeyError", vec!["LookupError".into(), "Exception".into()]);
        assert_eq!(registry.find_exception_policy(&key_error).map(|p| p.kind), Some("LookupError".into()));

        let value_error = ExceptionKind::new("ValueError", vec!["Exception".into()]);
        assert!(registry.find_exception_policy(&value_error).is_none());

        assert!(registry.remove_exception("LookupError").is_ok());
        assert!(registry.remove_exception("LookupError").is_err());
    }
}
