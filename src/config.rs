//! Engine configuration.
//!
//! Values are layered: defaults, then an optional JSON file, then
//! environment variables, then command-line flags (applied by the binary).

use crate::debugger::SuspendPolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

pub const ENV_PROJECT_ROOTS: &str = "TRACE_DEBUGGER_PROJECT_ROOTS";
pub const ENV_PATH_MAPPINGS: &str = "TRACE_DEBUGGER_PATH_MAPPINGS";
pub const ENV_STOP_ON_START: &str = "TRACE_DEBUGGER_STOP_ON_START";

/// One client-to-debuggee path prefix translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub client: String,
    pub debuggee: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Directories considered user code. Empty means everything is user code.
    pub project_roots: Vec<String>,
    /// Files whose frames never generate stops while don't-trace is enabled.
    pub dont_trace_files: Vec<String>,
    pub dont_trace_enabled: bool,
    pub path_mappings: Vec<PathMapping>,
    /// Suspend at the first line of user code after `run`.
    pub stop_on_start: bool,
    /// Suspend every new thread at its first event.
    pub stop_on_thread_create: bool,
    /// Policy used for step completions and explicit suspends.
    pub step_suspend_policy: SuspendPolicy,
    /// Policy used by exception breakpoints that do not carry one.
    pub exception_suspend_policy: SuspendPolicy,
    /// Mirror debuggee output to the real stdout/stderr as well.
    pub echo_output: bool,
    /// The outermost visible frame is not the real top of the stack.
    pub attach_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_roots: Vec::new(),
            dont_trace_files: Vec::new(),
            dont_trace_enabled: true,
            path_mappings: Vec::new(),
            stop_on_start: false,
            stop_on_thread_create: false,
            step_suspend_policy: SuspendPolicy::One,
            exception_suspend_policy: SuspendPolicy::One,
            echo_output: false,
            attach_mode: false,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        debug!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Overlay the `TRACE_DEBUGGER_*` environment variables.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Some(roots) = std::env::var_os(ENV_PROJECT_ROOTS) {
            self.project_roots = std::env::split_paths(&roots)
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
        }

        if let Ok(mappings) = std::env::var(ENV_PATH_MAPPINGS) {
            self.path_mappings = parse_path_mappings(&mappings)?;
        }

        if let Ok(flag) = std::env::var(ENV_STOP_ON_START) {
            match parse_flag(&flag) {
                Some(value) => self.stop_on_start = value,
                None => warn!(value = %flag, "Ignoring unrecognized {}", ENV_STOP_ON_START),
            }
        }

        Ok(self)
    }
}

/// Accepts either `[{"client": .., "debuggee": ..}]` or `[[client, debuggee]]`.
pub fn parse_path_mappings(text: &str) -> Result<Vec<PathMapping>> {
    if let Ok(mappings) = serde_json::from_str::<Vec<PathMapping>>(text) {
        return Ok(mappings);
    }
    let pairs: Vec<(String, String)> = serde_json::from_str(text)
        .map_err(|e| Error::InvalidMessage(format!("{}: {}", ENV_PATH_MAPPINGS, e)))?;
    Ok(pairs
        .into_iter()
        .map(|(client, debuggee)| PathMapping { client, debuggee })
        .collect())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.project_roots.is_empty());
        assert!(config.dont_trace_enabled);
        assert_eq!(config.step_suspend_policy, SuspendPolicy::One);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"projectRoots": ["/work/app"], "stopOnStart": true}"#)
                .unwrap();
        assert_eq!(config.project_roots, vec!["/work/app".to_string()]);
        assert!(config.stop_on_start);
        assert!(!config.attach_mode);
    }

    #[test]
    fn test_path_mappings_both_shapes() {
        let objects =
            parse_path_mappings(r#"[{"client": "C:/src", "debuggee": "/srv/src"}]"#).unwrap();
        let pairs = parse_path_mappings(r#"[["C:/src", "/srv/src"]]"#).unwrap();
        assert_eq!(objects, pairs);
        assert!(parse_path_mappings("nope").is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
