use super::frame::FrameInfo;
use crate::config::{EngineConfig, PathMapping};
use std::collections::HashSet;

pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

fn strip_trailing_slash(path: String) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        path
    } else {
        trimmed.to_string()
    }
}

fn has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

// `prefix` followed by the remainder of a path it matched, with exactly one
// separator between them.
fn join_prefix(prefix: &str, rest: &str) -> String {
    match (prefix.ends_with('/'), rest.strip_prefix('/')) {
        (true, Some(rest)) => format!("{}{}", prefix, rest),
        (false, None) if !rest.is_empty() => format!("{}/{}", prefix, rest),
        _ => format!("{}{}", prefix, rest),
    }
}

/// Directories whose files count as user code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectRoots {
    roots: Vec<String>,
}

impl ProjectRoots {
    pub fn new<S: AsRef<str>>(roots: &[S]) -> Self {
        Self {
            roots: roots
                .iter()
                .map(|r| strip_trailing_slash(normalize_path(r.as_ref())))
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    /// With no roots configured everything is user code.
    pub fn is_user_code(&self, file: &str) -> bool {
        if self.roots.is_empty() {
            return true;
        }
        let file = normalize_path(file);
        self.roots.iter().any(|root| has_prefix(&file, root))
    }
}

/// Prefix rewriting between controller-side and debuggee-side paths.
#[derive(Debug, Clone, Default)]
pub struct PathTranslator {
    mappings: Vec<(String, String)>,
}

impl PathTranslator {
    pub fn new(mappings: &[PathMapping]) -> Self {
        Self {
            mappings: mappings
                .iter()
                .map(|m| {
                    (
                        strip_trailing_slash(normalize_path(&m.client)),
                        strip_trailing_slash(normalize_path(&m.debuggee)),
                    )
                })
                .collect(),
        }
    }

    pub fn to_debuggee(&self, client_path: &str) -> String {
        let path = normalize_path(client_path);
        for (client, debuggee) in &self.mappings {
            if has_prefix(&path, client) {
                return join_prefix(debuggee, &path[client.len()..]);
            }
        }
        path
    }

    pub fn to_client(&self, debuggee_path: &str) -> String {
        let path = normalize_path(debuggee_path);
        for (client, debuggee) in &self.mappings {
            if has_prefix(&path, debuggee) {
                return join_prefix(client, &path[debuggee.len()..]);
            }
        }
        path
    }
}

/// Session-wide frame filters: project roots, do-not-trace and path mapping.
#[derive(Debug, Clone)]
pub struct Filters {
    pub roots: ProjectRoots,
    pub translator: PathTranslator,
    dont_trace_enabled: bool,
    dont_trace_files: HashSet<String>,
}

impl Filters {
    pub fn from_config(config: &EngineConfig) -> Self {
        let translator = PathTranslator::new(&config.path_mappings);
        let dont_trace_files = config
            .dont_trace_files
            .iter()
            .map(|f| translator.to_debuggee(f))
            .collect();
        Self {
            roots: ProjectRoots::new(&config.project_roots),
            translator,
            dont_trace_enabled: config.dont_trace_enabled,
            dont_trace_files,
        }
    }

    pub fn is_dont_trace(&self, frame: &FrameInfo) -> bool {
        self.dont_trace_enabled
            && (frame.dont_trace || self.dont_trace_files.contains(&normalize_path(&frame.file)))
    }

    pub fn is_user_code(&self, frame: &FrameInfo) -> bool {
        self.roots.is_user_code(&frame.file)
    }

    pub fn set_dont_trace_enabled(&mut self, enabled: bool) {
        self.dont_trace_enabled = enabled;
    }

    pub fn set_dont_trace_files(&mut self, files: &[String]) {
        self.dont_trace_files = files.iter().map(|f| self.translator.to_debuggee(f)).collect();
    }

    pub fn set_project_roots(&mut self, roots: &[String]) {
        let translated: Vec<String> = roots.iter().map(|r| self.translator.to_debuggee(r)).collect();
        self.roots = ProjectRoots::new(&translated);
    }
}

impl Default for Filters {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_roots_accept_everything() {
        assert!(ProjectRoots::default().is_user_code("/usr/lib/anything"));
    }

    #[test]
    fn test_roots_match_on_directory_boundary() {
        let roots = ProjectRoots::new(&["/work/app/"]);
        assert!(roots.is_user_code("/work/app/main.trace"));
        assert!(roots.is_user_code("\\work\\app\\sub\\x.trace"));
        assert!(!roots.is_user_code("/work/application/x.trace"));
        assert!(!roots.is_user_code("/usr/lib/x.trace"));
    }

    #[test]
    fn test_path_translation_both_ways() {
        let translator = PathTranslator::new(&[PathMapping {
            client: "C:\\src".into(),
            debuggee: "/srv/src".into(),
        }]);
        assert_eq!(translator.to_debuggee("C:\\src\\app.trace"), "/srv/src/app.trace");
        assert_eq!(translator.to_client("/srv/src/app.trace"), "C:/src/app.trace");
        assert_eq!(translator.to_client("/other/x"), "/other/x");
    }

    #[test]
    fn test_root_mapping_keeps_one_separator() {
        let translator = PathTranslator::new(&[PathMapping {
            client: "/".into(),
            debuggee: "/srv".into(),
        }]);
        assert_eq!(translator.to_debuggee("/a"), "/srv/a");
        assert_eq!(translator.to_client("/srv/a"), "/a");
        assert_eq!(translator.to_client("/srv"), "/");

        let reversed = PathTranslator::new(&[PathMapping {
            client: "/srv".into(),
            debuggee: "/".into(),
        }]);
        assert_eq!(reversed.to_debuggee("/srv/a"), "/a");
        assert_eq!(reversed.to_client("/a"), "/srv/a");
    }

    #[test]
    fn test_dont_trace_toggle_and_files() {
        let mut filters = Filters::default();
        let marked = FrameInfo::new("helper", "/lib/util.trace", 3).with_dont_trace(true);
        let listed = FrameInfo::new("f", "/lib/vendored.trace", 1);
        assert!(filters.is_dont_trace(&marked));
        assert!(!filters.is_dont_trace(&listed));

        filters.set_dont_trace_files(&["/lib/vendored.trace".to_string()]);
        assert!(filters.is_dont_trace(&listed));

        filters.set_dont_trace_enabled(false);
        assert!(!filters.is_dont_trace(&marked));
        assert!(!filters.is_dont_trace(&listed));
    }
}
