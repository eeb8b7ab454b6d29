use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Function name reported for statements outside any function.
pub const MODULE_FUNCTION: &str = "<module>";

const INDEX_BITS: u32 = 16;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// Lexical position of one line: the chain of block ids enclosing it,
/// outermost first. The function body itself is the empty chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineScope {
    pub line: u32,
    pub scope: Vec<u32>,
}

/// Line table of one function, used for jump validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionLayout {
    pub lines: Vec<LineScope>,
}

impl FunctionLayout {
    pub fn scope_of(&self, line: u32) -> Option<&[u32]> {
        self.lines
            .iter()
            .find(|entry| entry.line == line)
            .map(|entry| entry.scope.as_slice())
    }
}

/// One entry of a frame chain as reported by the instrumentation source.
/// Index 0 of a chain is the innermost frame.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub function: String,
    pub file: String,
    pub line: u32,
    /// Frame belongs to code marked do-not-trace.
    pub dont_trace: bool,
    pub layout: Option<Arc<FunctionLayout>>,
}

impl FrameInfo {
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            function: function.into(),
            file: file.into(),
            line,
            dont_trace: false,
            layout: None,
        }
    }

    pub fn with_layout(mut self, layout: Arc<FunctionLayout>) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn with_dont_trace(mut self, dont_trace: bool) -> Self {
        self.dont_trace = dont_trace;
        self
    }

    pub fn is_module_level(&self) -> bool {
        self.function == MODULE_FUNCTION
    }
}

/// Opaque frame reference handed to the controller.
///
/// Packs the owning thread's generation with the depth index, so a handle
/// captured before a resume no longer resolves afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameHandle(pub u64);

impl FrameHandle {
    pub fn new(generation: u64, index: usize) -> Self {
        FrameHandle((generation << INDEX_BITS) | (index as u64 & INDEX_MASK))
    }

    pub fn generation(&self) -> u64 {
        self.0 >> INDEX_BITS
    }

    pub fn index(&self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }
}

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.generation(), self.index())
    }
}

/// Wire form of a frame in stop events and stack replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameView {
    pub id: FrameHandle,
    pub name: String,
    pub file: String,
    pub line: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_packing() {
        let handle = FrameHandle::new(7, 3);
        assert_eq!(handle.generation(), 7);
        assert_eq!(handle.index(), 3);
        assert_ne!(handle, FrameHandle::new(8, 3));
    }

    #[test]
    fn test_layout_scope_lookup() {
        let layout = FunctionLayout {
            lines: vec![
                LineScope { line: 4, scope: vec![] },
                LineScope { line: 5, scope: vec![1] },
            ],
        };
        assert_eq!(layout.scope_of(5), Some(&[1u32][..]));
        assert_eq!(layout.scope_of(9), None);
    }
}
