//! Error types for the debug session engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed or out-of-sequence command
    ///
    /// Use for: resume/step on a thread that is not suspended, duplicate
    /// resumes, unknown commands, invalid jump targets. Reported back to the
    /// controller with the offending sequence id; the session continues.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Expression or variable evaluation raised inside debuggee code
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Requested file, thread, frame or breakpoint no longer exists
    ///
    /// Also returned for frame handles captured before the owning thread was
    /// resumed (stale generation).
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// The instrumentation source failed to deliver expected events
    #[error("Instrumentation fault: {0}")]
    Instrumentation(String),

    /// JSON parsing and deserialization failures
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Socket and stream failures
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Short tag sent to the controller alongside the message text.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "protocol",
            Error::Evaluation(_) => "evaluation",
            Error::TargetNotFound(_) => "target_not_found",
            Error::Instrumentation(_) => "instrumentation",
            Error::InvalidMessage(_) => "invalid_message",
            Error::Transport(_) => "transport",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidMessage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::TargetNotFound(err.to_string()),
            _ => Error::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Protocol("thread 3 is not suspended".to_string());
        assert_eq!(err.to_string(), "Protocol error: thread 3 is not suspended");
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json");
        let err: Error = json_err.unwrap_err().into();
        match err {
            Error::InvalidMessage(_) => (),
            _ => panic!("Expected InvalidMessage error"),
        }
    }

    #[test]
    fn test_missing_file_maps_to_target_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert_eq!(Error::from(io).kind(), "target_not_found");
    }
}
