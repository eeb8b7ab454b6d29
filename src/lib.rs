//! Remote-controllable debug session engine.
//!
//! The engine receives execution events from an instrumentation source,
//! decides when a thread suspends, and talks to a controller over a
//! Content-Length framed JSON protocol. A small trace-script interpreter
//! serves as the instrumentation source for the binary and the tests.

pub mod config;
pub mod dap;
pub mod debugger;
pub mod error;
pub mod executor;
pub mod parser;

pub use error::{Error, Result};

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "trace_debugger=info";

/// Install the global `tracing` subscriber. Logs go to stderr; `RUST_LOG`
/// overrides the default filter. Later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
