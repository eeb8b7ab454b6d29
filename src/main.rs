//! Run a trace script under the debug session engine.
//!
//! Usage: `trace-debugger <SCRIPT> [--connect ADDR | --listen ADDR] [--config FILE]
//! [--project-root DIR]... [--stop-on-start] [--no-wait]`

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{error, info};

use trace_debugger::config::EngineConfig;
use trace_debugger::dap::{connect, fork_over_tcp, Connection, Endpoint, SessionHub};
use trace_debugger::executor::Runtime;
use trace_debugger::parser::{parse_program, Program};
use trace_debugger::Result;

#[derive(Parser, Debug)]
#[command(name = "trace-debugger")]
#[command(about = "Debug a trace script from a remote controller")]
struct Args {
    /// Trace script to run
    script: PathBuf,

    /// Dial out to a controller listening on ADDR
    #[arg(long, value_name = "ADDR", conflicts_with = "listen")]
    connect: Option<String>,

    /// Listen on ADDR; each controller that connects gets its own run
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// JSON engine configuration
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding user code (repeatable)
    #[arg(long = "project-root", value_name = "DIR")]
    project_roots: Vec<String>,

    /// Suspend at the first line of user code
    #[arg(long)]
    stop_on_start: bool,

    /// Start running without waiting for the controller's `run`
    #[arg(long)]
    no_wait: bool,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig> {
        let config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        let mut config = config.apply_env()?;
        if !self.project_roots.is_empty() {
            config.project_roots = self.project_roots.clone();
        }
        if self.stop_on_start {
            config.stop_on_start = true;
        }
        Ok(config)
    }
}

fn load_program(path: &Path) -> Result<Program> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let source = std::fs::read_to_string(&path)?;
    let program = parse_program(&path.to_string_lossy(), &source)?;
    info!(script = %path.display(), functions = program.functions.len(), "Loaded script");
    Ok(program)
}

/// Run the script on one connection and report its exit code.
fn run_session(connection: Connection, program: Arc<Program>, fork_addr: Option<String>, wait: bool) -> i32 {
    let session = Arc::clone(connection.session());
    if wait {
        session.wait_for_run();
    }

    let mut runtime = Runtime::new(Arc::clone(&program), session.clone());
    if let Some(addr) = fork_addr {
        runtime = runtime.with_fork(fork_over_tcp(addr, session.config().clone(), program));
    }
    let code = Arc::new(runtime).run_main();
    connection.finish(code);
    code
}

fn run(args: Args) -> Result<i32> {
    let mut config = args.engine_config()?;
    let program = Arc::new(load_program(&args.script)?);
    let wait = !args.no_wait;

    match Endpoint::from_flags(args.connect, args.listen) {
        Endpoint::Stdio => {
            // stdout carries the protocol; debuggee output goes through it too.
            config.echo_output = false;
            let connection = Connection::stdio(config)?;
            connection.session().start_redirect();
            Ok(run_session(connection, program, None, wait))
        }
        Endpoint::Connect(addr) => {
            config.echo_output = true;
            let connection = connect(&addr, config)?;
            Ok(run_session(connection, program, Some(addr), wait))
        }
        Endpoint::Listen(addr) => {
            config.echo_output = true;
            let hub = SessionHub::bind(&addr)?;
            info!(addr = %hub.local_addr()?, "Waiting for controllers");
            hub.serve(&config, move |connection| {
                let code = run_session(connection, Arc::clone(&program), None, wait);
                info!(code, "Session finished");
            })?;
            Ok(0)
        }
    }
}

fn main() {
    trace_debugger::init_logging();
    let args = Args::parse();

    match run(args) {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("{}", err);
            process::exit(2);
        }
    }
}
