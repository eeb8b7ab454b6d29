use super::Connection;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::executor::{ForkHandler, Runtime};
use crate::parser::Program;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Where the controller is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Stdio,
    /// The controller listens; we dial out.
    Connect(String),
    /// We listen; every accepted controller gets its own session.
    Listen(String),
}

impl Endpoint {
    pub fn from_flags(connect: Option<String>, listen: Option<String>) -> Self {
        match (connect, listen) {
            (Some(addr), _) => Endpoint::Connect(addr),
            (None, Some(addr)) => Endpoint::Listen(addr),
            (None, None) => Endpoint::Stdio,
        }
    }
}

pub fn connect(addr: &str, config: EngineConfig) -> Result<Connection> {
    let stream = TcpStream::connect(addr)?;
    info!(%addr, "Connected to controller");
    Connection::tcp(config, stream)
}

/// Accepts controller connections and runs one independent session per
/// connection.
pub struct SessionHub {
    listener: TcpListener,
}

impl SessionHub {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks accepting connections; `start` runs on a thread of its own for
    /// each one.
    pub fn serve<F>(&self, config: &EngineConfig, start: F) -> Result<()>
    where
        F: Fn(Connection) + Clone + Send + 'static,
    {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "Accept failed");
                    continue;
                }
            };
            let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
            let connection = match Connection::tcp(config.clone(), stream) {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(%peer, error = %err, "Could not open session");
                    continue;
                }
            };
            info!(%peer, "Controller attached");
            let start = start.clone();
            thread::Builder::new()
                .name(format!("session-{}", peer))
                .spawn(move || start(connection))?;
        }
        Ok(())
    }
}

/// Forked children dial the controller themselves and appear to it as a new
/// process with its own session.
pub fn fork_over_tcp(addr: String, config: EngineConfig, program: Arc<Program>) -> ForkHandler {
    Arc::new(move |function: &str| -> Result<JoinHandle<()>> {
        let connection = connect(&addr, config.clone())?;
        let child_fork = fork_over_tcp(addr.clone(), config.clone(), Arc::clone(&program));
        let program = Arc::clone(&program);
        let function = function.to_string();

        let handle = thread::Builder::new()
            .name(format!("fork-{}", function))
            .spawn(move || {
                let session = Arc::clone(connection.session());
                session.process_created(&function);
                session.wait_for_run();

                let runtime = Arc::new(Runtime::new(program, session).with_fork(child_fork));
                let code = match runtime.run_function(&function) {
                    Ok(code) => code,
                    Err(err) => {
                        error!(%function, error = %err, "Forked child could not start");
                        1
                    }
                };
                connection.finish(code);
            })?;
        Ok(handle)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_flags() {
        assert_eq!(Endpoint::from_flags(None, None), Endpoint::Stdio);
        assert_eq!(
            Endpoint::from_flags(Some("127.0.0.1:9000".into()), None),
            Endpoint::Connect("127.0.0.1:9000".into())
        );
        assert_eq!(
            Endpoint::from_flags(None, Some("0.0.0.0:9000".into())),
            Endpoint::Listen("0.0.0.0:9000".into())
        );
    }
}
