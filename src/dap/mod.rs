mod protocol;
mod server;
mod transport;

pub use protocol::{args, DapMessage, DapMessageContent};
pub use server::DapServer;
pub use transport::{connect, fork_over_tcp, Endpoint, SessionHub};

use crate::config::EngineConfig;
use crate::debugger::{Outbound, OutputStream, Reporter, SequenceAllocator, Session};
use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

const CONTENT_LENGTH: &str = "Content-Length:";

/// Largest body accepted from the controller.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Read one framed message. `Ok(None)` at a clean end of stream.
///
/// A frame with a bad or oversized length is consumed up to its body and
/// reported as `InvalidMessage`, so the next call starts on a fresh frame.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<DapMessage>> {
    let mut content_length: Option<usize> = None;
    let mut bad_header: Option<String> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            if saw_header {
                return Err(Error::Transport("stream closed inside a message header".into()));
            }
            return Ok(None);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;
        // The header may follow leftovers of a frame whose length was unusable.
        if let Some(at) = line.find(CONTENT_LENGTH) {
            let value = line[at + CONTENT_LENGTH.len()..].trim();
            match value.parse() {
                Ok(length) => content_length = Some(length),
                Err(_) => bad_header = Some(format!("bad content length '{}'", value)),
            }
        }
    }

    if let Some(message) = bad_header {
        return Err(Error::InvalidMessage(message));
    }
    let length = content_length.ok_or_else(|| Error::InvalidMessage("missing Content-Length header".into()))?;
    if length > MAX_MESSAGE_LEN {
        io::copy(&mut reader.by_ref().take(length as u64), &mut io::sink())?;
        return Err(Error::InvalidMessage(format!(
            "message of {} bytes exceeds the {} byte limit",
            length, MAX_MESSAGE_LEN
        )));
    }
    let mut buffer = vec![0u8; length];
    reader.read_exact(&mut buffer)?;
    Ok(Some(serde_json::from_slice(&buffer)?))
}

pub fn write_message<W: Write>(writer: &mut W, msg: &DapMessage) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    write!(writer, "{} {}\r\n\r\n{}", CONTENT_LENGTH, json.len(), json)?;
    writer.flush()?;
    Ok(())
}

fn event(seq: u64, event: &str, body: Value) -> DapMessage {
    DapMessage {
        seq,
        msg_type: "event".to_string(),
        content: DapMessageContent::Event {
            event: event.to_string(),
            body: Some(body),
        },
    }
}

/// Wire form of an outbound message.
pub fn to_message(outbound: Outbound, seq: u64) -> Result<DapMessage> {
    let msg = match outbound {
        Outbound::ThreadCreated { thread_id, name } => event(
            seq,
            "thread",
            json!({ "reason": "started", "threadId": thread_id, "name": name }),
        ),
        Outbound::ThreadKilled { thread_id } => {
            event(seq, "thread", json!({ "reason": "exited", "threadId": thread_id }))
        }
        Outbound::Stopped(stop) => event(seq, "stopped", serde_json::to_value(stop)?),
        Outbound::Output { stream, text } => {
            let category = match stream {
                OutputStream::Stdout => "stdout",
                OutputStream::Stderr => "stderr",
                OutputStream::Console => "console",
            };
            event(seq, "output", json!({ "category": category, "output": text }))
        }
        Outbound::ProcessCreated { name, pid } => {
            event(seq, "process", json!({ "name": name, "systemProcessId": pid }))
        }
        Outbound::Exited { code } => event(seq, "exited", json!({ "exitCode": code })),
        Outbound::Response {
            request_seq,
            command,
            result,
        } => {
            let (success, message, body) = match result {
                Ok(body) => (true, None, body),
                Err(err) => (false, Some(err.to_string()), Some(json!({ "kind": err.kind() }))),
            };
            DapMessage {
                seq,
                msg_type: "response".to_string(),
                content: DapMessageContent::Response {
                    request_seq,
                    success,
                    command,
                    message,
                    body,
                },
            }
        }
    };
    Ok(msg)
}

fn writer_loop<W: Write>(rx: Receiver<Outbound>, mut writer: W) {
    let seq = SequenceAllocator::default();
    for outbound in rx {
        let last = matches!(outbound, Outbound::Exited { .. });
        let result = to_message(outbound, seq.next()).and_then(|msg| write_message(&mut writer, &msg));
        if let Err(err) = result {
            warn!(error = %err, "Could not write to controller");
            break;
        }
        if last {
            break;
        }
    }
    debug!("Writer finished");
}

fn reader_loop<R: BufRead>(server: DapServer, mut reader: R) {
    loop {
        match read_message(&mut reader) {
            Ok(Some(msg)) => {
                if !server.handle_message(msg) {
                    break;
                }
            }
            Ok(None) => {
                info!("Controller closed the connection");
                server.session().detach();
                break;
            }
            Err(Error::InvalidMessage(message)) => {
                warn!(%message, "Skipping malformed message");
            }
            Err(err) => {
                warn!(error = %err, "Lost the controller connection");
                server.session().detach();
                break;
            }
        }
    }
}

/// One controller connection with its session, reader thread and writer
/// thread.
pub struct Connection {
    session: Arc<Session>,
    writer: JoinHandle<()>,
}

impl Connection {
    pub fn open<R, W>(config: EngineConfig, reader: R, writer: W) -> Result<Self>
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let session = Arc::new(Session::new(config, Reporter::new(tx)));

        let writer = thread::Builder::new()
            .name("dap-writer".to_string())
            .spawn(move || writer_loop(rx, writer))?;
        let server = DapServer::new(Arc::clone(&session));
        thread::Builder::new()
            .name("dap-reader".to_string())
            .spawn(move || reader_loop(server, reader))?;

        Ok(Self { session, writer })
    }

    pub fn tcp(config: EngineConfig, stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Self::open(config, reader, stream)
    }

    pub fn stdio(config: EngineConfig) -> Result<Self> {
        Self::open(config, BufReader::new(io::stdin()), io::stdout())
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Report the exit code and wait until everything queued is written.
    pub fn finish(self, code: i32) {
        self.session.reporter().send(Outbound::Exited { code });
        if self.writer.join().is_err() {
            warn!("Writer thread panicked");
        }
    }
}
