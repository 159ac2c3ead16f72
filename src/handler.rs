//! Per-connection protocol handler.
//!
//! Runs inside a worker and owns exactly one connection:
//!
//! ```text
//! harden -> read -> dispatch -> write -> close
//!             |                   |
//!             +--(eof/error)------+----> close
//! ```
//!
//! Nothing is retried. Every failure is logged and ends with the connection
//! being dropped.

use crate::config::WorkerConfig;
use crate::protocol::{self, Command};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why the request could not be read.
#[derive(Debug)]
pub enum ReadFailure {
    /// Receive deadline expired before any data arrived.
    Timeout,
    /// Peer reset the connection.
    Reset,
    /// Any other I/O error.
    Io(io::Error),
}

impl ReadFailure {
    /// Classify a failed `read`.
    pub fn classify(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ReadFailure::Timeout,
            io::ErrorKind::ConnectionReset => ReadFailure::Reset,
            _ => ReadFailure::Io(err),
        }
    }
}

impl fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadFailure::Timeout => write!(f, "read timeout"),
            ReadFailure::Reset => write!(f, "connection reset by peer"),
            ReadFailure::Io(e) => write!(f, "read error: {e}"),
        }
    }
}

/// Result of sending a reply.
#[derive(Debug)]
pub enum WriteOutcome {
    /// Every byte was accepted.
    Complete(usize),
    /// Fewer bytes than produced were accepted; the peer likely went away
    /// mid-transfer.
    Partial { written: usize, expected: usize },
    /// Peer had already closed its end.
    BrokenPipe,
    /// Peer reset the connection.
    Reset,
    /// Any other I/O error.
    Failed(io::Error),
    /// There was nothing to send.
    NoOutput,
}

impl WriteOutcome {
    /// Classify the result of a single `write` of `expected` bytes.
    pub fn classify(result: io::Result<usize>, expected: usize) -> Self {
        match result {
            Ok(written) if written >= expected => WriteOutcome::Complete(written),
            Ok(written) => WriteOutcome::Partial { written, expected },
            Err(e) => match e.kind() {
                io::ErrorKind::BrokenPipe => WriteOutcome::BrokenPipe,
                io::ErrorKind::ConnectionReset => WriteOutcome::Reset,
                _ => WriteOutcome::Failed(e),
            },
        }
    }

    fn log(&self) {
        match self {
            WriteOutcome::Complete(bytes) => info!(bytes, "Reply sent"),
            WriteOutcome::Partial { written, expected } => {
                warn!(written, expected, "Partial write, client probably disconnected")
            }
            WriteOutcome::BrokenPipe => warn!("Broken pipe, client disconnected before reply"),
            WriteOutcome::Reset => warn!("Connection reset while sending reply"),
            WriteOutcome::Failed(e) => warn!(error = %e, "Failed to send reply"),
            WriteOutcome::NoOutput => warn!("Command produced no output"),
        }
    }
}

/// How a connection ended.
#[derive(Debug)]
pub enum Exchange {
    /// Peer closed without sending anything.
    PeerClosed,
    /// Request could not be read.
    ReadFailed(ReadFailure),
    /// Request was not recognized; the error line was sent.
    Unknown(WriteOutcome),
    /// Request was served with the command output.
    SysInfo(WriteOutcome),
}

/// Failures that end a worker abnormally.
#[derive(Debug)]
pub enum HandlerError {
    /// The command could not be started.
    Command(String, io::Error),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Command(program, e) => {
                write!(f, "Failed to execute '{program}': {e}")
            }
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::Command(_, e) => Some(e),
        }
    }
}

/// Serves one request on one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    config: WorkerConfig,
}

impl ConnectionHandler {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Serve `stream` and close it.
    ///
    /// The stream is dropped before this returns, on every path. A command
    /// that fails to start is returned, not logged; the caller reports it.
    pub fn handle(&self, mut stream: TcpStream) -> Result<Exchange, HandlerError> {
        if self.config.harden {
            self.harden(&stream);
        }

        let request = match self.read_request(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => {
                info!("Client closed the connection without sending a request");
                return Ok(Exchange::PeerClosed);
            }
            Err(failure) => {
                info!(reason = %failure, "Closing connection");
                return Ok(Exchange::ReadFailed(failure));
            }
        };

        debug!(bytes = request.len(), "Request received");

        match protocol::parse(&request) {
            Command::GetSysInfo => {
                info!("Received GET_SYS_INFO from client");
                let output = self.run_command()?;
                let outcome = send(&mut stream, &output);
                outcome.log();
                Ok(Exchange::SysInfo(outcome))
            }
            Command::Unknown => {
                let text = String::from_utf8_lossy(&request);
                info!(request = %text.escape_debug(), "Unknown command");
                let outcome = send(&mut stream, protocol::UNKNOWN_COMMAND);
                outcome.log();
                Ok(Exchange::Unknown(outcome))
            }
        }
    }

    /// Bound how long a silent or slow peer can hold the worker.
    fn harden(&self, stream: &TcpStream) {
        let timeout = Duration::from_millis(self.config.read_timeout_ms);
        // A zero duration would be rejected; treat it as "no deadline".
        let timeout = (!timeout.is_zero()).then_some(timeout);
        if let Err(e) = stream.set_read_timeout(timeout) {
            warn!(error = %e, "Failed to set receive deadline");
        }
    }

    /// Read one chunk. `Ok(None)` means the peer closed cleanly.
    fn read_request(&self, stream: &mut TcpStream) -> Result<Option<Bytes>, ReadFailure> {
        let mut buf = BytesMut::zeroed(self.config.buffer_size);
        let n = stream.read(&mut buf).map_err(ReadFailure::classify)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }

    /// Run the configured command and capture its stdout.
    fn run_command(&self) -> Result<Bytes, HandlerError> {
        let output = std::process::Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| HandlerError::Command(self.config.command.clone(), e))?;

        if !output.status.success() {
            debug!(command = %self.config.command, status = %output.status, "Command exited unsuccessfully");
        }

        let mut stdout = output.stdout;
        stdout.truncate(self.config.buffer_size);
        Ok(Bytes::from(stdout))
    }
}

/// Send a reply with a single `write` and classify the result.
fn send(stream: &mut TcpStream, reply: &[u8]) -> WriteOutcome {
    if reply.is_empty() {
        return WriteOutcome::NoOutput;
    }
    WriteOutcome::classify(stream.write(reply), reply.len())
}
