//! Worker creation.
//!
//! A [`Spawner`] turns an accepted connection into an isolated worker running
//! [`ConnectionHandler`]. Two isolation units are provided:
//!
//! - [`ProcessSpawner`]: re-executes the server binary in worker mode with the
//!   connection as its standard input. Workers share nothing with the
//!   listener and a crash only loses that one connection.
//! - [`ThreadSpawner`]: a dedicated thread per connection. Workers still share
//!   no mutable state, but they live in the listener's address space.
//!
//! If creation fails the connection is handed back so the listener can tell
//! the client it is busy.

use crate::config::WorkerConfig;
use crate::handler::{ConnectionHandler, HandlerError};
use crate::logging::LogLevel;
use std::fmt;
use std::io;
use std::net::TcpStream;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, error};

/// A worker that was created for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    /// Separate process; must be reclaimed by the reaper.
    Process { pid: u32 },
    /// Detached thread; cleans up after itself.
    Thread,
}

/// Worker creation failed. Carries the connection back to the caller.
#[derive(Debug)]
pub struct SpawnError {
    pub conn: TcpStream,
    pub source: io::Error,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to create worker: {}", self.source)
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Creates one isolated worker per connection.
pub trait Spawner: Send {
    /// Hand `conn` to a new worker. On success the caller must not touch the
    /// connection again.
    fn spawn(&mut self, conn: TcpStream) -> Result<Worker, SpawnError>;
}

/// Spawns a worker process per connection.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    settings: String,
    log_level: LogLevel,
}

impl ProcessSpawner {
    /// Workers are started from `program`, which must accept `--worker`.
    pub fn new(program: PathBuf, settings: String, log_level: LogLevel) -> Self {
        Self {
            program,
            settings,
            log_level,
        }
    }

    /// Workers are started from the currently running executable.
    pub fn current_exe(settings: String, log_level: LogLevel) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, settings, log_level))
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&mut self, conn: TcpStream) -> Result<Worker, SpawnError> {
        // The child gets its own descriptor; ours is dropped by the caller
        // without shutting the stream down.
        let child_end = match conn.try_clone() {
            Ok(stream) => OwnedFd::from(stream),
            Err(source) => return Err(SpawnError { conn, source }),
        };

        let spawned = Command::new(&self.program)
            .arg("--log-level")
            .arg(self.log_level.to_string())
            .arg("--worker")
            .arg(&self.settings)
            .stdin(Stdio::from(child_end))
            .spawn();

        match spawned {
            Ok(child) => {
                let pid = child.id();
                debug!(pid, "Worker process started");
                Ok(Worker::Process { pid })
            }
            Err(source) => Err(SpawnError { conn, source }),
        }
    }
}

/// Spawns a worker thread per connection.
#[derive(Debug)]
pub struct ThreadSpawner {
    handler: ConnectionHandler,
    next_id: u64,
}

impl ThreadSpawner {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            handler: ConnectionHandler::new(config),
            next_id: 0,
        }
    }
}

impl Spawner for ThreadSpawner {
    fn spawn(&mut self, conn: TcpStream) -> Result<Worker, SpawnError> {
        let worker_end = match conn.try_clone() {
            Ok(stream) => stream,
            Err(source) => return Err(SpawnError { conn, source }),
        };

        let id = self.next_id;
        self.next_id += 1;
        let handler = self.handler.clone();

        thread::Builder::new()
            .name(format!("conn-{id}"))
            .spawn(move || {
                if let Err(e) = handler.handle(worker_end) {
                    error!(worker = id, error = %e, "Worker failed");
                }
            })
            .map(|_| Worker::Thread)
            .map_err(|source| SpawnError { conn, source })
    }
}

/// Entry point of a worker process: serve the connection on descriptor 0.
///
/// The caller reports a returned error and exits with a failure status.
pub fn run_process_worker(config: WorkerConfig) -> Result<(), HandlerError> {
    // SAFETY: a worker process is started with the connection as stdin and
    // nothing else in the process uses descriptor 0, so the stream becomes
    // its sole owner and closes it when dropped.
    let stream = TcpStream::from(unsafe { OwnedFd::from_raw_fd(libc::STDIN_FILENO) });

    if let Ok(peer) = stream.peer_addr() {
        debug!(peer = %peer, pid = std::process::id(), "Worker serving connection");
    }

    ConnectionHandler::new(config).handle(stream)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_thread_spawner_serves_connection() {
        let config = WorkerConfig {
            command: "echo".to_string(),
            args: vec!["threaded".to_string()],
            ..WorkerConfig::default()
        };
        let mut spawner = ThreadSpawner::new(config);
        let (mut client, server) = connected_pair();

        assert_eq!(spawner.spawn(server).unwrap(), Worker::Thread);

        client.write_all(b"GET_SYS_INFO\n").unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"threaded\n");
    }

    #[test]
    fn test_process_spawn_failure_returns_connection() {
        let mut spawner = ProcessSpawner::new(
            PathBuf::from("/nonexistent/remote-uptime-server"),
            String::new(),
            LogLevel::Info,
        );
        let (mut client, server) = connected_pair();

        let err = spawner.spawn(server).unwrap_err();
        assert_eq!(err.source.kind(), io::ErrorKind::NotFound);

        // The returned connection is still usable.
        let mut conn = err.conn;
        conn.write_all(b"ok\n").unwrap();
        drop(conn);
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"ok\n");
    }
}
