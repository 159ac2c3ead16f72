//! Listener and dispatcher.
//!
//! Binds the listening socket, accepts connections in a single synchronous
//! loop and hands each one to a freshly created worker. The listener never
//! performs connection I/O itself, except for the `SERVER_BUSY` notice when
//! no worker could be created.

use crate::config::{Config, Isolation};
use crate::logging::Logger;
use crate::protocol;
use crate::reaper::Reaper;
use crate::worker::{ProcessSpawner, SpawnError, Spawner, ThreadSpawner, Worker};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a refused client gets to finish sending before the socket closes.
const BUSY_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Most request bytes discarded while draining a refused client.
const BUSY_DRAIN_LIMIT: usize = 4096;

/// Fatal startup errors.
#[derive(Debug)]
pub enum ServerError {
    /// The listen address did not resolve.
    Address(String, io::Error),
    /// Socket creation or option setting failed.
    Socket(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(io::Error),
    /// The reaper thread could not be started.
    Reaper(io::Error),
    /// Worker settings could not be prepared.
    Worker(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Address(addr, e) => write!(f, "Invalid listen address '{addr}': {e}"),
            ServerError::Socket(e) => write!(f, "Failed to create socket: {e}"),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
            ServerError::Listen(e) => write!(f, "Failed to listen: {e}"),
            ServerError::Reaper(e) => write!(f, "Failed to install worker reaper: {e}"),
            ServerError::Worker(e) => write!(f, "Failed to prepare workers: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Server instance
pub struct Server {
    listener: TcpListener,
    spawner: Box<dyn Spawner>,
    reaper: Reaper,
    busy_backoff: Duration,
}

impl Server {
    /// Bind the listening socket, install the reaper and prepare the spawner
    /// selected by `config.isolation`.
    pub fn bind(config: &Config, logger: Logger) -> Result<Self, ServerError> {
        let spawner: Box<dyn Spawner> = match config.isolation {
            Isolation::Process => {
                let settings = config
                    .worker
                    .to_settings()
                    .map_err(|e| ServerError::Worker(Box::new(e)))?;
                let spawner = ProcessSpawner::current_exe(settings, logger.level())
                    .map_err(|e| ServerError::Worker(Box::new(e)))?;
                Box::new(spawner)
            }
            Isolation::Thread => Box::new(ThreadSpawner::new(config.worker.clone())),
        };

        Self::with_spawner(config, spawner)
    }

    /// Like [`Server::bind`] with a caller-provided spawner.
    pub fn with_spawner(config: &Config, spawner: Box<dyn Spawner>) -> Result<Self, ServerError> {
        let listen = config.listen_addr();
        let addr = listen
            .to_socket_addrs()
            .map_err(|e| ServerError::Address(listen.clone(), e))?
            .next()
            .ok_or_else(|| {
                ServerError::Address(
                    listen.clone(),
                    io::Error::new(io::ErrorKind::NotFound, "no addresses"),
                )
            })?;

        let listener = create_listener(addr, config.backlog)?;

        // No connection is accepted before reclamation is in place.
        let reaper = Reaper::install().map_err(ServerError::Reaper)?;

        Ok(Server {
            listener,
            spawner,
            reaper,
            busy_backoff: Duration::from_millis(config.busy_backoff_ms),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the reaper, for observing unreclaimed workers.
    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Accept connections forever.
    pub fn run(mut self) -> ! {
        if let Ok(addr) = self.local_addr() {
            info!(address = %addr, "Server listening");
        }

        loop {
            let (conn, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer, "New connection");

            match self.spawner.spawn(conn) {
                Ok(Worker::Process { pid }) => {
                    self.reaper.track(pid);
                    debug!(peer = %peer, pid, live = self.reaper.live(), "Dispatched to worker process");
                }
                Ok(Worker::Thread) => {
                    debug!(peer = %peer, "Dispatched to worker thread");
                }
                Err(SpawnError { mut conn, source }) => {
                    info!(peer = %peer, error = %source, "Cannot create worker, sending SERVER_BUSY");
                    if let Err(e) = refuse(&mut conn) {
                        debug!(peer = %peer, error = %e, "Failed to send SERVER_BUSY");
                    }
                    drop(conn);
                    thread::sleep(self.busy_backoff);
                }
            }
        }
    }
}

/// Send `SERVER_BUSY` and close gracefully.
///
/// The unread request is drained first: closing a socket with unread data
/// sends a reset, which can discard the notice before the client reads it.
fn refuse(conn: &mut TcpStream) -> io::Result<()> {
    conn.write_all(protocol::SERVER_BUSY)?;
    conn.shutdown(Shutdown::Write)?;
    conn.set_read_timeout(Some(BUSY_DRAIN_TIMEOUT))?;

    let mut scratch = [0u8; 512];
    let mut drained = 0;
    while drained < BUSY_DRAIN_LIMIT {
        match conn.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => drained += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    Ok(())
}

fn create_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, ServerError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(ServerError::Socket)?;

    socket.set_reuse_address(true).map_err(ServerError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Bind(addr, e))?;
    socket.listen(backlog).map_err(ServerError::Listen)?;

    Ok(socket.into())
}
