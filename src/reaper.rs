//! Reclaims terminated worker processes.
//!
//! A dedicated thread waits on worker exits with `waitpid(-1)` and removes
//! them from its tracking set, so the accept loop never blocks on a child and
//! no reclamation runs in signal context. The thread only calls `waitpid`
//! while it tracks at least one worker; otherwise it sleeps on the channel.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How long a pid reaped ahead of its `track` message is remembered. The
/// listener tracks a worker right after spawning it, so a pid still unclaimed
/// after this long was never a tracked worker.
const EARLY_TTL: Duration = Duration::from_secs(5);

/// Handle used by the listener to hand workers to the reaper thread.
#[derive(Debug, Clone)]
pub struct Reaper {
    tx: Sender<u32>,
    live: Arc<AtomicUsize>,
}

impl Reaper {
    /// Start the reaper thread. It runs for the life of the process.
    pub fn install() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let live = Arc::new(AtomicUsize::new(0));

        let state = ReapState {
            rx,
            live: Arc::clone(&live),
            tracked: HashSet::new(),
            early: HashMap::new(),
        };

        thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || state.run())?;

        Ok(Reaper { tx, live })
    }

    /// Track a freshly spawned worker process.
    pub fn track(&self, pid: u32) {
        // Counted here so `live` never under-reports a worker that is
        // still in the channel.
        self.live.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(pid).is_err() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            error!(pid, "Reaper thread is gone, worker will not be reclaimed");
        }
    }

    /// Workers spawned but not yet reclaimed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

struct ReapState {
    rx: Receiver<u32>,
    live: Arc<AtomicUsize>,
    /// Pids handed over and not yet reaped.
    tracked: HashSet<u32>,
    /// Pids reaped before their `track` message arrived, with reap time.
    early: HashMap<u32, Instant>,
}

impl ReapState {
    fn run(mut self) {
        loop {
            if self.tracked.is_empty() {
                match self.rx.recv() {
                    Ok(pid) => self.admit(pid),
                    // Every sender dropped: nothing left to reap.
                    Err(_) => return,
                }
            }
            while let Ok(pid) = self.rx.try_recv() {
                self.admit(pid);
            }
            if self.tracked.is_empty() {
                continue;
            }

            match wait_any(0) {
                Ok(Some(pid)) => {
                    self.reclaim(pid);
                    // Drain everything else that already exited.
                    loop {
                        match wait_any(libc::WNOHANG) {
                            Ok(Some(pid)) => self.reclaim(pid),
                            Ok(None) => break,
                            Err(e) => {
                                self.on_wait_error(e);
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => self.on_wait_error(e),
            }
        }
    }

    fn admit(&mut self, pid: u32) {
        self.expire_early(Instant::now());
        if self.early.remove(&pid).is_some() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            debug!(pid, "Worker reclaimed");
        } else {
            self.tracked.insert(pid);
        }
    }

    fn reclaim(&mut self, pid: u32) {
        if self.tracked.remove(&pid) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            debug!(pid, live = self.tracked.len(), "Worker reclaimed");
        } else {
            let now = Instant::now();
            self.expire_early(now);
            self.early.insert(pid, now);
        }
    }

    /// Forget early reaps too old to belong to a pending `track`, so a
    /// reused pid is not mistaken for an already reclaimed worker.
    fn expire_early(&mut self, now: Instant) {
        self.early
            .retain(|_, reaped_at| now.saturating_duration_since(*reaped_at) < EARLY_TTL);
    }

    fn on_wait_error(&mut self, e: io::Error) {
        if e.raw_os_error() == Some(libc::ECHILD) {
            // No children at all; anything still tracked is already gone.
            if !self.tracked.is_empty() {
                warn!(count = self.tracked.len(), "Tracked workers vanished");
                self.live.fetch_sub(self.tracked.len(), Ordering::SeqCst);
                self.tracked.clear();
            }
        } else {
            error!(error = %e, "waitpid failed");
        }
    }
}

/// Wait for any child. `Ok(None)` when `WNOHANG` finds nothing to reap.
fn wait_any(flags: libc::c_int) -> io::Result<Option<u32>> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid pointer for the duration of the call.
        let pid = unsafe { libc::waitpid(-1, &mut status, flags) };
        if pid > 0 {
            return Ok(Some(pid as u32));
        }
        if pid == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
