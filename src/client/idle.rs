//! Idle timers that fail an exchange, or a whole HTTP/2 connection, after
//! a period without I/O progress.
//!
//! An [`IdleMonitor`] governs one scope: an HTTP/1.1 connection, a single
//! HTTP/2 stream, or an HTTP/2 connection. Clones of its [`MonitorHandle`]
//! are handed to the IO wrapper that reports progress and to the phase
//! tracker that arms it. The countdown itself runs on a background task.
//!
//! Expiry is a two-step handshake. The timer task calls its target with the
//! generation it was armed for, and the target confirms under its own lock
//! via [`MonitorHandle::confirm`]. A phase advance that re-armed the monitor
//! in the meantime bumped the generation, so exactly one of the two wins.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use super::phase::Phase;

/// What an armed monitor is watching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Watch {
    /// An exchange in the given phase.
    Phase(Phase),
    /// An HTTP/2 connection with open streams.
    Connection,
}

/// The object a monitor fails when it expires.
pub(crate) trait Expire: Send + Sync {
    /// Called from the timer task, outside the monitor's lock.
    ///
    /// Implementations must call [`MonitorHandle::confirm`] under their own
    /// lock before acting on the expiry.
    fn expire(&self, watch: Watch, generation: u64);
}

/// Owns the background timer of one governed scope.
///
/// Dropping it stops the timer task.
pub(crate) struct IdleMonitor {
    handle: MonitorHandle,
}

/// A shared reference to an idle monitor.
#[derive(Clone)]
pub(crate) struct MonitorHandle {
    shared: Arc<Shared>,
}

struct Shared {
    timeout: Duration,
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    target: Option<Weak<dyn Expire>>,
    armed: Option<Watch>,
    last_progress: Instant,
    generation: u64,
    fired: bool,
    closed: bool,
}

impl IdleMonitor {
    /// Creates a disarmed monitor and spawns its timer task.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(timeout: Duration) -> IdleMonitor {
        let shared = Arc::new(Shared {
            timeout,
            state: Mutex::new(State {
                target: None,
                armed: None,
                last_progress: Instant::now(),
                generation: 0,
                fired: false,
                closed: false,
            }),
            notify: Notify::new(),
        });
        tokio::spawn(run(shared.clone()));
        IdleMonitor {
            handle: MonitorHandle { shared },
        }
    }

    pub(crate) fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.handle.shared.state.lock().closed = true;
        self.handle.shared.notify.notify_one();
    }
}

impl fmt::Debug for IdleMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.handle.fmt(f)
    }
}

impl MonitorHandle {
    /// Points the monitor at a new target.
    ///
    /// This is the only way to reuse a fired monitor: the fired flag is
    /// cleared and the monitor starts disarmed.
    pub(crate) fn attach(&self, target: Weak<dyn Expire>) {
        let mut state = self.shared.state.lock();
        state.target = Some(target);
        state.armed = None;
        state.fired = false;
        state.generation += 1;
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Starts a fresh countdown watching `watch`.
    ///
    /// Returns the generation of the countdown, or `None` if the monitor
    /// already fired or was closed.
    pub(crate) fn arm(&self, watch: Watch) -> Option<u64> {
        let mut state = self.shared.state.lock();
        if state.fired || state.closed {
            return None;
        }
        state.generation += 1;
        state.armed = Some(watch);
        state.last_progress = Instant::now();
        let generation = state.generation;
        drop(state);
        trace!("idle monitor armed for {:?}", watch);
        self.shared.notify.notify_one();
        Some(generation)
    }

    pub(crate) fn disarm(&self) {
        let mut state = self.shared.state.lock();
        if state.armed.take().is_some() {
            state.generation += 1;
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Records I/O progress, restarting the idle countdown.
    pub(crate) fn touch(&self) {
        let mut state = self.shared.state.lock();
        if !state.fired {
            state.last_progress = Instant::now();
        }
    }

    /// Confirms an expiry the timer task reported for `generation`.
    ///
    /// Succeeds only if the monitor was not re-armed or disarmed since and
    /// no progress was recorded within the timeout. A confirmed monitor is
    /// fired: it ignores arms and touches until re-attached.
    pub(crate) fn confirm(&self, generation: u64) -> bool {
        let mut state = self.shared.state.lock();
        if state.fired || state.closed || state.armed.is_none() || state.generation != generation
        {
            return false;
        }
        if Instant::now() < state.last_progress + self.shared.timeout {
            return false;
        }
        state.fired = true;
        state.armed = None;
        true
    }

    #[cfg(test)]
    pub(crate) fn armed(&self) -> Option<Watch> {
        self.shared.state.lock().armed
    }

    #[cfg(test)]
    pub(crate) fn is_fired(&self) -> bool {
        self.shared.state.lock().fired
    }
}

impl fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("IdleMonitor")
            .field("timeout", &self.shared.timeout)
            .field("armed", &state.armed)
            .field("fired", &state.fired)
            .finish()
    }
}

enum Next {
    Park,
    Sleep {
        watch: Watch,
        generation: u64,
        deadline: Instant,
    },
    Exit,
}

async fn run(shared: Arc<Shared>) {
    loop {
        let next = {
            let state = shared.state.lock();
            if state.closed {
                Next::Exit
            } else {
                match state.armed {
                    Some(watch) if !state.fired => Next::Sleep {
                        watch,
                        generation: state.generation,
                        deadline: state.last_progress + shared.timeout,
                    },
                    _ => Next::Park,
                }
            }
        };

        match next {
            Next::Exit => break,
            Next::Park => shared.notify.notified().await,
            Next::Sleep {
                watch,
                generation,
                deadline,
            } => {
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = sleep_until(deadline) => expire(&shared, watch, generation),
                }
            }
        }
    }
    trace!("idle monitor task finished");
}

fn expire(shared: &Shared, watch: Watch, generation: u64) {
    let target = {
        let state = shared.state.lock();
        if state.closed || state.fired || state.generation != generation {
            return;
        }
        if Instant::now() < state.last_progress + shared.timeout {
            // progress moved the deadline; the loop sleeps again
            return;
        }
        state.target.as_ref().and_then(Weak::upgrade)
    };

    match target {
        Some(target) => {
            debug!("idle timeout elapsed for {:?}", watch);
            target.expire(watch, generation);
        }
        None => trace!("idle timeout elapsed without a target"),
    }

    // An unconfirmed expiry leaves nothing to watch for this generation.
    let mut state = shared.state.lock();
    if !state.fired && state.generation == generation {
        state.armed = None;
    }
}
