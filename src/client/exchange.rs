use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use super::future::{ResponseFuture, Slot};
use super::idle::{Expire, MonitorHandle, Watch};
use super::phase::{Phase, PhaseTracker, Refused};
use crate::message::Message;
use crate::version::Version;

/// Identifies one exchange sent by a [`Client`](super::Client).
///
/// Ids increase monotonically per client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExchangeId(u64);

impl ExchangeId {
    pub(crate) fn new(id: u64) -> ExchangeId {
        ExchangeId(id)
    }

    /// The numeric value of this id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an exchange is running on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scope {
    Unbound,
    Connection(u64),
    Stream { connection: u64, stream: u32 },
}

/// One request paired with at most one response.
///
/// All phase advancement, idle expiry, cancellation and settlement of an
/// exchange go through its lock, so exactly one terminal event wins.
#[derive(Clone)]
pub(crate) struct Exchange {
    inner: Arc<Inner>,
}

struct Inner {
    id: ExchangeId,
    state: Mutex<State>,
    slot: Arc<Slot>,
    done: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

struct State {
    tracker: PhaseTracker,
    version: Version,
    scope: Scope,
}

impl Exchange {
    pub(crate) fn new(id: ExchangeId) -> (Exchange, ResponseFuture) {
        let slot = Slot::new();
        let (done, done_rx) = watch::channel(false);
        let exchange = Exchange {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(State {
                    tracker: PhaseTracker::new(),
                    version: Version::default(),
                    scope: Scope::Unbound,
                }),
                slot: slot.clone(),
                done,
                done_rx,
            }),
        };
        let future = ResponseFuture::new(exchange.clone(), slot);
        (exchange, future)
    }

    pub(crate) fn id(&self) -> ExchangeId {
        self.inner.id
    }

    pub(crate) fn phase(&self) -> Phase {
        self.inner.state.lock().tracker.current()
    }

    pub(crate) fn entered_at(&self, phase: Phase) -> Option<Instant> {
        self.inner.state.lock().tracker.entered_at(phase)
    }

    #[cfg(test)]
    pub(crate) fn version(&self) -> Version {
        self.inner.state.lock().version
    }

    #[cfg(test)]
    pub(crate) fn scope(&self) -> Scope {
        self.inner.state.lock().scope
    }

    #[cfg(test)]
    pub(crate) fn slot(&self) -> Arc<Slot> {
        self.inner.slot.clone()
    }

    /// Binds the exchange to the connection (or stream) that carries it.
    ///
    /// The monitor, if any, is pointed at this exchange and armed once the
    /// exchange enters a watched phase.
    pub(crate) fn bind(&self, version: Version, scope: Scope, monitor: Option<MonitorHandle>) {
        let mut state = self.inner.state.lock();
        if state.tracker.current().is_terminal() {
            return;
        }
        state.version = version;
        state.scope = scope;
        if let Some(ref monitor) = monitor {
            let target: Weak<dyn Expire> =
                Arc::downgrade(&(self.inner.clone() as Arc<dyn Expire>));
            monitor.attach(target);
        }
        state.tracker.bind(monitor);
        trace!("exchange {} bound to {:?} over {}", self.inner.id, scope, version);
    }

    /// Moves the exchange to `next`.
    ///
    /// Fails with a "settled" error if the exchange already ended, which
    /// tells the caller to stop driving it. An illegal transition fails the
    /// exchange itself, and so does a terminal `next`: those are only
    /// reached through `complete` and `fail`, which settle the exchange.
    pub(crate) fn advance(&self, next: Phase) -> crate::Result<()> {
        let mut state = self.inner.state.lock();
        let from = state.tracker.current();
        if from.is_terminal() {
            return Err(crate::Error::new_settled());
        }
        if next.is_terminal() {
            self.refuse(state, from, next);
            return Err(crate::Error::new_illegal_transition(from, next));
        }
        match state.tracker.advance(next) {
            Ok(_) => Ok(()),
            Err(Refused::Terminated(_)) => Err(crate::Error::new_settled()),
            Err(Refused::Illegal { from, to }) => {
                self.refuse(state, from, to);
                Err(crate::Error::new_illegal_transition(from, to))
            }
        }
    }

    /// Records I/O progress that is not visible to the socket wrapper, such
    /// as an HTTP/2 data frame accepted by the codec.
    pub(crate) fn progress(&self) {
        let state = self.inner.state.lock();
        if state.tracker.current().is_terminal() {
            return;
        }
        if let Some(monitor) = state.tracker.monitor() {
            monitor.touch();
        }
    }

    /// Completes the exchange with its response.
    ///
    /// Returns false if another terminal event won.
    pub(crate) fn complete(&self, mut message: Message) -> bool {
        let mut state = self.inner.state.lock();
        match state.tracker.advance(Phase::Complete) {
            Ok(_) => {
                let version = state.version;
                drop(state);
                message.set_version(version);
                trace!("exchange {} complete", self.inner.id);
                self.inner.settle(Ok(message))
            }
            Err(Refused::Terminated(_)) => false,
            Err(Refused::Illegal { from, to }) => {
                self.refuse(state, from, to);
                false
            }
        }
    }

    /// Fails the exchange.
    ///
    /// Returns false if the exchange already ended.
    pub(crate) fn fail(&self, err: crate::Error) -> bool {
        let mut state = self.inner.state.lock();
        let from = match state.tracker.advance(Phase::Failed) {
            Ok(from) => from,
            Err(_) => return false,
        };
        let version = state.version;
        drop(state);

        if err.is_illegal_transition() {
            error!("exchange {} failed in {}: {}", self.inner.id, from, err);
        } else {
            debug!("exchange {} failed in {}: {}", self.inner.id, from, err);
        }
        self.inner.settle(Err(err.with_version(version)))
    }

    // driver fault: fail with IllegalTransition, never a peer error kind
    fn refuse(&self, mut state: MutexGuard<'_, State>, from: Phase, to: Phase) {
        error!(
            "exchange {} illegal phase transition {} -> {}",
            self.inner.id, from, to
        );
        let _ = state.tracker.advance(Phase::Failed);
        let version = state.version;
        drop(state);
        self.inner.settle(Err(
            crate::Error::new_illegal_transition(from, to).with_version(version)
        ));
    }

    pub(crate) fn cancel(&self) -> bool {
        self.fail(crate::Error::new_canceled())
    }

    /// Resolves once the exchange reached a terminal phase.
    pub(crate) async fn terminated(&self) {
        let mut rx = self.inner.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Inner {
    fn settle(&self, result: crate::Result<Message>) -> bool {
        let settled = self.slot.settle(result);
        let _ = self.done.send(true);
        settled
    }
}

impl Expire for Inner {
    fn expire(&self, watch: Watch, generation: u64) {
        let phase = match watch {
            Watch::Phase(phase) => phase,
            Watch::Connection => return,
        };

        let mut state = self.state.lock();
        if state.tracker.current() != phase {
            trace!("exchange {} left {} before expiry", self.id, phase);
            return;
        }
        let confirmed = state
            .tracker
            .monitor()
            .map_or(false, |monitor| monitor.confirm(generation));
        if !confirmed {
            return;
        }
        let _ = state.tracker.advance(Phase::Failed);
        let version = state.version;
        drop(state);

        debug!(
            "exchange {} idle timeout while {} over {}",
            self.id, phase, version
        );
        self.settle(Err(
            crate::Error::new_idle_timeout(phase).with_version(version)
        ));
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Exchange")
            .field("id", &self.inner.id)
            .field("phase", &state.tracker.current())
            .field("version", &state.version)
            .field("scope", &state.scope)
            .finish()
    }
}
