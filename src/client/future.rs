use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{mpsc, Arc};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use super::exchange::{Exchange, ExchangeId};
use super::phase::Phase;
use crate::message::Message;

/// Receives the outcome of one exchange.
///
/// Exactly one of the two methods is called, once, from whichever task
/// settled the exchange.
pub trait ResponseListener: Send + 'static {
    /// The exchange completed with a response.
    fn on_message(&mut self, message: Message);

    /// The exchange failed.
    fn on_error(&mut self, error: crate::Error);
}

/// Adapts a closure receiving the exchange result into a [`ResponseListener`].
pub fn listener_fn<F>(f: F) -> impl ResponseListener
where
    F: FnOnce(crate::Result<Message>) + Send + 'static,
{
    ListenerFn(Some(f))
}

struct ListenerFn<F>(Option<F>);

impl<F> ResponseListener for ListenerFn<F>
where
    F: FnOnce(crate::Result<Message>) + Send + 'static,
{
    fn on_message(&mut self, message: Message) {
        if let Some(f) = self.0.take() {
            f(Ok(message));
        }
    }

    fn on_error(&mut self, error: crate::Error) {
        if let Some(f) = self.0.take() {
            f(Err(error));
        }
    }
}

/// The settlement cell shared by an exchange and its `ResponseFuture`.
///
/// The first `settle` wins; later ones are ignored and report `false`.
pub(crate) struct Slot {
    state: Mutex<State>,
}

enum State {
    Pending {
        waker: Option<Waker>,
        listener: Option<Box<dyn ResponseListener>>,
    },
    Ready(crate::Result<Message>),
    Taken,
}

impl Slot {
    pub(crate) fn new() -> Arc<Slot> {
        Arc::new(Slot {
            state: Mutex::new(State::Pending {
                waker: None,
                listener: None,
            }),
        })
    }

    pub(crate) fn settle(&self, result: crate::Result<Message>) -> bool {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, State::Taken) {
            State::Pending {
                listener: Some(listener),
                ..
            } => {
                drop(state);
                deliver(listener, result);
                true
            }
            State::Pending {
                waker,
                listener: None,
            } => {
                *state = State::Ready(result);
                drop(state);
                if let Some(waker) = waker {
                    waker.wake();
                }
                true
            }
            already => {
                *state = already;
                trace!("ignoring settlement of an already settled exchange");
                false
            }
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        !matches!(*self.state.lock(), State::Pending { .. })
    }

    fn set_listener(&self, listener: Box<dyn ResponseListener>) {
        let mut state = self.state.lock();
        match *state {
            State::Pending {
                listener: ref mut slot,
                ..
            } => {
                *slot = Some(listener);
            }
            State::Ready(_) => {
                if let State::Ready(result) = mem::replace(&mut *state, State::Taken) {
                    drop(state);
                    deliver(listener, result);
                }
            }
            State::Taken => {}
        }
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<crate::Result<Message>> {
        let mut state = self.state.lock();
        match *state {
            State::Pending { ref mut waker, .. } => {
                match *waker {
                    Some(ref w) if w.will_wake(cx.waker()) => {}
                    _ => *waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
            State::Ready(_) => match mem::replace(&mut *state, State::Taken) {
                State::Ready(result) => Poll::Ready(result),
                _ => unreachable!("state checked above"),
            },
            State::Taken => Poll::Ready(Err(crate::Error::new_settled())),
        }
    }
}

fn deliver(mut listener: Box<dyn ResponseListener>, result: crate::Result<Message>) {
    match result {
        Ok(message) => listener.on_message(message),
        Err(error) => listener.on_error(error),
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// A `Future` resolving to the response of one exchange.
///
/// The outcome can be observed exactly once, by one of:
///
/// - awaiting the future,
/// - registering a [`ResponseListener`] with [`set_listener`](ResponseFuture::set_listener),
/// - blocking the current thread with [`wait`](ResponseFuture::wait).
///
/// Dropping an unsettled future cancels its exchange, unless a listener was
/// registered.
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    exchange: Exchange,
    slot: Arc<Slot>,
    detached: bool,
}

impl ResponseFuture {
    pub(crate) fn new(exchange: Exchange, slot: Arc<Slot>) -> ResponseFuture {
        ResponseFuture {
            exchange,
            slot,
            detached: false,
        }
    }

    /// The id of the exchange this future observes.
    pub fn id(&self) -> ExchangeId {
        self.exchange.id()
    }

    /// The phase the exchange is currently in.
    pub fn phase(&self) -> Phase {
        self.exchange.phase()
    }

    /// When the exchange entered `phase`, or `None` if it never did.
    pub fn entered_at(&self, phase: Phase) -> Option<Instant> {
        self.exchange.entered_at(phase).map(|at| at.into_std())
    }

    /// Returns true once the exchange has an outcome.
    pub fn is_settled(&self) -> bool {
        self.slot.is_settled()
    }

    /// Cancels the exchange.
    ///
    /// The future then resolves to an error for which
    /// [`Error::is_canceled`](crate::Error::is_canceled) is true. Has no
    /// effect if the exchange already settled. Over HTTP/2 only this
    /// exchange's stream is reset; the connection stays up.
    pub fn cancel(&self) {
        self.exchange.cancel();
    }

    /// Delivers the outcome to `listener` instead of this future.
    ///
    /// If the exchange already settled the listener is called right away, on
    /// the current thread.
    pub fn set_listener<L: ResponseListener>(mut self, listener: L) {
        self.detached = true;
        self.slot.set_listener(Box::new(listener));
    }

    /// Blocks the current thread until the exchange settles.
    ///
    /// This must not be called from a thread driving the runtime the
    /// exchange runs on.
    pub fn wait(self) -> crate::Result<Message> {
        let (tx, rx) = mpsc::channel();
        self.set_listener(listener_fn(move |result| {
            let _ = tx.send(result);
        }));
        rx.recv().unwrap_or_else(|_| Err(crate::Error::new_closed()))
    }
}

impl Future for ResponseFuture {
    type Output = crate::Result<Message>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.slot.poll_take(cx)
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.detached && !self.slot.is_settled() {
            trace!("response future dropped, canceling exchange {}", self.id());
            self.exchange.cancel();
        }
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("id", &self.exchange.id())
            .field("settled", &self.slot.is_settled())
            .finish()
    }
}
