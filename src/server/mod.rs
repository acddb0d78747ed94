//! HTTP Server
//!
//! A [`Server`] accepts TCP connections and speaks HTTP/1.1 on them. With
//! [`Version::Http2`] configured it also accepts HTTP/2 with prior knowledge
//! and HTTP/1.1 requests offering a switch to h2c. Every inbound request is
//! handed to the registered [`Listener`] together with a [`Responder`].
//!
//! ```no_run
//! # async fn run() -> phasewire::Result<()> {
//! use phasewire::server::{Responder, Server};
//! use phasewire::{Message, StatusCode};
//!
//! let server = Server::builder(([127, 0, 0, 1], 0).into()).build();
//! server.set_listener(|_request: Message, responder: Responder| {
//!     responder.respond(Message::response(StatusCode::OK, "hello"));
//! });
//! let addr = server.start().await?;
//! println!("listening on http://{}", addr);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_channel::oneshot;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::message::Message;
use crate::proto;
use crate::version::Version;

mod conn;

/// Receives the requests a [`Server`] accepts.
pub trait Listener: Send + Sync + 'static {
    /// Called once per inbound request.
    ///
    /// Called on the connection's task, so implementations should hand
    /// slow work off and answer through `responder` later.
    fn on_message(&self, request: Message, responder: Responder);
}

impl<F> Listener for F
where
    F: Fn(Message, Responder) + Send + Sync + 'static,
{
    fn on_message(&self, request: Message, responder: Responder) {
        (self)(request, responder)
    }
}

/// Answers one inbound request.
///
/// Dropping a `Responder` without responding answers `500 Internal Server
/// Error`.
pub struct Responder {
    tx: oneshot::Sender<Message>,
    version: Version,
}

impl Responder {
    /// Sends the response.
    pub fn respond(self, response: Message) {
        if self.tx.send(response).is_err() {
            trace!("response dropped, connection gone");
        }
    }

    /// The protocol the request arrived over.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns true if the peer went away and a response would be dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_canceled()
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("version", &self.version)
            .finish()
    }
}

/// A server accepting HTTP connections on one address.
pub struct Server {
    addr: SocketAddr,
    shared: Arc<Shared>,
    state: Mutex<State>,
}

/// A builder to configure a [`Server`].
#[derive(Clone, Debug)]
pub struct Builder {
    addr: SocketAddr,
    config: Config,
}

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) http2: bool,
    pub(crate) h2: proto::h2::Config,
}

pub(crate) struct Shared {
    pub(crate) config: Config,
    listener: Mutex<Option<Arc<dyn Listener>>>,
}

struct State {
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Server {
    /// Starts building a server for `addr`.
    ///
    /// Port `0` picks a free port, reported by [`start`](Server::start).
    pub fn builder(addr: SocketAddr) -> Builder {
        Builder {
            addr,
            config: Config {
                idle_timeout: Some(Duration::from_secs(60)),
                http2: false,
                h2: proto::h2::Config::default(),
            },
        }
    }

    /// Binds the listening socket and starts accepting connections.
    ///
    /// Resolves with the bound address once the server accepts. Starting a
    /// started server returns its address again.
    pub async fn start(&self) -> crate::Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(crate::Error::new_listen)?;
        let local_addr = listener.local_addr().map_err(crate::Error::new_listen)?;

        let (tx, rx) = watch::channel(false);
        {
            let mut state = self.state.lock();
            if let Some(addr) = state.local_addr {
                // lost a race with another start
                return Ok(addr);
            }
            state.local_addr = Some(local_addr);
            state.shutdown = Some(tx);
        }
        debug!("server listening on {}", local_addr);
        tokio::spawn(accept_loop(listener, self.shared.clone(), rx));
        Ok(local_addr)
    }

    /// Registers the listener that receives inbound requests, replacing any
    /// previous one.
    ///
    /// Requests arriving while no listener is set are answered `503`.
    pub fn set_listener<L: Listener>(&self, listener: L) {
        self.shared.set_listener(Arc::new(listener));
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().local_addr
    }

    /// Stops accepting and closes idle connections.
    ///
    /// Requests already being answered finish first.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(tx) = state.shutdown.take() {
            debug!("server stopping");
            let _ = tx.send(true);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("local_addr", &self.local_addr())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Shared {
    pub(crate) fn new(config: Config) -> Shared {
        Shared {
            config,
            listener: Mutex::new(None),
        }
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn Listener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Hands `request` to the listener and returns where its response
    /// arrives.
    pub(crate) fn dispatch(&self, request: Message) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        let version = request.version();
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => listener.on_message(request, Responder { tx, version }),
            None => {
                debug!("no listener set, answering 503");
                let _ = tx.send(Message::response(
                    http::StatusCode::SERVICE_UNAVAILABLE,
                    crate::message::Body::empty(),
                ));
            }
        }
        rx
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, remote)) => {
                    trace!("accepted connection from {}", remote);
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!("error trying to set TCP nodelay: {}", e);
                    }
                    tokio::spawn(conn::serve(stream, shared.clone(), shutdown.clone()));
                }
                Err(e) => {
                    // Connection errors can be ignored directly, continue by
                    // accepting the next request.
                    let err = crate::Error::new_accept(e);
                    debug!("{}", err);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("server accept loop finished");
}

// ===== impl Builder

impl Builder {
    /// Sets how long a connection may wait for request bytes before it is
    /// closed. A zero duration disables it.
    ///
    /// Default is 60 seconds.
    pub fn socket_idle_timeout(mut self, dur: Duration) -> Builder {
        self.config.idle_timeout = if dur == Duration::from_secs(0) {
            None
        } else {
            Some(dur)
        };
        self
    }

    /// Sets the highest protocol the server speaks.
    ///
    /// [`Version::Http2`] enables HTTP/2 with prior knowledge and accepting
    /// h2c upgrade offers. Default is HTTP/1.1.
    pub fn protocol_version(mut self, version: Version) -> Builder {
        self.config.http2 = version == Version::Http2;
        self
    }

    /// Sets the [`SETTINGS_INITIAL_WINDOW_SIZE`][spec] option for HTTP2
    /// stream-level flow control.
    ///
    /// [spec]: https://http2.github.io/http2-spec/#SETTINGS_INITIAL_WINDOW_SIZE
    pub fn http2_initial_stream_window_size(mut self, sz: u32) -> Builder {
        self.config.h2.initial_stream_window_size = sz;
        self
    }

    /// Sets the max connection-level flow control for HTTP2.
    pub fn http2_initial_connection_window_size(mut self, sz: u32) -> Builder {
        self.config.h2.initial_conn_window_size = sz;
        self
    }

    /// Sets the maximum frame size to use for HTTP2.
    pub fn http2_max_frame_size(mut self, sz: u32) -> Builder {
        self.config.h2.max_frame_size = sz;
        self
    }

    /// Builds the server. Nothing is bound until [`Server::start`].
    pub fn build(self) -> Server {
        Server {
            addr: self.addr,
            shared: Arc::new(Shared::new(self.config)),
            state: Mutex::new(State {
                local_addr: None,
                shutdown: None,
            }),
        }
    }
}
