//! HTTP Client
//!
//! A [`Client`] sends request [`Message`]s and hands back a
//! [`ResponseFuture`] for each. Every request runs as an *exchange* that
//! moves through the [`Phase`]s of its lifetime; the idle timer governing
//! the exchange fails it with an error naming the phase it stalled in.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use phasewire::client::{listener_fn, Client};
//! use phasewire::Version;
//!
//! let client = Client::builder()
//!     .protocol_version(Version::Http2)
//!     .h2_prior_knowledge(true)
//!     .build();
//!
//! client
//!     .get("http://127.0.0.1:9000/".parse()?)
//!     .set_listener(listener_fn(|res: phasewire::Result<phasewire::Message>| {
//!         match res {
//!             Ok(msg) => println!("{:?}", msg.status()),
//!             Err(err) => eprintln!("{}", err),
//!         }
//!     }));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{Method, Uri};
use tracing::trace;

pub use self::exchange::ExchangeId;
pub use self::future::{listener_fn, ResponseFuture, ResponseListener};
pub use self::phase::Phase;

use self::conn::Request;
use self::connect::Connector;
use self::exchange::Exchange;
use self::pool::{Connection, Pool, Preference, Target};
use crate::message::{Body, Message};
use crate::version::Version;

mod conn;
mod connect;
pub(crate) mod exchange;
mod future;
pub(crate) mod idle;
mod phase;
mod pool;

/// A Client to make outgoing HTTP requests.
///
/// Cloning a `Client` is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Pool,
    preference: Preference,
    next_id: AtomicU64,
}

/// A builder to configure a [`Client`].
#[derive(Clone, Debug)]
pub struct Builder {
    conn: conn::Config,
    version: Version,
    h2_prior_knowledge: bool,
    connect_timeout: Option<Duration>,
    nodelay: bool,
    keep_alive: Option<Duration>,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
}

impl Client {
    /// Create a new Client with the default config.
    pub fn new() -> Client {
        Builder::default().build()
    }

    /// Configure a Client with a builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Send a `GET` request to the supplied `Uri`.
    pub fn get(&self, uri: Uri) -> ResponseFuture {
        self.send(Message::request(Method::GET, uri, Body::empty()))
    }

    /// Send a request.
    ///
    /// The exchange starts right away on a spawned task, so the returned
    /// future need not be polled for the request to make progress. Must be
    /// called from within a tokio runtime.
    pub fn send(&self, request: Message) -> ResponseFuture {
        let id = ExchangeId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (exchange, future) = Exchange::new(id);

        let prepared = Request::from_message(request).and_then(|req| {
            let target = Target::from_uri(&req.uri)?;
            Ok((target, req))
        });
        match prepared {
            Ok((target, req)) => {
                trace!("exchange {} sending {} {}", id, req.method, req.uri);
                tokio::spawn(drive(self.inner.clone(), exchange, target, req));
            }
            Err(err) => {
                exchange.fail(err);
            }
        }
        future
    }

    /// Drops pooled connections and refuses new exchanges.
    ///
    /// Exchanges already in flight on HTTP/1.1 connections run to their end.
    pub fn close(&self) {
        self.inner.pool.close();
    }
}

async fn drive(client: Arc<Inner>, exchange: Exchange, target: Target, req: Request) {
    tokio::select! {
        biased;
        _ = exchange.terminated() => {
            trace!("exchange {} ended while in flight", exchange.id());
        }
        res = execute(&client, &exchange, &target, req) => match res {
            Ok((message, conn)) => {
                // the connection goes back first, so a follow-up request can
                // find it as soon as this one resolves
                if let Some(conn) = conn {
                    client.pool.release(&target, conn).await;
                }
                exchange.complete(message);
            }
            Err(err) => {
                exchange.fail(err);
            }
        }
    }
}

async fn execute(
    client: &Inner,
    exchange: &Exchange,
    target: &Target,
    req: Request,
) -> crate::Result<(Message, Option<conn::http1::Connection>)> {
    match client.pool.acquire(target, client.preference).await? {
        Connection::Http1(mut conn) => {
            let message = conn.send(exchange, req).await?;
            Ok((message, Some(conn)))
        }
        Connection::Http2(tx) => {
            let message = tx.send(exchange, req).await?;
            Ok((message, None))
        }
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.inner.pool)
            .field("preference", &self.inner.preference)
            .finish()
    }
}

// ===== impl Builder

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            conn: conn::Config::default(),
            version: Version::Http11,
            h2_prior_knowledge: false,
            connect_timeout: None,
            nodelay: true,
            keep_alive: None,
            pool_max_idle_per_host: usize::MAX,
            pool_idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

impl Builder {
    /// Sets how long an exchange may go without I/O progress before it
    /// fails with an idle timeout.
    ///
    /// The timer covers the whole connection for HTTP/1.1 and each stream
    /// for HTTP/2. A zero duration disables it.
    ///
    /// Default is 60 seconds.
    pub fn socket_idle_timeout(mut self, dur: Duration) -> Builder {
        self.conn.idle_timeout = if dur == Duration::from_secs(0) {
            None
        } else {
            Some(dur)
        };
        self
    }

    /// Same as [`socket_idle_timeout`](Builder::socket_idle_timeout), in
    /// milliseconds.
    pub fn socket_idle_timeout_millis(self, millis: u64) -> Builder {
        self.socket_idle_timeout(Duration::from_millis(millis))
    }

    /// Sets the protocol new connections speak.
    ///
    /// With [`Version::Http2`] and no prior knowledge, the first request on
    /// a connection goes out over HTTP/1.1 offering a switch to h2c.
    ///
    /// Default is HTTP/1.1.
    pub fn protocol_version(mut self, version: Version) -> Builder {
        self.version = version;
        self
    }

    /// Sets whether HTTP/2 connections start with the connection preface
    /// instead of an HTTP/1.1 upgrade offer.
    ///
    /// Without prior knowledge the switch to HTTP/2 only works against a
    /// phasewire [`Server`](crate::Server): it accepts the offer by
    /// answering the request itself with `upgrade: h2c`, and both sides
    /// speak HTTP/2 from the next exchange on. A server doing the RFC 7540
    /// upgrade answers `101 Switching Protocols` instead, which fails the
    /// offering exchange with a protocol error. Enable prior knowledge for
    /// such servers.
    ///
    /// Default is `false`.
    pub fn h2_prior_knowledge(mut self, enabled: bool) -> Builder {
        self.h2_prior_knowledge = enabled;
        self
    }

    /// Sets whether every HTTP/2 stream gets its own idle timer.
    ///
    /// Default is `true`.
    pub fn http2_stream_idle_timeouts(mut self, enabled: bool) -> Builder {
        self.conn.h2_stream_idle_timeouts = enabled;
        self
    }

    /// Sets an idle timeout for whole HTTP/2 connections.
    ///
    /// While at least one stream is open, a connection without any I/O for
    /// this long fails all its streams and closes.
    ///
    /// Default is `None`.
    pub fn http2_connection_idle_timeout(mut self, dur: Option<Duration>) -> Builder {
        self.conn.h2_connection_idle_timeout = dur;
        self
    }

    /// Sets the [`SETTINGS_INITIAL_WINDOW_SIZE`][spec] option for HTTP2
    /// stream-level flow control.
    ///
    /// Default is 2MB.
    ///
    /// [spec]: https://http2.github.io/http2-spec/#SETTINGS_INITIAL_WINDOW_SIZE
    pub fn http2_initial_stream_window_size(mut self, sz: u32) -> Builder {
        self.conn.h2.initial_stream_window_size = sz;
        self
    }

    /// Sets the max connection-level flow control for HTTP2
    ///
    /// Default is 5MB.
    pub fn http2_initial_connection_window_size(mut self, sz: u32) -> Builder {
        self.conn.h2.initial_conn_window_size = sz;
        self
    }

    /// Sets the maximum frame size to use for HTTP2.
    ///
    /// Default is 16KB.
    pub fn http2_max_frame_size(mut self, sz: u32) -> Builder {
        self.conn.h2.max_frame_size = sz;
        self
    }

    /// Set the connect timeout.
    ///
    /// If `None`, then no timeout is applied by the connector, making it
    /// subject to the timeout imposed by the operating system.
    pub fn connect_timeout(mut self, dur: Option<Duration>) -> Builder {
        self.connect_timeout = dur;
        self
    }

    /// Set that all sockets have `SO_NODELAY` set to the supplied value.
    ///
    /// Default is `true`.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Builder {
        self.nodelay = nodelay;
        self
    }

    /// Set that all sockets have `SO_KEEPALIVE` set with the supplied duration.
    ///
    /// If `None`, the option will not be set.
    pub fn tcp_keepalive(mut self, dur: Option<Duration>) -> Builder {
        self.keep_alive = dur;
        self
    }

    /// Sets the maximum idle HTTP/1.1 connections kept per host.
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Builder {
        self.pool_max_idle_per_host = max;
        self
    }

    /// Set an optional timeout for idle pooled connections.
    ///
    /// Default is 90 seconds.
    pub fn pool_idle_timeout(mut self, dur: Option<Duration>) -> Builder {
        self.pool_idle_timeout = dur;
        self
    }

    /// Builds the client.
    pub fn build(self) -> Client {
        let mut connector = Connector::new();
        connector.set_connect_timeout(self.connect_timeout);
        connector.set_nodelay(self.nodelay);
        connector.set_keepalive(self.keep_alive);

        let preference = match (self.version, self.h2_prior_knowledge) {
            (Version::Http11, _) => Preference::Http11,
            (Version::Http2, true) => Preference::Http2PriorKnowledge,
            (Version::Http2, false) => Preference::Http2Upgrade,
        };
        Client {
            inner: Arc::new(Inner {
                pool: Pool::new(
                    connector,
                    self.conn,
                    self.pool_max_idle_per_host,
                    self.pool_idle_timeout,
                ),
                preference,
                next_id: AtomicU64::new(0),
            }),
        }
    }
}
