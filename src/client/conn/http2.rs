//! HTTP/2 client connections

use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::mux::Multiplexer;
use super::{Config, Request};
use crate::client::exchange::{Exchange, Scope};
use crate::client::phase::Phase;
use crate::common::io::Tracked;
use crate::message::{Body, Head, Message};
use crate::proto;
use crate::version::Version;

/// The sender side of an established HTTP/2 connection.
///
/// Clones share the connection; each [`send`](SendRequest::send) opens one
/// stream.
#[derive(Clone)]
pub(crate) struct SendRequest {
    tx: h2::client::SendRequest<Bytes>,
    mux: Multiplexer,
}

/// Performs the client handshake over `io` and spawns the connection task.
pub(crate) async fn handshake<T>(id: u64, io: T, config: &Config) -> crate::Result<SendRequest>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let stream_timeout = if config.h2_stream_idle_timeouts {
        config.idle_timeout
    } else {
        None
    };
    let mux = Multiplexer::new(id, stream_timeout, config.h2_connection_idle_timeout);
    let io = Tracked::new(io, mux.connection_monitor());

    let (tx, conn) = proto::h2::client_builder(&config.h2)
        .handshake::<_, Bytes>(io)
        .await
        .map_err(crate::Error::new_h2)?;
    debug!("connection {} speaking HTTP/2", id);

    tokio::spawn(conn_task(conn, mux.clone()));
    Ok(SendRequest { tx, mux })
}

async fn conn_task<T>(conn: h2::client::Connection<T, Bytes>, mux: Multiplexer)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        res = conn => {
            if let Err(e) = res {
                debug!("connection {} error: {}", mux.id(), e);
            }
        }
        _ = mux.closed() => {
            trace!("connection {} shut down", mux.id());
        }
    }
    mux.close();
}

impl SendRequest {
    pub(crate) fn id(&self) -> u64 {
        self.mux.id()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    pub(crate) fn close(&self) {
        self.mux.close();
    }

    /// Runs one exchange on a new stream.
    ///
    /// Dropping the returned future resets the stream and leaves the
    /// connection open for its other streams.
    pub(crate) async fn send(&self, exchange: &Exchange, request: Request) -> crate::Result<Message> {
        exchange.bind(Version::Http2, Scope::Connection(self.mux.id()), None);
        let mut tx = self
            .tx
            .clone()
            .ready()
            .await
            .map_err(crate::Error::new_h2)?;

        let Request {
            method,
            uri,
            mut headers,
            mut body,
        } = request;
        proto::h2::strip_connection_headers(&mut headers, true);

        let mut req = http::Request::new(());
        *req.method_mut() = method;
        *req.uri_mut() = uri;
        *req.version_mut() = http::Version::HTTP_2;
        *req.headers_mut() = headers;

        let eos = body.exact_len() == Some(0) && !body.has_trailers();
        let (response, mut send) = tx.send_request(req, eos).map_err(crate::Error::new_h2)?;
        let _guard = self.mux.open(response.stream_id().as_u32(), exchange)?;

        exchange.advance(Phase::WritingRequest)?;
        if !eos {
            proto::h2::send_body(&mut body, &mut send, |_| exchange.progress()).await?;
        }
        exchange.advance(Phase::AwaitingResponse)?;

        let response = response.await.map_err(crate::Error::new_h2)?;
        exchange.advance(Phase::ReadingResponse)?;
        let (parts, recv) = response.into_parts();
        let (content, trailers) = proto::h2::recv_body(recv, |_| exchange.progress()).await?;

        Ok(Message::from_parts(
            Head::Response {
                status: parts.status,
            },
            Version::Http2,
            parts.headers,
            Body::full(content, trailers),
        ))
    }
}

impl fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRequest").field("mux", &self.mux).finish()
    }
}
