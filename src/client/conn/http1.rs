//! HTTP/1 client connections

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Config, Request};
use crate::client::exchange::{Exchange, Scope};
use crate::client::idle::IdleMonitor;
use crate::client::phase::Phase;
use crate::common::io::Tracked;
use crate::message::{Body, Head, Message};
use crate::proto::h1::decode::Decoded;
use crate::proto::h1::io::Buffered;
use crate::proto::h1::role;
use crate::version::Version;

/// An HTTP/1.1 connection carrying one exchange at a time.
///
/// The idle monitor governs the whole connection: every byte read or
/// written resets it, and each exchange re-arms it as it changes phase.
pub(crate) struct Connection {
    id: u64,
    io: Buffered<Tracked<TcpStream>>,
    monitor: Option<IdleMonitor>,
    keep_alive: bool,
    /// SETTINGS payload offered with the next request, if switching to
    /// h2c is still on the table.
    h2c_offer: Option<String>,
    upgraded: bool,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        stream: TcpStream,
        config: &Config,
        h2c_offer: Option<String>,
    ) -> Connection {
        let monitor = config.idle_timeout.map(IdleMonitor::new);
        let io = Tracked::new(stream, monitor.as_ref().map(IdleMonitor::handle));
        Connection {
            id,
            io: Buffered::new(io),
            monitor,
            keep_alive: true,
            h2c_offer,
            upgraded: false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Returns true if the connection may carry another HTTP/1.1 exchange.
    pub(crate) fn is_reusable(&self) -> bool {
        self.keep_alive && !self.upgraded && self.io.read_buf().is_empty()
    }

    /// Returns true if the peer accepted the offer to switch to h2c.
    pub(crate) fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Checks, without blocking, whether the peer closed an idle connection.
    pub(crate) fn is_closed(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.io.get_ref().get_ref().try_read(&mut probe) {
            // unsolicited bytes on an idle connection are as bad as EOF
            Ok(_) => true,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }

    /// Gives back the socket and any bytes read past the last response.
    pub(crate) fn into_parts(self) -> (TcpStream, Bytes) {
        let (io, read_buf) = self.io.into_parts();
        (io.into_inner(), read_buf)
    }

    /// Runs one exchange on this connection.
    ///
    /// Writes the request, streaming a delayed body as its producer yields
    /// chunks, then reads the whole response.
    pub(crate) async fn send(
        &mut self,
        exchange: &Exchange,
        request: Request,
    ) -> crate::Result<Message> {
        exchange.bind(
            Version::Http11,
            Scope::Connection(self.id),
            self.monitor.as_ref().map(IdleMonitor::handle),
        );
        exchange.advance(Phase::WritingRequest)?;

        let Request {
            method,
            uri,
            mut headers,
            mut body,
        } = request;
        if let Some(ref settings) = self.h2c_offer {
            trace!("connection {} offering h2c", self.id);
            role::offer_h2c(&mut headers, settings);
        }
        self.keep_alive = role::is_keep_alive(http::Version::HTTP_11, &headers);

        let mut buf = Vec::new();
        let mut encoder = role::encode_request(
            &method,
            &uri,
            &mut headers,
            body.exact_len(),
            body.has_trailers(),
            &mut buf,
        );
        self.write(&buf).await?;

        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            buf.clear();
            encoder.encode(&chunk, &mut buf)?;
            self.write(&buf).await?;
            exchange.progress();
        }
        let trailers = body.trailers().await?;
        buf.clear();
        encoder.end(trailers.as_ref(), &mut buf)?;
        self.write(&buf).await?;
        trace!("connection {} request written", self.id);

        exchange.advance(Phase::AwaitingResponse)?;
        if self.io.read_buf().is_empty() && self.read_more().await? == 0 {
            debug!("connection {} closed before response", self.id);
            return Err(crate::Error::new_incomplete());
        }
        exchange.advance(Phase::ReadingResponse)?;

        self.read_response(exchange, &method).await
    }

    async fn read_response(
        &mut self,
        exchange: &Exchange,
        method: &Method,
    ) -> crate::Result<Message> {
        let head = loop {
            match role::parse_response(self.io.read_buf())? {
                Some((head, len)) => {
                    self.io.consume(len);
                    if head.status == StatusCode::SWITCHING_PROTOCOLS {
                        debug!("connection {} got 101 to an h2c offer", self.id);
                        return Err(crate::Error::new_switching_protocols());
                    }
                    if head.status.is_informational() {
                        trace!("ignoring informational response: {}", head.status);
                        continue;
                    }
                    break head;
                }
                None => {
                    if self.read_more().await? == 0 {
                        return Err(crate::Error::new_incomplete());
                    }
                }
            }
        };

        let mut decoder = role::response_decoder(&head, method)?;
        let mut content = BytesMut::new();
        let trailers = loop {
            match decoder.decode(&mut self.io).await? {
                Decoded::Data(chunk) => {
                    if !chunk.is_empty() {
                        exchange.progress();
                        content.extend_from_slice(&chunk);
                    }
                }
                Decoded::End(trailers) => break trailers,
            }
        };

        if self.keep_alive {
            self.keep_alive = role::is_keep_alive(head.version, &head.headers)
                && !decoder.is_close_delimited();
        }
        if self.h2c_offer.take().is_some() {
            self.upgraded = role::accepts_h2c(head.status, &head.headers);
            debug!(
                "connection {} h2c offer {}",
                self.id,
                if self.upgraded { "accepted" } else { "ignored" }
            );
        }
        Ok(Message::from_parts(
            Head::Response {
                status: head.status,
            },
            Version::Http11,
            head.headers,
            Body::full(content.freeze(), trailers),
        ))
    }

    async fn write(&mut self, buf: &[u8]) -> crate::Result<()> {
        self.io.write_all(buf).await.map_err(crate::Error::new_io)?;
        self.io.flush().await.map_err(crate::Error::new_io)
    }

    async fn read_more(&mut self) -> crate::Result<usize> {
        self.io.read_more().await.map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => crate::Error::new_too_large(),
            _ => crate::Error::new_io(e),
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.io.get_ref().peer_addr())
            .field("keep_alive", &self.keep_alive)
            .field("upgraded", &self.upgraded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::exchange::ExchangeId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn request(body: &'static str) -> Request {
        Request {
            method: Method::POST,
            uri: "http://127.0.0.1/echo".parse().unwrap(),
            headers: http::HeaderMap::new(),
            body: Body::from(body),
        }
    }

    async fn read_request(server: &mut TcpStream) -> String {
        let mut buf = vec![0; 1024];
        let n = server.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn sends_request_and_reads_response() {
        let (client, mut server) = pair().await;
        let mut conn = Connection::new(1, client, &Config::default(), None);
        let (exchange, _future) = Exchange::new(ExchangeId::new(1));

        let peer = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
                .await
                .unwrap();
            (req, server)
        });

        let response = conn.send(&exchange, request("ping")).await.unwrap();
        assert_eq!(response.status(), Some(StatusCode::OK));
        assert_eq!(response.into_body().to_bytes().await.unwrap(), "hello");
        assert_eq!(exchange.phase(), Phase::ReadingResponse);
        assert!(conn.is_reusable());

        let (req, _server) = peer.await.unwrap();
        assert!(req.starts_with("POST /echo HTTP/1.1\r\n"), "{}", req);
        assert!(req.contains("content-length: 4\r\n"), "{}", req);
        assert!(req.ends_with("\r\n\r\nping"), "{}", req);
    }

    #[tokio::test]
    async fn h2c_offer_and_acceptance() {
        let (client, mut server) = pair().await;
        let mut conn = Connection::new(1, client, &Config::default(), Some("AAIAAAAA".into()));
        let (exchange, _future) = Exchange::new(ExchangeId::new(1));

        let peer = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nupgrade: h2c\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            (req, server)
        });

        conn.send(&exchange, request("")).await.unwrap();
        assert!(conn.is_upgraded());
        assert!(!conn.is_reusable());

        let (req, _server) = peer.await.unwrap();
        assert!(req.contains("upgrade: h2c\r\n"), "{}", req);
        assert!(req.contains("http2-settings: AAIAAAAA\r\n"), "{}", req);
    }

    #[tokio::test]
    async fn switching_protocols_is_protocol_error() {
        let (client, mut server) = pair().await;
        let mut conn = Connection::new(1, client, &Config::default(), Some("AAIAAAAA".into()));
        let (exchange, _future) = Exchange::new(ExchangeId::new(1));

        tokio::spawn(async move {
            let _ = read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nupgrade: h2c\r\n\r\n")
                .await
                .unwrap();
            server
        });

        let err = conn.send(&exchange, request("")).await.unwrap_err();
        assert!(err.is_protocol(), "{:?}", err);
    }

    #[tokio::test]
    async fn eof_before_response_is_incomplete() {
        let (client, mut server) = pair().await;
        let mut conn = Connection::new(1, client, &Config::default(), None);
        let (exchange, _future) = Exchange::new(ExchangeId::new(1));

        tokio::spawn(async move {
            let _ = read_request(&mut server).await;
        });

        let err = conn.send(&exchange, request("x")).await.unwrap_err();
        assert!(err.is_protocol() || err.is_io(), "{:?}", err);
        assert_eq!(exchange.phase(), Phase::AwaitingResponse);
    }
}
