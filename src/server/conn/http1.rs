//! HTTP/1.1 server connections

use std::io;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, CONNECTION, UPGRADE};
use http::{Method, StatusCode};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{idle_error, internal_error, timed};
use crate::message::{Body, Head, Message};
use crate::proto;
use crate::proto::h1::decode::Decoded;
use crate::proto::h1::io::Buffered;
use crate::proto::h1::role::{self, RequestHead};
use crate::server::Shared;
use crate::version::Version;

/// How an HTTP/1.1 connection ended.
#[derive(Debug)]
pub(super) enum Served {
    Closed,
    /// The last response accepted an h2c offer; the socket and any bytes
    /// read past that request now belong to HTTP/2.
    Upgrade(TcpStream, Bytes),
}

pub(super) async fn serve(
    stream: TcpStream,
    pre: Bytes,
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> crate::Result<Served> {
    let mut io = Buffered::with_buffer(stream, pre);
    let idle_timeout = shared.config.idle_timeout;

    loop {
        let head = match read_head(&mut io, idle_timeout, shutdown).await? {
            Some(head) => head,
            None => return Ok(Served::Closed),
        };
        let mut decoder = role::request_decoder(&head)?;
        let mut content = BytesMut::new();
        let trailers = loop {
            let decoded = timed(idle_timeout, decoder.decode(&mut io))
                .await
                .ok_or_else(idle_error)??;
            match decoded {
                Decoded::Data(chunk) => content.extend_from_slice(&chunk),
                Decoded::End(trailers) => break trailers,
            }
        };

        let RequestHead {
            method,
            uri,
            version,
            mut headers,
        } = head;
        let mut keep_alive = role::is_keep_alive(version, &headers);
        let mut upgrade = false;
        if let Some(settings) = role::h2c_offer(&headers) {
            upgrade = shared.config.http2
                && keep_alive
                && proto::h2::decode_settings(settings).is_some();
            trace!("h2c offer {}", if upgrade { "accepted" } else { "ignored" });
            role::strip_h2c_offer(&mut headers);
        }
        let head_request = method == Method::HEAD;

        let request = Message::from_parts(
            Head::Request { method, uri },
            Version::Http11,
            headers,
            Body::full(content.freeze(), trailers),
        );
        let mut rx = shared.dispatch(request);

        let response = loop {
            tokio::select! {
                res = &mut rx => break res.unwrap_or_else(|_| internal_error()),
                read = io.read_more() => match read {
                    Ok(0) => {
                        debug!("peer closed while awaiting response");
                        return Ok(Served::Closed);
                    }
                    // pipelined, handled after this response
                    Ok(_) => continue,
                    Err(e) => return Err(map_read_error(e)),
                },
            }
        };

        let (head, mut headers, mut body) = response.into_parts();
        let status = match head {
            Head::Response { status } => status,
            Head::Request { .. } => {
                debug!("listener responded with a request message");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        keep_alive = keep_alive && role::is_keep_alive(http::Version::HTTP_11, &headers);
        upgrade = upgrade && keep_alive;
        if !keep_alive {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
        if upgrade {
            headers.insert(UPGRADE, HeaderValue::from_static(role::H2C));
        }

        let mut buf = Vec::new();
        let mut encoder = role::encode_response(
            status,
            &mut headers,
            body.exact_len(),
            body.has_trailers(),
            head_request,
            &mut buf,
        );
        write(&mut io, &buf).await?;

        if !encoder.is_eof() {
            while let Some(chunk) = body.data().await {
                let chunk = chunk?;
                buf.clear();
                encoder.encode(&chunk, &mut buf)?;
                write(&mut io, &buf).await?;
            }
            let trailers = body.trailers().await?;
            buf.clear();
            encoder.end(trailers.as_ref(), &mut buf)?;
            write(&mut io, &buf).await?;
        }
        trace!("response written, status={}", status);

        if upgrade {
            let (stream, rest) = io.into_parts();
            return Ok(Served::Upgrade(stream, rest));
        }
        if !keep_alive {
            return Ok(Served::Closed);
        }
    }
}

/// Reads the next request head.
///
/// Returns `None` when the connection should close quietly: the peer
/// closed between requests, the connection sat idle too long, or the
/// server is shutting down.
async fn read_head(
    io: &mut Buffered<TcpStream>,
    idle_timeout: Option<std::time::Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> crate::Result<Option<RequestHead>> {
    loop {
        if let Some((head, len)) = role::parse_request(io.read_buf())? {
            io.consume(len);
            trace!("request head: {} {}", head.method, head.uri);
            return Ok(Some(head));
        }

        let between_requests = io.read_buf().is_empty();
        if between_requests && *shutdown.borrow() {
            return Ok(None);
        }
        let read = tokio::select! {
            read = timed(idle_timeout, io.read_more()) => read,
            _ = shutdown.changed(), if between_requests => {
                trace!("closing idle connection for shutdown");
                return Ok(None);
            }
        };
        let n = match read {
            Some(res) => res.map_err(map_read_error)?,
            None if between_requests => {
                debug!("idle connection timed out");
                return Ok(None);
            }
            None => return Err(idle_error()),
        };
        if n == 0 {
            if io.read_buf().is_empty() {
                return Ok(None);
            }
            return Err(crate::Error::new_incomplete());
        }
    }
}

async fn write(io: &mut Buffered<TcpStream>, buf: &[u8]) -> crate::Result<()> {
    io.write_all(buf).await.map_err(crate::Error::new_io)?;
    io.flush().await.map_err(crate::Error::new_io)
}

fn map_read_error(e: io::Error) -> crate::Error {
    match e.kind() {
        io::ErrorKind::InvalidData => crate::Error::new_too_large(),
        _ => crate::Error::new_io(e),
    }
}
