//! Per-connection serving.
//!
//! A connection starts out as HTTP/1.1 unless HTTP/2 is enabled and the
//! first bytes are the HTTP/2 connection preface. An HTTP/1.1 connection
//! switches to HTTP/2 after answering a request that offered h2c.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::Shared;
use crate::common::io::Rewind;
use crate::message::{Body, Message};

mod http1;
mod http2;

const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(super) async fn serve(
    mut stream: TcpStream,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = stream.peer_addr().ok();

    let pre = if shared.config.http2 {
        match sniff(&mut stream, shared.config.idle_timeout).await {
            Ok(Sniffed::Http2(pre)) => {
                trace!("connection from {:?} speaking HTTP/2", peer);
                let io = Rewind::new_buffered(stream, pre);
                if let Err(e) = http2::serve(io, &shared, &mut shutdown).await {
                    debug!("connection from {:?} error: {}", peer, e);
                }
                return;
            }
            Ok(Sniffed::Http1(pre)) => pre,
            Err(e) => {
                debug!("connection from {:?} error: {}", peer, e);
                return;
            }
        }
    } else {
        Bytes::new()
    };

    match http1::serve(stream, pre, &shared, &mut shutdown).await {
        Ok(http1::Served::Closed) => trace!("connection from {:?} closed", peer),
        Ok(http1::Served::Upgrade(stream, rest)) => {
            debug!("connection from {:?} switched to HTTP/2", peer);
            let io = Rewind::new_buffered(stream, rest);
            if let Err(e) = http2::serve(io, &shared, &mut shutdown).await {
                debug!("connection from {:?} error: {}", peer, e);
            }
        }
        Err(e) => debug!("connection from {:?} error: {}", peer, e),
    }
}

enum Sniffed {
    Http1(Bytes),
    Http2(Bytes),
}

/// Reads until the bytes either complete or diverge from the preface.
async fn sniff(stream: &mut TcpStream, idle_timeout: Option<Duration>) -> crate::Result<Sniffed> {
    let mut buf = BytesMut::with_capacity(PREFACE.len());
    loop {
        let n = match timed(idle_timeout, stream.read_buf(&mut buf)).await {
            Some(res) => res.map_err(crate::Error::new_io)?,
            None => return Err(idle_error()),
        };
        let len = buf.len().min(PREFACE.len());
        if buf[..len] != PREFACE[..len] {
            return Ok(Sniffed::Http1(buf.freeze()));
        }
        if buf.len() >= PREFACE.len() {
            return Ok(Sniffed::Http2(buf.freeze()));
        }
        if n == 0 {
            // closed mid-preface, let HTTP/1 report it
            return Ok(Sniffed::Http1(buf.freeze()));
        }
    }
}

/// Runs `fut` under an optional timeout; `None` means it elapsed.
pub(super) async fn timed<F: Future>(dur: Option<Duration>, fut: F) -> Option<F::Output> {
    match dur {
        Some(dur) => tokio::time::timeout(dur, fut).await.ok(),
        None => Some(fut.await),
    }
}

pub(super) fn idle_error() -> crate::Error {
    crate::Error::new_io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "connection idle timeout",
    ))
}

/// The answer when a listener drops its responder.
pub(super) fn internal_error() -> Message {
    Message::response(StatusCode::INTERNAL_SERVER_ERROR, Body::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn sniff_bytes(chunks: &'static [&'static [u8]]) -> Sniffed {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for chunk in chunks {
                stream.write_all(chunk).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stream
        });
        let (mut server, _) = listener.accept().await.unwrap();
        let sniffed = sniff(&mut server, None).await.unwrap();
        drop(client.await.unwrap());
        sniffed
    }

    #[tokio::test]
    async fn detects_preface_across_reads() {
        match sniff_bytes(&[b"PRI * HTTP/2.0\r\n", b"\r\nSM\r\n\r\n"]).await {
            Sniffed::Http2(pre) => assert_eq!(&pre[..], &PREFACE[..]),
            Sniffed::Http1(_) => panic!("expected preface"),
        }
    }

    #[tokio::test]
    async fn http1_request_is_not_preface() {
        match sniff_bytes(&[b"GET / HTTP/1.1\r\n\r\n"]).await {
            Sniffed::Http1(pre) => assert!(pre.starts_with(b"GET")),
            Sniffed::Http2(_) => panic!("expected HTTP/1"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_elapses() {
        let never = std::future::pending::<()>();
        assert!(timed(Some(Duration::from_millis(10)), never).await.is_none());
        assert_eq!(timed(None, async { 3 }).await, Some(3));
    }
}
