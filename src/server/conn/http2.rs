//! HTTP/2 server connections

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::poll_fn;
use h2::server::SendResponse;
use h2::RecvStream;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::internal_error;
use crate::message::{Body, Head, Message};
use crate::proto;
use crate::server::Shared;
use crate::version::Version;

enum Event {
    Accepted(Option<Result<(http::Request<RecvStream>, SendResponse<Bytes>), h2::Error>>),
    Shutdown,
    Idle,
}

/// Serves streams until the peer goes away or a graceful shutdown finishes.
///
/// The connection closes once it has had no open stream for the idle
/// timeout.
pub(super) async fn serve<T>(
    io: T,
    shared: &Arc<Shared>,
    shutdown: &mut watch::Receiver<bool>,
) -> crate::Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut conn = proto::h2::server_builder(&shared.config.h2)
        .handshake::<_, Bytes>(io)
        .await
        .map_err(crate::Error::new_h2)?;
    trace!("h2 server handshake complete");

    // every stream task holds a clone
    let open = Arc::new(());
    let idle_timeout = shared.config.idle_timeout;
    let mut closing = *shutdown.borrow();
    if closing {
        conn.graceful_shutdown();
    }

    loop {
        let deadline = idle_timeout.map(|dur| Instant::now() + dur);
        let event = tokio::select! {
            accepted = conn.accept() => Event::Accepted(accepted),
            _ = shutdown.changed(), if !closing => Event::Shutdown,
            _ = sleep_until(deadline), if !closing => Event::Idle,
        };
        match event {
            Event::Accepted(Some(Ok((request, respond)))) => {
                trace!("accepted stream {}", respond.stream_id().as_u32());
                tokio::spawn(handle_stream(request, respond, shared.clone(), open.clone()));
            }
            Event::Accepted(Some(Err(e))) => return Err(crate::Error::new_h2(e)),
            Event::Accepted(None) => {
                trace!("h2 connection closed");
                return Ok(());
            }
            Event::Shutdown => {
                debug!("h2 connection shutting down");
                closing = true;
                conn.graceful_shutdown();
            }
            Event::Idle => {
                if Arc::strong_count(&open) == 1 {
                    debug!("h2 connection idle timeout");
                    closing = true;
                    conn.graceful_shutdown();
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn handle_stream(
    request: http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    shared: Arc<Shared>,
    _open: Arc<()>,
) {
    let stream_id = respond.stream_id().as_u32();
    if let Err(e) = serve_stream(request, &mut respond, &shared).await {
        debug!("stream {} error: {}", stream_id, e);
        respond.send_reset(e.h2_reason());
    }
}

async fn serve_stream(
    request: http::Request<RecvStream>,
    respond: &mut SendResponse<Bytes>,
    shared: &Shared,
) -> crate::Result<()> {
    let (parts, recv) = request.into_parts();
    let (content, trailers) = proto::h2::recv_body(recv, |_| ()).await?;
    let request = Message::from_parts(
        Head::Request {
            method: parts.method,
            uri: parts.uri,
        },
        Version::Http2,
        parts.headers,
        Body::full(content, trailers),
    );

    let mut rx = shared.dispatch(request);
    let response = tokio::select! {
        res = &mut rx => res.unwrap_or_else(|_| internal_error()),
        reset = poll_fn(|cx| respond.poll_reset(cx)) => {
            let reason = reset.map_err(crate::Error::new_h2)?;
            debug!("stream reset by peer before response: {:?}", reason);
            return Ok(());
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
    proto::h2::strip_connection_headers(&mut headers, false);
    let mut res = http::Response::new(());
    *res.status_mut() = status;
    *res.headers_mut() = headers;

    let eos = body.exact_len() == Some(0) && !body.has_trailers();
    let mut send = respond
        .send_response(res, eos)
        .map_err(crate::Error::new_h2)?;
    if !eos {
        proto::h2::send_body(&mut body, &mut send, |_| ()).await?;
    }
    Ok(())
}
