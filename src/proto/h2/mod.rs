use std::task::Poll;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use futures_util::future::poll_fn;
use h2::{RecvStream, SendStream};
use http::header::{
    HeaderName, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use http::HeaderMap;
use tracing::{debug, trace, warn};

use crate::message::Body;

// Our defaults are chosen for the "majority" case, which usually are not
// resource constrained, and so the RFC 7540 default of 64kb can be too limiting
// for performance.
const DEFAULT_CONN_WINDOW: u32 = 1024 * 1024 * 5; // 5mb
const DEFAULT_STREAM_WINDOW: u32 = 1024 * 1024 * 2; // 2mb
const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 16; // 16kb
const DEFAULT_MAX_SEND_BUF_SIZE: usize = 1024 * 1024; // 1mb

// SETTINGS identifiers, RFC 7540 section 6.5.2
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) initial_conn_window_size: u32,
    pub(crate) initial_stream_window_size: u32,
    pub(crate) max_frame_size: u32,
    pub(crate) max_send_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            initial_conn_window_size: DEFAULT_CONN_WINDOW,
            initial_stream_window_size: DEFAULT_STREAM_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_send_buffer_size: DEFAULT_MAX_SEND_BUF_SIZE,
        }
    }
}

pub(crate) fn client_builder(config: &Config) -> h2::client::Builder {
    let mut builder = h2::client::Builder::default();
    builder
        .initial_window_size(config.initial_stream_window_size)
        .initial_connection_window_size(config.initial_conn_window_size)
        .max_frame_size(config.max_frame_size)
        .max_send_buffer_size(config.max_send_buffer_size)
        .enable_push(false);
    builder
}

#[cfg(feature = "server")]
pub(crate) fn server_builder(config: &Config) -> h2::server::Builder {
    let mut builder = h2::server::Builder::default();
    builder
        .initial_window_size(config.initial_stream_window_size)
        .initial_connection_window_size(config.initial_conn_window_size)
        .max_frame_size(config.max_frame_size)
        .max_send_buffer_size(config.max_send_buffer_size);
    builder
}

/// Encodes the SETTINGS a client announces in an `HTTP2-Settings` header.
pub(crate) fn settings_payload(config: &Config) -> String {
    let settings = [
        (SETTINGS_ENABLE_PUSH, 0),
        (SETTINGS_INITIAL_WINDOW_SIZE, config.initial_stream_window_size),
        (SETTINGS_MAX_FRAME_SIZE, config.max_frame_size),
    ];
    let mut payload = Vec::with_capacity(settings.len() * 6);
    for (id, value) in settings.iter() {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    URL_SAFE_NO_PAD.encode(payload)
}

/// Decodes an `HTTP2-Settings` header into `(identifier, value)` pairs.
///
/// Returns `None` for anything that is not a well-formed SETTINGS payload.
#[cfg(feature = "server")]
pub(crate) fn decode_settings(payload: &str) -> Option<Vec<(u16, u32)>> {
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    if bytes.len() % 6 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks(6)
            .map(|c| {
                (
                    u16::from_be_bytes([c[0], c[1]]),
                    u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
                )
            })
            .collect(),
    )
}

pub(crate) fn strip_connection_headers(headers: &mut HeaderMap, is_request: bool) {
    // List of connection headers from:
    // https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Connection
    //
    // TE headers are allowed in HTTP/2 requests as long as the value is "trailers", so they're
    // tested separately.
    let connection_headers = [
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ];

    for header in connection_headers.iter() {
        if headers.remove(header).is_some() {
            warn!("Connection header illegal in HTTP/2: {}", header.as_str());
        }
    }

    if is_request {
        if headers
            .get(TE)
            .map(|te_header| te_header != "trailers")
            .unwrap_or(false)
        {
            warn!("TE headers not set to \"trailers\" are illegal in HTTP/2 requests");
            headers.remove(TE);
        }
    } else if headers.remove(TE).is_some() {
        warn!("TE headers illegal in HTTP/2 responses");
    }

    if let Some(header) = headers.remove(CONNECTION) {
        warn!(
            "Connection header illegal in HTTP/2: {}",
            CONNECTION.as_str()
        );

        // A `Connection` header may have a comma-separated list of names of other headers that
        // are meant for only this specific connection.
        //
        // Iterate these names and remove them as headers. Connection-specific headers are
        // forbidden in HTTP2, as that information has been moved into frame types of the h2
        // protocol.
        if let Ok(header_contents) = header.to_str() {
            for name in header_contents.split(',') {
                let name = name.trim();
                headers.remove(name);
            }
        }
    }
}

// body adapters used by both Client and Server

/// Streams `body` onto an h2 stream, ending it with trailers or an empty
/// end-of-stream DATA frame.
///
/// `on_progress` is called after each chunk is handed to the codec.
pub(crate) async fn send_body<F>(
    body: &mut Body,
    tx: &mut SendStream<Bytes>,
    mut on_progress: F,
) -> crate::Result<()>
where
    F: FnMut(usize),
{
    loop {
        check_reset(tx).await?;

        let chunk = match body.data().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                debug!("send body user stream error: {}", err);
                tx.send_reset(err.h2_reason());
                return Err(err);
            }
            None => break,
        };
        if chunk.is_empty() {
            continue;
        }

        // we don't have the next chunk of data yet, so just reserve 1 byte to make
        // sure there's some capacity available. h2 will handle the capacity management
        // for the actual body chunk.
        tx.reserve_capacity(1);
        if tx.capacity() == 0 {
            loop {
                match poll_fn(|cx| tx.poll_capacity(cx)).await {
                    Some(Ok(0)) => {}
                    Some(Ok(_)) => break,
                    Some(Err(err)) => return Err(crate::Error::new_h2(err)),
                    None => return Err(crate::Error::new_closed()),
                }
            }
        }

        let len = chunk.len();
        trace!("send body chunk: {} bytes", len);
        tx.send_data(chunk, false).map_err(crate::Error::new_h2)?;
        on_progress(len);
    }

    tx.reserve_capacity(0);
    match body.trailers().await? {
        Some(trailers) => {
            trace!("send body trailers");
            tx.send_trailers(trailers).map_err(crate::Error::new_h2)
        }
        None => {
            trace!("send body eos");
            tx.send_data(Bytes::new(), true).map_err(crate::Error::new_h2)
        }
    }
}

async fn check_reset(tx: &mut SendStream<Bytes>) -> crate::Result<()> {
    let reset = poll_fn(|cx| match tx.poll_reset(cx) {
        Poll::Ready(res) => Poll::Ready(Some(res)),
        Poll::Pending => Poll::Ready(None),
    })
    .await;
    match reset {
        Some(Ok(reason)) => {
            debug!("stream received RST_STREAM: {:?}", reason);
            Err(crate::Error::new_h2(h2::Error::from(reason)))
        }
        Some(Err(err)) => Err(crate::Error::new_h2(err)),
        None => Ok(()),
    }
}

/// Collects a whole inbound h2 body, releasing flow-control capacity as
/// data arrives.
pub(crate) async fn recv_body<F>(
    mut recv: RecvStream,
    mut on_progress: F,
) -> crate::Result<(Bytes, Option<HeaderMap>)>
where
    F: FnMut(usize),
{
    let mut buf = BytesMut::new();
    while let Some(chunk) = recv.data().await {
        let chunk = chunk.map_err(crate::Error::new_h2)?;
        let len = chunk.len();
        let _ = recv.flow_control().release_capacity(len);
        on_progress(len);
        buf.extend_from_slice(&chunk);
    }
    let trailers = recv.trailers().await.map_err(crate::Error::new_h2)?;
    Ok((buf.freeze(), trailers))
}
