use std::fmt::{self, Write};
use std::time::SystemTime;

use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, DATE, HOST, TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tracing::{debug, trace};

use super::decode::Decoder;
use super::encode::Encoder;
use crate::error::Parse;

const MAX_HEADERS: usize = 100;
const AVERAGE_HEADER_SIZE: usize = 30;

/// The token offered in `Upgrade` for cleartext HTTP/2.
pub(crate) const H2C: &str = "h2c";

/// The header carrying the base64url SETTINGS payload of an h2c offer.
pub(crate) const HTTP2_SETTINGS: &str = "http2-settings";

#[cfg(feature = "server")]
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// Parses a request head from the front of `buf`.
///
/// Returns the head and the number of bytes it occupied, or `None` if
/// more bytes are needed.
#[cfg(feature = "server")]
pub(crate) fn parse_request(buf: &[u8]) -> crate::Result<Option<(RequestHead, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    trace!("Request.parse([Header; {}], [u8; {}])", headers.len(), buf.len());
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf).map_err(Parse::from)? {
        httparse::Status::Complete(len) => {
            trace!("Request.parse Complete({})", len);
            let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
                .map_err(Parse::from)?;
            let uri = req
                .path
                .unwrap_or_default()
                .parse::<Uri>()
                .map_err(Parse::from)?;
            let version = if req.version == Some(1) {
                Version::HTTP_11
            } else {
                Version::HTTP_10
            };
            let headers = to_header_map(req.headers)?;
            Ok(Some((
                RequestHead {
                    method,
                    uri,
                    version,
                    headers,
                },
                len,
            )))
        }
        httparse::Status::Partial => Ok(None),
    }
}

/// Parses a response head from the front of `buf`.
pub(crate) fn parse_response(buf: &[u8]) -> crate::Result<Option<(ResponseHead, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    trace!("Response.parse([Header; {}], [u8; {}])", headers.len(), buf.len());
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(buf).map_err(Parse::from)? {
        httparse::Status::Complete(len) => {
            trace!("Response.parse Complete({})", len);
            let status = StatusCode::from_u16(res.code.unwrap_or_default()).map_err(Parse::from)?;
            let version = if res.version == Some(1) {
                Version::HTTP_11
            } else {
                Version::HTTP_10
            };
            let headers = to_header_map(res.headers)?;
            Ok(Some((
                ResponseHead {
                    status,
                    version,
                    headers,
                },
                len,
            )))
        }
        httparse::Status::Partial => Ok(None),
    }
}

fn to_header_map(raw: &[httparse::Header<'_>]) -> crate::Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| Parse::Header)?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| Parse::Header)?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Picks the body decoder for an inbound request.
#[cfg(feature = "server")]
pub(crate) fn request_decoder(head: &RequestHead) -> crate::Result<Decoder> {
    // According to https://tools.ietf.org/html/rfc7230#section-3.3.3
    // 3. Transfer-Encoding: chunked has a chunked body.
    // 5. Content-Length header has a sized body.
    // 6. Length 0.
    if head.headers.contains_key(TRANSFER_ENCODING) {
        if head.version == Version::HTTP_10 {
            debug!("HTTP/1.0 cannot have Transfer-Encoding header");
            Err(Parse::Header.into())
        } else if is_chunked(&head.headers) {
            Ok(Decoder::chunked())
        } else {
            debug!("request with transfer-encoding header, but not chunked, bad request");
            Err(Parse::Header.into())
        }
    } else if let Some(len) = content_length(&head.headers)? {
        Ok(Decoder::length(len))
    } else {
        Ok(Decoder::length(0))
    }
}

/// Picks the body decoder for an inbound response to `method`.
///
/// Informational responses are skipped by the caller before this is asked.
pub(crate) fn response_decoder(head: &ResponseHead, method: &Method) -> crate::Result<Decoder> {
    // According to https://tools.ietf.org/html/rfc7230#section-3.3.3
    // 1. HEAD responses, and Status 1xx, 204, and 304 cannot have a body.
    // 3. Transfer-Encoding: chunked has a chunked body.
    // 5. Content-Length header has a sized body.
    // 7. Read till EOF.
    match head.status.as_u16() {
        204 | 304 => return Ok(Decoder::length(0)),
        _ => (),
    }
    if *method == Method::HEAD {
        return Ok(Decoder::length(0));
    }

    if head.headers.contains_key(TRANSFER_ENCODING) {
        if head.version == Version::HTTP_10 {
            debug!("HTTP/1.0 cannot have Transfer-Encoding header");
            Err(Parse::Header.into())
        } else if is_chunked(&head.headers) {
            Ok(Decoder::chunked())
        } else {
            trace!("not chunked, read till eof");
            Ok(Decoder::eof())
        }
    } else if let Some(len) = content_length(&head.headers)? {
        Ok(Decoder::length(len))
    } else {
        trace!("neither Transfer-Encoding nor Content-Length");
        Ok(Decoder::eof())
    }
}

/// Writes a request head into `dst` and returns the encoder for its body.
///
/// `body_len` is the exact body length when known up front; `trailers`
/// tells whether trailers may follow, which forces chunked framing.
pub(crate) fn encode_request(
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body_len: Option<u64>,
    trailers: bool,
    dst: &mut Vec<u8>,
) -> Encoder {
    if !headers.contains_key(HOST) {
        if let Some(authority) = uri.authority() {
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(HOST, host);
            }
        }
    }

    let encoder = match body_len {
        Some(0) if !trailers => {
            headers.remove(TRANSFER_ENCODING);
            if *method == Method::POST || *method == Method::PUT {
                set_content_length(headers, 0)
            } else {
                headers.remove(CONTENT_LENGTH);
                Encoder::length(0)
            }
        }
        Some(len) if !trailers => {
            headers.remove(TRANSFER_ENCODING);
            set_content_length(headers, len)
        }
        _ => match content_length(headers) {
            Ok(Some(len)) if !trailers => Encoder::length(len),
            _ => {
                headers.remove(CONTENT_LENGTH);
                headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                Encoder::chunked()
            }
        },
    };

    dst.reserve(30 + headers.len() * AVERAGE_HEADER_SIZE);
    extend(dst, method.as_str().as_bytes());
    extend(dst, b" ");
    match uri.path_and_query() {
        Some(path) if !path.as_str().is_empty() => {
            let _ = write!(FastWrite(dst), "{}", path);
        }
        _ => extend(dst, b"/"),
    }
    extend(dst, b" HTTP/1.1\r\n");
    write_headers(headers, dst);
    extend(dst, b"\r\n");
    encoder
}

/// Writes a response head into `dst` and returns the encoder for its body.
#[cfg(feature = "server")]
pub(crate) fn encode_response(
    status: StatusCode,
    headers: &mut HeaderMap,
    body_len: Option<u64>,
    trailers: bool,
    head_request: bool,
    dst: &mut Vec<u8>,
) -> Encoder {
    if !headers.contains_key(DATE) {
        if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
            headers.insert(DATE, date);
        }
    }

    let bodyless = head_request
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
    let encoder = match body_len {
        _ if bodyless => Encoder::length(0),
        Some(len) if !trailers => {
            headers.remove(TRANSFER_ENCODING);
            set_content_length(headers, len)
        }
        _ => {
            headers.remove(CONTENT_LENGTH);
            headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            Encoder::chunked()
        }
    };

    dst.reserve(30 + headers.len() * AVERAGE_HEADER_SIZE);
    extend(dst, b"HTTP/1.1 ");
    extend(dst, status.as_str().as_bytes());
    extend(dst, b" ");
    extend(dst, status.canonical_reason().unwrap_or("<none>").as_bytes());
    extend(dst, b"\r\n");
    write_headers(headers, dst);
    extend(dst, b"\r\n");
    encoder
}

fn set_content_length(headers: &mut HeaderMap, len: u64) -> Encoder {
    let mut buf = itoa::Buffer::new();
    if let Ok(value) = HeaderValue::from_str(buf.format(len)) {
        headers.insert(CONTENT_LENGTH, value);
    }
    Encoder::length(len)
}

/// Returns the declared content length, if any.
///
/// Multiple differing values are an error.
pub(crate) fn content_length(headers: &HeaderMap) -> crate::Result<Option<u64>> {
    let mut found = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let len = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or(Parse::Header)?;
        match found {
            Some(prev) if prev != len => {
                debug!("multiple Content-Length headers with different values");
                return Err(Parse::Header.into());
            }
            _ => found = Some(len),
        }
    }
    Ok(found)
}

fn is_chunked(headers: &HeaderMap) -> bool {
    // chunked must always be the last encoding, per RFC 7230
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .last()
        .and_then(|value| value.to_str().ok())
        .and_then(|s| s.rsplit(',').next())
        .map_or(false, |last| last.trim().eq_ignore_ascii_case("chunked"))
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|s| s.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Returns true if the connection may carry another message after this one.
pub(crate) fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if has_token(headers, CONNECTION, "close") {
        return false;
    }
    version == Version::HTTP_11 || has_token(headers, CONNECTION, "keep-alive")
}

/// Adds the headers offering a switch to cleartext HTTP/2.
pub(crate) fn offer_h2c(headers: &mut HeaderMap, settings: &str) {
    if let Ok(value) = HeaderValue::from_str(settings) {
        headers.insert(UPGRADE, HeaderValue::from_static(H2C));
        headers.insert(
            CONNECTION,
            HeaderValue::from_static("Upgrade, HTTP2-Settings"),
        );
        headers.insert(HeaderName::from_static(HTTP2_SETTINGS), value);
    }
}

/// Returns the SETTINGS payload of a request offering h2c, if it offers one.
#[cfg(feature = "server")]
pub(crate) fn h2c_offer(headers: &HeaderMap) -> Option<&str> {
    if !has_token(headers, UPGRADE, H2C) || !has_token(headers, CONNECTION, "upgrade") {
        return None;
    }
    headers
        .get(HTTP2_SETTINGS)
        .and_then(|value| value.to_str().ok())
}

/// Returns true if a response advertises the switch to h2c.
pub(crate) fn accepts_h2c(status: StatusCode, headers: &HeaderMap) -> bool {
    status != StatusCode::SWITCHING_PROTOCOLS && has_token(headers, UPGRADE, H2C)
}

/// Removes the h2c offer from a request before it is handed to a listener.
#[cfg(feature = "server")]
pub(crate) fn strip_h2c_offer(headers: &mut HeaderMap) {
    headers.remove(UPGRADE);
    headers.remove(HTTP2_SETTINGS);
    headers.remove(CONNECTION);
}

fn write_headers(headers: &HeaderMap, dst: &mut Vec<u8>) {
    for (name, value) in headers {
        extend(dst, name.as_str().as_bytes());
        extend(dst, b": ");
        extend(dst, value.as_bytes());
        extend(dst, b"\r\n");
    }
}

pub(super) struct FastWrite<'a>(pub(super) &'a mut Vec<u8>);

impl<'a> fmt::Write for FastWrite<'a> {
    #[inline]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        extend(self.0, s.as_bytes());
        Ok(())
    }

    #[inline]
    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> fmt::Result {
        fmt::write(self, args)
    }
}

#[inline]
pub(super) fn extend(dst: &mut Vec<u8>, data: &[u8]) {
    dst.extend_from_slice(data);
}
