use std::cmp;
use std::io;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::io::Buffered;

use self::Kind::{Chunked, Eof, Length};

/// Maximum amount of trailer bytes accepted after a chunked body.
const TRAILER_LIMIT: usize = 16 * 1024;

/// Decoders to handle different Transfer-Encodings.
///
/// If a message body does not include a Transfer-Encoding, it *should*
/// include a Content-Length header.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    /// A Reader used when a Content-Length header is passed with a positive integer.
    Length(u64),
    /// A Reader used when Transfer-Encoding is `chunked`.
    Chunked(ChunkedState),
    /// A Reader used for responses that don't indicate a length or chunked.
    ///
    /// The bool tracks when EOF is seen on the transport.
    Eof(bool),
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Size,
    Body(u64),
    End,
}

/// One step of body decoding.
#[derive(Debug, PartialEq)]
pub(crate) enum Decoded {
    Data(Bytes),
    End(Option<HeaderMap>),
}

impl Decoder {
    // constructors

    pub(crate) fn length(x: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(x),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked(ChunkedState::Size),
        }
    }

    pub(crate) fn eof() -> Decoder {
        Decoder {
            kind: Kind::Eof(false),
        }
    }

    // methods

    #[cfg(test)]
    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self.kind,
            Length(0) | Chunked(ChunkedState::End) | Eof(true)
        )
    }

    /// Returns true if the body ends only when the peer closes the
    /// connection, which rules out reuse.
    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.kind, Eof(_))
    }

    /// Decodes the next piece of the body from `io`.
    pub(crate) async fn decode<T>(&mut self, io: &mut Buffered<T>) -> crate::Result<Decoded>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Decoded::End(None));
                }
                let to_read = cmp::min(*remaining, usize::MAX as u64) as usize;
                let buf = io.read_mem(to_read).await.map_err(map_io)?;
                if buf.is_empty() {
                    trace!("incomplete sized body, {} bytes remaining", remaining);
                    return Err(crate::Error::new_incomplete());
                }
                *remaining -= buf.len() as u64;
                Ok(Decoded::Data(buf))
            }
            Chunked(ref mut state) => match *state {
                ChunkedState::Size => {
                    let line = io.read_line().await.map_err(map_io)?;
                    let size = parse_chunk_size(&line)?;
                    trace!("chunk size={}", size);
                    if size == 0 {
                        let trailers = read_trailers(io).await?;
                        *state = ChunkedState::End;
                        Ok(Decoded::End(trailers))
                    } else {
                        *state = ChunkedState::Body(size);
                        Ok(Decoded::Data(Bytes::new()))
                    }
                }
                ChunkedState::Body(remaining) => {
                    let to_read = cmp::min(remaining, usize::MAX as u64) as usize;
                    let buf = io.read_mem(to_read).await.map_err(map_io)?;
                    if buf.is_empty() {
                        return Err(crate::Error::new_incomplete());
                    }
                    let left = remaining - buf.len() as u64;
                    if left == 0 {
                        let crlf = io.read_line().await.map_err(map_io)?;
                        if !crlf.is_empty() {
                            return Err(crate::Error::new_chunk("chunk data not followed by CRLF"));
                        }
                        *state = ChunkedState::Size;
                    } else {
                        *state = ChunkedState::Body(left);
                    }
                    Ok(Decoded::Data(buf))
                }
                ChunkedState::End => Ok(Decoded::End(None)),
            },
            Eof(ref mut is_eof) => {
                if *is_eof {
                    return Ok(Decoded::End(None));
                }
                let buf = io.read_mem(usize::MAX).await.map_err(map_io)?;
                if buf.is_empty() {
                    *is_eof = true;
                    Ok(Decoded::End(None))
                } else {
                    Ok(Decoded::Data(buf))
                }
            }
        }
    }
}

fn map_io(err: io::Error) -> crate::Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        crate::Error::new_incomplete()
    } else {
        crate::Error::new_io(err)
    }
}

fn parse_chunk_size(line: &[u8]) -> crate::Result<u64> {
    // extensions after ';' are ignored
    let digits = line.split(|&b| b == b';').next().unwrap_or_default();
    let digits = std::str::from_utf8(digits)
        .map_err(|_| crate::Error::new_chunk("invalid chunk size line"))?
        .trim();
    if digits.is_empty() || digits.len() > 16 {
        return Err(crate::Error::new_chunk("invalid chunk size line"));
    }
    u64::from_str_radix(digits, 16).map_err(crate::Error::new_chunk)
}

async fn read_trailers<T>(io: &mut Buffered<T>) -> crate::Result<Option<HeaderMap>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut trailers = HeaderMap::new();
    let mut total = 0;
    loop {
        let line = io.read_line().await.map_err(map_io)?;
        if line.is_empty() {
            break;
        }
        total += line.len();
        if total > TRAILER_LIMIT {
            return Err(crate::Error::new_too_large());
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(crate::Error::new_header)?;
        let name =
            HeaderName::from_bytes(&line[..colon]).map_err(|_| crate::Error::new_header())?;
        let value = trim(&line[colon + 1..]);
        let value = HeaderValue::from_bytes(value).map_err(|_| crate::Error::new_header())?;
        trailers.append(name, value);
    }
    Ok(if trailers.is_empty() {
        None
    } else {
        Some(trailers)
    })
}

fn trim(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(decoder: &mut Decoder, raw: &'static [u8]) -> crate::Result<(Vec<u8>, Option<HeaderMap>)> {
        let mock = tokio_test::io::Builder::new().read(raw).build();
        let mut io = Buffered::new(mock);
        let mut body = Vec::new();
        loop {
            match decoder.decode(&mut io).await? {
                Decoded::Data(chunk) => body.extend_from_slice(&chunk),
                Decoded::End(trailers) => return Ok((body, trailers)),
            }
        }
    }

    #[tokio::test]
    async fn test_read_length() {
        let mut decoder = Decoder::length(5);
        let (body, trailers) = collect(&mut decoder, b"hello").await.unwrap();
        assert_eq!(body, b"hello");
        assert!(trailers.is_none());
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn test_read_length_short() {
        let mut decoder = Decoder::length(10);
        let err = collect(&mut decoder, b"hello").await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_read_chunked_with_extensions_and_trailers() {
        let mut decoder = Decoder::chunked();
        let raw = b"5;foo=bar\r\nhello\r\n6\r\n world\r\n0\r\nExpires: never\r\nx-sum:  abc \r\n\r\n";
        let (body, trailers) = collect(&mut decoder, raw).await.unwrap();
        assert_eq!(body, b"hello world");
        let trailers = trailers.expect("trailers");
        assert_eq!(trailers["expires"], "never");
        assert_eq!(trailers["x-sum"], "abc");
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn test_read_chunked_invalid() {
        let mut decoder = Decoder::chunked();
        let err = collect(&mut decoder, b"zz\r\nhello\r\n").await.unwrap_err();
        assert!(err.is_protocol());

        let mut decoder = Decoder::chunked();
        let err = collect(&mut decoder, b"5\r\nhelloXX0\r\n\r\n").await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_read_chunked_early_eof() {
        let mut decoder = Decoder::chunked();
        let err = collect(&mut decoder, b"9\r\nfoo bar").await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_read_eof() {
        let mut decoder = Decoder::eof();
        assert!(decoder.is_close_delimited());
        let (body, _) = collect(&mut decoder, b"until close").await.unwrap();
        assert_eq!(body, b"until close");
        assert!(decoder.is_eof());
    }
}
