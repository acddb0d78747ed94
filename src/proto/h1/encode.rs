use std::fmt::Write;

use http::HeaderMap;
use tracing::{debug, trace};

use super::role::{extend, FastWrite};

/// Encoders to handle different Transfer-Encodings.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum Kind {
    /// An Encoder for when Transfer-Encoding includes `chunked`.
    Chunked,
    /// An Encoder for when Content-Length is set.
    ///
    /// Enforces that the body is not longer than the Content-Length header.
    Length(u64),
}

impl Encoder {
    pub(crate) fn chunked() -> Encoder {
        Encoder {
            kind: Kind::Chunked,
        }
    }

    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked)
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(self.kind, Kind::Length(0))
    }

    /// Frames one body chunk into `dst`.
    pub(crate) fn encode(&mut self, chunk: &[u8], dst: &mut Vec<u8>) -> crate::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        match self.kind {
            Kind::Chunked => {
                trace!("encoding chunked {}B", chunk.len());
                let _ = write!(FastWrite(dst), "{:X}\r\n", chunk.len());
                extend(dst, chunk);
                extend(dst, b"\r\n");
            }
            Kind::Length(ref mut remaining) => {
                let len = chunk.len() as u64;
                if len > *remaining {
                    debug!("body exceeds declared length by {}B", len - *remaining);
                    return Err(crate::Error::new_producer(
                        "body is longer than its content-length",
                    ));
                }
                trace!("sized write, len = {}", len);
                *remaining -= len;
                extend(dst, chunk);
            }
        }
        Ok(())
    }

    /// Writes the end of the body, with trailers if the framing allows.
    pub(crate) fn end(&self, trailers: Option<&HeaderMap>, dst: &mut Vec<u8>) -> crate::Result<()> {
        match self.kind {
            Kind::Chunked => {
                extend(dst, b"0\r\n");
                if let Some(trailers) = trailers {
                    for (name, value) in trailers {
                        extend(dst, name.as_str().as_bytes());
                        extend(dst, b": ");
                        extend(dst, value.as_bytes());
                        extend(dst, b"\r\n");
                    }
                }
                extend(dst, b"\r\n");
                Ok(())
            }
            Kind::Length(0) => {
                if trailers.is_some() {
                    debug!("dropping trailers of a sized body");
                }
                Ok(())
            }
            Kind::Length(remaining) => {
                debug!("body ended {}B short of its content-length", remaining);
                Err(crate::Error::new_producer(
                    "body is shorter than its content-length",
                ))
            }
        }
    }
}
