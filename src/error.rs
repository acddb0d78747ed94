//! Error and Result module.
use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::client::Phase;
use crate::version::Version;

/// Result type often returned from methods that can have phasewire `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Message of the timeout raised while the request body is still being written.
pub const IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY: &str =
    "Idle timeout triggered while writing outbound request body";

/// Message of the timeout raised after the request was written but before any
/// byte of the response arrived.
pub const IDLE_TIMEOUT_TRIGGERED_BEFORE_INITIATING_INBOUND_RESPONSE: &str =
    "Idle timeout triggered before initiating inbound response";

/// Message of the timeout raised while the response is being read.
pub const IDLE_TIMEOUT_TRIGGERED_WHILE_READING_INBOUND_RESPONSE_BODY: &str =
    "Idle timeout triggered while reading inbound response body";

/// Message of the timeout raised for a whole HTTP/2 connection.
pub const IDLE_TIMEOUT_TRIGGERED_ON_CONNECTION: &str = "Idle timeout triggered on connection";

/// Represents errors that can occur handling HTTP exchanges.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    version: Option<Version>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Kind {
    Parse(Parse),
    /// A message reached EOF, but is not complete.
    Incomplete,
    /// The idle timer of an exchange or connection expired.
    IdleTimeout(Timeout),
    /// The exchange was canceled by the caller.
    Canceled,
    /// Indicates a connection or channel is closed.
    Closed,
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    Io,
    /// Error occurred while connecting.
    Connect,
    /// Error creating a TcpListener.
    #[cfg(feature = "server")]
    Listen,
    /// Error accepting on a TcpListener.
    #[cfg(feature = "server")]
    Accept,
    /// The request body producer failed.
    Producer,
    /// The exchange was asked to make a transition its phase table forbids.
    IllegalTransition { from: Phase, to: Phase },
    /// The exchange was already settled when the operation was attempted.
    Settled,
    /// A general error from h2.
    Http2,
    /// User tried to send a Request with Client with non-absolute URI.
    AbsoluteUriRequired,
    /// User tried to send a Request with a scheme other than `http`.
    UnsupportedScheme,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum Timeout {
    Phase(Phase),
    Connection,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    Header,
    TooLarge,
    Status,
    Chunk,
    /// The peer answered an upgrade offer with `101`, which the h2 codec cannot adopt.
    SwitchingProtocols,
}

impl Error {
    /// Returns true if this was an idle timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::IdleTimeout(_))
    }

    /// Returns the phase an idle timeout was attributed to.
    ///
    /// Connection-scoped timeouts return `None`.
    pub fn timeout_phase(&self) -> Option<Phase> {
        match self.inner.kind {
            Kind::IdleTimeout(Timeout::Phase(phase)) => Some(phase),
            _ => None,
        }
    }

    /// Returns true if this was a timeout of a whole HTTP/2 connection.
    pub fn is_connection_timeout(&self) -> bool {
        self.inner.kind == Kind::IdleTimeout(Timeout::Connection)
    }

    /// Returns true if this was about a request that was canceled.
    pub fn is_canceled(&self) -> bool {
        self.inner.kind == Kind::Canceled
    }

    /// Returns true if a connection or channel is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.kind == Kind::Closed
    }

    /// Returns true if this was an error establishing the connection.
    pub fn is_connect(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Connect | Kind::AbsoluteUriRequired | Kind::UnsupportedScheme
        )
    }

    /// Returns true if the peer sent something malformed or incomplete.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Parse(_) | Kind::Incomplete | Kind::Http2
        )
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the body producer failed while writing.
    pub fn is_producer(&self) -> bool {
        self.inner.kind == Kind::Producer
    }

    /// Returns true if this was an `io::Error` on the socket.
    pub fn is_io(&self) -> bool {
        self.inner.kind == Kind::Io
    }

    /// Returns true if this error is a programming fault: an exchange was
    /// asked to make a phase transition that is not allowed.
    pub fn is_illegal_transition(&self) -> bool {
        matches!(self.inner.kind, Kind::IllegalTransition { .. })
    }

    /// The protocol label of the exchange that failed, if it got that far.
    pub fn version(&self) -> Option<Version> {
        self.inner.version
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind, cause: Option<Cause>) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause,
                version: None,
            }),
        }
    }

    pub(crate) fn with_version(mut self, version: Version) -> Error {
        self.inner.version.get_or_insert(version);
        self
    }

    pub(crate) fn h2_reason(&self) -> h2::Reason {
        // Find an h2::Reason somewhere in the cause stack, if it exists,
        // otherwise assume an INTERNAL_ERROR.
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(h2_err) = err.downcast_ref::<h2::Error>() {
                return h2_err.reason().unwrap_or(h2::Reason::INTERNAL_ERROR);
            }
            cause = err.source();
        }

        // else
        h2::Reason::INTERNAL_ERROR
    }

    pub(crate) fn new_idle_timeout(phase: Phase) -> Error {
        Error::new(Kind::IdleTimeout(Timeout::Phase(phase)), None)
    }

    pub(crate) fn new_connection_timeout() -> Error {
        Error::new(Kind::IdleTimeout(Timeout::Connection), None)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled, None)
    }

    pub(crate) fn new_settled() -> Error {
        Error::new(Kind::Settled, None)
    }

    pub(crate) fn new_illegal_transition(from: Phase, to: Phase) -> Error {
        Error::new(Kind::IllegalTransition { from, to }, None)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::Incomplete, None)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge), None)
    }

    pub(crate) fn new_header() -> Error {
        Error::new(Kind::Parse(Parse::Header), None)
    }

    pub(crate) fn new_chunk<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Parse(Parse::Chunk), Some(cause.into()))
    }

    pub(crate) fn new_switching_protocols() -> Error {
        Error::new(Kind::Parse(Parse::SwitchingProtocols), None)
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io, Some(cause.into()))
    }

    #[cfg(feature = "server")]
    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen, Some(cause.into()))
    }

    #[cfg(feature = "server")]
    pub(crate) fn new_accept<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Accept, Some(cause.into()))
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect, Some(cause.into()))
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed, None)
    }

    pub(crate) fn new_producer<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Producer, Some(cause.into()))
    }

    pub(crate) fn new_user_absolute_uri_required() -> Error {
        Error::new(Kind::AbsoluteUriRequired, None)
    }

    pub(crate) fn new_user_unsupported_scheme() -> Error {
        Error::new(Kind::UnsupportedScheme, None)
    }

    pub(crate) fn new_h2(cause: h2::Error) -> Error {
        if cause.is_io() {
            Error::new_io(cause.into_io().expect("h2::Error::is_io"))
        } else {
            Error::new(Kind::Http2, Some(Box::new(cause)))
        }
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Parse(Parse::Chunk) => "invalid chunked body framing",
            Kind::Parse(Parse::SwitchingProtocols) => {
                "peer switched protocols on the offering exchange"
            }
            Kind::Incomplete => "connection closed before message completed",
            Kind::IdleTimeout(Timeout::Phase(Phase::WritingRequest)) => {
                IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY
            }
            Kind::IdleTimeout(Timeout::Phase(Phase::AwaitingResponse)) => {
                IDLE_TIMEOUT_TRIGGERED_BEFORE_INITIATING_INBOUND_RESPONSE
            }
            Kind::IdleTimeout(Timeout::Phase(Phase::ReadingResponse)) => {
                IDLE_TIMEOUT_TRIGGERED_WHILE_READING_INBOUND_RESPONSE_BODY
            }
            Kind::IdleTimeout(Timeout::Phase(_)) => "Idle timeout triggered",
            Kind::IdleTimeout(Timeout::Connection) => IDLE_TIMEOUT_TRIGGERED_ON_CONNECTION,
            Kind::Canceled => "request canceled by caller",
            Kind::Closed => "connection closed",
            Kind::Io => "connection error",
            Kind::Connect => "error trying to connect",
            #[cfg(feature = "server")]
            Kind::Listen => "error creating server listener",
            #[cfg(feature = "server")]
            Kind::Accept => "error accepting connection",
            Kind::Producer => "error from request body producer",
            Kind::IllegalTransition { .. } => "illegal exchange phase transition",
            Kind::Settled => "exchange already settled",
            Kind::Http2 => "http2 error",
            Kind::AbsoluteUriRequired => "client requires absolute-form URIs",
            Kind::UnsupportedScheme => "client supports only the http scheme",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("phasewire::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        if let Some(ref version) = self.inner.version {
            f.field(version);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            // timeout messages are matched verbatim by callers
            Kind::IdleTimeout(_) => f.write_str(self.description()),
            Kind::IllegalTransition { from, to } => {
                write!(f, "{}: {:?} -> {:?}", self.description(), from, to)
            }
            _ => {
                if let Some(ref cause) = self.inner.cause {
                    write!(f, "{}: {}", self.description(), cause)
                } else {
                    f.write_str(self.description())
                }
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err), None)
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Status,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<http::method::InvalidMethod> for Parse {
    fn from(_: http::method::InvalidMethod) -> Parse {
        Parse::Method
    }
}

impl From<http::status::InvalidStatusCode> for Parse {
    fn from(_: http::status::InvalidStatusCode) -> Parse {
        Parse::Status
    }
}

impl From<http::uri::InvalidUri> for Parse {
    fn from(_: http::uri::InvalidUri) -> Parse {
        Parse::Uri
    }
}
