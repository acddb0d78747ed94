//! Client connections.
//!
//! A connection is either an HTTP/1.1 connection, which carries one
//! exchange at a time, or a handle to a multiplexed HTTP/2 connection.

use std::time::Duration;

use http::{HeaderMap, Method, Uri};

use crate::message::{Body, Head, Message};
use crate::proto;

pub(crate) mod http1;
pub(crate) mod http2;
pub(crate) mod mux;

/// Settings shared by every connection a client opens.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    /// Idle period after which an exchange (HTTP/1.1) or stream (HTTP/2)
    /// is failed. `None` disables the timers.
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) h2_stream_idle_timeouts: bool,
    pub(crate) h2_connection_idle_timeout: Option<Duration>,
    pub(crate) h2: proto::h2::Config,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            idle_timeout: Some(Duration::from_secs(60)),
            h2_stream_idle_timeouts: true,
            h2_connection_idle_timeout: None,
            h2: proto::h2::Config::default(),
        }
    }
}

/// The outbound half of an exchange, taken apart for the wire.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
}

impl Request {
    /// Splits a request message. Response messages are rejected.
    pub(crate) fn from_message(message: Message) -> crate::Result<Request> {
        match message.into_parts() {
            (Head::Request { method, uri }, headers, body) => Ok(Request {
                method,
                uri,
                headers,
                body,
            }),
            (Head::Response { .. }, _, _) => Err(crate::Error::new_user_absolute_uri_required()),
        }
    }
}
