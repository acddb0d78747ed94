#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # phasewire
//!
//! phasewire is an HTTP/1.1 and HTTP/2 transport that acts as both a
//! [`Client`](client::Client) and a [`Server`](server::Server) on shared
//! connection infrastructure.
//!
//! Every outbound request is tracked as an *exchange* that moves through a
//! fixed set of [phases](client::Phase). An idle timer watches each
//! exchange (the whole connection for HTTP/1.1, a single stream for HTTP/2)
//! and, when the peer or the local body producer stops making progress,
//! fails the exchange with an error naming the phase it stalled in:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//! use phasewire::{Client, Message, Method};
//!
//! let client = Client::builder()
//!     .socket_idle_timeout(Duration::from_secs(3))
//!     .build();
//!
//! let (request, mut body) = Message::delayed_request(Method::POST, "http://127.0.0.1:9000/".parse()?);
//! let response = client.send(request);
//! body.send_data("Content data part1".into()).await?;
//!
//! match response.await {
//!     Ok(msg) => println!("status: {:?}", msg.status()),
//!     Err(err) if err.is_timeout() => println!("{}", err),
//!     Err(err) => return Err(err.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Responses are delivered exactly once, either by awaiting the
//! [`ResponseFuture`](client::ResponseFuture), by a blocking wait, or through
//! a registered [`ResponseListener`](client::ResponseListener).

#[doc(hidden)]
pub use http;

pub use http::{header, HeaderMap, Method, StatusCode, Uri};

pub use crate::client::{Client, ResponseFuture, ResponseListener};
pub use crate::error::{
    Error, Result, IDLE_TIMEOUT_TRIGGERED_BEFORE_INITIATING_INBOUND_RESPONSE,
    IDLE_TIMEOUT_TRIGGERED_ON_CONNECTION, IDLE_TIMEOUT_TRIGGERED_WHILE_READING_INBOUND_RESPONSE_BODY,
    IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY,
};
pub use crate::message::{Body, Message, Sender};
#[cfg(feature = "server")]
pub use crate::server::Server;
pub use crate::version::Version;

mod common;
pub mod client;
mod error;
pub mod message;
mod proto;
#[cfg(feature = "server")]
pub mod server;
mod version;
