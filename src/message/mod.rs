//! HTTP messages carried over phasewire connections.
//!
//! A [`Message`] is one request or one response: its head, headers, the
//! protocol it travelled over, and a [`Body`]. Requests whose body is
//! produced incrementally are created with [`Message::delayed_request`],
//! which hands back the [`Sender`] that feeds the body.

use std::fmt;

use http::{HeaderMap, Method, StatusCode, Uri};

pub use self::body::{Body, Sender};
use crate::version::Version;

mod body;

/// One logical HTTP message.
pub struct Message {
    head: Head,
    version: Version,
    headers: HeaderMap,
    body: Body,
}

#[derive(Debug)]
pub(crate) enum Head {
    Request { method: Method, uri: Uri },
    Response { status: StatusCode },
}

impl Message {
    /// Creates a request message with a fully buffered body.
    pub fn request(method: Method, uri: Uri, body: impl Into<Body>) -> Message {
        Message::new(Head::Request { method, uri }, body.into())
    }

    /// Creates a request message whose body is produced through the
    /// returned [`Sender`].
    ///
    /// The message ends when the sender is finished or dropped. Until then
    /// the request stays in its writing phase.
    pub fn delayed_request(method: Method, uri: Uri) -> (Message, Sender) {
        let (tx, body) = Body::channel();
        (Message::new(Head::Request { method, uri }, body), tx)
    }

    /// Creates a response message.
    pub fn response(status: StatusCode, body: impl Into<Body>) -> Message {
        Message::new(Head::Response { status }, body.into())
    }

    fn new(head: Head, body: Body) -> Message {
        Message {
            head,
            version: Version::default(),
            headers: HeaderMap::new(),
            body,
        }
    }

    /// The request method, if this is a request.
    pub fn method(&self) -> Option<&Method> {
        match self.head {
            Head::Request { ref method, .. } => Some(method),
            Head::Response { .. } => None,
        }
    }

    /// The request target, if this is a request.
    pub fn uri(&self) -> Option<&Uri> {
        match self.head {
            Head::Request { ref uri, .. } => Some(uri),
            Head::Response { .. } => None,
        }
    }

    /// The response status, if this is a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self.head {
            Head::Response { status } => Some(status),
            Head::Request { .. } => None,
        }
    }

    /// Returns true if this message is a request.
    pub fn is_request(&self) -> bool {
        matches!(self.head, Head::Request { .. })
    }

    /// The protocol version this message travelled over.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The headers, with case-insensitive names and duplicates kept in
    /// insertion order.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Mutable access to the body.
    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Consumes the message, returning its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Returns true if the body is produced incrementally, possibly slowly.
    pub fn is_delayed(&self) -> bool {
        self.body.is_delayed()
    }

    pub(crate) fn from_parts(head: Head, version: Version, headers: HeaderMap, body: Body) -> Message {
        Message {
            head,
            version,
            headers,
            body,
        }
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn into_parts(self) -> (Head, HeaderMap, Body) {
        (self.head, self.headers, self.body)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("head", &self.head)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_request_is_flagged() {
        let (msg, _tx) = Message::delayed_request(Method::POST, Uri::from_static("http://a/"));
        assert!(msg.is_delayed());
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(&Method::POST));
        assert_eq!(msg.status(), None);

        let msg = Message::request(Method::GET, Uri::from_static("http://a/"), Body::empty());
        assert!(!msg.is_delayed());
    }

    #[test]
    fn duplicate_headers_keep_order() {
        let mut msg = Message::response(StatusCode::OK, "hi");
        msg.headers_mut().append("Set-Cookie", "a=1".parse().unwrap());
        msg.headers_mut().append("set-cookie", "b=2".parse().unwrap());

        let values: Vec<_> = msg.headers().get_all("SET-COOKIE").iter().collect();
        assert_eq!(values, ["a=1", "b=2"]);
        assert_eq!(msg.version(), Version::Http11);
    }
}
