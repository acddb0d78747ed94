//! HTTP/1.1 framing: head parsing and encoding, body codecs, and the
//! buffered IO they read from.

pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod io;
pub(crate) mod role;
