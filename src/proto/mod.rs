//! Pieces pertaining to the HTTP message protocol.

pub(crate) mod h1;
pub(crate) mod h2;
