use std::fmt;

/// The protocol version an exchange or message was carried over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Version {
    /// `HTTP/1.1`
    Http11,
    /// `HTTP/2.0`
    Http2,
}

impl Version {
    /// The version as it appears on an HTTP/1 start line.
    pub fn as_str(&self) -> &'static str {
        match *self {
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2.0",
        }
    }

    pub(crate) fn from_http(version: http::Version) -> Option<Version> {
        match version {
            http::Version::HTTP_11 | http::Version::HTTP_10 => Some(Version::Http11),
            http::Version::HTTP_2 => Some(Version::Http2),
            _ => None,
        }
    }
}

impl Default for Version {
    fn default() -> Version {
        Version::Http11
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Version> for http::Version {
    fn from(version: Version) -> http::Version {
        match version {
            Version::Http11 => http::Version::HTTP_11,
            Version::Http2 => http::Version::HTTP_2,
        }
    }
}
