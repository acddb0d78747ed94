//! TCP connector used by the pool.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::pool::Target;

/// Opens TCP connections for the `http` scheme.
#[derive(Clone, Debug)]
pub(crate) struct Connector {
    connect_timeout: Option<Duration>,
    keep_alive_timeout: Option<Duration>,
    nodelay: bool,
}

impl Connector {
    pub(crate) fn new() -> Connector {
        Connector {
            connect_timeout: None,
            keep_alive_timeout: None,
            nodelay: true,
        }
    }

    /// Set the connect timeout.
    ///
    /// If `None`, then no timeout is applied by the connector, making it
    /// subject to the timeout imposed by the operating system.
    pub(crate) fn set_connect_timeout(&mut self, dur: Option<Duration>) {
        self.connect_timeout = dur;
    }

    /// Set that all sockets have `SO_KEEPALIVE` set with the supplied duration.
    ///
    /// If `None`, the option will not be set.
    pub(crate) fn set_keepalive(&mut self, dur: Option<Duration>) {
        self.keep_alive_timeout = dur;
    }

    /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
    pub(crate) fn set_nodelay(&mut self, nodelay: bool) {
        self.nodelay = nodelay;
    }

    pub(crate) async fn connect(&self, target: &Target) -> crate::Result<TcpStream> {
        trace!("connecting to {}", target);
        let connecting = TcpStream::connect((target.host(), target.port()));
        let stream = match self.connect_timeout {
            Some(dur) => match tokio::time::timeout(dur, connecting).await {
                Ok(res) => res,
                Err(_) => {
                    debug!("connect to {} timed out after {:?}", target, dur);
                    return Err(crate::Error::new_connect(ConnectTimeout(dur)));
                }
            },
            None => connecting.await,
        }
        .map_err(crate::Error::new_connect)?;

        if let Some(dur) = self.keep_alive_timeout {
            let conf = TcpKeepalive::new().with_time(dur);
            if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&conf) {
                warn!("tcp set_keepalive error: {}", e);
            }
        }

        stream
            .set_nodelay(self.nodelay)
            .map_err(crate::Error::new_connect)?;

        debug!("connected to {}", target);
        Ok(stream)
    }
}

#[derive(Debug)]
struct ConnectTimeout(Duration);

impl fmt::Display for ConnectTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connect timed out after {:?}", self.0)
    }
}

impl StdError for ConnectTimeout {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connects_and_sets_nodelay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let target = Target::new("127.0.0.1", addr.port());

        let mut connector = Connector::new();
        connector.set_keepalive(Some(Duration::from_secs(30)));
        let stream = connector.connect(&target).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn refused_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = Target::new("127.0.0.1", addr.port());
        let err = Connector::new().connect(&target).await.unwrap_err();
        assert!(err.is_connect(), "{:?}", err);
    }
}
