use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::ready;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::client::idle::MonitorHandle;

pin_project! {
    /// An IO that reports every successful read or write to an idle monitor.
    #[derive(Debug)]
    pub(crate) struct Tracked<T> {
        #[pin]
        inner: T,
        monitor: Option<MonitorHandle>,
    }
}

impl<T> Tracked<T> {
    pub(crate) fn new(inner: T, monitor: Option<MonitorHandle>) -> Tracked<T> {
        Tracked { inner, monitor }
    }

    pub(crate) fn get_ref(&self) -> &T {
        &self.inner
    }

    pub(crate) fn into_inner(self) -> T {
        self.inner
    }
}

impl Tracked<TcpStream> {
    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr().ok()
    }
}

impl<T: AsyncRead> AsyncRead for Tracked<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let res = ready!(this.inner.poll_read(cx, buf));
        if res.is_ok() && buf.filled().len() > before {
            if let Some(monitor) = this.monitor {
                monitor.touch();
            }
        }
        Poll::Ready(res)
    }
}

impl<T: AsyncWrite> AsyncWrite for Tracked<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let res = ready!(this.inner.poll_write(cx, buf));
        if let Ok(n) = res {
            if n > 0 {
                if let Some(monitor) = this.monitor {
                    monitor.touch();
                }
            }
        }
        Poll::Ready(res)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
