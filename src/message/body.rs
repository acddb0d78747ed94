use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_channel::{mpsc, oneshot};
use futures_core::{ready, Stream};
use futures_util::future::poll_fn;
use http::HeaderMap;
use http_body::{Body as HttpBody, SizeHint};
use tracing::trace;

type BodySender = mpsc::Sender<Bytes>;

/// A stream of `Bytes` chunks, optionally followed by trailers.
///
/// A `Body` is either fully buffered (created from bytes, or assembled by the
/// client from a response) or *delayed*: produced incrementally through the
/// [`Sender`] half of [`Body::channel`].
#[must_use = "streams do nothing unless polled"]
pub struct Body {
    kind: Kind,
}

enum Kind {
    Once {
        chunk: Option<Bytes>,
        trailers: Option<HeaderMap>,
    },
    Chan {
        rx: mpsc::Receiver<Bytes>,
        abort_rx: oneshot::Receiver<()>,
        trailers_rx: Option<oneshot::Receiver<HeaderMap>>,
        eof: bool,
    },
}

/// A sender half used with `Body::channel()`.
///
/// The channel buffers a single chunk: `send_data` suspends until the
/// consumer (usually the connection writing the request) has taken the
/// previous one off the channel.
#[must_use = "Sender does nothing unless sent on"]
#[derive(Debug)]
pub struct Sender {
    abort_tx: oneshot::Sender<()>,
    trailers_tx: oneshot::Sender<HeaderMap>,
    tx: BodySender,
}

impl Body {
    /// Create an empty `Body` stream.
    #[inline]
    pub fn empty() -> Body {
        Body::new(Kind::Once {
            chunk: None,
            trailers: None,
        })
    }

    /// Create a `Body` stream with an associated sender half.
    ///
    /// Useful when the body is produced slowly or from another task.
    pub fn channel() -> (Sender, Body) {
        let (tx, rx) = mpsc::channel(0);
        let (abort_tx, abort_rx) = oneshot::channel();
        let (trailers_tx, trailers_rx) = oneshot::channel();

        let tx = Sender {
            abort_tx,
            trailers_tx,
            tx,
        };
        let rx = Body::new(Kind::Chan {
            rx,
            abort_rx,
            trailers_rx: Some(trailers_rx),
            eof: false,
        });

        (tx, rx)
    }

    /// Attach trailers to a fully buffered body.
    ///
    /// Channel bodies carry their trailers through [`Sender::send_trailers`];
    /// calling this on one is ignored.
    pub fn with_trailers(mut self, map: HeaderMap) -> Body {
        if let Kind::Once {
            ref mut trailers, ..
        } = self.kind
        {
            *trailers = Some(map);
        }
        self
    }

    fn new(kind: Kind) -> Body {
        Body { kind }
    }

    pub(crate) fn full(chunk: Bytes, trailers: Option<HeaderMap>) -> Body {
        Body::new(Kind::Once {
            chunk: if chunk.is_empty() { None } else { Some(chunk) },
            trailers,
        })
    }

    /// Returns true if this body is produced incrementally through a channel.
    pub fn is_delayed(&self) -> bool {
        matches!(self.kind, Kind::Chan { .. })
    }

    /// The number of bytes this body will yield, if known up front.
    pub(crate) fn exact_len(&self) -> Option<u64> {
        match self.kind {
            Kind::Once { ref chunk, .. } => Some(chunk.as_ref().map_or(0, |c| c.len() as u64)),
            Kind::Chan { .. } => None,
        }
    }

    /// Returns true if a fully buffered body has trailers waiting.
    pub(crate) fn has_trailers(&self) -> bool {
        match self.kind {
            Kind::Once { ref trailers, .. } => trailers.is_some(),
            Kind::Chan { .. } => true,
        }
    }

    /// Returns the next chunk of data, or `None` once the body is exhausted.
    pub async fn data(&mut self) -> Option<crate::Result<Bytes>> {
        poll_fn(|cx| self.poll_chunk(cx)).await
    }

    /// Returns the trailers, once all data has been read.
    pub async fn trailers(&mut self) -> crate::Result<Option<HeaderMap>> {
        poll_fn(|cx| self.poll_trailers_inner(cx)).await
    }

    /// Drains the whole body into one contiguous buffer, discarding trailers.
    pub async fn to_bytes(mut self) -> crate::Result<Bytes> {
        let first = match self.data().await {
            Some(chunk) => chunk?,
            None => return Ok(Bytes::new()),
        };
        let second = match self.data().await {
            Some(chunk) => chunk?,
            None => return Ok(first),
        };

        let mut vec = BytesMut::with_capacity(first.len() + second.len());
        vec.extend_from_slice(&first);
        vec.extend_from_slice(&second);
        while let Some(chunk) = self.data().await {
            vec.extend_from_slice(&chunk?);
        }
        Ok(vec.freeze())
    }

    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<crate::Result<Bytes>>> {
        match self.kind {
            Kind::Once { ref mut chunk, .. } => Poll::Ready(chunk.take().map(Ok)),
            Kind::Chan {
                ref mut rx,
                ref mut abort_rx,
                ref mut eof,
                ..
            } => {
                if *eof {
                    return Poll::Ready(None);
                }
                if let Poll::Ready(Ok(())) = Pin::new(abort_rx).poll(cx) {
                    *eof = true;
                    trace!("body producer aborted");
                    return Poll::Ready(Some(Err(crate::Error::new_producer(
                        "body producer aborted",
                    ))));
                }

                match ready!(Pin::new(rx).poll_next(cx)) {
                    Some(chunk) => Poll::Ready(Some(Ok(chunk))),
                    None => {
                        *eof = true;
                        Poll::Ready(None)
                    }
                }
            }
        }
    }

    fn poll_trailers_inner(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<crate::Result<Option<HeaderMap>>> {
        match self.kind {
            Kind::Once {
                ref mut trailers, ..
            } => Poll::Ready(Ok(trailers.take())),
            Kind::Chan {
                ref mut trailers_rx,
                ..
            } => match trailers_rx.as_mut() {
                Some(rx) => {
                    let res = ready!(Pin::new(rx).poll(cx));
                    *trailers_rx = None;
                    // a sender dropped without trailers just ends the body
                    Poll::Ready(Ok(res.ok()))
                }
                None => Poll::Ready(Ok(None)),
            },
        }
    }
}

impl Default for Body {
    /// Returns [`Body::empty()`](Body::empty).
    #[inline]
    fn default() -> Body {
        Body::empty()
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = crate::Error;

    fn poll_data(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        self.poll_chunk(cx)
    }

    fn poll_trailers(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        self.poll_trailers_inner(cx)
    }

    fn is_end_stream(&self) -> bool {
        match self.kind {
            Kind::Once {
                ref chunk,
                ref trailers,
            } => chunk.is_none() && trailers.is_none(),
            Kind::Chan { .. } => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.exact_len() {
            Some(len) => SizeHint::with_exact(len),
            None => SizeHint::default(),
        }
    }
}

impl Stream for Body {
    type Item = crate::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_chunk(cx)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[derive(Debug)]
        struct Streaming;
        #[derive(Debug)]
        struct Empty;
        let mut builder = f.debug_tuple("Body");
        match self.kind {
            Kind::Once { chunk: None, .. } => builder.field(&Empty),
            Kind::Once {
                chunk: Some(ref chunk),
                ..
            } => builder.field(&format_args!("Full({} bytes)", chunk.len())),
            Kind::Chan { .. } => builder.field(&Streaming),
        };

        builder.finish()
    }
}

impl From<Bytes> for Body {
    #[inline]
    fn from(chunk: Bytes) -> Body {
        Body::full(chunk, None)
    }
}

impl From<Vec<u8>> for Body {
    #[inline]
    fn from(vec: Vec<u8>) -> Body {
        Body::from(Bytes::from(vec))
    }
}

impl From<&'static [u8]> for Body {
    #[inline]
    fn from(slice: &'static [u8]) -> Body {
        Body::from(Bytes::from_static(slice))
    }
}

impl From<String> for Body {
    #[inline]
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s.into_bytes()))
    }
}

impl From<&'static str> for Body {
    #[inline]
    fn from(slice: &'static str) -> Body {
        Body::from(Bytes::from_static(slice.as_bytes()))
    }
}

impl From<Cow<'static, str>> for Body {
    #[inline]
    fn from(cow: Cow<'static, str>) -> Body {
        match cow {
            Cow::Borrowed(b) => Body::from(b),
            Cow::Owned(o) => Body::from(o),
        }
    }
}

impl Sender {
    /// Check to see if this `Sender` can send more data.
    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        if let Poll::Ready(()) = self.abort_tx.poll_canceled(cx) {
            return Poll::Ready(Err(crate::Error::new_closed()));
        }

        self.tx
            .poll_ready(cx)
            .map_err(|_| crate::Error::new_closed())
    }

    /// Send data on this channel when it is ready.
    ///
    /// Suspends while the previous chunk has not been taken by the consumer.
    pub async fn send_data(&mut self, chunk: Bytes) -> crate::Result<()> {
        poll_fn(|cx| self.poll_ready(cx)).await?;
        self.tx
            .try_send(chunk)
            .map_err(|_| crate::Error::new_closed())
    }

    /// Try to send data on this channel.
    ///
    /// # Errors
    ///
    /// Returns `Err(Bytes)` if the channel could not (currently) accept
    /// another `Bytes`.
    pub fn try_send_data(&mut self, chunk: Bytes) -> Result<(), Bytes> {
        self.tx
            .try_send(chunk)
            .map_err(|err| err.into_inner())
    }

    /// Ends the body with trailers.
    pub fn send_trailers(self, trailers: HeaderMap) -> crate::Result<()> {
        self.trailers_tx
            .send(trailers)
            .map_err(|_| crate::Error::new_closed())
    }

    /// Ends the body without trailers.
    ///
    /// Dropping the `Sender` has the same effect.
    pub fn finish(self) {
        trace!("body sender finished");
    }

    /// Aborts the body in an abnormal fashion.
    ///
    /// The consumer sees a producer error instead of the end of the body.
    pub fn abort(self) {
        let _ = self.abort_tx.send(());
    }
}
