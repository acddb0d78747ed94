//! The stream table of one client HTTP/2 connection.
//!
//! Every open stream maps to the exchange it carries and, when per-stream
//! timeouts are enabled, to an idle monitor of its own, so a stalled stream
//! fails alone while its siblings keep going. An optional connection-level
//! monitor stays armed while any stream is open; when it fires every open
//! stream fails with a connection timeout and the connection shuts down.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::client::exchange::{Exchange, Scope};
use crate::client::idle::{Expire, IdleMonitor, MonitorHandle, Watch};
use crate::version::Version;

#[derive(Clone)]
pub(crate) struct Multiplexer {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    streams: Mutex<Streams>,
    stream_timeout: Option<Duration>,
    conn_monitor: Option<IdleMonitor>,
    closed: AtomicBool,
    shutdown: Notify,
}

struct Streams {
    table: HashMap<u32, Entry>,
    last_id: u32,
}

struct Entry {
    exchange: Exchange,
    // kept alive for as long as the stream is open
    _monitor: Option<IdleMonitor>,
}

/// Removes its stream from the table when the stream driver finishes.
pub(crate) struct StreamGuard {
    mux: Multiplexer,
    stream_id: u32,
}

impl Multiplexer {
    /// Must be called from within a tokio runtime when either timeout is set.
    pub(crate) fn new(
        id: u64,
        stream_timeout: Option<Duration>,
        conn_timeout: Option<Duration>,
    ) -> Multiplexer {
        let inner = Arc::new(Inner {
            id,
            streams: Mutex::new(Streams {
                table: HashMap::new(),
                last_id: 0,
            }),
            stream_timeout,
            conn_monitor: conn_timeout.map(IdleMonitor::new),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        if let Some(ref monitor) = inner.conn_monitor {
            let target: Weak<dyn Expire> = Arc::downgrade(&(inner.clone() as Arc<dyn Expire>));
            monitor.handle().attach(target);
        }
        Multiplexer { inner }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// The monitor the connection's IO should report progress to.
    pub(crate) fn connection_monitor(&self) -> Option<MonitorHandle> {
        self.inner.conn_monitor.as_ref().map(IdleMonitor::handle)
    }

    /// Registers a stream the codec just opened for `exchange`.
    ///
    /// The id must be client-initiated (odd) and above every id seen so far.
    pub(crate) fn open(&self, stream_id: u32, exchange: &Exchange) -> crate::Result<StreamGuard> {
        let mut streams = self.inner.streams.lock();
        if self.is_closed() {
            return Err(crate::Error::new_closed());
        }
        if stream_id % 2 == 0 || stream_id <= streams.last_id {
            warn!(
                "connection {} refusing stream id {} (last {})",
                self.inner.id, stream_id, streams.last_id
            );
            return Err(crate::Error::new_h2(h2::Reason::PROTOCOL_ERROR.into()));
        }
        streams.last_id = stream_id;

        let monitor = self.inner.stream_timeout.map(IdleMonitor::new);
        exchange.bind(
            Version::Http2,
            Scope::Stream {
                connection: self.inner.id,
                stream: stream_id,
            },
            monitor.as_ref().map(IdleMonitor::handle),
        );
        streams.table.insert(
            stream_id,
            Entry {
                exchange: exchange.clone(),
                _monitor: monitor,
            },
        );
        trace!(
            "connection {} opened stream {} for exchange {}",
            self.inner.id,
            stream_id,
            exchange.id()
        );
        if streams.table.len() == 1 {
            if let Some(ref monitor) = self.inner.conn_monitor {
                monitor.handle().arm(Watch::Connection);
            }
        }
        Ok(StreamGuard {
            mux: self.clone(),
            stream_id,
        })
    }

    fn remove(&self, stream_id: u32) {
        let entry = {
            let mut streams = self.inner.streams.lock();
            let entry = streams.table.remove(&stream_id);
            if streams.table.is_empty() {
                if let Some(ref monitor) = self.inner.conn_monitor {
                    monitor.handle().disarm();
                }
            }
            entry
        };
        if entry.is_some() {
            trace!("connection {} closed stream {}", self.inner.id, stream_id);
        }
    }

    pub(crate) fn open_streams(&self) -> usize {
        self.inner.streams.lock().table.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Marks the connection closed and wakes its connection task.
    pub(crate) fn close(&self) {
        self.inner.close();
    }

    /// Resolves when the connection was asked to shut down.
    pub(crate) async fn closed(&self) {
        self.inner.shutdown.notified().await
    }
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("connection {} closing", self.id);
            self.shutdown.notify_one();
        }
    }
}

impl Expire for Inner {
    fn expire(&self, watch: Watch, generation: u64) {
        if watch != Watch::Connection {
            return;
        }
        let entries = {
            let mut streams = self.streams.lock();
            let confirmed = self
                .conn_monitor
                .as_ref()
                .map_or(false, |monitor| monitor.handle().confirm(generation));
            if !confirmed {
                return;
            }
            streams.table.drain().map(|(_, entry)| entry).collect::<Vec<_>>()
        };

        debug!(
            "connection {} idle timeout, failing {} open streams",
            self.id,
            entries.len()
        );
        for entry in entries {
            entry.exchange.fail(crate::Error::new_connection_timeout());
        }
        self.close();
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.mux.remove(self.stream_id);
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.inner.id)
            .field("streams", &self.open_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Debug for StreamGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamGuard")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::exchange::ExchangeId;
    use crate::client::phase::Phase;

    fn exchange(n: u64) -> (Exchange, crate::client::ResponseFuture) {
        Exchange::new(ExchangeId::new(n))
    }

    #[tokio::test]
    async fn validates_stream_ids() {
        let mux = Multiplexer::new(7, None, None);
        let (a, _fa) = exchange(1);
        let (b, _fb) = exchange(2);
        let (c, _fc) = exchange(3);

        let guard = mux.open(1, &a).unwrap();
        assert_eq!(
            a.scope(),
            Scope::Stream {
                connection: 7,
                stream: 1
            }
        );
        assert_eq!(a.version(), Version::Http2);

        assert!(mux.open(1, &b).is_err(), "reused id");
        assert!(mux.open(4, &b).is_err(), "server-initiated id");
        let _other = mux.open(3, &c).unwrap();
        assert_eq!(mux.open_streams(), 2);

        drop(guard);
        assert_eq!(mux.open_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_monitor_fails_only_its_stream() {
        let mux = Multiplexer::new(1, Some(Duration::from_millis(100)), None);
        let (stalled, stalled_fut) = exchange(1);
        let (busy, busy_fut) = exchange(2);
        let _g1 = mux.open(1, &stalled).unwrap();
        let _g3 = mux.open(3, &busy).unwrap();
        stalled.advance(Phase::WritingRequest).unwrap();
        busy.advance(Phase::WritingRequest).unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            busy.progress();
        }

        let err = stalled_fut.await.unwrap_err();
        assert_eq!(err.timeout_phase(), Some(Phase::WritingRequest));
        assert_eq!(err.version(), Some(Version::Http2));
        assert!(!busy_fut.is_settled());
        assert!(!mux.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_monitor_fails_every_stream() {
        let mux = Multiplexer::new(1, None, Some(Duration::from_millis(100)));
        let (a, fa) = exchange(1);
        let (b, fb) = exchange(2);
        let _g1 = mux.open(1, &a).unwrap();
        let _g3 = mux.open(3, &b).unwrap();
        a.advance(Phase::WritingRequest).unwrap();
        b.advance(Phase::WritingRequest).unwrap();

        let closed = mux.clone();
        let shutdown = tokio::spawn(async move { closed.closed().await });

        let err = fa.await.unwrap_err();
        assert!(err.is_connection_timeout());
        assert_eq!(err.to_string(), crate::IDLE_TIMEOUT_TRIGGERED_ON_CONNECTION);
        assert!(fb.await.unwrap_err().is_connection_timeout());
        shutdown.await.unwrap();
        assert!(mux.is_closed());
        assert!(mux.open(5, &exchange(3).0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_monitor_idle_without_streams() {
        let mux = Multiplexer::new(1, None, Some(Duration::from_millis(100)));
        let (a, fa) = exchange(1);
        drop(mux.open(1, &a).unwrap());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!mux.is_closed());
        assert!(!fa.is_settled());
    }
}
