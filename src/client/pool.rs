use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_channel::oneshot;
use http::Uri;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::conn::{self, http1, http2};
use super::connect::Connector;
use crate::common::io::Rewind;
use crate::proto;

/// Where connections go: host and port of an `http` URI.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Target {
    host: String,
    port: u16,
}

/// How a new connection should speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Preference {
    Http11,
    Http2PriorKnowledge,
    /// HTTP/1.1 first, offering a switch to h2c.
    Http2Upgrade,
}

/// A connection checked out of the pool.
#[derive(Debug)]
pub(crate) enum Connection {
    Http1(http1::Connection),
    Http2(http2::SendRequest),
}

#[derive(Clone)]
pub(crate) struct Pool {
    inner: Arc<Mutex<PoolInner>>,
    connector: Connector,
    config: Arc<conn::Config>,
}

struct PoolInner {
    idle: HashMap<Target, Vec<Idle>>,
    // one shared HTTP/2 connection per target
    h2: HashMap<Target, http2::SendRequest>,
    // targets with an HTTP/2 connection being established
    connecting: HashSet<Target>,
    // checkouts waiting for that connection
    parked: HashMap<Target, VecDeque<oneshot::Sender<http2::SendRequest>>>,
    max_idle_per_host: usize,
    timeout: Option<Duration>,
    next_id: u64,
    closed: bool,
}

struct Idle {
    conn: http1::Connection,
    idle_at: Instant,
}

enum Checkout {
    Found(Connection),
    /// Another checkout is establishing the shared HTTP/2 connection.
    Parked(oneshot::Receiver<http2::SendRequest>),
    Connect,
}

/// Held by the checkout establishing a shared HTTP/2 connection.
///
/// Dropping it without a connection, on failure or when the exchange went
/// away mid-connect, wakes the parked checkouts so they retry.
struct Connecting {
    pool: Pool,
    target: Target,
    done: bool,
}

impl Target {
    pub(crate) fn new(host: &str, port: u16) -> Target {
        Target {
            host: host.to_owned(),
            port,
        }
    }

    /// Extracts the target of an absolute `http` URI.
    pub(crate) fn from_uri(uri: &Uri) -> crate::Result<Target> {
        let authority = match (uri.scheme_str(), uri.authority()) {
            (Some(_), Some(authority)) => authority,
            _ => return Err(crate::Error::new_user_absolute_uri_required()),
        };
        if uri.scheme() != Some(&http::uri::Scheme::HTTP) {
            return Err(crate::Error::new_user_unsupported_scheme());
        }
        Ok(Target::new(authority.host(), authority.port_u16().unwrap_or(80)))
    }

    pub(crate) fn host(&self) -> &str {
        // bracketed IPv6 literals are not valid for a socket address lookup
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Pool {
    pub(crate) fn new(
        connector: Connector,
        config: conn::Config,
        max_idle_per_host: usize,
        timeout: Option<Duration>,
    ) -> Pool {
        Pool {
            inner: Arc::new(Mutex::new(PoolInner {
                idle: HashMap::new(),
                h2: HashMap::new(),
                connecting: HashSet::new(),
                parked: HashMap::new(),
                max_idle_per_host,
                timeout,
                next_id: 0,
                closed: false,
            })),
            connector,
            config: Arc::new(config),
        }
    }

    /// Returns a pooled connection to `target`, or opens a new one.
    ///
    /// With HTTP/2 prior knowledge, concurrent checkouts for a target share
    /// one connection: the first one connects while the others park until
    /// it is ready.
    ///
    /// Every failure is reported as a connect error.
    pub(crate) async fn acquire(
        &self,
        target: &Target,
        preference: Preference,
    ) -> crate::Result<Connection> {
        loop {
            match self.checkout(target, preference)? {
                Checkout::Found(conn) => return Ok(conn),
                Checkout::Parked(rx) => match rx.await {
                    Ok(tx) => {
                        trace!("checkout h2 connection {} for {} after wait", tx.id(), target);
                        return Ok(Connection::Http2(tx));
                    }
                    Err(_canceled) => {
                        trace!("h2 connect for {} did not finish, retrying", target);
                        continue;
                    }
                },
                Checkout::Connect => return self.connect(target, preference).await,
            }
        }
    }

    async fn connect(&self, target: &Target, preference: Preference) -> crate::Result<Connection> {
        let id = self.next_id();
        match preference {
            Preference::Http11 => {
                let stream = self.connector.connect(target).await?;
                Ok(Connection::Http1(http1::Connection::new(
                    id,
                    stream,
                    &self.config,
                    None,
                )))
            }
            Preference::Http2Upgrade => {
                let stream = self.connector.connect(target).await?;
                let settings = proto::h2::settings_payload(&self.config.h2);
                Ok(Connection::Http1(http1::Connection::new(
                    id,
                    stream,
                    &self.config,
                    Some(settings),
                )))
            }
            Preference::Http2PriorKnowledge => {
                let mut connecting = Connecting {
                    pool: self.clone(),
                    target: target.clone(),
                    done: false,
                };
                let stream = self.connector.connect(target).await?;
                let tx = http2::handshake(id, stream, &self.config)
                    .await
                    .map_err(crate::Error::new_connect)?;
                connecting.done = true;
                Ok(Connection::Http2(self.insert_h2(target, tx)))
            }
        }
    }

    fn checkout(&self, target: &Target, preference: Preference) -> crate::Result<Checkout> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.closed {
            return Err(crate::Error::new_connect(crate::Error::new_closed()));
        }

        if preference != Preference::Http11 {
            if let Some(tx) = inner.h2.get(target).cloned() {
                if !tx.is_closed() {
                    trace!("checkout h2 connection {} for {}", tx.id(), target);
                    return Ok(Checkout::Found(Connection::Http2(tx)));
                }
                trace!("removing closed h2 connection for {}", target);
                inner.h2.remove(target);
            }
        }

        if preference == Preference::Http2PriorKnowledge {
            if inner.connecting.contains(target) {
                trace!("parking checkout for {} behind pending h2 connect", target);
                let (tx, rx) = oneshot::channel();
                inner
                    .parked
                    .entry(target.clone())
                    .or_insert_with(VecDeque::new)
                    .push_back(tx);
                return Ok(Checkout::Parked(rx));
            }
            inner.connecting.insert(target.clone());
            return Ok(Checkout::Connect);
        }

        let timeout = inner.timeout;
        let mut found = None;
        if let Some(list) = inner.idle.get_mut(target) {
            while let Some(entry) = list.pop() {
                if timeout.map_or(false, |dur| entry.idle_at.elapsed() > dur) {
                    trace!("removing expired connection {}", entry.conn.id());
                    continue;
                }
                if entry.conn.is_closed() {
                    trace!("removing closed connection {}", entry.conn.id());
                    continue;
                }
                found = Some(entry.conn);
                break;
            }
            if list.is_empty() {
                inner.idle.remove(target);
            }
        }
        Ok(match found {
            Some(conn) => {
                trace!("checkout connection {} for {}", conn.id(), target);
                Checkout::Found(Connection::Http1(conn))
            }
            None => Checkout::Connect,
        })
    }

    /// Returns a finished HTTP/1.1 connection.
    ///
    /// A connection whose peer accepted an h2c offer is switched to HTTP/2
    /// and shared from then on; one that cannot be reused is dropped.
    pub(crate) async fn release(&self, target: &Target, conn: http1::Connection) {
        let id = conn.id();
        if conn.is_upgraded() {
            if self.has_live_h2(target) {
                debug!(
                    "connection {} switched to HTTP/2, but {} already has one; closing",
                    id, target
                );
                return;
            }
            let (stream, read_buf) = conn.into_parts();
            let io = Rewind::new_buffered(stream, read_buf);
            match http2::handshake(id, io, &self.config).await {
                Ok(tx) => {
                    debug!("connection {} switched to HTTP/2", id);
                    self.insert_h2(target, tx);
                }
                Err(e) => debug!("connection {} h2c handshake failed: {}", id, e),
            }
            return;
        }

        if !conn.is_reusable() {
            trace!("connection {} not reusable, closing", id);
            return;
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let max = inner.max_idle_per_host;
        let list = inner.idle.entry(target.clone()).or_insert_with(Vec::new);
        if list.len() >= max {
            trace!("idle list for {} full, closing connection {}", target, id);
            return;
        }
        trace!("pooling idle connection {} for {}", id, target);
        list.push(Idle {
            conn,
            idle_at: Instant::now(),
        });
    }

    fn has_live_h2(&self, target: &Target) -> bool {
        self.inner
            .lock()
            .h2
            .get(target)
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Shares `tx` as the HTTP/2 connection of `target` and hands it to the
    /// parked checkouts.
    ///
    /// A live connection already shared for `target` is kept, and the one
    /// returned; `tx` is closed then.
    fn insert_h2(&self, target: &Target, tx: http2::SendRequest) -> http2::SendRequest {
        let mut inner = self.inner.lock();
        inner.connecting.remove(target);
        let parked = inner.parked.remove(target).unwrap_or_default();
        if inner.closed {
            tx.close();
            return tx;
        }
        let shared = match inner.h2.get(target) {
            Some(existing) if !existing.is_closed() => {
                trace!(
                    "keeping h2 connection {} for {}, closing {}",
                    existing.id(),
                    target,
                    tx.id()
                );
                tx.close();
                existing.clone()
            }
            _ => {
                inner.h2.insert(target.clone(), tx.clone());
                tx
            }
        };
        drop(inner);

        for waiter in parked {
            // a waiter whose exchange already ended dropped its receiver
            let _ = waiter.send(shared.clone());
        }
        shared
    }

    fn connect_failed(&self, target: &Target) {
        let mut inner = self.inner.lock();
        inner.connecting.remove(target);
        // dropping the senders wakes every parked checkout
        if let Some(parked) = inner.parked.remove(target) {
            trace!("h2 connect for {} failed, waking {} parked", target, parked.len());
        }
    }

    fn next_id(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        inner.next_id
    }

    /// Drops idle connections and shuts down shared HTTP/2 connections.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.idle.clear();
        inner.connecting.clear();
        inner.parked.clear();
        for (_, tx) in inner.h2.drain() {
            tx.close();
        }
    }

    #[cfg(test)]
    fn idle_count(&self, target: &Target) -> usize {
        self.inner.lock().idle.get(target).map_or(0, Vec::len)
    }
}

impl Drop for Connecting {
    fn drop(&mut self) {
        if !self.done {
            self.pool.connect_failed(&self.target);
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Pool")
            .field("idle", &inner.idle.values().map(Vec::len).sum::<usize>())
            .field("h2", &inner.h2.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Accepts HTTP/2 connections and keeps them open, counting them.
    async fn h2_server() -> (Target, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::new("127.0.0.1", listener.local_addr().unwrap().port());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut conn = match h2::server::handshake(sock).await {
                        Ok(conn) => conn,
                        Err(_) => return,
                    };
                    while let Some(Ok(_)) = conn.accept().await {}
                });
            }
        });
        (target, accepted)
    }

    #[test]
    fn target_from_uri() {
        let target = Target::from_uri(&"http://example.local/a".parse().unwrap()).unwrap();
        assert_eq!(target, Target::new("example.local", 80));
        assert_eq!(target.to_string(), "example.local:80");

        let target = Target::from_uri(&"http://[::1]:8080/".parse().unwrap()).unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.port(), 8080);

        let err = Target::from_uri(&"/relative".parse().unwrap()).unwrap_err();
        assert!(err.is_connect());
        let err = Target::from_uri(&"https://example.local/".parse().unwrap()).unwrap_err();
        assert!(err.is_connect());
    }

    #[tokio::test]
    async fn reuses_released_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::new("127.0.0.1", listener.local_addr().unwrap().port());
        let _accepting = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let pool = Pool::new(Connector::new(), conn::Config::default(), 1, None);
        let first = match pool.acquire(&target, Preference::Http11).await.unwrap() {
            Connection::Http1(conn) => conn,
            other => panic!("unexpected {:?}", other),
        };
        let second = match pool.acquire(&target, Preference::Http11).await.unwrap() {
            Connection::Http1(conn) => conn,
            other => panic!("unexpected {:?}", other),
        };
        let first_id = first.id();
        assert_ne!(first_id, second.id());

        pool.release(&target, first).await;
        pool.release(&target, second).await;
        assert_eq!(pool.idle_count(&target), 1, "bounded per host");

        match pool.acquire(&target, Preference::Http11).await.unwrap() {
            Connection::Http1(conn) => assert_eq!(conn.id(), first_id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_idle_connection_is_not_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::new("127.0.0.1", listener.local_addr().unwrap().port());
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
            let _ = closed_tx.send(());
            let _keep = listener.accept().await;
        });

        let pool = Pool::new(Connector::new(), conn::Config::default(), 4, None);
        let conn = match pool.acquire(&target, Preference::Http11).await.unwrap() {
            Connection::Http1(conn) => conn,
            other => panic!("unexpected {:?}", other),
        };
        let id = conn.id();
        pool.release(&target, conn).await;
        closed_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        match pool.acquire(&target, Preference::Http11).await.unwrap() {
            Connection::Http1(conn) => assert_ne!(conn.id(), id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn concurrent_h2_checkouts_share_one_connection() {
        let (target, accepted) = h2_server().await;
        let pool = Pool::new(Connector::new(), conn::Config::default(), 4, None);

        let (a, b, c) = futures_util::future::join3(
            pool.acquire(&target, Preference::Http2PriorKnowledge),
            pool.acquire(&target, Preference::Http2PriorKnowledge),
            pool.acquire(&target, Preference::Http2PriorKnowledge),
        )
        .await;
        let ids = vec![a.unwrap(), b.unwrap(), c.unwrap()]
            .into_iter()
            .map(|conn| match conn {
                Connection::Http2(tx) => tx.id(),
                other => panic!("unexpected {:?}", other),
            })
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![ids[0]; 3]);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        match pool.acquire(&target, Preference::Http2PriorKnowledge).await.unwrap() {
            Connection::Http2(tx) => assert_eq!(tx.id(), ids[0]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_h2_connect_wakes_parked_checkouts() {
        let target = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            Target::new("127.0.0.1", listener.local_addr().unwrap().port())
        };
        let pool = Pool::new(Connector::new(), conn::Config::default(), 4, None);

        let (a, b) = futures_util::future::join(
            pool.acquire(&target, Preference::Http2PriorKnowledge),
            pool.acquire(&target, Preference::Http2PriorKnowledge),
        )
        .await;
        assert!(a.unwrap_err().is_connect());
        assert!(b.unwrap_err().is_connect());

        let inner = pool.inner.lock();
        assert!(inner.connecting.is_empty());
        assert!(inner.parked.is_empty());
    }

    #[tokio::test]
    async fn abandoned_h2_connect_releases_target() {
        let (target, accepted) = h2_server().await;
        let pool = Pool::new(Connector::new(), conn::Config::default(), 4, None);

        match pool.checkout(&target, Preference::Http2PriorKnowledge).unwrap() {
            Checkout::Connect => {}
            _ => panic!("first checkout connects"),
        }
        let mut parked = match pool.checkout(&target, Preference::Http2PriorKnowledge).unwrap() {
            Checkout::Parked(rx) => rx,
            _ => panic!("second checkout parks"),
        };
        drop(Connecting {
            pool: pool.clone(),
            target: target.clone(),
            done: false,
        });
        assert!(parked.try_recv().is_err(), "parked checkout was woken");

        match pool.acquire(&target, Preference::Http2PriorKnowledge).await.unwrap() {
            Connection::Http2(_) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses() {
        let pool = Pool::new(Connector::new(), conn::Config::default(), 4, None);
        pool.close();
        let err = pool
            .acquire(&Target::new("127.0.0.1", 1), Preference::Http11)
            .await
            .unwrap_err();
        assert!(err.is_connect());
    }
}
