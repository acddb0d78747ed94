#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use phasewire::client::{Phase, ResponseFuture};
use phasewire::server::{Listener, Responder, Server};
use phasewire::{Body, Message, StatusCode, Uri, Version};

pub fn init() {
    let _ = pretty_env_logger::try_init();
}

/// Starts a server on an ephemeral local port.
pub async fn serve<L: Listener>(version: Version, listener: L) -> (Server, SocketAddr) {
    init();
    let server = Server::builder(([127, 0, 0, 1], 0).into())
        .protocol_version(version)
        .build();
    server.set_listener(listener);
    let addr = server.start().await.expect("server start");
    (server, addr)
}

/// Forwards every TCP connection to `upstream`, counting them.
pub async fn counting_proxy(upstream: SocketAddr) -> (SocketAddr, Connections) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("proxy bind");
    let addr = listener.local_addr().expect("proxy addr");
    let connections = Connections::default();
    let counted = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut inbound, _)) = listener.accept().await {
            counted.0.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Ok(mut outbound) = tokio::net::TcpStream::connect(upstream).await {
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                }
            });
        }
    });
    (addr, connections)
}

#[derive(Clone, Default)]
pub struct Connections(Arc<AtomicUsize>);

impl Connections {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn uri(addr: SocketAddr, path: &str) -> Uri {
    format!("http://{}{}", addr, path).parse().expect("uri")
}

/// Keeps every responder without answering, so exchanges never complete.
#[derive(Clone, Default)]
pub struct NoResponse {
    held: Arc<Mutex<Vec<Responder>>>,
}

impl NoResponse {
    pub fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }
}

impl Listener for NoResponse {
    fn on_message(&self, _request: Message, responder: Responder) {
        self.held.lock().unwrap().push(responder);
    }
}

/// Answers `200` with the request body.
pub fn echo() -> impl Listener {
    |request: Message, responder: Responder| {
        tokio::spawn(async move {
            let body = request.into_body().to_bytes().await.unwrap_or_default();
            responder.respond(Message::response(StatusCode::OK, body));
        });
    }
}

/// Answers `200`, sends `chunk` of the body, then stalls forever.
pub fn stall_after(chunk: &'static [u8]) -> impl Listener {
    move |_request: Message, responder: Responder| {
        let (mut tx, body) = Body::channel();
        tokio::spawn(async move {
            let _ = tx.send_data(Bytes::from_static(chunk)).await;
            std::future::pending::<()>().await;
            drop(tx);
        });
        responder.respond(Message::response(StatusCode::OK, body));
    }
}

/// Records the version of every request it sees, then echoes.
#[derive(Clone, Default)]
pub struct Recording {
    pub versions: Arc<Mutex<Vec<Version>>>,
}

impl Listener for Recording {
    fn on_message(&self, request: Message, responder: Responder) {
        self.versions.lock().unwrap().push(request.version());
        echo().on_message(request, responder);
    }
}

/// Polls until the exchange reaches `phase`.
pub async fn reached(future: &ResponseFuture, phase: Phase) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while future.phase() != phase {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("phase not reached");
}

pub async fn body_string(message: Message) -> String {
    let bytes = message.into_body().to_bytes().await.expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8")
}
