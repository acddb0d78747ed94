#![deny(warnings)]

mod support;

use std::time::Duration;

use bytes::Bytes;
use phasewire::client::Phase;
use phasewire::{
    Client, Message, Method, Version, IDLE_TIMEOUT_TRIGGERED_BEFORE_INITIATING_INBOUND_RESPONSE,
    IDLE_TIMEOUT_TRIGGERED_WHILE_READING_INBOUND_RESPONSE_BODY,
    IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY,
};

use support::NoResponse;

const IDLE: Duration = Duration::from_millis(400);

fn client(version: Version, prior_knowledge: bool) -> Client {
    Client::builder()
        .socket_idle_timeout(IDLE)
        .protocol_version(version)
        .h2_prior_knowledge(prior_knowledge)
        .build()
}

/// Sends a request whose body stalls after its first chunk and returns the
/// resulting error.
async fn stalled_write(client: &Client, addr: std::net::SocketAddr) -> phasewire::Error {
    let (request, mut body) = Message::delayed_request(Method::POST, support::uri(addr, "/upload"));
    let response = client.send(request);
    body.send_data(Bytes::from_static(b"Content data part1"))
        .await
        .expect("first chunk");
    let err = response.await.expect_err("stalled write");
    drop(body);
    err
}

#[tokio::test]
async fn http1_stalled_request_body_times_out_while_writing() {
    let (_server, addr) = support::serve(Version::Http11, NoResponse::default()).await;
    let client = client(Version::Http11, false);

    let err = stalled_write(&client, addr).await;
    assert!(err.is_timeout());
    assert!(!err.is_canceled());
    assert_eq!(err.to_string(), IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY);
    assert_eq!(err.timeout_phase(), Some(Phase::WritingRequest));
    assert_eq!(err.version(), Some(Version::Http11));
}

#[tokio::test]
async fn http1_unanswered_request_times_out_awaiting_response() {
    let server = NoResponse::default();
    let (_server, addr) = support::serve(Version::Http11, server.clone()).await;
    let client = client(Version::Http11, false);

    let request = Message::request(Method::POST, support::uri(addr, "/"), "Content data part1");
    let err = client.send(request).await.expect_err("no response");
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), IDLE_TIMEOUT_TRIGGERED_BEFORE_INITIATING_INBOUND_RESPONSE);
    assert_ne!(err.to_string(), IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY);
    assert_eq!(err.timeout_phase(), Some(Phase::AwaitingResponse));
    assert_eq!(server.held(), 1, "the request reached the listener");
}

#[tokio::test]
async fn http1_stalled_response_body_times_out_while_reading() {
    let (_server, addr) = support::serve(Version::Http11, support::stall_after(b"partial")).await;
    let client = client(Version::Http11, false);

    let err = client
        .get(support::uri(addr, "/download"))
        .await
        .expect_err("stalled response");
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), IDLE_TIMEOUT_TRIGGERED_WHILE_READING_INBOUND_RESPONSE_BODY);
    assert_eq!(err.timeout_phase(), Some(Phase::ReadingResponse));
}

#[tokio::test]
async fn http2_prior_knowledge_stalled_write() {
    let (_server, addr) = support::serve(Version::Http2, NoResponse::default()).await;
    let client = client(Version::Http2, true);

    let err = stalled_write(&client, addr).await;
    assert_eq!(err.to_string(), IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY);
    assert_eq!(err.timeout_phase(), Some(Phase::WritingRequest));
    assert_eq!(err.version(), Some(Version::Http2));
}

#[tokio::test]
async fn http2_upgrade_stalled_write_is_reported_as_http1() {
    let (_server, addr) = support::serve(Version::Http2, NoResponse::default()).await;
    let client = client(Version::Http2, false);

    // the offering exchange never finishes, so the switch never happens
    let err = stalled_write(&client, addr).await;
    assert_eq!(err.to_string(), IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY);
    assert_eq!(err.timeout_phase(), Some(Phase::WritingRequest));
    assert_eq!(err.version(), Some(Version::Http11));
}

#[tokio::test]
async fn http2_stalled_stream_does_not_fail_its_sibling() {
    let (_server, upstream) = support::serve(Version::Http2, support::echo()).await;
    let (addr, connections) = support::counting_proxy(upstream).await;
    let client = client(Version::Http2, true);

    // both exchanges start before either has a connection
    let (request, mut body) = Message::delayed_request(Method::POST, support::uri(addr, "/a"));
    let stalled = client.send(request);
    let sibling = client.send(Message::request(
        Method::POST,
        support::uri(addr, "/b"),
        "sibling body",
    ));
    body.send_data(Bytes::from_static(b"Content data part1"))
        .await
        .expect("first chunk");

    let res = sibling.await.expect("sibling completes");
    assert_eq!(res.version(), Version::Http2);
    assert_eq!(support::body_string(res).await, "sibling body");

    let err = stalled.await.expect_err("stalled stream");
    assert_eq!(err.to_string(), IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY);
    assert_eq!(err.timeout_phase(), Some(Phase::WritingRequest));
    assert_eq!(err.version(), Some(Version::Http2));
    assert_eq!(connections.count(), 1, "streams of one connection");
    drop(body);
}

#[tokio::test]
async fn http2_connection_timeout_fails_open_streams() {
    let server = NoResponse::default();
    let (_server, upstream) = support::serve(Version::Http2, server.clone()).await;
    let (addr, connections) = support::counting_proxy(upstream).await;
    let client = Client::builder()
        .protocol_version(Version::Http2)
        .h2_prior_knowledge(true)
        .http2_stream_idle_timeouts(false)
        .http2_connection_idle_timeout(Some(IDLE))
        .build();

    let a = client.get(support::uri(addr, "/a"));
    let b = client.get(support::uri(addr, "/b"));
    let (a, b) = futures_util::future::join(a, b).await;
    for err in vec![a.expect_err("a"), b.expect_err("b")] {
        assert!(err.is_timeout());
        assert!(err.is_connection_timeout());
        assert_eq!(err.timeout_phase(), None);
        assert_eq!(err.to_string(), phasewire::IDLE_TIMEOUT_TRIGGERED_ON_CONNECTION);
    }
    assert_eq!(connections.count(), 1, "both streams shared the connection");
    assert_eq!(server.held(), 2);
}

#[tokio::test]
async fn http2_cancel_keeps_connection_for_siblings() {
    let (_server, addr) = support::serve(Version::Http2, support::echo()).await;
    let client = client(Version::Http2, true);

    let (request, mut body) = Message::delayed_request(Method::POST, support::uri(addr, "/a"));
    let canceled = client.send(request);
    body.send_data(Bytes::from_static(b"part"))
        .await
        .expect("first chunk");
    support::reached(&canceled, Phase::WritingRequest).await;

    canceled.cancel();
    let err = canceled.await.expect_err("canceled");
    assert!(err.is_canceled());
    assert!(!err.is_timeout());

    let res = client
        .send(Message::request(Method::POST, support::uri(addr, "/b"), "after"))
        .await
        .expect("connection still usable");
    assert_eq!(res.version(), Version::Http2);
    assert_eq!(support::body_string(res).await, "after");
}

#[tokio::test]
async fn zero_idle_timeout_disables_the_monitor() {
    let (_server, addr) = support::serve(Version::Http11, NoResponse::default()).await;
    let client = Client::builder()
        .socket_idle_timeout(Duration::from_secs(0))
        .build();

    let response = client.get(support::uri(addr, "/"));
    support::reached(&response, Phase::AwaitingResponse).await;
    tokio::time::sleep(IDLE * 2).await;
    assert!(!response.is_settled());
}

#[tokio::test]
async fn connect_failure_is_a_connect_error() {
    support::init();
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let client = client(Version::Http11, false);
    let err = client
        .get(support::uri(addr, "/"))
        .await
        .expect_err("nothing listening");
    assert!(err.is_connect());
    assert!(!err.is_timeout());
}
