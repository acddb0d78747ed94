#![deny(warnings)]

mod support;

use std::time::Duration;

use bytes::Bytes;
use phasewire::client::{listener_fn, Phase};
use phasewire::server::{Responder, Server};
use phasewire::{header, Client, Message, Method, StatusCode, Version};

use support::Recording;

fn client(version: Version, prior_knowledge: bool) -> Client {
    Client::builder()
        .socket_idle_timeout(Duration::from_secs(5))
        .protocol_version(version)
        .h2_prior_knowledge(prior_knowledge)
        .build()
}

#[tokio::test]
async fn http1_round_trip() {
    let (_server, addr) = support::serve(Version::Http11, support::echo()).await;
    let client = client(Version::Http11, false);

    let mut request = Message::request(Method::POST, support::uri(addr, "/echo"), "hello");
    request
        .headers_mut()
        .insert("x-trace", header::HeaderValue::from_static("abc"));
    let response = client.send(request);
    let id = response.id();
    let res = response.await.expect("response");
    assert_eq!(res.status(), Some(StatusCode::OK));
    assert_eq!(res.version(), Version::Http11);
    assert!(res.headers().contains_key(header::DATE));
    assert_eq!(support::body_string(res).await, "hello");

    let next = client.get(support::uri(addr, "/"));
    assert!(next.id() > id);
    next.await.expect("second response");
}

#[tokio::test]
async fn http1_streams_delayed_request_body() {
    let (_server, addr) = support::serve(Version::Http11, support::echo()).await;
    let client = client(Version::Http11, false);

    let (request, mut body) = Message::delayed_request(Method::PUT, support::uri(addr, "/"));
    assert!(request.is_delayed());
    let response = client.send(request);
    for part in &["one ", "two ", "three"] {
        body.send_data(Bytes::from(*part))
            .await
            .expect("send chunk");
    }
    body.finish();

    let res = response.await.expect("response");
    assert_eq!(support::body_string(res).await, "one two three");
}

#[tokio::test]
async fn http1_aborted_request_body_is_a_producer_error() {
    let (_server, addr) = support::serve(Version::Http11, support::echo()).await;
    let client = client(Version::Http11, false);

    let (request, mut body) = Message::delayed_request(Method::PUT, support::uri(addr, "/"));
    let response = client.send(request);
    body.send_data(Bytes::from_static(b"partial"))
        .await
        .expect("send chunk");
    body.abort();

    let err = response.await.expect_err("aborted");
    assert!(err.is_producer());
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn http2_prior_knowledge_round_trip() {
    let recording = Recording::default();
    let (_server, addr) = support::serve(Version::Http2, recording.clone()).await;
    let client = client(Version::Http2, true);

    for body in &["first", "second"] {
        let res = client
            .send(Message::request(Method::POST, support::uri(addr, "/"), *body))
            .await
            .expect("response");
        assert_eq!(res.version(), Version::Http2);
        assert_eq!(support::body_string(res).await, *body);
    }
    assert_eq!(
        *recording.versions.lock().unwrap(),
        vec![Version::Http2, Version::Http2]
    );
}

#[tokio::test]
async fn http2_concurrent_exchanges_share_one_connection() {
    let recording = Recording::default();
    let (_server, upstream) = support::serve(Version::Http2, recording.clone()).await;
    let (addr, connections) = support::counting_proxy(upstream).await;
    let client = client(Version::Http2, true);

    let sends = ["a", "b", "c"]
        .iter()
        .map(|body| client.send(Message::request(Method::POST, support::uri(addr, "/"), *body)))
        .collect::<Vec<_>>();
    for (res, body) in futures_util::future::join_all(sends)
        .await
        .into_iter()
        .zip(&["a", "b", "c"])
    {
        let res = res.expect("response");
        assert_eq!(res.version(), Version::Http2);
        assert_eq!(support::body_string(res).await, *body);
    }
    assert_eq!(connections.count(), 1);
    assert_eq!(recording.versions.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn http2_upgrade_switches_after_first_exchange() {
    let recording = Recording::default();
    let (_server, addr) = support::serve(Version::Http2, recording.clone()).await;
    let client = client(Version::Http2, false);

    let first = client
        .send(Message::request(Method::POST, support::uri(addr, "/"), "offer"))
        .await
        .expect("offering exchange");
    assert_eq!(first.version(), Version::Http11);
    assert_eq!(support::body_string(first).await, "offer");

    let second = client
        .send(Message::request(Method::POST, support::uri(addr, "/"), "switched"))
        .await
        .expect("upgraded exchange");
    assert_eq!(second.version(), Version::Http2);
    assert_eq!(support::body_string(second).await, "switched");

    assert_eq!(
        *recording.versions.lock().unwrap(),
        vec![Version::Http11, Version::Http2]
    );
}

#[tokio::test]
async fn http1_server_ignores_upgrade_offer() {
    let recording = Recording::default();
    let (_server, addr) = support::serve(Version::Http11, recording.clone()).await;
    let client = client(Version::Http2, false);

    for _ in 0..2 {
        let res = client
            .get(support::uri(addr, "/"))
            .await
            .expect("response");
        assert_eq!(res.version(), Version::Http11);
    }
    assert_eq!(
        *recording.versions.lock().unwrap(),
        vec![Version::Http11, Version::Http11]
    );
}

#[tokio::test]
async fn server_without_listener_answers_503() {
    support::init();
    let server = Server::builder(([127, 0, 0, 1], 0).into()).build();
    let addr = server.start().await.expect("start");
    let res = client(Version::Http11, false)
        .get(support::uri(addr, "/"))
        .await
        .expect("response");
    assert_eq!(res.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
}

#[tokio::test]
async fn dropped_responder_answers_500() {
    let (_server, addr) = support::serve(
        Version::Http2,
        |_request: Message, responder: Responder| drop(responder),
    )
    .await;

    for prior_knowledge in vec![false, true] {
        let res = client(Version::Http2, prior_knowledge)
            .get(support::uri(addr, "/"))
            .await
            .expect("response");
        assert_eq!(res.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }
}

#[tokio::test]
async fn listener_receives_exactly_one_outcome() {
    let (_server, addr) = support::serve(Version::Http11, support::echo()).await;
    let client = client(Version::Http11, false);

    let (tx, rx) = tokio::sync::oneshot::channel();
    client
        .send(Message::request(Method::POST, support::uri(addr, "/"), "via listener"))
        .set_listener(listener_fn(move |res: phasewire::Result<Message>| {
            let _ = tx.send(res);
        }));
    let res = rx.await.expect("listener called").expect("response");
    assert_eq!(support::body_string(res).await, "via listener");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_wait() {
    let (_server, addr) = support::serve(Version::Http11, support::echo()).await;
    let client = client(Version::Http11, false);

    let response = client.send(Message::request(Method::POST, support::uri(addr, "/"), "waited"));
    let res = tokio::task::spawn_blocking(move || response.wait())
        .await
        .expect("join")
        .expect("response");
    assert_eq!(support::body_string(res).await, "waited");
}

#[tokio::test]
async fn rejected_uri_settles_immediately() {
    support::init();
    let client = client(Version::Http11, false);
    let response = client.get("/relative".parse().unwrap());
    assert!(response.is_settled());
    assert_eq!(response.phase(), Phase::Failed);
    assert!(response.await.unwrap_err().is_connect());
}

#[tokio::test]
async fn stopped_server_refuses_connections() {
    let (server, addr) = support::serve(Version::Http11, support::echo()).await;
    server.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client(Version::Http11, false)
        .get(support::uri(addr, "/"))
        .await
        .expect_err("stopped");
    assert!(err.is_connect());
}
