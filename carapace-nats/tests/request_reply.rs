//! Request/reply in both reply modes.

mod common;

use std::time::{Duration, Instant};

use carapace_core::error::Error;
use carapace_core::options::ReplyMode;
use carapace_nats::{Client, SubscribeOptions};
use common::MockBroker;

/// Answer every request on `subject` with `prefix` + payload, after `delay`.
fn spawn_responder(client: &Client, subject: &str, prefix: &'static str, delay: Duration) {
    let responder = client.clone();
    // Handler-mode subscriptions stay registered when the handle is dropped.
    let _sub = client
        .subscribe_with_handler(subject, SubscribeOptions::default(), move |msg| {
            let responder = responder.clone();
            async move {
                tokio::time::sleep(delay).await;
                if let Some(reply) = msg.reply {
                    let body = format!("{prefix}{}", String::from_utf8_lossy(&msg.payload));
                    let _ = responder.publish(&reply, body);
                }
            }
        })
        .unwrap();
}

#[tokio::test]
async fn test_request_gets_reply() {
    let broker = MockBroker::start().await;
    let server = Client::connect_with_options(broker.options()).await.unwrap();
    spawn_responder(&server, "echo", "re:", Duration::ZERO);
    server.flush().await.unwrap();

    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let reply = client
        .request_timeout("echo", "ping", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.text(), "re:ping");

    // The shared inbox is reused for later requests.
    let subs_before = broker.subscriptions();
    for i in 0..5 {
        let reply = client
            .request_timeout("echo", i.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.text(), format!("re:{i}"));
    }
    assert_eq!(broker.subscriptions(), subs_before);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_concurrent_requests_are_demultiplexed() {
    let broker = MockBroker::start().await;
    let server = Client::connect_with_options(broker.options()).await.unwrap();
    spawn_responder(&server, "calc", "", Duration::from_millis(5));
    server.flush().await.unwrap();

    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let mut tasks = Vec::new();
    for i in 0..20 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let reply = client
                .request_timeout("calc", i.to_string(), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(reply.text(), i.to_string());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_no_responders_fails_fast() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();

    let timeout = Duration::from_secs(5);
    let started = Instant::now();
    let err = client
        .request_timeout("nobody.home", "x", timeout)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoResponders), "{err:?}");
    assert!(started.elapsed() < timeout / 2);
    client.close().await;
}

#[tokio::test]
async fn test_slow_responder_times_out() {
    let broker = MockBroker::start().await;
    let server = Client::connect_with_options(broker.options()).await.unwrap();
    spawn_responder(&server, "slow", "", Duration::from_millis(500));
    server.flush().await.unwrap();

    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let timeout = Duration::from_millis(100);
    let started = Instant::now();
    let err = client.request_timeout("slow", "x", timeout).await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "{err:?}");
    assert!(started.elapsed() >= timeout);

    // The late reply is dropped and does not disturb the next request.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let reply = client
        .request_timeout("slow", "again", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.text(), "again");
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_legacy_mode_uses_fresh_inbox() {
    let broker = MockBroker::start().await;
    let server = Client::connect_with_options(broker.options()).await.unwrap();
    spawn_responder(&server, "legacy", "ok:", Duration::ZERO);
    server.flush().await.unwrap();
    let baseline = broker.subscriptions();

    let client = Client::connect_with_options(broker.options().with_reply_mode(ReplyMode::Legacy))
        .await
        .unwrap();
    let reply = client
        .request_timeout("legacy", "a", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.text(), "ok:a");
    client.flush().await.unwrap();
    assert_eq!(broker.subscriptions(), baseline, "per-request inbox removed");

    let err = client
        .request_timeout("missing", "x", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoResponders));
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_request_many_collects_fan_out() {
    let broker = MockBroker::start().await;
    let server = Client::connect_with_options(broker.options()).await.unwrap();
    spawn_responder(&server, "census", "a:", Duration::ZERO);
    spawn_responder(&server, "census", "b:", Duration::ZERO);
    spawn_responder(&server, "census", "c:", Duration::ZERO);
    server.flush().await.unwrap();

    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let replies = client
        .request_many("census", "q", 3, Duration::from_secs(2))
        .await
        .unwrap();
    let mut texts: Vec<String> = replies.iter().map(|m| m.text().into_owned()).collect();
    texts.sort();
    assert_eq!(texts, vec!["a:q", "b:q", "c:q"]);

    // Fewer replies than asked for: what arrived before the deadline.
    let replies = client
        .request_many("census", "q", 10, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(replies.len(), 3);
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_request_fails_when_closed() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    client.close().await;
    let err = client.request("anything", "x").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
}
