//! Publish/subscribe against the in-process broker.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use carapace_core::monitor::ConnectionEvent;
use carapace_core::state::ConnectionState;
use carapace_nats::{Client, HeaderMap, SubscribeOptions};
use common::MockBroker;

#[tokio::test]
async fn test_five_messages_arrive_in_order() {
    let broker = MockBroker::start().await;
    let a = Client::connect_with_options(broker.options()).await.unwrap();
    let b = Client::connect_with_options(broker.options()).await.unwrap();

    let sub = a.subscribe("foo").unwrap();
    a.flush().await.unwrap();

    for _ in 0..5 {
        b.publish("foo", "hello").unwrap();
    }
    b.flush().await.unwrap();

    for _ in 0..5 {
        let msg = sub
            .next_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("subscription ended early");
        assert_eq!(msg.subject, "foo");
        assert_eq!(&msg.payload[..], b"hello");
    }
    assert!(sub.try_next().is_none());
    assert_eq!(sub.stats().delivered, 5);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_order_preserved_per_subscription() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let sub = client.subscribe("seq.>").unwrap();

    for i in 0..100 {
        client.publish("seq.n", i.to_string()).unwrap();
    }
    client.flush().await.unwrap();

    for i in 0..100 {
        let msg = sub.next_timeout(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(msg.text(), i.to_string());
    }
    client.close().await;
}

#[tokio::test]
async fn test_wildcard_and_headers() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let sub = client.subscribe("orders.*.created").unwrap();
    client.flush().await.unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("Trace-Id", "abc");
    client
        .publish_with_headers("orders.eu.created", &headers, "{}")
        .unwrap();
    client.publish("orders.eu.deleted", "ignored").unwrap();
    client.flush().await.unwrap();

    let msg = sub.next_timeout(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(msg.subject, "orders.eu.created");
    assert_eq!(msg.headers.as_ref().and_then(|h| h.get("Trace-Id")), Some("abc"));
    assert!(sub.try_next().is_none());
    client.close().await;
}

#[tokio::test]
async fn test_queue_group_delivers_once() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let w1 = client.queue_subscribe("jobs", "workers").unwrap();
    let w2 = client.queue_subscribe("jobs", "workers").unwrap();
    client.flush().await.unwrap();

    for _ in 0..10 {
        client.publish("jobs", "work").unwrap();
    }
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let total = w1.stats().pending_msgs + w2.stats().pending_msgs;
    assert_eq!(total, 10);
    assert!(w1.stats().pending_msgs > 0 && w2.stats().pending_msgs > 0);
    client.close().await;
}

#[tokio::test]
async fn test_handler_mode_runs_every_message() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let _sub = client
        .subscribe_with_handler("tick", SubscribeOptions::default(), move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    client.flush().await.unwrap();

    for _ in 0..3 {
        client.publish("tick", "").unwrap();
    }
    client.flush().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while seen.load(Ordering::SeqCst) < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    client.close().await;
}

#[tokio::test]
async fn test_slow_consumer_drops_excess_and_reports_once() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let monitor = client.monitor();
    let sub = client
        .subscribe_with("flood", SubscribeOptions::default().with_limits(5, 1024 * 1024))
        .unwrap();
    client.flush().await.unwrap();

    for i in 0..8 {
        client.publish("flood", i.to_string()).unwrap();
    }
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = sub.stats();
    assert_eq!(stats.pending_msgs, 5);
    assert_eq!(stats.dropped, 3);

    // The first five (at or under the limit) are the ones kept.
    for i in 0..5 {
        let msg = sub.try_next().unwrap();
        assert_eq!(msg.text(), i.to_string());
    }

    let mut slow = 0;
    while let Ok(event) = monitor.try_recv() {
        if matches!(event, ConnectionEvent::SlowConsumer { .. }) {
            slow += 1;
        }
    }
    assert_eq!(slow, 1, "one report per overflow episode");
    assert_eq!(client.state(), ConnectionState::Connected);
    client.close().await;
}

#[tokio::test]
async fn test_auto_unsubscribe_after_max() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let sub = client.subscribe("limited").unwrap();
    sub.unsubscribe_after(2).unwrap();
    client.flush().await.unwrap();

    for _ in 0..4 {
        client.publish("limited", "x").unwrap();
    }
    client.flush().await.unwrap();

    assert!(sub.next_timeout(Duration::from_secs(1)).await.unwrap().is_some());
    assert!(sub.next_timeout(Duration::from_secs(1)).await.unwrap().is_some());
    assert!(sub.next_timeout(Duration::from_secs(1)).await.unwrap().is_none());
    assert!(!sub.is_active());
    client.close().await;
}

#[tokio::test]
async fn test_invalid_subject_rejected() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    assert!(client.publish("bad subject", "x").is_err());
    assert!(client.publish("foo.*", "x").is_err());
    assert!(client.subscribe("").is_err());
    client.close().await;
}

#[tokio::test]
async fn test_max_payload_enforced_locally() {
    let broker = MockBroker::start_with_info(serde_json::json!({ "max_payload": 16 })).await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let err = client.publish("big", vec![0u8; 17]).unwrap_err();
    assert!(matches!(
        err,
        carapace_core::error::Error::MaxPayload { size: 17, max: 16 }
    ));
    client.publish("small", vec![0u8; 16]).unwrap();
    client.close().await;
}

#[tokio::test]
async fn test_publish_after_close_fails() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    client.close().await;
    assert!(client.is_closed());
    assert!(matches!(
        client.publish("foo", "x"),
        Err(carapace_core::error::Error::ConnectionClosed)
    ));
    assert!(client.flush().await.is_err());
}

#[tokio::test]
async fn test_connect_sends_client_identity() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options().with_name("inventory").with_no_echo(true))
        .await
        .unwrap();
    client.flush().await.unwrap();

    let connects = broker.connects();
    let connect = connects.first().unwrap();
    assert_eq!(connect["name"], "inventory");
    assert_eq!(connect["lang"], "rust");
    assert_eq!(connect["protocol"], 1);
    assert_eq!(connect["echo"], false);
    assert_eq!(connect["headers"], true);
    client.close().await;
}

#[tokio::test]
async fn test_permissions_error_keeps_connection() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let monitor = client.monitor();

    broker.send_raw("-ERR 'Permissions Violation for Publish to \"secret\"'\r\n");
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), monitor.recv_async())
            .await
            .unwrap()
            .unwrap();
        match event {
            ConnectionEvent::Error(e) => {
                assert!(e.contains("Permissions"), "{e}");
                break;
            }
            ConnectionEvent::Connected(_) => {}
            other => panic!("unexpected {other}"),
        }
    }
    client.flush().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    client.close().await;
}

#[tokio::test]
async fn test_discovered_servers_and_lame_duck() {
    let broker = MockBroker::start().await;
    let client = Client::connect_with_options(broker.options()).await.unwrap();
    let monitor = client.monitor();

    broker.send_info(serde_json::json!({ "connect_urls": ["127.0.0.1:1"], "ldm": true }));

    let mut discovered = false;
    let mut lame_duck = false;
    while !(discovered && lame_duck) {
        match tokio::time::timeout(Duration::from_secs(2), monitor.recv_async()).await {
            Ok(Ok(ConnectionEvent::ServersDiscovered(eps))) => {
                assert_eq!(eps[0].port, 1);
                discovered = true;
            }
            Ok(Ok(ConnectionEvent::LameDuck(_))) => lame_duck = true,
            Ok(Ok(_)) => {}
            other => panic!("missing events: {other:?}"),
        }
    }
    client.close().await;
}
