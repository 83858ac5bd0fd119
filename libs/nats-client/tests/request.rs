mod common;

use std::time::Duration;

use common::{BrokerConfig, MockBroker};
use nats_client::{ConnectionInfo, NatsClient, NatsError, Subscription};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

/// Answers every request on `sub` with its payload upper-cased.
fn spawn_responder(responder: NatsClient, mut sub: Subscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            let Some(reply_to) = msg.reply_to.as_deref() else {
                continue;
            };
            let body = String::from_utf8_lossy(&msg.payload).to_uppercase();
            if responder.publish(reply_to, body).await.is_err() {
                break;
            }
        }
    })
}

async fn requester(broker: &MockBroker, use_inbox: bool) -> NatsClient {
    let mut info: ConnectionInfo = broker.connection_info();
    info.use_inbox_requests = use_inbox;
    info.request_timeout = Duration::from_secs(2);
    let client = NatsClient::new(info).unwrap();
    client.connect().await.unwrap();
    client
}

#[tokio::test]
#[traced_test]
async fn test_request_over_shared_inbox() {
    let broker = MockBroker::start().await;
    let responder = broker.client().await;
    let sub = responder.subscribe("greet").await.unwrap();
    broker.wait_for_subscribers("greet", 1).await;
    let _task = spawn_responder(responder.clone(), sub);

    let client = requester(&broker, true).await;
    let reply = client.request("greet", "hello").await.unwrap();
    assert_eq!(&reply.payload[..], b"HELLO");
    assert!(reply.subject.starts_with("_INBOX."));

    // later requests reuse the inbox subscription
    let reply = client.request("greet", "again").await.unwrap();
    assert_eq!(&reply.payload[..], b"AGAIN");
    let inboxes = broker.subscribers(&format!(
        "{}.*",
        reply.subject.rsplit_once('.').unwrap().0
    ));
    assert_eq!(inboxes, 1);
}

#[tokio::test]
#[traced_test]
async fn test_concurrent_requests_are_correlated() {
    let broker = MockBroker::start().await;
    let responder = broker.client().await;
    let sub = responder.subscribe("echo").await.unwrap();
    broker.wait_for_subscribers("echo", 1).await;
    let _task = spawn_responder(responder.clone(), sub);

    let client = requester(&broker, true).await;
    let requests = (0..10).map(|n| {
        let client = client.clone();
        async move { (n, client.request("echo", format!("r{n}")).await) }
    });
    for (n, reply) in futures::future::join_all(requests).await {
        assert_eq!(reply.unwrap().payload, format!("R{n}").into_bytes());
    }
}

#[tokio::test]
#[traced_test]
async fn test_request_with_temporary_subscription() {
    let broker = MockBroker::start().await;
    let responder = broker.client().await;
    let sub = responder.subscribe("greet").await.unwrap();
    broker.wait_for_subscribers("greet", 1).await;
    let _task = spawn_responder(responder.clone(), sub);

    let client = requester(&broker, false).await;
    let reply = client.request("greet", "per-request").await.unwrap();
    assert_eq!(&reply.payload[..], b"PER-REQUEST");
    broker.wait_for_no_subscribers(&reply.subject).await;
}

#[tokio::test]
#[traced_test]
async fn test_no_responders() {
    let broker = MockBroker::start().await;
    for use_inbox in [true, false] {
        let client = requester(&broker, use_inbox).await;
        let err = client.request("nobody.home", "?").await.unwrap_err();
        assert!(
            matches!(err, NatsError::NoResponders { ref subject } if subject == "nobody.home"),
            "use_inbox={use_inbox}: {err:?}"
        );
    }
}

#[tokio::test]
#[traced_test]
async fn test_request_times_out() {
    let broker = MockBroker::with_config(BrokerConfig {
        no_responders: false,
        ..Default::default()
    })
    .await;
    let client = requester(&broker, true).await;
    let err = client
        .request_with_timeout("void", "?", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");

    // the client stays usable
    assert!(client.is_connected());
}

#[tokio::test]
#[traced_test]
async fn test_request_cancelled_by_token() {
    let broker = MockBroker::with_config(BrokerConfig {
        no_responders: false,
        ..Default::default()
    })
    .await;
    let client = requester(&broker, true).await;
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let err = client
        .request_with_token("void", "?", &token)
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
}

#[tokio::test]
#[traced_test]
async fn test_pending_request_cancelled_on_disconnect() {
    let broker = MockBroker::with_config(BrokerConfig {
        no_responders: false,
        ..Default::default()
    })
    .await;
    for use_inbox in [true, false] {
        let client = requester(&broker, use_inbox).await;
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.request("void", "?").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.disconnect().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_cancelled(), "use_inbox={use_inbox}: {err:?}");
    }
}

#[tokio::test]
async fn test_request_requires_connection() {
    let broker = MockBroker::start().await;
    let client = NatsClient::new(broker.connection_info()).unwrap();
    assert!(client.request("x", "y").await.unwrap_err().is_not_connected());
}
