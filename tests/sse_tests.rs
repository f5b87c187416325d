//! Integration tests for the SSE client's subscription map.

use resource_tree_handler::cache::TreeCache;
use resource_tree_handler::sse::SseClient;

fn offline_client() -> kube::Client {
    let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
    kube::Client::try_from(config).expect("client from static config")
}

fn sse_client(cache: TreeCache) -> SseClient {
    SseClient::new(
        "http://127.0.0.1:9/events".to_string(),
        offline_client(),
        cache,
    )
}

#[tokio::test]
async fn subscribe_is_idempotent() {
    let sse = sse_client(TreeCache::new());
    sse.subscribe_to("u1");
    sse.subscribe_to("u1");
    assert!(sse.is_subscribed("u1"));

    sse.unsubscribe_from("u1");
    assert!(!sse.is_subscribed("u1"));
}

#[tokio::test]
async fn unsubscribe_of_absent_id_is_a_noop() {
    let sse = sse_client(TreeCache::new());
    sse.unsubscribe_from("never-subscribed");
    assert!(!sse.is_subscribed("never-subscribed"));
}

#[tokio::test]
async fn subscriptions_are_registered_while_disconnected() {
    let sse = sse_client(TreeCache::new());
    assert!(!sse.is_connected());
    sse.subscribe_to("u2");
    assert!(sse.is_subscribed("u2"));
}

#[tokio::test]
async fn subscriptions_are_independent_per_composition() {
    let sse = sse_client(TreeCache::new());
    sse.subscribe_to("a");
    sse.subscribe_to("b");
    sse.unsubscribe_from("a");
    assert!(!sse.is_subscribed("a"));
    assert!(sse.is_subscribed("b"));
}
