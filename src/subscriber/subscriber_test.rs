use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;
use crate::endpoint::route_candidates;

struct CountingSubscriber {
    hits: AtomicUsize,
}

impl CountingSubscriber {
    fn new() -> Arc<Self> {
        Arc::new(CountingSubscriber {
            hits: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl Subscriber for CountingSubscriber {
    async fn handle_message(&self, _msg: Bytes) -> i32 {
        self.hits.fetch_add(1, Ordering::SeqCst);
        0
    }
}

#[test]
fn test_register_replaces() {
    let table = SubscriberTable::new();
    let first = CountingSubscriber::new();
    let second = CountingSubscriber::new();

    table.register(":0".to_owned(), first.clone());
    table.register(":0".to_owned(), second.clone());
    assert_eq!(table.len(), 1);

    let found = table.find(":0").unwrap();
    tokio_test::block_on(found.handle_message(Bytes::new()));
    assert_eq!(first.hits.load(Ordering::SeqCst), 0);
    assert_eq!(second.hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_resolve_precedence() {
    let table = SubscriberTable::new();
    let sender_exact = CountingSubscriber::new();
    let local_wildcard = CountingSubscriber::new();
    let global = CountingSubscriber::new();

    table.register(":0".to_owned(), global.clone());
    table.register("localhost:2233".to_owned(), local_wildcard.clone());

    let src = "127.0.0.1:40000".parse().unwrap();
    let local = "127.0.0.1:2233".parse().unwrap();
    let keys = route_candidates(&src, &local);

    // Local wildcard beats the global one.
    assert!(table.resolve(&keys).is_some());
    table.register("127.0.0.1:40000".to_owned(), sender_exact.clone());

    // Exact sender beats everything; exercise it by handling a message.
    let resolved = table.resolve(&keys).unwrap();
    tokio_test::block_on(resolved.handle_message(Bytes::from_static(b"x")));
    assert_eq!(sender_exact.hits.load(Ordering::SeqCst), 1);
    assert_eq!(local_wildcard.hits.load(Ordering::SeqCst), 0);
    assert_eq!(global.hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_resolve_no_match() {
    let table = SubscriberTable::new();
    assert!(table.resolve(&["1.2.3.4:5".to_owned()]).is_none());
    assert!(table.is_empty());
}

#[test]
fn test_clear() {
    let table = SubscriberTable::new();
    table.register(":0".to_owned(), CountingSubscriber::new());
    table.clear();
    assert!(table.find(":0").is_none());
}
