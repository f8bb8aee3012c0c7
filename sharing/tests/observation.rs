use futures::StreamExt;
use sharing::keys::{InMemoryKey, InMemoryStorage};
use sharing::{PersistentReferences, Shared, SharedObservable};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_stream_starts_with_current_value() {
    let count = Shared::from_value(0);
    let mut stream = count.stream();
    for _ in 0..3 {
        count.with_lock(|count| *count += 1);
    }
    assert_eq!(stream.drain(), vec![0, 1, 2, 3]);
    assert_eq!(stream.try_next_value(), None);
}

#[tokio::test]
async fn test_stream_across_tasks() {
    let cache = PersistentReferences::new();
    let storage = InMemoryStorage::new();
    let count = Shared::new_in(&cache, InMemoryKey::with_storage("count", &storage), 0);
    let mut stream = count.reader().stream();

    let writer = count.clone();
    let task = tokio::spawn(async move {
        for _ in 0..3 {
            writer.with_lock(|count| *count += 1);
            tokio::task::yield_now().await;
        }
    });

    let mut seen = Vec::new();
    while seen.last() != Some(&3) {
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next_value()).await.unwrap();
        seen.push(next.unwrap());
    }
    task.await.unwrap();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_stream_combinators() {
    let count = Shared::from_value(1);
    let stream = count.stream();
    count.with_lock(|count| *count = 2);
    count.with_lock(|count| *count = 3);

    let doubled: Vec<i32> = stream.map(|count| count * 2).take(3).collect().await;
    assert_eq!(doubled, vec![2, 4, 6]);
}

#[tokio::test]
async fn test_external_change_reaches_stream() {
    let cache = PersistentReferences::new();
    let storage = InMemoryStorage::new();
    let count = Shared::new_in(&cache, InMemoryKey::with_storage("count", &storage), 0);
    let mut stream = count.stream();

    storage.set_value("count", 42);
    assert_eq!(stream.drain(), vec![0, 42]);
}

#[tokio::test]
async fn test_observe_until_dropped() {
    let count = Shared::from_value(0);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let subscription = count.observe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    count.with_lock(|count| *count += 1);
    assert!(subscription.is_active());
    drop(subscription);
    count.with_lock(|count| *count += 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_listener_may_mutate_other_handles() {
    let source = Shared::from_value(0);
    let mirror = Shared::from_value(0);
    let target = mirror.clone();
    let _subscription = source.observe(move |value| {
        let value = *value;
        target.with_lock(|mirrored| *mirrored = value * 10);
    });

    source.with_lock(|value| *value = 4);
    assert_eq!(mirror.get(), 40);
}
