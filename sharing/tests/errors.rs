mod common;

use common::MockKey;
use sharing::{PersistentReferences, Shared, SharedError, SharedObservable, SharedReader};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_initial_load_error_keeps_default() {
    let cache = PersistentReferences::new();
    let key = MockKey::<i32>::new("count", Some(5));
    *key.backend().load_error.lock() = Some("offline".to_string());

    let shared = Shared::new_in(&cache, key.clone(), 0);
    assert_eq!(shared.get(), 0);
    let error = shared.load_error().unwrap();
    assert!(error.is_load_failure());
    assert_eq!(error.to_string(), "load failed: offline");
    assert!(shared.save_error().is_none());
}

#[tokio::test]
async fn test_failed_load_keeps_last_good_value() {
    let cache = PersistentReferences::new();
    let key = MockKey::<i32>::new("count", Some(1));
    let backend = key.backend();
    let shared = Shared::new_in(&cache, key, 0);
    assert_eq!(shared.get(), 1);

    *backend.value.lock() = Some(2);
    *backend.load_error.lock() = Some("offline".to_string());
    let result = shared.load().await;
    assert!(matches!(result, Err(SharedError::LoadFailed(_))));
    assert_eq!(shared.get(), 1);
    assert!(shared.load_error().is_some());

    *backend.load_error.lock() = None;
    shared.load().await.unwrap();
    assert_eq!(shared.get(), 2);
    assert!(shared.load_error().is_none());
}

#[tokio::test]
async fn test_failed_save_keeps_local_value() {
    let cache = PersistentReferences::new();
    let key = MockKey::<i32>::new("count", Some(1));
    let backend = key.backend();
    let shared = Shared::new_in(&cache, key, 0);

    *backend.save_error.lock() = Some("disk full".to_string());
    shared.with_lock(|count| *count = 5);
    assert_eq!(shared.get(), 5);
    assert!(shared.save_error().unwrap().is_save_failure());
    assert!(shared.load_error().is_none());
    assert_eq!(*backend.value.lock(), Some(1));

    let result = shared.save().await;
    assert!(matches!(result, Err(SharedError::SaveFailed(_))));

    *backend.save_error.lock() = None;
    shared.save().await.unwrap();
    assert!(shared.save_error().is_none());
    assert_eq!(*backend.value.lock(), Some(5));
}

#[tokio::test]
async fn test_errors_latch_independently() {
    let cache = PersistentReferences::new();
    let key = MockKey::<i32>::new("count", Some(1));
    let backend = key.backend();
    let shared = Shared::new_in(&cache, key, 0);

    *backend.save_error.lock() = Some("disk full".to_string());
    *backend.load_error.lock() = Some("offline".to_string());
    shared.with_lock(|count| *count += 1);
    assert!(shared.load().await.is_err());
    assert!(shared.load_error().is_some());
    assert!(shared.save_error().is_some());

    // A successful save clears only the save error
    *backend.save_error.lock() = None;
    shared.save().await.unwrap();
    assert!(shared.save_error().is_none());
    assert!(shared.load_error().is_some());

    // ...and a successful load clears only the load error
    *backend.save_error.lock() = Some("disk full".to_string());
    shared.with_lock(|count| *count += 1);
    *backend.load_error.lock() = None;
    shared.load().await.unwrap();
    assert!(shared.load_error().is_none());
    assert!(shared.save_error().is_some());
}

#[tokio::test]
async fn test_subscription_error_latches_until_next_value() {
    let cache = PersistentReferences::new();
    let key = MockKey::<i32>::new("count", Some(1));
    let backend = key.backend();
    let reader = SharedReader::new_in(&cache, key, 0);

    backend.push_error("stream broke");
    assert_eq!(reader.get(), 1);
    assert!(reader.load_error().is_some());

    backend.push(2);
    assert_eq!(reader.get(), 2);
    assert!(reader.load_error().is_none());
}

#[tokio::test]
async fn test_require_without_value() {
    let cache = PersistentReferences::new();
    let result = Shared::require_in(&cache, MockKey::<i32>::new("missing", None)).await;
    match result {
        Err(SharedError::NoValueAvailable(description)) => assert_eq!(description, ".mock(\"missing\")"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_require_surfaces_load_failure() {
    let cache = PersistentReferences::new();
    let key = MockKey::<i32>::new("count", Some(1));
    *key.backend().load_error.lock() = Some("offline".to_string());
    let result = SharedReader::require_in(&cache, key).await;
    assert!(matches!(result, Err(SharedError::LoadFailed(_))));
}

#[tokio::test]
async fn test_require_loads_once_and_adopts_into_live_cell() {
    let cache = PersistentReferences::new();
    let key = MockKey::<i32>::new("count", Some(3));
    let backend = key.backend();

    let required = Shared::require_in(&cache, key.clone()).await.unwrap();
    assert_eq!(required.get(), 3);
    assert_eq!(backend.loads(), 1);

    *backend.value.lock() = Some(4);
    let again = SharedReader::require_in(&cache, key).await.unwrap();
    assert_eq!(again.get(), 4);
    assert_eq!(required.get(), 4);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_own_echo_is_ignored() {
    let cache = PersistentReferences::new();
    let key = MockKey::<i32>::new("count", Some(0));
    key.backend().echo_saves.store(true, Ordering::SeqCst);
    let shared = Shared::new_in(&cache, key.clone(), 0);

    let notifications = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notifications);
    let _subscription = shared.observe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    shared.with_lock(|count| *count += 1);
    shared.with_lock(|count| *count += 1);
    assert_eq!(notifications.load(Ordering::SeqCst), 2);

    // Pushes from anyone else still apply
    key.backend().push(10);
    assert_eq!(shared.get(), 10);
    assert_eq!(notifications.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_concurrent_load_and_save() {
    let cache = PersistentReferences::new();
    let key = MockKey::<i32>::new("count", Some(1));
    let backend = key.backend();
    let shared = Shared::new_in(&cache, key, 0);
    shared.with_lock(|count| *count = 2);

    let (loaded, saved) = futures::join!(shared.load(), shared.save());
    loaded.unwrap();
    saved.unwrap();
    assert_eq!(shared.get(), 2);
    assert_eq!(*backend.value.lock(), Some(2));
}
