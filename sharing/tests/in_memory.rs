use sharing::keys::{InMemoryKey, InMemoryStorage};
use sharing::{PersistentReferences, Shared, SharedObservable, SharedReader};

#[tokio::test]
async fn test_first_default_outlives_handles() {
    let cache = PersistentReferences::new();
    let storage = InMemoryStorage::new();

    let first = Shared::new_in(&cache, InMemoryKey::with_storage("count", &storage), 1);
    first.with_lock(|count| *count += 1);
    drop(first);
    assert!(cache.is_empty());

    let second = Shared::new_in(&cache, InMemoryKey::with_storage("count", &storage), 100);
    assert_eq!(second.get(), 2);
}

#[tokio::test]
async fn test_external_set_and_remove() {
    let cache = PersistentReferences::new();
    let storage = InMemoryStorage::new();
    let reader = SharedReader::new_in(&cache, InMemoryKey::with_storage("name", &storage), "Blob".to_string());
    let mut stream = reader.stream();

    storage.set_value("name", "Blob Jr".to_string());
    assert_eq!(reader.get(), "Blob Jr");

    storage.remove_value("name");
    assert_eq!(reader.get(), "Blob");
    assert!(!storage.contains("name"));

    assert_eq!(stream.drain(), vec!["Blob".to_string(), "Blob Jr".to_string(), "Blob".to_string()]);
}

#[tokio::test]
async fn test_type_mismatch_is_a_load_error() {
    let cache = PersistentReferences::new();
    let storage = InMemoryStorage::new();
    let count = SharedReader::new_in(&cache, InMemoryKey::<i32>::with_storage("slot", &storage), 3);

    storage.set_value("slot", "three".to_string());
    assert_eq!(count.get(), 3);
    assert!(count.load_error().is_some());

    storage.set_value("slot", 4);
    assert_eq!(count.get(), 4);
    assert!(count.load_error().is_none());
}

#[tokio::test]
async fn test_separate_storages_are_isolated() {
    let cache = PersistentReferences::new();
    let a = InMemoryStorage::new();
    let b = InMemoryStorage::new();
    assert!(a != b);
    assert!(a == a.clone());

    let in_a = Shared::new_in(&cache, InMemoryKey::with_storage("count", &a), 0);
    let in_b = Shared::new_in(&cache, InMemoryKey::with_storage("count", &b), 0);
    in_a.with_lock(|count| *count = 5);
    assert_eq!(in_b.get(), 0);
    assert_eq!(b.value::<i32>("count"), Some(0));
}
