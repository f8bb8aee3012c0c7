use serde::{Deserialize, Serialize};
use serde_json::json;
use sharing::keys::{AppStorageKey, KeyValueStore};
use sharing::{KeyDefault, PersistentReferences, Shared, SharedReader};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    visits: u32,
}

#[tokio::test]
async fn test_initial_value_is_written_through() {
    let cache = PersistentReferences::new();
    let store = KeyValueStore::in_memory();

    let count = Shared::new_in(&cache, AppStorageKey::with_store("count", &store), 5);
    assert_eq!(count.get(), 5);
    assert_eq!(store.get("count"), Some(json!(5)));

    count.with_lock(|count| *count += 1);
    assert_eq!(store.get("count"), Some(json!(6)));
}

#[tokio::test]
async fn test_structured_values_and_external_writes() {
    let cache = PersistentReferences::new();
    let store = KeyValueStore::in_memory();
    let profile = SharedReader::new_in(
        &cache,
        AppStorageKey::with_store("profile", &store),
        Profile {
            name: "Blob".to_string(),
            visits: 0,
        },
    );

    store.set("profile", json!({"name": "Blob", "visits": 3})).unwrap();
    assert_eq!(profile.get().visits, 3);

    store.set("profile", json!("garbage")).unwrap();
    assert_eq!(profile.get().visits, 3);
    assert!(profile.load_error().is_some());

    store.remove("profile").unwrap();
    assert_eq!(profile.get().visits, 0);
    assert!(profile.load_error().is_none());
}

#[tokio::test]
async fn test_undecodable_stored_value_is_a_load_error() {
    let cache = PersistentReferences::new();
    let store = KeyValueStore::in_memory();
    store.set("count", json!("not a number")).unwrap();

    let count = Shared::new_in(&cache, AppStorageKey::<i32>::with_store("count", &store), 0);
    assert_eq!(count.get(), 0);
    assert!(count.load_error().unwrap().is_load_failure());
    assert_eq!(store.get("count"), Some(json!("not a number")));
}

#[tokio::test]
async fn test_key_default_shares_identity() {
    let cache = PersistentReferences::new();
    let store = KeyValueStore::in_memory();
    let key = KeyDefault::new(AppStorageKey::<i32>::with_store("count", &store), 10);

    let with_default = Shared::from_default_key_in(&cache, key.clone());
    let plain = Shared::new_in(&cache, AppStorageKey::with_store("count", &store), 99);
    assert_eq!(cache.len(), 1);
    assert_eq!(plain.get(), 10);
    assert!(with_default == plain);

    plain.with_lock(|count| *count = 11);
    assert_eq!(with_default.get(), 11);
}

#[tokio::test]
async fn test_key_default_require_falls_back_to_default() {
    let cache = PersistentReferences::new();
    let store = KeyValueStore::in_memory();

    let required = Shared::require_in(&cache, KeyDefault::new(AppStorageKey::<i32>::with_store("count", &store), 10)).await;
    assert!(required.is_err());
    // The default was written through on the explicit load
    assert_eq!(store.get("count"), Some(json!(10)));

    let again = SharedReader::require_in(&cache, AppStorageKey::<i32>::with_store("count", &store))
        .await
        .unwrap();
    assert_eq!(again.get(), 10);
}

#[tokio::test]
async fn test_file_backed_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("defaults.json");
    {
        let cache = PersistentReferences::new();
        let store = KeyValueStore::open(&path).unwrap();
        let visits = Shared::new_in(&cache, AppStorageKey::with_store("visits", &store), 0u32);
        visits.with_lock(|visits| *visits += 1);
        visits.save().await.unwrap();
    }

    let cache = PersistentReferences::new();
    let store = KeyValueStore::open(&path).unwrap();
    let visits = SharedReader::require_in(&cache, AppStorageKey::<u32>::with_store("visits", &store))
        .await
        .unwrap();
    assert_eq!(visits.get(), 1);
    assert_eq!(store.names(), vec!["visits".to_string()]);
}
