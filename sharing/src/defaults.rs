//! Process-wide defaults used by constructors without an `_in` suffix
//!
//! Tests that need isolation either pass their own cache and storages to the
//! `*_in` / `with_storage` constructors, or call [`prepare`] once at start-up.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::SharingConfig;
use crate::keys::{FileStorage, FileSystemStorage, InMemoryStorage, KeyValueStore};
use crate::persistent_references::PersistentReferences;

#[derive(Clone)]
pub struct SharingDefaults {
    pub references: PersistentReferences,
    pub in_memory_storage: InMemoryStorage,
    pub key_value_store: KeyValueStore,
    pub file_storage: Arc<dyn FileStorage>,
    pub config: SharingConfig,
}

impl SharingDefaults {
    /// Fresh cache and storages, configured from the environment
    #[must_use]
    pub fn live() -> Self {
        let config = SharingConfig::from_env();
        Self {
            references: PersistentReferences::new(),
            in_memory_storage: InMemoryStorage::new(),
            key_value_store: KeyValueStore::in_memory(),
            file_storage: Arc::new(FileSystemStorage::new(config.file_poll_interval())),
            config,
        }
    }
}

lazy_static! {
    static ref DEFAULTS: RwLock<SharingDefaults> = RwLock::new(SharingDefaults::live());
}

/// Snapshot of the current defaults
#[must_use]
pub fn current() -> SharingDefaults {
    DEFAULTS.read().clone()
}

/// The process-wide reference cache
#[must_use]
pub fn references() -> PersistentReferences {
    DEFAULTS.read().references.clone()
}

/// Override the defaults
///
/// Affects handles and keys created afterwards; existing ones keep what they
/// were built with.
pub fn prepare(update: impl FnOnce(&mut SharingDefaults)) {
    update(&mut DEFAULTS.write());
}
