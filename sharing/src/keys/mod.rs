//! Built-in backends
//!
//! ```text
//!   InMemoryKey          AppStorageKey          FileStorageKey
//!       │                      │                      │
//!       ▼                      ▼                      ▼
//! InMemoryStorage        KeyValueStore          dyn FileStorage
//! (typed, in-process)    (JSON values,          ├─ FileSystemStorage
//!                         optional file)        └─ InMemoryFileStorage
//! ```

pub mod app_storage;
pub mod file_storage;
pub mod in_memory;

pub use app_storage::{AppStorageKey, KeyValueStore, StoreError};
pub use file_storage::{FileStorage, FileStorageKey, FileSystemStorage, InMemoryFileStorage};
pub use in_memory::{InMemoryKey, InMemoryStorage};
