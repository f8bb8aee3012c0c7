pub mod config;
pub mod continuation;
pub mod defaults;
pub mod diagnostics;
mod echo;
pub mod error;
pub mod key;
pub mod keys;
pub mod observation;
pub mod persistent_references;
mod reference;
pub mod shared;
pub mod shared_reader;
pub mod subscriber;
pub mod subscription;

// Re-export handle types for convenience
pub use shared::Shared;
pub use shared_reader::SharedReader;

// Re-export key capability types for convenience
pub use continuation::{LoadContinuation, SaveContinuation, SharedContinuation};
pub use key::{KeyDefault, LoadContext, LoadResult, SaveContext, SharedKey, SharedReaderKey, SharedValue};
pub use subscriber::SharedSubscriber;
pub use subscription::SharedSubscription;

// Re-export cache, errors and observation
pub use config::SharingConfig;
pub use error::{BackendError, BoxError, Misuse, SharedError};
pub use observation::{SharedObservable, SharedStream};
pub use persistent_references::PersistentReferences;

/// Writable view of a field path, identified by the path itself
///
/// `project!(shared, a.b)` is `shared.project_path("a.b", |v| &v.a.b, |v| &mut v.a.b)`,
/// so two projections of the same path compare equal.
#[macro_export]
macro_rules! project {
    ($shared:expr, $($field:tt).+) => {
        $shared.project_path(
            stringify!($($field).+),
            |root| &root.$($field).+,
            |root| &mut root.$($field).+,
        )
    };
}
