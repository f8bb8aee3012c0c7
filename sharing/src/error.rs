//! Error types shared by the cache, the handles and the built-in backends

use std::fmt;
use std::sync::Arc;

/// Boxed error a backend hands to a continuation or subscriber
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Backend error as stored on a cell
///
/// Reference-counted so the same latched error can be handed to every
/// handle and to the explicit caller that triggered it.
pub type BackendError = Arc<dyn std::error::Error + Send + Sync>;

/// How a backend violated the exactly-once contract of a continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    /// `resume_*` was called a second (or later) time
    ResumedMoreThanOnce,
    /// The continuation was dropped without ever being resumed
    NeverResumed,
}

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResumedMoreThanOnce => write!(f, "tried to resume its continuation more than once"),
            Self::NeverResumed => write!(
                f,
                "leaked its continuation without resuming it; tasks waiting on it may remain suspended forever"
            ),
        }
    }
}

/// Errors surfaced by shared references
#[derive(Debug, Clone, thiserror::Error)]
pub enum SharedError {
    /// The backend failed to load a value
    #[error("load failed: {0}")]
    LoadFailed(#[source] BackendError),

    /// The backend failed to save a value
    #[error("save failed: {0}")]
    SaveFailed(#[source] BackendError),

    /// The backend holds no value and no default was supplied
    #[error("no value available for {0}")]
    NoValueAvailable(String),

    /// A backend broke the exactly-once resume contract
    #[error("{description} {misuse}")]
    ContinuationMisuse { description: String, misuse: Misuse },

    /// The operation was superseded by a newer load or its reference was released
    #[error("operation cancelled")]
    Cancelled,
}

impl SharedError {
    /// The backend error behind a load or save failure
    #[must_use]
    pub fn backend_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::LoadFailed(source) | Self::SaveFailed(source) => Some(source.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_load_failure(&self) -> bool {
        matches!(self, Self::LoadFailed(_))
    }

    #[must_use]
    pub fn is_save_failure(&self) -> bool {
        matches!(self, Self::SaveFailed(_))
    }
}

/// Convert anything error-like into the shared backend representation
pub(crate) fn into_backend_error(error: impl Into<BoxError>) -> BackendError {
    Arc::from(error.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskOnFire;

    #[test]
    fn test_backend_error_downcasts() {
        let error = SharedError::SaveFailed(into_backend_error(DiskOnFire));
        assert!(error.is_save_failure());
        assert!(error
            .backend_error()
            .and_then(|e| e.downcast_ref::<DiskOnFire>())
            .is_some());
        assert_eq!(error.to_string(), "save failed: disk on fire");
    }

    #[test]
    fn test_misuse_message_names_the_key() {
        let error = SharedError::ContinuationMisuse {
            description: "'.in_memory(\"count\")'".to_string(),
            misuse: Misuse::ResumedMoreThanOnce,
        };
        assert_eq!(
            error.to_string(),
            "'.in_memory(\"count\")' tried to resume its continuation more than once"
        );
    }

    #[test]
    fn test_string_errors_convert() {
        let error = into_backend_error("plain message");
        assert_eq!(error.to_string(), "plain message");
    }
}
