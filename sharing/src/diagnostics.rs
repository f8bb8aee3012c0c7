//! Issue reporting
//!
//! Programmer errors in backends (a continuation resumed twice, or dropped
//! without being resumed) cannot be attributed to a specific caller, so they
//! are not returned from any operation. Instead they are logged and broadcast
//! to every live [`IssueReceiver`].
//!
//! Tests subscribe before exercising a backend and assert on what arrived:
//!
//! ```
//! use sharing::diagnostics;
//!
//! let mut issues = diagnostics::subscribe_issues();
//! // ... exercise a misbehaving backend ...
//! assert!(issues.drain().is_empty());
//! ```
//!
//! Reporting never panics.

use lazy_static::lazy_static;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::config::SharingConfig;
use crate::error::SharedError;

lazy_static! {
    static ref ISSUES: broadcast::Sender<SharedError> = {
        let capacity = SharingConfig::from_env().issue_channel_capacity.max(1);
        broadcast::channel(capacity).0
    };
}

/// Report a non-fatal issue
pub fn report_issue(issue: SharedError) {
    error!(%issue, "sharing issue");
    // No receivers is the normal production case
    let _ = ISSUES.send(issue);
}

/// Start receiving issues reported from now on
#[must_use]
pub fn subscribe_issues() -> IssueReceiver {
    IssueReceiver {
        receiver: ISSUES.subscribe(),
    }
}

/// Receiving end of the issue broadcast
///
/// Drop it to unsubscribe.
pub struct IssueReceiver {
    receiver: broadcast::Receiver<SharedError>,
}

impl IssueReceiver {
    /// Take every issue received so far without waiting
    pub fn drain(&mut self) -> Vec<SharedError> {
        let mut issues = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(issue) => issues.push(issue),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "issue receiver lagged");
                }
                Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed) => {
                    break;
                }
            }
        }
        issues
    }

    /// Take the issues whose message mentions `needle`
    ///
    /// Issues are process-wide, so concurrently running tests filter by the
    /// description of the key they exercise.
    pub fn drain_matching(&mut self, needle: &str) -> Vec<SharedError> {
        self.drain()
            .into_iter()
            .filter(|issue| issue.to_string().contains(needle))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Misuse;

    #[test]
    fn test_reported_issue_reaches_subscriber() {
        let mut issues = subscribe_issues();
        report_issue(SharedError::ContinuationMisuse {
            description: "'diagnostics-unit-test'".to_string(),
            misuse: Misuse::NeverResumed,
        });
        let matching = issues.drain_matching("diagnostics-unit-test");
        assert_eq!(matching.len(), 1);
    }

    #[test]
    fn test_report_without_subscribers_is_silent() {
        report_issue(SharedError::Cancelled);
    }
}
