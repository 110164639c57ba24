//! Per-resource reconcile state
//!
//! Every resource moves through
//! `Pending -> Reconciling -> Synced -> Deleting -> Gone`, with conflicts
//! dropping back to `Pending`. The tracker publishes the state map on a
//! `tokio::sync::watch` channel so callers can wait for a resource to settle
//! instead of polling. Reaching `Gone` drops the resource from the map, so
//! a name that comes back starts over as unknown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle state of one resource in the reconcile loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileState {
    /// Spec seen, workload not yet known to match
    Pending,
    /// Diff computed, write in flight
    Reconciling,
    /// Workload matches the spec
    Synced,
    /// Resource marked for deletion, waiting for the cascade
    Deleting,
    /// Resource and workload are gone; never stored, the entry is removed
    Gone,
}

impl ReconcileState {
    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Staying in the same state is always allowed.
    #[must_use]
    pub fn can_transition_to(self, next: ReconcileState) -> bool {
        use ReconcileState::{Deleting, Gone, Pending, Reconciling, Synced};

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Reconciling | Synced | Deleting | Gone)
                | (Reconciling, Pending | Synced | Deleting | Gone)
                | (Synced, Pending | Reconciling | Deleting | Gone)
                | (Deleting, Gone)
                // Same name recreated after deletion
                | (Gone, Pending)
        )
    }

    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileState::Pending => "pending",
            ReconcileState::Reconciling => "reconciling",
            ReconcileState::Synced => "synced",
            ReconcileState::Deleting => "deleting",
            ReconcileState::Gone => "gone",
        }
    }
}

/// Rejected state change
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal transition for {name}: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    /// Resource name
    pub name: String,
    /// Current state
    pub from: ReconcileState,
    /// Requested state
    pub to: ReconcileState,
}

/// Timed out waiting for a resource to reach a state
#[derive(Debug, Error, PartialEq, Eq)]
#[error("timed out after {waited:?} waiting on {name} (last state {last:?})")]
pub struct WaitTimeout {
    /// Resource name
    pub name: String,
    /// How long we waited
    pub waited: Duration,
    /// Last observed state
    pub last: Option<ReconcileState>,
}

/// Shared map of resource name to reconcile state.
///
/// Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct StateTracker {
    tx: Arc<watch::Sender<HashMap<String, ReconcileState>>>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HashMap::new());
        Self { tx: Arc::new(tx) }
    }

    /// Current state of a resource, if it has been seen
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ReconcileState> {
        self.tx.borrow().get(name).copied()
    }

    /// Move a resource to `next`, returning its previous state.
    ///
    /// Unknown resources may enter any state. Moving to `Gone` forgets the
    /// resource. Subscribers are only notified when the map actually changes.
    pub fn transition(&self, name: &str, next: ReconcileState) -> Result<Option<ReconcileState>, InvalidTransition> {
        let mut result = Ok(None);
        self.tx.send_if_modified(|states| {
            let previous = states.get(name).copied();
            if let Some(from) = previous.filter(|from| !from.can_transition_to(next)) {
                result = Err(InvalidTransition {
                    name: name.to_string(),
                    from,
                    to: next,
                });
                return false;
            }
            result = Ok(previous);
            if next == ReconcileState::Gone {
                return states.remove(name).is_some();
            }
            states.insert(name.to_string(), next);
            previous != Some(next)
        });
        result
    }

    /// Wait until `predicate` holds for the resource's state.
    pub async fn wait_for(
        &self,
        name: &str,
        timeout: Duration,
        predicate: impl Fn(Option<ReconcileState>) -> bool,
    ) -> Result<Option<ReconcileState>, WaitTimeout> {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|states| predicate(states.get(name).copied()))).await;
        match waited {
            Ok(Ok(states)) => Ok(states.get(name).copied()),
            // The sender lives as long as self, so only the timeout can fire
            _ => Err(WaitTimeout {
                name: name.to_string(),
                waited: timeout,
                last: self.get(name),
            }),
        }
    }

    /// Wait until the resource is `Synced`.
    pub async fn wait_synced(&self, name: &str, timeout: Duration) -> Result<(), WaitTimeout> {
        self.wait_for(name, timeout, |s| s == Some(ReconcileState::Synced))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReconcileState::*;

    #[test]
    fn test_transition_table() {
        assert!(Pending.can_transition_to(Reconciling));
        assert!(Reconciling.can_transition_to(Synced));
        assert!(Reconciling.can_transition_to(Pending));
        assert!(Synced.can_transition_to(Reconciling));
        assert!(Synced.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Gone));
        assert!(Gone.can_transition_to(Pending));

        assert!(!Deleting.can_transition_to(Synced));
        assert!(!Deleting.can_transition_to(Reconciling));
        assert!(!Gone.can_transition_to(Synced));
        assert!(!Gone.can_transition_to(Deleting));
    }

    #[test]
    fn test_tracker_rejects_illegal_transition() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.transition("gpu", Pending), Ok(None));
        assert_eq!(tracker.transition("gpu", Deleting), Ok(Some(Pending)));

        let err = tracker.transition("gpu", Synced).unwrap_err();
        assert_eq!(err.from, Deleting);
        assert_eq!(tracker.get("gpu"), Some(Deleting));
    }

    #[tokio::test]
    async fn test_gone_forgets_resource_and_notifies() {
        let tracker = StateTracker::new();
        tracker.transition("gpu", Pending).expect("enter pending");
        tracker.transition("gpu", Deleting).expect("deleting");

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for("gpu", Duration::from_secs(5), |s| s.is_none()).await })
        };

        assert_eq!(tracker.transition("gpu", Gone), Ok(Some(Deleting)));
        assert_eq!(waiter.await.expect("join"), Ok(None));
        assert_eq!(tracker.get("gpu"), None);

        // Forgetting an unknown name is a no-op
        assert_eq!(tracker.transition("gpu", Gone), Ok(None));
        assert_eq!(tracker.transition("gpu", Pending), Ok(None));
    }

    #[tokio::test]
    async fn test_wait_for_is_notified_without_polling() {
        let tracker = StateTracker::new();
        tracker.transition("gpu", Pending).expect("enter pending");

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_synced("gpu", Duration::from_secs(5)).await })
        };

        tracker.transition("gpu", Reconciling).expect("reconciling");
        tracker.transition("gpu", Synced).expect("synced");

        assert_eq!(waiter.await.expect("join"), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let tracker = StateTracker::new();
        tracker.transition("gpu", Pending).expect("enter pending");

        let err = tracker
            .wait_synced("gpu", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.last, Some(Pending));
    }
}
