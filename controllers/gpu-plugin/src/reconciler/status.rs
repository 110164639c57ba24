//! Status reporting
//!
//! The reporter re-reads the resource, merges the update into the stored
//! status and writes only if something changed. Transition timestamps are
//! carried over for conditions whose status did not change, so reporting
//! the same thing twice is a no-op. Status write conflicts are retried with
//! jittered backoff against a fresh read.

use crate::backoff::{RetryConfig, retry_with_backoff};
use chrono::Utc;
use crds::{ConditionStatus, ConditionType, GpuDevicePluginStatus, PluginCondition, WorkloadReference, find_condition};
use tracing::debug;
use workload_store::{StoreError, WorkloadStore};

/// Reason reported while the owned workload matches the spec
pub const REASON_SYNCED: &str = "Synced";
/// Reason reported when validation fails
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
/// Reason reported when the workload name is taken by another owner
pub const REASON_OWNERSHIP_CONFLICT: &str = "OwnershipConflict";
/// Reason reported when the store stays unreachable
pub const REASON_STORE_UNAVAILABLE: &str = "StoreUnavailable";
/// Reason reported once the store is reachable again
pub const REASON_STORE_REACHABLE: &str = "StoreReachable";

/// Changes to apply to a resource's status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    /// Controlled workload; `None` keeps the stored reference
    pub workload: Option<WorkloadReference>,
    /// `(desiredNumberScheduled, numberReady)`; `None` keeps stored counts
    pub rollout: Option<(i32, i32)>,
    /// Conditions to set; other condition types are kept
    pub conditions: Vec<PluginCondition>,
    /// Spec generation the update was computed from
    pub observed_generation: Option<i64>,
}

/// Builds a condition without a timestamp; the reporter fills it in.
#[must_use]
pub fn condition(
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> PluginCondition {
    PluginCondition {
        type_,
        status,
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: None,
        observed_generation,
    }
}

fn condition_order(type_: ConditionType) -> u8 {
    match type_ {
        ConditionType::Ready => 0,
        ConditionType::Degraded => 1,
    }
}

/// Merges `update` into `current`, keeping transition times where the
/// condition status is unchanged.
#[must_use]
pub fn merge_status(current: &GpuDevicePluginStatus, update: &StatusUpdate) -> GpuDevicePluginStatus {
    let mut next = current.clone();

    if let Some(workload) = &update.workload {
        next.controlled_daemon_set = Some(workload.clone());
    }
    if let Some((desired, ready)) = update.rollout {
        next.desired_number_scheduled = desired;
        next.number_ready = ready;
    }
    if update.observed_generation.is_some() {
        next.observed_generation = update.observed_generation;
    }

    for incoming in &update.conditions {
        let previous = find_condition(&current.conditions, incoming.type_);
        let mut merged = incoming.clone();
        merged.last_transition_time = match previous {
            Some(prev) if prev.status == incoming.status => prev.last_transition_time,
            _ => Some(Utc::now()),
        };
        next.conditions.retain(|c| c.type_ != incoming.type_);
        next.conditions.push(merged);
    }
    next.conditions.sort_by_key(|c| condition_order(c.type_));

    next
}

/// Writes status onto resources
pub struct StatusReporter<'a> {
    store: &'a dyn WorkloadStore,
    retry: &'a RetryConfig,
}

impl<'a> StatusReporter<'a> {
    /// Create a reporter writing through `store`
    pub fn new(store: &'a dyn WorkloadStore, retry: &'a RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Apply `update` to the named resource's status.
    ///
    /// Returns whether a write happened. A missing resource is not an error:
    /// there is nothing left to report on.
    pub async fn report(&self, name: &str, update: &StatusUpdate) -> Result<bool, StoreError> {
        let store = self.store;
        retry_with_backoff(self.retry, "status update", StoreError::is_conflict, || async move {
            let Some(plugin) = store.get_plugin(name).await? else {
                debug!(plugin = %name, "Resource gone, skipping status update");
                return Ok(false);
            };

            let current = plugin.status.unwrap_or_default();
            let next = merge_status(&current, update);
            if next == current {
                debug!(plugin = %name, "Status unchanged");
                return Ok(false);
            }

            store
                .patch_plugin_status(name, plugin.metadata.resource_version.as_deref(), &next)
                .await?;
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{GpuDevicePlugin, GpuDevicePluginSpec};
    use std::time::Duration;
    use workload_store::MockWorkloadStore;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn ready_update() -> StatusUpdate {
        StatusUpdate {
            workload: Some(WorkloadReference {
                api_version: "apps/v1".to_string(),
                kind: "DaemonSet".to_string(),
                name: "intel-gpu-plugin-gpu".to_string(),
                namespace: "inteldeviceplugins-system".to_string(),
                uid: "ds-uid".to_string(),
            }),
            rollout: Some((3, 1)),
            conditions: vec![condition(
                ConditionType::Ready,
                ConditionStatus::True,
                REASON_SYNCED,
                "DaemonSet matches spec",
                Some(1),
            )],
            observed_generation: Some(1),
        }
    }

    fn store_with_plugin() -> MockWorkloadStore {
        let store = MockWorkloadStore::new("inteldeviceplugins-system");
        store.add_plugin(GpuDevicePlugin::new(
            "gpu",
            GpuDevicePluginSpec {
                image: "gpu-testimage".to_string(),
                ..Default::default()
            },
        ));
        store
    }

    #[tokio::test]
    async fn test_repeated_report_is_idempotent() {
        let store = store_with_plugin();
        let retry = fast_retry();
        let reporter = StatusReporter::new(&store, &retry);

        assert!(reporter.report("gpu", &ready_update()).await.expect("report"));
        let first = store.plugin("gpu").and_then(|p| p.status).expect("status written");

        assert!(!reporter.report("gpu", &ready_update()).await.expect("report"));
        assert_eq!(store.status_write_count(), 1);

        let second = store.plugin("gpu").and_then(|p| p.status).expect("status kept");
        assert_eq!(first, second);
        assert_eq!(second.controlled_daemon_set.map(|r| r.uid), Some("ds-uid".to_string()));
        assert_eq!(second.desired_number_scheduled, 3);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_with_fresh_read() {
        let store = store_with_plugin();
        store.inject_status_conflicts(2);
        let retry = fast_retry();
        let reporter = StatusReporter::new(&store, &retry);

        assert!(reporter.report("gpu", &ready_update()).await.expect("report"));
        assert_eq!(store.status_write_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_resource_is_not_an_error() {
        let store = MockWorkloadStore::new("inteldeviceplugins-system");
        let retry = fast_retry();
        let reporter = StatusReporter::new(&store, &retry);
        assert!(!reporter.report("gone", &ready_update()).await.expect("report"));
    }

    #[test]
    fn test_merge_keeps_transition_time_and_orders_conditions() {
        let degraded = StatusUpdate {
            conditions: vec![condition(
                ConditionType::Degraded,
                ConditionStatus::True,
                REASON_STORE_UNAVAILABLE,
                "",
                None,
            )],
            ..Default::default()
        };
        let after_degraded = merge_status(&GpuDevicePluginStatus::default(), &degraded);
        let after_ready = merge_status(&after_degraded, &ready_update());

        assert_eq!(after_ready.conditions.len(), 2);
        assert_eq!(after_ready.conditions[0].type_, ConditionType::Ready);
        assert_eq!(after_ready.conditions[1].type_, ConditionType::Degraded);
        assert_eq!(
            after_ready.conditions[1].last_transition_time,
            after_degraded.conditions[0].last_transition_time
        );

        let reapplied = merge_status(&after_ready, &ready_update());
        assert_eq!(reapplied, after_ready);
    }
}
