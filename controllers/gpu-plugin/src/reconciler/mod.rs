//! Reconciliation logic for GpuDevicePlugin resources.
//!
//! One pass reads the resource fresh, migrates it if it was written under an
//! older schema, validates and normalizes the spec, builds the desired
//! DaemonSet, diffs it against the live one and applies the minimal change.
//! Status is reported last.
//!
//! - `normalize`: defaults and validation
//! - `builder`: desired workload and manifest
//! - `diff`: desired vs observed comparison
//! - `ownership`: owner references and name collision checks
//! - `status`: condition and workload reference reporting
//! - `upgrade`: schema generation migration

pub mod builder;
pub mod diff;
pub mod normalize;
pub mod ownership;
pub mod status;
pub mod upgrade;


use crate::backoff::{ExponentialBackoff, RetryConfig, jittered};
use crate::config::Settings;
use crate::error::ControllerError;
use crate::event::PluginEvent;
use crate::metrics::Metrics;
use crate::state::{ReconcileState, StateTracker};
use crds::{ConditionStatus, ConditionType, DevicePlugin, GpuDevicePlugin, WorkloadReference};
use diff::{DiffOutcome, ObservedWorkload};
use k8s_openapi::api::apps::v1::DaemonSet;
use ownership::{OwnerIdentity, Ownership};
use status::{StatusReporter, StatusUpdate, condition};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use workload_store::WorkloadStore;

/// Base delay before retrying after a write conflict
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);
/// Poll interval while waiting for garbage collection
const DELETING_REQUEUE: Duration = Duration::from_secs(2);
/// Periodic re-check of synced resources
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);
/// Retry interval for name collisions and unexpected errors
const SLOW_REQUEUE: Duration = Duration::from_secs(300);

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: ExponentialBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300)), // 1s min, 5m max
            error_count: 0,
        }
    }
}

/// Result of a successful reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// DaemonSet created
    Created,
    /// DaemonSet patched; carries the changed fields
    Patched(Vec<&'static str>),
    /// DaemonSet already matched
    Unchanged,
    /// Spec rejected; waits for an edit
    Invalid(String),
    /// DaemonSet name taken by another owner
    OwnershipConflict(String),
    /// Resource is being deleted, DaemonSet still present
    Deleting,
    /// Resource gone
    Gone,
}

impl ReconcileOutcome {
    /// Metric label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::Patched(_) => "patched",
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Invalid(_) => "invalid",
            ReconcileOutcome::OwnershipConflict(_) => "ownership_conflict",
            ReconcileOutcome::Deleting => "deleting",
            ReconcileOutcome::Gone => "gone",
        }
    }

    /// When to look at the resource again; `None` waits for the next change.
    #[must_use]
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ReconcileOutcome::Created | ReconcileOutcome::Patched(_) | ReconcileOutcome::Unchanged => {
                Some(RESYNC_INTERVAL)
            }
            ReconcileOutcome::OwnershipConflict(_) => Some(SLOW_REQUEUE),
            ReconcileOutcome::Deleting => Some(DELETING_REQUEUE),
            ReconcileOutcome::Invalid(_) | ReconcileOutcome::Gone => None,
        }
    }
}

/// Outcome of the pre-write re-read
enum WriteGuard {
    Proceed,
    Deleting,
    Gone,
}

/// Reconciles GpuDevicePlugin resources.
pub struct Reconciler {
    store: Box<dyn WorkloadStore>,
    states: StateTracker,
    metrics: Arc<Metrics>,
    status_retry: RetryConfig,
    max_transient_retries: u32,
    /// Error count tracking per resource (name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    /// Create a reconciler writing through `store`
    pub fn new(store: Box<dyn WorkloadStore>, settings: &Settings, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            states: StateTracker::new(),
            metrics,
            status_retry: RetryConfig::default(),
            max_transient_retries: settings.max_transient_retries,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the status conflict retry policy
    #[must_use]
    pub fn with_status_retry(mut self, retry: RetryConfig) -> Self {
        self.status_retry = retry;
        self
    }

    /// Per-resource state tracker, also the readiness notifier
    #[must_use]
    pub fn states(&self) -> &StateTracker {
        &self.states
    }

    /// Reconcile one resource from a watch snapshot.
    ///
    /// The snapshot only identifies the resource and classifies the event;
    /// the pass itself works from a fresh read.
    pub async fn reconcile_plugin(&self, snapshot: Arc<GpuDevicePlugin>) -> Result<ReconcileOutcome, ControllerError> {
        let name = snapshot
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::InvalidResource("GpuDevicePlugin missing name".to_string()))?;
        let event = PluginEvent::classify(snapshot, self.states.get(&name));
        debug!(
            plugin = %name,
            event = event.kind(),
            resource_version = ?event.plugin().metadata.resource_version,
            "Reconciling"
        );

        let started = Instant::now();
        let result = self.reconcile_pass(&name).await;

        match &result {
            Ok(outcome) => {
                self.reset_errors(&name);
                self.metrics.record_reconcile(outcome.label(), started.elapsed());
            }
            Err(e) => {
                self.metrics.record_reconcile("error", started.elapsed());
                if e.is_conflict() {
                    debug!(plugin = %name, error = %e, "Write conflict, retrying from a fresh read");
                    self.advance(&name, ReconcileState::Pending);
                } else if e.is_transient() {
                    self.record_transient_failure(&name, e).await;
                } else {
                    warn!(plugin = %name, error = %e, "Reconciliation failed");
                }
            }
        }
        result
    }

    async fn reconcile_pass(&self, name: &str) -> Result<ReconcileOutcome, ControllerError> {
        let Some(mut plugin) = self.store.get_plugin(name).await? else {
            self.mark_gone(name);
            return Ok(ReconcileOutcome::Gone);
        };

        if plugin.metadata.deletion_timestamp.is_some() {
            return self.handle_deletion(&plugin, name).await;
        }
        match self.states.get(name) {
            // Deleted and recreated under the same name without a removal
            // notice in between
            Some(ReconcileState::Deleting) => {
                debug!(plugin = %name, "Resource recreated while tracked as deleting");
                self.mark_gone(name);
                self.advance(name, ReconcileState::Pending);
            }
            None => self.advance(name, ReconcileState::Pending),
            Some(_) => {}
        }

        let migrated = upgrade::needs_migration(&plugin)
            .and_then(|stale| stale.then(|| upgrade::migrate(&plugin)).transpose());
        match migrated {
            Ok(Some(migrated)) => {
                plugin = self.store.replace_plugin(&migrated).await?;
                info!(plugin = %name, action = "migrate", "Migrated resource to current schema generation");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(plugin = %name, error = %e, "Rejecting resource that cannot be migrated");
                let message = e.to_string();
                return self
                    .reject(&plugin, status::REASON_INVALID_SPEC, &message, ReconcileOutcome::Invalid(message.clone()))
                    .await;
            }
        }

        if let Err(e) = normalize::validate(&plugin.spec) {
            warn!(plugin = %name, error = %e, "Rejecting invalid spec");
            let message = e.to_string();
            return self
                .reject(&plugin, status::REASON_INVALID_SPEC, &message, ReconcileOutcome::Invalid(message.clone()))
                .await;
        }

        let spec = normalize::normalize(&plugin.spec);
        let owner = OwnerIdentity::of(&plugin)?;
        let desired = builder::build(&spec, &owner, self.store.namespace());

        let existing = self.store.get_workload(&desired.name).await?;
        if let Some(ds) = &existing {
            let holder = match ownership::classify(ds, &owner) {
                Ownership::Owned => None,
                Ownership::Foreign(other) => Some(format!("controlled by {other}")),
                Ownership::Unowned => Some("not controlled by any resource".to_string()),
            };
            if let Some(holder) = holder {
                let message = format!("DaemonSet {}/{} exists and is {holder}", desired.namespace, desired.name);
                warn!(plugin = %name, workload = %desired.name, "{}", message);
                return self
                    .reject(
                        &plugin,
                        status::REASON_OWNERSHIP_CONFLICT,
                        &message,
                        ReconcileOutcome::OwnershipConflict(message.clone()),
                    )
                    .await;
            }
        }

        let observed = existing
            .as_ref()
            .map(|ds| ObservedWorkload::from_daemon_set(ds, &desired.container_name));

        let (outcome, workload) = match diff::diff(&desired, observed.as_ref()) {
            DiffOutcome::NoOp => (ReconcileOutcome::Unchanged, existing),
            DiffOutcome::Create => {
                self.advance(name, ReconcileState::Reconciling);
                if let Some(abandoned) = self.guard_write(name, &owner.uid).await? {
                    return Ok(abandoned);
                }
                let created = self.store.create_workload(&desired.to_daemon_set()).await?;
                self.metrics.record_workload_write("create");
                info!(plugin = %name, workload = %desired.name, action = "create", "Created DaemonSet");
                (ReconcileOutcome::Created, Some(created))
            }
            DiffOutcome::Patch(patch) => {
                self.advance(name, ReconcileState::Reconciling);
                if let Some(abandoned) = self.guard_write(name, &owner.uid).await? {
                    return Ok(abandoned);
                }
                let fields = patch.changed_fields();
                let resource_version = observed.as_ref().and_then(|o| o.resource_version.as_deref());
                let patched = self
                    .store
                    .patch_workload(&desired.name, resource_version, &patch)
                    .await?;
                self.metrics.record_workload_write("patch");
                info!(
                    plugin = %name,
                    workload = %desired.name,
                    action = "patch",
                    "Patched DaemonSet fields {:?}",
                    fields
                );
                (ReconcileOutcome::Patched(fields), Some(patched))
            }
        };

        self.advance(name, ReconcileState::Synced);
        self.report_synced(&plugin, workload.as_ref()).await?;
        Ok(outcome)
    }

    /// Re-reads the resource right before a write.
    ///
    /// Returns the outcome to stop with when the resource was deleted (or
    /// replaced under the same name) since the pass started.
    async fn guard_write(&self, name: &str, uid: &str) -> Result<Option<ReconcileOutcome>, ControllerError> {
        let guard = match self.store.get_plugin(name).await? {
            None => WriteGuard::Gone,
            Some(current) if current.metadata.uid.as_deref() != Some(uid) => WriteGuard::Gone,
            Some(current) if current.metadata.deletion_timestamp.is_some() => WriteGuard::Deleting,
            Some(_) => WriteGuard::Proceed,
        };

        match guard {
            WriteGuard::Proceed => Ok(None),
            WriteGuard::Deleting => {
                info!(plugin = %name, "Resource is being deleted, skipping workload write");
                self.advance(name, ReconcileState::Deleting);
                Ok(Some(ReconcileOutcome::Deleting))
            }
            WriteGuard::Gone => {
                info!(plugin = %name, "Resource no longer exists, skipping workload write");
                self.mark_gone(name);
                Ok(Some(ReconcileOutcome::Gone))
            }
        }
    }

    /// The owned DaemonSet is removed by garbage collection; only wait for it.
    async fn handle_deletion(&self, plugin: &GpuDevicePlugin, name: &str) -> Result<ReconcileOutcome, ControllerError> {
        self.advance(name, ReconcileState::Deleting);

        let workload_name = plugin.workload_name();
        let still_owned = match (self.store.get_workload(&workload_name).await?, OwnerIdentity::of(plugin)) {
            (Some(ds), Ok(owner)) => ownership::classify(&ds, &owner) == Ownership::Owned,
            _ => false,
        };

        if still_owned {
            debug!(plugin = %name, workload = %workload_name, "Waiting for DaemonSet garbage collection");
            return Ok(ReconcileOutcome::Deleting);
        }

        info!(plugin = %name, action = "delete", "Resource and DaemonSet gone");
        self.mark_gone(name);
        Ok(ReconcileOutcome::Gone)
    }

    /// Record that a resource disappeared from the cluster.
    pub fn observe_removed(&self, name: &str) {
        if self.states.get(name).is_some() {
            debug!(plugin = %name, "Resource removed");
            self.mark_gone(name);
        }
    }

    fn mark_gone(&self, name: &str) {
        self.advance(name, ReconcileState::Gone);
        self.reset_errors(name);
    }

    fn advance(&self, name: &str, next: ReconcileState) {
        if let Err(e) = self.states.transition(name, next) {
            warn!(plugin = %name, "{}", e);
        }
    }

    async fn report_synced(&self, plugin: &GpuDevicePlugin, workload: Option<&DaemonSet>) -> Result<(), ControllerError> {
        let name = plugin.metadata.name.as_deref().unwrap_or_default();
        let generation = plugin.metadata.generation;

        let reference = workload.and_then(|ds| {
            Some(WorkloadReference {
                api_version: "apps/v1".to_string(),
                kind: "DaemonSet".to_string(),
                name: ds.metadata.name.clone()?,
                namespace: ds
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_else(|| self.store.namespace().to_string()),
                uid: ds.metadata.uid.clone()?,
            })
        });
        let rollout = workload
            .and_then(|ds| ds.status.as_ref())
            .map_or((0, 0), |s| (s.desired_number_scheduled, s.number_ready));

        let update = StatusUpdate {
            workload: reference,
            rollout: Some(rollout),
            conditions: vec![
                condition(
                    ConditionType::Ready,
                    ConditionStatus::True,
                    status::REASON_SYNCED,
                    "DaemonSet matches spec",
                    generation,
                ),
                reachable(generation),
            ],
            observed_generation: generation,
        };

        StatusReporter::new(self.store.as_ref(), &self.status_retry)
            .report(name, &update)
            .await?;
        Ok(())
    }

    async fn reject(
        &self,
        plugin: &GpuDevicePlugin,
        reason: &str,
        message: &str,
        outcome: ReconcileOutcome,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let name = plugin.metadata.name.as_deref().unwrap_or_default();
        let generation = plugin.metadata.generation;
        self.advance(name, ReconcileState::Pending);

        let update = StatusUpdate {
            conditions: vec![
                condition(ConditionType::Ready, ConditionStatus::False, reason, message, generation),
                reachable(generation),
            ],
            observed_generation: generation,
            ..Default::default()
        };
        StatusReporter::new(self.store.as_ref(), &self.status_retry)
            .report(name, &update)
            .await?;
        Ok(outcome)
    }

    async fn record_transient_failure(&self, name: &str, error: &ControllerError) {
        let count = self.increment_error(name);
        warn!(plugin = %name, attempt = count, error = %error, "Store unavailable");
        if count < self.max_transient_retries {
            return;
        }

        let update = StatusUpdate {
            conditions: vec![condition(
                ConditionType::Degraded,
                ConditionStatus::True,
                status::REASON_STORE_UNAVAILABLE,
                format!("store unreachable for {} consecutive attempts", self.max_transient_retries),
                None,
            )],
            ..Default::default()
        };
        // Best effort: the store is likely still unreachable
        if let Err(e) = StatusReporter::new(self.store.as_ref(), &self.status_retry)
            .report(name, &update)
            .await
        {
            debug!(plugin = %name, error = %e, "Could not record degraded condition");
        }
    }

    fn increment_error(&self, name: &str) -> u32 {
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(name.to_string()).or_insert_with(BackoffState::new);
        state.error_count += 1;
        state.error_count
    }

    fn reset_errors(&self, name: &str) {
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        states.remove(name);
    }

    /// Consecutive transient failures recorded for a resource
    #[cfg(test)]
    pub fn error_count(&self, name: &str) -> u32 {
        let states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(name).map_or(0, |s| s.error_count)
    }

    /// Delay before retrying a failed pass.
    ///
    /// Conflicts retry quickly with jitter; transient failures back off
    /// exponentially per resource; anything else waits for a slow re-check.
    pub fn error_requeue(&self, name: &str, error: &ControllerError) -> Duration {
        if error.is_conflict() {
            return jittered(CONFLICT_REQUEUE);
        }
        if !error.is_transient() {
            return SLOW_REQUEUE;
        }
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .entry(name.to_string())
            .or_insert_with(BackoffState::new)
            .backoff
            .next_backoff()
    }
}

fn reachable(generation: Option<i64>) -> crds::PluginCondition {
    condition(
        ConditionType::Degraded,
        ConditionStatus::False,
        status::REASON_STORE_REACHABLE,
        "",
        generation,
    )
}
