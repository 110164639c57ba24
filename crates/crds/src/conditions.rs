//! Status condition records and workload references
//!
//! Conditions follow the Kubernetes convention of a typed record with a
//! tri-state status, a machine readable reason and a transition timestamp.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types reported on device plugin resources
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    /// The owned DaemonSet matches the declared spec
    Ready,

    /// The store could not be reached for longer than the retry ceiling
    Degraded,
}

impl ConditionType {
    /// Wire representation of the type
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Degraded => "Degraded",
        }
    }
}

/// Tri-state condition status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// Condition holds
    True,

    /// Condition does not hold
    False,

    /// Not yet determined
    #[default]
    Unknown,
}

/// A single condition record
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Condition status
    pub status: ConditionStatus,

    /// Machine readable reason in PascalCase
    pub reason: String,

    /// Human readable detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the status or reason changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Resource generation the condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl PluginCondition {
    /// Whether two conditions say the same thing, ignoring timestamps.
    #[must_use]
    pub fn same_state(&self, other: &PluginCondition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Stable reference to the workload controlled by a resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReference {
    /// API version of the workload
    pub api_version: String,

    /// Kind of the workload
    pub kind: String,

    /// Workload name
    pub name: String,

    /// Workload namespace
    pub namespace: String,

    /// UID assigned by the API server
    #[serde(rename = "uid")]
    pub uid: String,
}

/// Looks up a condition by type.
#[must_use]
pub fn find_condition(conditions: &[PluginCondition], type_: ConditionType) -> Option<&PluginCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}
