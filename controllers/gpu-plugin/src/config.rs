//! Controller settings
//!
//! Read once at startup from environment variables. Parsing goes through a
//! lookup function so tests can supply values without touching the process
//! environment.

use crate::error::ControllerError;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default namespace for plugin DaemonSets
pub const DEFAULT_PLUGIN_NAMESPACE: &str = "inteldeviceplugins-system";

/// Runtime settings for the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Namespace the owned DaemonSets are created in (`PLUGIN_NAMESPACE`)
    pub plugin_namespace: String,
    /// Maximum concurrent reconciliations (`RECONCILE_CONCURRENCY`)
    pub reconcile_concurrency: u16,
    /// Quiet period before a triggered reconciliation runs (`DEBOUNCE_MILLIS`)
    pub debounce: Duration,
    /// Consecutive transient failures before a resource is marked degraded
    /// (`MAX_TRANSIENT_RETRIES`)
    pub max_transient_retries: u32,
    /// Listen address for `/metrics`, `/healthz` and `/readyz`
    /// (`METRICS_BIND_ADDRESS`)
    pub metrics_bind_address: SocketAddr,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            plugin_namespace: DEFAULT_PLUGIN_NAMESPACE.to_string(),
            reconcile_concurrency: 3,
            debounce: Duration::from_millis(500),
            max_transient_retries: 5,
            metrics_bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = Self::default();

        let plugin_namespace = lookup("PLUGIN_NAMESPACE")
            .map(|ns| ns.trim().to_string())
            .unwrap_or(defaults.plugin_namespace);
        if plugin_namespace.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "PLUGIN_NAMESPACE must not be empty".to_string(),
            ));
        }

        let reconcile_concurrency = parse_var(&lookup, "RECONCILE_CONCURRENCY", defaults.reconcile_concurrency)?;
        if reconcile_concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let debounce_millis = parse_var(&lookup, "DEBOUNCE_MILLIS", 500u64)?;

        Ok(Self {
            plugin_namespace,
            reconcile_concurrency,
            debounce: Duration::from_millis(debounce_millis),
            max_transient_retries: parse_var(&lookup, "MAX_TRANSIENT_RETRIES", defaults.max_transient_retries)?,
            metrics_bind_address: parse_var(&lookup, "METRICS_BIND_ADDRESS", defaults.metrics_bind_address)?,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings = Settings::from_lookup(lookup_from(&[])).expect("defaults are valid");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.plugin_namespace, "inteldeviceplugins-system");
        assert_eq!(settings.reconcile_concurrency, 3);
        assert_eq!(settings.debounce, Duration::from_millis(500));
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("PLUGIN_NAMESPACE", "gpu-system"),
            ("RECONCILE_CONCURRENCY", "8"),
            ("DEBOUNCE_MILLIS", "0"),
            ("MAX_TRANSIENT_RETRIES", " 2 "),
            ("METRICS_BIND_ADDRESS", "127.0.0.1:9090"),
        ]))
        .expect("valid overrides");

        assert_eq!(settings.plugin_namespace, "gpu-system");
        assert_eq!(settings.reconcile_concurrency, 8);
        assert_eq!(settings.debounce, Duration::ZERO);
        assert_eq!(settings.max_transient_retries, 2);
        assert_eq!(settings.metrics_bind_address.port(), 9090);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        assert!(matches!(
            Settings::from_lookup(lookup_from(&[("RECONCILE_CONCURRENCY", "many")])),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            Settings::from_lookup(lookup_from(&[("RECONCILE_CONCURRENCY", "0")])),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            Settings::from_lookup(lookup_from(&[("METRICS_BIND_ADDRESS", "localhost")])),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            Settings::from_lookup(lookup_from(&[("PLUGIN_NAMESPACE", "  ")])),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}
