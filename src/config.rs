//! Controller configuration from environment variables
//!
//! Every setting has a default matching the stock RHOAM layout, so the controller
//! runs without any configuration. Malformed numeric values fall back to the
//! default with a warning.

use crate::controller::cluster::ObjectKey;
use std::time::Duration;
use tracing::warn;

/// Default port for health and metrics endpoints
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Fixed delay between verification polls
pub const DEFAULT_REQUEUE_SECONDS: u64 = 5;

pub const DEFAULT_PROBE_NAME: &str = "tempds";
pub const DEFAULT_PROBE_NAMESPACE: &str = "redhat-rhoam-rhsso";
pub const DEFAULT_PROBE_PORT: i32 = 8080;
pub const DEFAULT_REFERENCE_NAME: &str = "keycloak";
pub const DEFAULT_REFERENCE_NAMESPACE: &str = "redhat-rhoam-rhsso";
pub const DEFAULT_WORKER_LABEL: &str = "worker";

/// Identity and shape of the image pre-pull probe DaemonSet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub name: String,
    pub namespace: String,
    pub container_port: i32,
}

impl ProbeConfig {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            name: DEFAULT_PROBE_NAME.to_string(),
            namespace: DEFAULT_PROBE_NAMESPACE.to_string(),
            container_port: DEFAULT_PROBE_PORT,
        }
    }
}

/// Settings for the rolling image verification action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationConfig {
    /// StatefulSet whose first container image is pre-pulled
    pub reference: ObjectKey,
    pub probe: ProbeConfig,
    /// Nodes with a label key containing this string count as workers
    pub worker_label: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        VerificationConfig {
            reference: ObjectKey::new(DEFAULT_REFERENCE_NAMESPACE, DEFAULT_REFERENCE_NAME),
            probe: ProbeConfig::default(),
            worker_label: DEFAULT_WORKER_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub health_port: u16,
    pub requeue_delay: Duration,
    pub verification: VerificationConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            health_port: DEFAULT_HEALTH_PORT,
            requeue_delay: Duration::from_secs(DEFAULT_REQUEUE_SECONDS),
            verification: VerificationConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    ///
    /// - SOP_HEALTH_PORT: health/metrics port (default: 8080)
    /// - SOP_REQUEUE_SECONDS: delay between verification polls (default: 5)
    /// - SOP_PROBE_NAME / SOP_PROBE_NAMESPACE / SOP_PROBE_PORT: probe DaemonSet
    /// - SOP_REFERENCE_NAME / SOP_REFERENCE_NAMESPACE: StatefulSet to read the image from
    /// - SOP_WORKER_LABEL: substring identifying worker node label keys (default: worker)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ControllerConfig::default();
        let string = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let requeue_seconds = parse_or_default(
            "SOP_REQUEUE_SECONDS",
            lookup("SOP_REQUEUE_SECONDS"),
            DEFAULT_REQUEUE_SECONDS,
        );

        ControllerConfig {
            health_port: parse_or_default(
                "SOP_HEALTH_PORT",
                lookup("SOP_HEALTH_PORT"),
                defaults.health_port,
            ),
            requeue_delay: Duration::from_secs(requeue_seconds),
            verification: VerificationConfig {
                reference: ObjectKey::new(
                    &string("SOP_REFERENCE_NAMESPACE", DEFAULT_REFERENCE_NAMESPACE),
                    &string("SOP_REFERENCE_NAME", DEFAULT_REFERENCE_NAME),
                ),
                probe: ProbeConfig {
                    name: string("SOP_PROBE_NAME", DEFAULT_PROBE_NAME),
                    namespace: string("SOP_PROBE_NAMESPACE", DEFAULT_PROBE_NAMESPACE),
                    container_port: parse_or_default(
                        "SOP_PROBE_PORT",
                        lookup("SOP_PROBE_PORT"),
                        DEFAULT_PROBE_PORT,
                    ),
                },
                worker_label: string("SOP_WORKER_LABEL", DEFAULT_WORKER_LABEL),
            },
        }
    }
}

fn parse_or_default<T>(key: &str, value: Option<String>, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    match value {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(key = key, value = %raw, default = %default, "Invalid value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = ControllerConfig::from_lookup(|_| None);

        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.requeue_delay, Duration::from_secs(5));
        assert_eq!(config.verification.probe.name, "tempds");
        assert_eq!(config.verification.probe.namespace, "redhat-rhoam-rhsso");
        assert_eq!(config.verification.reference.name, "keycloak");
        assert_eq!(config.verification.worker_label, "worker");
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = ControllerConfig::from_lookup(lookup_from(&[
            ("SOP_HEALTH_PORT", "9090"),
            ("SOP_REQUEUE_SECONDS", "12"),
            ("SOP_PROBE_NAME", "prepull"),
            ("SOP_PROBE_NAMESPACE", "sso"),
            ("SOP_PROBE_PORT", "9000"),
            ("SOP_REFERENCE_NAME", "rhsso"),
            ("SOP_REFERENCE_NAMESPACE", "sso"),
            ("SOP_WORKER_LABEL", "node-role.kubernetes.io/app"),
        ]));

        assert_eq!(config.health_port, 9090);
        assert_eq!(config.requeue_delay, Duration::from_secs(12));
        assert_eq!(config.verification.probe.key(), ObjectKey::new("sso", "prepull"));
        assert_eq!(config.verification.probe.container_port, 9000);
        assert_eq!(config.verification.reference, ObjectKey::new("sso", "rhsso"));
        assert_eq!(config.verification.worker_label, "node-role.kubernetes.io/app");
    }

    #[test]
    fn test_invalid_numbers_fall_back_to_defaults() {
        let config = ControllerConfig::from_lookup(lookup_from(&[
            ("SOP_HEALTH_PORT", "not-a-port"),
            ("SOP_REQUEUE_SECONDS", "-3"),
            ("SOP_PROBE_PORT", ""),
        ]));

        assert_eq!(config.health_port, DEFAULT_HEALTH_PORT);
        assert_eq!(config.requeue_delay, Duration::from_secs(DEFAULT_REQUEUE_SECONDS));
        assert_eq!(config.verification.probe.container_port, DEFAULT_PROBE_PORT);
    }

    #[test]
    fn test_blank_strings_use_defaults() {
        let config = ControllerConfig::from_lookup(lookup_from(&[("SOP_PROBE_NAME", "  ")]));
        assert_eq!(config.verification.probe.name, DEFAULT_PROBE_NAME);
    }
}
