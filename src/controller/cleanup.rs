//! Startup cleanup of leftovers from a previous controller process
//!
//! The probe DaemonSet and its pull events outlive the controller. If they were
//! left in place, the next verification would count pull events from the last
//! run. The entry point runs this once, before the controller starts handling
//! SOPs.

use crate::config::ProbeConfig;
use crate::controller::cluster::ClusterApi;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// What a cleanup pass removed and how many deletions failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub probe_deleted: bool,
    pub signals_deleted: usize,
    pub failures: usize,
}

impl CleanupReport {
    pub fn deletions(&self) -> usize {
        self.signals_deleted + usize::from(self.probe_deleted)
    }
}

/// Delete the probe DaemonSet and every event whose name contains the probe name
///
/// Failures are logged and counted, never returned.
pub async fn run_startup_cleanup(cluster: &dyn ClusterApi, probe: &ProbeConfig) -> CleanupReport {
    let mut report = CleanupReport::default();
    let key = probe.key();

    match cluster.delete_daemonset(&key).await {
        Ok(deleted) => report.probe_deleted = deleted,
        Err(e) => {
            error!(daemonset = %key, error = %e, "Unable to delete old probe DaemonSet");
            report.failures += 1;
        }
    }

    match cluster.list_pull_signals().await {
        Ok(signals) => {
            for signal in signals.iter().filter(|s| s.name.contains(&probe.name)) {
                match cluster.delete_pull_signal(signal).await {
                    Ok(true) => report.signals_deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        error!(
                            event = %signal.name,
                            namespace = %signal.namespace,
                            error = %e,
                            "Unable to delete old event"
                        );
                        report.failures += 1;
                    }
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Unable to list old events");
            report.failures += 1;
        }
    }

    info!(
        probe_deleted = report.probe_deleted,
        events_deleted = report.signals_deleted,
        failures = report.failures,
        "Startup cleanup finished"
    );
    report
}

/// One-shot gate around `run_startup_cleanup`
///
/// Owned by the process entry point. The first call runs the cleanup, every
/// later call is a no-op.
#[derive(Debug, Default)]
pub struct StartupCleanup {
    done: AtomicBool,
}

impl StartupCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the cleanup unless it already ran; `None` when skipped
    pub async fn run_once(
        &self,
        cluster: &dyn ClusterApi,
        probe: &ProbeConfig,
    ) -> Option<CleanupReport> {
        if self
            .done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        Some(run_startup_cleanup(cluster, probe).await)
    }

    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::controller::actions::image_pull::build_probe_daemonset;
    use crate::controller::cluster::MockCluster;

    fn seeded_cluster() -> MockCluster {
        let cluster = MockCluster::new();
        let probe = ProbeConfig::default();
        cluster.insert_daemonset(&probe.key(), build_probe_daemonset(&probe, "sso:1"));
        cluster.push_signal("redhat-rhoam-rhsso", "tempds-a.1", "Pulled");
        cluster.push_signal("redhat-rhoam-rhsso", "tempds-b.1", "Started container");
        cluster.push_signal("redhat-rhoam-rhsso", "keycloak-0.1", "Pulled");
        cluster
    }

    #[tokio::test]
    async fn test_cleanup_deletes_probe_and_its_events() {
        let cluster = seeded_cluster();
        let probe = ProbeConfig::default();

        let report = run_startup_cleanup(&cluster, &probe).await;

        assert_eq!(
            report,
            CleanupReport {
                probe_deleted: true,
                signals_deleted: 2,
                failures: 0,
            }
        );
        assert!(cluster.daemonset(&probe.key()).is_none());
        let remaining: Vec<String> = cluster.signals().into_iter().map(|s| s.name).collect();
        assert_eq!(remaining, vec!["keycloak-0.1".to_string()]);
    }

    #[tokio::test]
    async fn test_cleanup_on_clean_cluster_is_noop() {
        let cluster = MockCluster::new();

        let report = run_startup_cleanup(&cluster, &ProbeConfig::default()).await;

        assert_eq!(report, CleanupReport::default());
        assert_eq!(report.deletions(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_counted_not_fatal() {
        let cluster = seeded_cluster();
        cluster.fail_signal_deletes(true);

        let report = run_startup_cleanup(&cluster, &ProbeConfig::default()).await;

        assert!(report.probe_deleted);
        assert_eq!(report.signals_deleted, 0);
        assert_eq!(report.failures, 2);
    }

    #[tokio::test]
    async fn test_cleanup_listing_failure_still_deletes_probe() {
        let cluster = seeded_cluster();
        cluster.fail_signal_listing(true);

        let report = run_startup_cleanup(&cluster, &ProbeConfig::default()).await;

        assert!(report.probe_deleted);
        assert_eq!(report.failures, 1);
    }

    #[tokio::test]
    async fn test_gate_runs_cleanup_at_most_once() {
        let cluster = seeded_cluster();
        let probe = ProbeConfig::default();
        let gate = StartupCleanup::new();
        assert!(!gate.has_run());

        let first = gate.run_once(&cluster, &probe).await;
        assert_eq!(first.unwrap().deletions(), 3);

        // Leftovers appear again; later calls must not touch them
        cluster.insert_daemonset(&probe.key(), build_probe_daemonset(&probe, "sso:2"));
        cluster.push_signal("redhat-rhoam-rhsso", "tempds-c.1", "Pulled");
        for _ in 0..5 {
            assert!(gate.run_once(&cluster, &probe).await.is_none());
        }

        assert!(gate.has_run());
        assert_eq!(cluster.daemonset_deletes(), 1);
        assert_eq!(cluster.signal_deletes(), 2);
        assert!(cluster.daemonset(&probe.key()).is_some());
    }
}
