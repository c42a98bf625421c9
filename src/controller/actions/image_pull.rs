//! Rolling image verification
//!
//! Forces every node to pull the image of a reference StatefulSet by running a
//! throwaway probe DaemonSet with `imagePullPolicy: Always`, then counts the
//! kubelet "Successfully pulled image" events attributed to the probe. The
//! upgrade is considered propagated once there are at least as many pull
//! events as worker nodes.
//!
//! The reference workload itself is only read, never modified.

use super::{ActionKind, Outcome, SopAction};
use crate::config::{ProbeConfig, VerificationConfig};
use crate::controller::cluster::{ClusterApi, ClusterError, ProbeTemplate, PullSignal};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const RHSSO_UPGRADE: &str = "rhsso-upgrade";

/// Label key selecting probe pods; the value is the probe name
pub const PROBE_LABEL: &str = "app";

/// Message fragment the kubelet emits once an image is on the node
pub fn pull_success_phrase(image: &str) -> String {
    format!("Successfully pulled image \"{}\"", image)
}

/// Whether an event reports the probe pulling the target image
///
/// Attribution is by substring: the event name must contain the probe name and
/// the message must contain the success phrase.
pub fn is_probe_pull_signal(signal: &PullSignal, probe_name: &str, phrase: &str) -> bool {
    signal.name.contains(probe_name) && signal.message.contains(phrase)
}

/// Count pull events for `image` attributed to the probe
///
/// Events are not deduplicated per node: two events from the same node count
/// twice.
pub fn count_pull_signals(signals: &[PullSignal], probe_name: &str, image: &str) -> usize {
    let phrase = pull_success_phrase(image);
    signals
        .iter()
        .filter(|s| is_probe_pull_signal(s, probe_name, &phrase))
        .count()
}

/// A node is a worker if any of its label keys contains `marker`
pub fn is_worker_node(labels: &BTreeMap<String, String>, marker: &str) -> bool {
    labels.keys().any(|key| key.contains(marker))
}

pub fn count_worker_nodes(nodes: &[BTreeMap<String, String>], marker: &str) -> usize {
    nodes.iter().filter(|labels| is_worker_node(labels, marker)).count()
}

/// Compare observed pulls against the worker node count
///
/// A cluster with no worker nodes is trivially ready.
pub fn evaluate_progress(observed: usize, target: usize) -> Outcome {
    if observed >= target {
        Outcome::Ready
    } else {
        Outcome::NotYetReady
    }
}

/// Build the probe DaemonSet for `image`
///
/// Single container named after the probe, `imagePullPolicy: Always`, selector
/// and pod labels `app=<probe name>`. No node selector, so it lands on every
/// schedulable node.
pub fn build_probe_daemonset(probe: &ProbeConfig, image: &str) -> DaemonSet {
    let labels = probe_labels(probe);

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(probe.name.clone()),
            namespace: Some(probe.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: probe.name.clone(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some(PROBE_PULL_POLICY.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: probe.container_port,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Image of the named container in a DaemonSet's pod template
pub fn probe_container_image<'a>(daemonset: &'a DaemonSet, container: &str) -> Option<&'a str> {
    daemonset
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container)?
        .image
        .as_deref()
}

/// Pull policy the probe container must carry so every node re-pulls
pub const PROBE_PULL_POLICY: &str = "Always";

fn probe_labels(probe: &ProbeConfig) -> BTreeMap<String, String> {
    [(PROBE_LABEL.to_string(), probe.name.clone())].into()
}

fn carries_probe_identity(labels: Option<&BTreeMap<String, String>>, probe: &ProbeConfig) -> bool {
    labels.and_then(|l| l.get(PROBE_LABEL)) == Some(&probe.name)
}

/// Which fields of an existing probe DaemonSet differ from the desired shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeDrift {
    pub image: bool,
    pub pull_policy: bool,
    pub template_labels: bool,
    /// The selector is immutable, so this drift needs a re-create
    pub selector: bool,
}

impl ProbeDrift {
    pub fn is_clean(&self) -> bool {
        *self == ProbeDrift::default()
    }
}

pub fn probe_drift(existing: &DaemonSet, probe: &ProbeConfig, image: &str) -> ProbeDrift {
    let spec = existing.spec.as_ref();
    let container = spec
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == probe.name));

    ProbeDrift {
        image: container.and_then(|c| c.image.as_deref()) != Some(image),
        pull_policy: container.and_then(|c| c.image_pull_policy.as_deref())
            != Some(PROBE_PULL_POLICY),
        template_labels: !carries_probe_identity(
            spec.and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.labels.as_ref()),
            probe,
        ),
        selector: !carries_probe_identity(
            spec.and_then(|s| s.selector.match_labels.as_ref()),
            probe,
        ),
    }
}

/// What `upsert_probe` had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeUpsert {
    Created,
    Patched,
    /// Deleted and created again because the selector had drifted
    Recreated,
    Unchanged,
}

async fn create_probe(
    cluster: &dyn ClusterApi,
    probe: &ProbeConfig,
    image: &str,
) -> Result<(), ClusterError> {
    cluster
        .create_daemonset(&build_probe_daemonset(probe, image))
        .await?;
    info!(daemonset = %probe.key(), image = %image, "Created probe DaemonSet");
    Ok(())
}

/// Create the probe DaemonSet, or bring it back to the desired shape
///
/// Idempotent: an up-to-date probe is not written. An image-only change patches
/// just the container image; drifted pull policy or pod labels are patched back
/// along with it, and a drifted selector forces a delete and re-create. If
/// another writer creates the probe between our read and our create, the
/// existing object is re-read and reconciled instead.
pub async fn upsert_probe(
    cluster: &dyn ClusterApi,
    probe: &ProbeConfig,
    image: &str,
) -> Result<ProbeUpsert, ClusterError> {
    let key = probe.key();

    let existing = match cluster.get_daemonset(&key).await? {
        Some(existing) => existing,
        None => match create_probe(cluster, probe, image).await {
            Ok(()) => return Ok(ProbeUpsert::Created),
            Err(ClusterError::AlreadyExists(_)) => {
                debug!(daemonset = %key, "Probe DaemonSet created concurrently, re-reading");
                cluster.get_daemonset(&key).await?.ok_or_else(|| {
                    ClusterError::Conflict(format!("DaemonSet {} vanished after create", key))
                })?
            }
            Err(e) => return Err(e),
        },
    };

    let drift = probe_drift(&existing, probe, image);
    if drift.is_clean() {
        debug!(daemonset = %key, image = %image, "Probe DaemonSet already up to date");
        return Ok(ProbeUpsert::Unchanged);
    }

    if drift.selector {
        warn!(daemonset = %key, "Probe DaemonSet selector drifted, re-creating");
        cluster.delete_daemonset(&key).await?;
        create_probe(cluster, probe, image).await?;
        return Ok(ProbeUpsert::Recreated);
    }

    info!(
        daemonset = %key,
        current = ?probe_container_image(&existing, &probe.name),
        desired = %image,
        drift = ?drift,
        "Patching probe DaemonSet"
    );
    if drift.pull_policy || drift.template_labels {
        let template = ProbeTemplate {
            labels: probe_labels(probe),
            container: probe.name.clone(),
            image: image.to_string(),
            pull_policy: PROBE_PULL_POLICY.to_string(),
        };
        cluster.patch_probe_template(&key, &template).await?;
    } else {
        cluster
            .patch_container_image(&key, &probe.name, image)
            .await?;
    }
    Ok(ProbeUpsert::Patched)
}

/// Verified rollout of a new image across all worker nodes
pub struct RollingImageVerificationAction {
    identifier: String,
    config: VerificationConfig,
}

impl RollingImageVerificationAction {
    pub fn new(identifier: &str, config: VerificationConfig) -> Self {
        RollingImageVerificationAction {
            identifier: identifier.to_string(),
            config,
        }
    }
}

#[async_trait]
impl SopAction for RollingImageVerificationAction {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn kind(&self) -> ActionKind {
        ActionKind::VerifiedRollout
    }

    async fn execute(&self, cluster: &dyn ClusterApi) -> Outcome {
        let reference = &self.config.reference;
        let probe = &self.config.probe;

        let image = match cluster.get_container_image(reference).await {
            Ok(Some(image)) => image,
            Ok(None) => {
                warn!(statefulset = %reference, "Reference workload has no readable image");
                return Outcome::Failed("reference workload unavailable".to_string());
            }
            Err(e) => {
                warn!(statefulset = %reference, error = %e, "Failed to read reference workload");
                return Outcome::Failed(format!("reference workload unavailable: {}", e));
            }
        };

        info!(
            sop_action = %self.identifier,
            image = %image,
            "Verifying image rollout across worker nodes"
        );

        if let Err(e) = upsert_probe(cluster, probe, &image).await {
            warn!(daemonset = %probe.key(), error = %e, "Failed to upsert probe DaemonSet");
            return Outcome::Failed(format!(
                "failed to upsert probe DaemonSet {}: {}",
                probe.key(),
                e
            ));
        }

        let observed = match cluster.list_pull_signals().await {
            Ok(signals) => count_pull_signals(&signals, &probe.name, &image),
            Err(e) => {
                warn!(error = %e, "Failed to list image pull events");
                return Outcome::Failed(format!("failed to list events: {}", e));
            }
        };

        let target = match cluster.list_node_labels().await {
            Ok(nodes) => count_worker_nodes(&nodes, &self.config.worker_label),
            Err(e) => {
                warn!(error = %e, "Failed to list nodes");
                return Outcome::Failed(format!("failed to list nodes: {}", e));
            }
        };

        let outcome = evaluate_progress(observed, target);
        match outcome {
            Outcome::Ready => info!(
                image = %image,
                observed = observed,
                target = target,
                "Image pulled on all worker nodes"
            ),
            _ => info!(
                image = %image,
                observed = observed,
                target = target,
                "Not all worker nodes have pulled the new image yet"
            ),
        }
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "image_pull_test.rs"]
mod tests;
