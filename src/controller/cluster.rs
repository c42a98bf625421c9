//! Cluster access for the SOP controller
//!
//! Every store interaction the controller performs goes through the `ClusterApi`
//! trait. Production code uses `KubeCluster` which talks to the API server.
//! Tests use `MockCluster` which keeps objects in memory and records writes.

use crate::crd::sop::{Sop, SopStatus};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{Event, Node};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} was modified concurrently")]
    Conflict(String),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

/// Namespace + name identity of a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        ObjectKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A cluster event reduced to the fields used for image pull attribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullSignal {
    pub namespace: String,
    /// Event object name (e.g. "tempds-8x2kq.17a3c1f0d2e4b5a6")
    pub name: String,
    pub message: String,
}

impl PullSignal {
    fn from_event(event: &Event) -> Self {
        PullSignal {
            namespace: event.namespace().unwrap_or_default(),
            name: event.name_any(),
            message: event.message.clone().unwrap_or_default(),
        }
    }
}

/// Desired pod template fields of the probe DaemonSet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTemplate {
    pub labels: BTreeMap<String, String>,
    pub container: String,
    pub image: String,
    pub pull_policy: String,
}

/// Store operations used by the reconciler, the actions and startup cleanup
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a SOP; `Ok(None)` when it does not exist
    async fn get_procedure(&self, key: &ObjectKey) -> Result<Option<Sop>, ClusterError>;

    /// Write the status subresource, guarded by the SOP's resourceVersion
    ///
    /// Returns the SOP as stored after the write.
    async fn patch_procedure_status(
        &self,
        sop: &Sop,
        status: &SopStatus,
    ) -> Result<Sop, ClusterError>;

    /// Image of the first container of a StatefulSet
    async fn get_container_image(&self, key: &ObjectKey) -> Result<Option<String>, ClusterError>;

    async fn get_daemonset(&self, key: &ObjectKey) -> Result<Option<DaemonSet>, ClusterError>;

    /// Create a DaemonSet; `AlreadyExists` if another writer got there first
    async fn create_daemonset(&self, daemonset: &DaemonSet) -> Result<(), ClusterError>;

    /// Patch only the image of one container in a DaemonSet's pod template
    async fn patch_container_image(
        &self,
        key: &ObjectKey,
        container: &str,
        image: &str,
    ) -> Result<(), ClusterError>;

    /// Patch the pod template labels and one container's image and pull policy
    ///
    /// Other template fields are left alone.
    async fn patch_probe_template(
        &self,
        key: &ObjectKey,
        template: &ProbeTemplate,
    ) -> Result<(), ClusterError>;

    /// Delete a DaemonSet; `Ok(false)` when it was already gone
    async fn delete_daemonset(&self, key: &ObjectKey) -> Result<bool, ClusterError>;

    /// All events across all namespaces
    async fn list_pull_signals(&self) -> Result<Vec<PullSignal>, ClusterError>;

    /// Delete an event; `Ok(false)` when it was already gone
    async fn delete_pull_signal(&self, signal: &PullSignal) -> Result<bool, ClusterError>;

    /// Labels of every node in the cluster
    async fn list_node_labels(&self) -> Result<Vec<BTreeMap<String, String>>, ClusterError>;
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

/// Production cluster access over a kube client
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        KubeCluster { client }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_procedure(&self, key: &ObjectKey) -> Result<Option<Sop>, ClusterError> {
        let api: Api<Sop> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn patch_procedure_status(
        &self,
        sop: &Sop,
        status: &SopStatus,
    ) -> Result<Sop, ClusterError> {
        let namespace = sop.namespace().unwrap_or_default();
        let name = sop.name_any();
        let api: Api<Sop> = Api::namespaced(self.client.clone(), &namespace);

        // Including resourceVersion makes the API server reject stale writes with 409
        let mut patch = serde_json::json!({ "status": status });
        if let Some(rv) = sop.resource_version() {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }

        match api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => Ok(updated),
            Err(e) if is_status(&e, 409) => {
                Err(ClusterError::Conflict(format!("SOP {}/{}", namespace, name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_container_image(&self, key: &ObjectKey) -> Result<Option<String>, ClusterError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &key.namespace);
        let image = api.get_opt(&key.name).await?.and_then(|sts| {
            sts.spec?
                .template
                .spec?
                .containers
                .into_iter()
                .next()?
                .image
        });
        Ok(image)
    }

    async fn get_daemonset(&self, key: &ObjectKey) -> Result<Option<DaemonSet>, ClusterError> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn create_daemonset(&self, daemonset: &DaemonSet) -> Result<(), ClusterError> {
        let namespace = daemonset.namespace().unwrap_or_default();
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), daemonset).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => Err(ClusterError::AlreadyExists(format!(
                "DaemonSet {}/{}",
                namespace,
                daemonset.name_any()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_container_image(
        &self,
        key: &ObjectKey,
        container: &str,
        image: &str,
    ) -> Result<(), ClusterError> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &key.namespace);

        // Strategic merge keys containers by name, so only the image field changes
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "spec": {
                        "containers": [{
                            "name": container,
                            "image": image
                        }]
                    }
                }
            }
        });

        api.patch(&key.name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    async fn patch_probe_template(
        &self,
        key: &ObjectKey,
        template: &ProbeTemplate,
    ) -> Result<(), ClusterError> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &key.namespace);

        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "labels": template.labels
                    },
                    "spec": {
                        "containers": [{
                            "name": template.container,
                            "image": template.image,
                            "imagePullPolicy": template.pull_policy
                        }]
                    }
                }
            }
        });

        api.patch(&key.name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    async fn delete_daemonset(&self, key: &ObjectKey) -> Result<bool, ClusterError> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &key.namespace);
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pull_signals(&self) -> Result<Vec<PullSignal>, ClusterError> {
        let api: Api<Event> = Api::all(self.client.clone());
        let events = api.list(&ListParams::default()).await?;
        debug!(count = events.items.len(), "Listed cluster events");
        Ok(events.items.iter().map(PullSignal::from_event).collect())
    }

    async fn delete_pull_signal(&self, signal: &PullSignal) -> Result<bool, ClusterError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &signal.namespace);
        match api.delete(&signal.name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_node_labels(&self) -> Result<Vec<BTreeMap<String, String>>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes
            .items
            .into_iter()
            .map(|node| node.metadata.labels.unwrap_or_default())
            .collect())
    }
}

/// Mock cluster for testing - keeps objects in memory and records every write
#[cfg(test)]
pub use mock::MockCluster;
