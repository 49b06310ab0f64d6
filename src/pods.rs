//! Cluster-side view of runner pods.
//!
//! The manage loop talks to the cluster through [`PodClient`], a thin seam
//! over list/update/delete so tests can run against an in-memory store. Pods
//! come back as [`RunnerPod`], carrying just the fields reconciliation needs.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use tokio::sync::RwLock;

use crate::config::{
    APP_COMPONENT_LABEL_KEY, APP_COMPONENT_RUNNER, APP_INSTANCE_LABEL_KEY, APP_NAME,
    APP_NAME_LABEL_KEY,
};

/// Phase value of a pod that is up and able to serve its status endpoint.
const POD_PHASE_RUNNING: &str = "Running";

/// One runner pod, reduced to what reconciliation looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerPod {
    pub namespace: String,
    pub name: String,
    /// Cluster IP of the pod, absent until the pod is scheduled.
    pub ip: Option<String>,
    /// Cluster lifecycle phase (`Pending`, `Running`, ...).
    pub phase: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl RunnerPod {
    /// `namespace/name`, for logs.
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_running(&self) -> bool {
        self.phase == POD_PHASE_RUNNING
    }

    pub fn has_label(&self, key: &str) -> bool {
        self.labels.contains_key(key)
    }

    fn from_pod(pod: &Pod, namespace: &str) -> Self {
        let status = pod.status.as_ref();
        Self {
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string()),
            name: pod.metadata.name.clone().unwrap_or_default(),
            ip: status.and_then(|s| s.pod_ip.clone()),
            phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            created_at: pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Labels stamped on every runner pod of `pool_name`.
pub fn pool_labels(pool_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_NAME_LABEL_KEY.to_string(), APP_NAME.to_string()),
        (
            APP_COMPONENT_LABEL_KEY.to_string(),
            APP_COMPONENT_RUNNER.to_string(),
        ),
        (APP_INSTANCE_LABEL_KEY.to_string(), pool_name.to_string()),
    ])
}

/// Label selector matching exactly the runner pods of `pool_name`.
pub fn pool_selector(pool_name: &str) -> String {
    pool_labels(pool_name)
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Cluster operations the manage loop performs on pods.
#[async_trait]
pub trait PodClient: Send + Sync {
    /// List the pods in `namespace` matching a `key=value,...` label
    /// selector.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<RunnerPod>>;

    /// Drop one label from a pod, as an update of the pod's metadata. A pod
    /// that is gone, or never had the label, counts as success.
    async fn remove_pod_label(&self, namespace: &str, name: &str, label_key: &str) -> Result<()>;

    /// Delete a pod. A pod that is already gone counts as deleted.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Production client backed by the cluster API.
pub struct KubePodClient {
    client: kube::Client,
}

impl KubePodClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<RunnerPod>> {
        let params = ListParams::default().labels(label_selector);
        let pods = self
            .pods(namespace)
            .list(&params)
            .await
            .with_context(|| format!("Failed to list pods in namespace {namespace}"))?;
        Ok(pods
            .items
            .iter()
            .map(|pod| RunnerPod::from_pod(pod, namespace))
            .collect())
    }

    async fn remove_pod_label(&self, namespace: &str, name: &str, label_key: &str) -> Result<()> {
        // A merge patch with a null value drops the label without clobbering
        // concurrent metadata changes.
        let patch = serde_json::json!({
            "metadata": { "labels": { label_key: serde_json::Value::Null } }
        });
        match self
            .pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(error).with_context(|| {
                format!("Failed to remove label {label_key} from pod {namespace}/{name}")
            }),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("Failed to delete pod {namespace}/{name}"))
            }
        }
    }
}

/// In-memory pod store for tests and downstream consumers.
#[derive(Default)]
pub struct MockPodClient {
    pods: RwLock<Vec<RunnerPod>>,
}

impl MockPodClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pod, replacing any existing pod with the same namespace and
    /// name.
    pub async fn add_pod(&self, pod: RunnerPod) {
        let mut pods = self.pods.write().await;
        pods.retain(|p| !(p.namespace == pod.namespace && p.name == pod.name));
        pods.push(pod);
    }

    pub async fn pod(&self, namespace: &str, name: &str) -> Option<RunnerPod> {
        self.pods
            .read()
            .await
            .iter()
            .find(|p| p.namespace == namespace && p.name == name)
            .cloned()
    }

    pub async fn pods(&self) -> Vec<RunnerPod> {
        self.pods.read().await.clone()
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|clause| !clause.is_empty())
        .all(|clause| match clause.split_once('=') {
            Some((key, value)) => labels
                .get(key.trim())
                .is_some_and(|have| have == value.trim()),
            None => false,
        })
}

#[async_trait]
impl PodClient for MockPodClient {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<RunnerPod>> {
        Ok(self
            .pods
            .read()
            .await
            .iter()
            .filter(|p| p.namespace == namespace && matches_selector(&p.labels, label_selector))
            .cloned()
            .collect())
    }

    async fn remove_pod_label(&self, namespace: &str, name: &str, label_key: &str) -> Result<()> {
        let mut pods = self.pods.write().await;
        if let Some(pod) = pods
            .iter_mut()
            .find(|p| p.namespace == namespace && p.name == name)
        {
            pod.labels.remove(label_key);
        }
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods
            .write()
            .await
            .retain(|p| !(p.namespace == namespace && p.name == name));
        Ok(())
    }
}
