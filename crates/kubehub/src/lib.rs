//! Skiff kubehub: kube-rs backed implementations of the cluster traits.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ContainerState, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use skiff_core::client::ContainerStatus;
use skiff_core::manifest::{self, ingress_kind};
use skiff_core::{ClientError, Cluster, InstanceSource, ResourceClient, WorkloadInstance};
use tracing::{debug, info};

/// Live cluster reached through the inferred kubeconfig (or in-cluster config).
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    api_host: String,
}

impl KubeCluster {
    pub async fn connect() -> Result<Self> {
        let config = kube::Config::infer().await.context("loading kube config")?;
        let api_host = config.cluster_url.host().unwrap_or("localhost").to_string();
        let client = Client::try_from(config).context("building kube client")?;
        info!(api_host = %api_host, "connected to cluster");
        Ok(Self { client, api_host })
    }

    pub fn from_client(client: Client, api_host: &str) -> Self {
        Self { client, api_host: api_host.to_string() }
    }
}

fn function_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(manifest::API_GROUP, manifest::API_VERSION, manifest::KIND);
    ApiResource::from_gvk_with_plural(&gvk, manifest::PLURAL)
}

fn ingress_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(ingress_kind::API_GROUP, ingress_kind::API_VERSION, ingress_kind::KIND);
    ApiResource::from_gvk_with_plural(&gvk, ingress_kind::PLURAL)
}

impl Cluster for KubeCluster {
    fn functions(&self, namespace: &str) -> Arc<dyn ResourceClient> {
        Arc::new(KubeCollection::new(self.client.clone(), namespace, &function_resource()))
    }

    fn ingresses(&self, namespace: &str) -> Arc<dyn ResourceClient> {
        Arc::new(KubeCollection::new(self.client.clone(), namespace, &ingress_resource()))
    }

    fn instances(&self) -> Arc<dyn InstanceSource> {
        Arc::new(KubePods { api: Api::all(self.client.clone()) })
    }

    fn api_host(&self) -> String { self.api_host.clone() }
}

/// One namespaced collection of a dynamic resource kind.
pub struct KubeCollection {
    api: Api<DynamicObject>,
    namespace: String,
    plural: String,
}

impl KubeCollection {
    pub fn new(client: Client, namespace: &str, ar: &ApiResource) -> Self {
        Self { api: Api::namespaced_with(client, namespace, ar), namespace: namespace.to_string(), plural: ar.plural.clone() }
    }
}

fn map_err(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict(ae.message),
        kube::Error::Api(ae) => ClientError::Api { code: ae.code, message: ae.message },
        kube::Error::SerdeError(se) => ClientError::Decode(se.to_string()),
        other => {
            let msg = other.to_string();
            if msg.contains("timed out") || msg.contains("timeout") {
                ClientError::Timeout(msg)
            } else {
                ClientError::Transport(msg)
            }
        }
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::Decode(e.to_string()))
}

#[async_trait::async_trait]
impl ResourceClient for KubeCollection {
    fn namespace(&self) -> &str { &self.namespace }

    async fn get(&self, name: &str) -> Result<Json, ClientError> {
        debug!(kind = %self.plural, ns = %self.namespace, name, "get");
        let obj = self.api.get(name).await.map_err(map_err)?;
        to_json(&obj)
    }

    async fn list(&self) -> Result<Vec<Json>, ClientError> {
        let list = self.api.list(&ListParams::default()).await.map_err(map_err)?;
        list.items.iter().map(to_json).collect()
    }

    async fn create(&self, doc: &Json) -> Result<Json, ClientError> {
        let obj: DynamicObject = serde_json::from_value(doc.clone()).map_err(|e| ClientError::Decode(e.to_string()))?;
        debug!(kind = %self.plural, ns = %self.namespace, name = ?obj.metadata.name, "create");
        counter!("kube_writes", 1u64);
        let created = self.api.create(&PostParams::default(), &obj).await.map_err(map_err)?;
        to_json(&created)
    }

    async fn update(&self, name: &str, doc: &Json) -> Result<Json, ClientError> {
        debug!(kind = %self.plural, ns = %self.namespace, name, "merge patch");
        counter!("kube_writes", 1u64);
        let patched = self.api.patch(name, &PatchParams::default(), &Patch::Merge(doc)).await.map_err(map_err)?;
        to_json(&patched)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        debug!(kind = %self.plural, ns = %self.namespace, name, "delete");
        counter!("kube_writes", 1u64);
        self.api.delete(name, &DeleteParams::default()).await.map_err(map_err)?;
        Ok(())
    }
}

/// Cluster-wide pod listing.
pub struct KubePods {
    api: Api<Pod>,
}

#[async_trait::async_trait]
impl InstanceSource for KubePods {
    async fn list_instances(&self) -> Result<Vec<WorkloadInstance>, ClientError> {
        let pods = self.api.list(&ListParams::default()).await.map_err(map_err)?;
        Ok(pods.items.iter().filter_map(instance_from_pod).collect())
    }
}

fn render_state(state: &ContainerState) -> String {
    if let Some(w) = &state.waiting {
        format!("waiting: {}", w.reason.as_deref().unwrap_or("-"))
    } else if state.running.is_some() {
        "running".to_string()
    } else if let Some(t) = &state.terminated {
        format!("terminated: {} (exit {})", t.reason.as_deref().unwrap_or("-"), t.exit_code)
    } else {
        "unknown".to_string()
    }
}

/// Pods without a name or creation timestamp are not usable for rollout
/// tracking and are dropped.
fn instance_from_pod(pod: &Pod) -> Option<WorkloadInstance> {
    let meta = &pod.metadata;
    let name = meta.name.clone()?;
    let created = meta.creation_timestamp.as_ref()?.0;
    // We assume function pods run a single container
    let container = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.first())
        .map(|c| ContainerStatus {
            ready: c.ready,
            restart_count: c.restart_count,
            state: c.state.as_ref().map(render_state).unwrap_or_else(|| "unknown".to_string()),
        });
    Some(WorkloadInstance {
        name,
        namespace: meta.namespace.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        created,
        terminating: meta.deletion_timestamp.is_some(),
        container,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(v: Json) -> Pod { serde_json::from_value(v).unwrap() }

    #[test]
    fn pod_conversion_reads_primary_container() {
        let p = pod(serde_json::json!({
            "metadata": {
                "name": "hello-1",
                "namespace": "default",
                "labels": { "function": "hello" },
                "creationTimestamp": "2024-01-01T00:00:10Z"
            },
            "status": {
                "containerStatuses": [{
                    "name": "hello", "image": "x", "imageID": "", "ready": false, "restartCount": 3,
                    "state": { "waiting": { "reason": "CrashLoopBackOff" } }
                }]
            }
        }));
        let inst = instance_from_pod(&p).unwrap();
        assert_eq!(inst.label("function"), Some("hello"));
        assert!(!inst.terminating);
        let c = inst.container.unwrap();
        assert!(!c.ready);
        assert_eq!(c.restart_count, 3);
        assert_eq!(c.state, "waiting: CrashLoopBackOff");
        assert_eq!(inst.created.timestamp(), chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:10Z").unwrap().timestamp());
    }

    #[test]
    fn pods_without_timestamp_are_dropped_and_deleting_pods_flagged() {
        assert!(instance_from_pod(&pod(serde_json::json!({ "metadata": { "name": "x" } }))).is_none());
        let p = pod(serde_json::json!({ "metadata": {
            "name": "y", "creationTimestamp": "2024-01-01T00:00:00Z", "deletionTimestamp": "2024-01-01T00:01:00Z"
        }}));
        let inst = instance_from_pod(&p).unwrap();
        assert!(inst.terminating);
        assert!(inst.container.is_none());
    }

    #[test]
    fn api_errors_map_to_client_errors() {
        let resp = |code: u16| kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(), message: format!("code {}", code), reason: "x".into(), code,
        });
        assert!(map_err(resp(404)).is_not_found());
        assert!(map_err(resp(409)).is_conflict());
        assert_eq!(map_err(resp(500)).code(), Some(500));
    }
}
