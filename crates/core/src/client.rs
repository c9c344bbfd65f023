//! Capabilities the engine consumes from the cluster. Implementations live
//! in `skiff-kubehub` (live API) and [`crate::mock`] (in-memory).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

use crate::error::ClientError;

/// Generic CRUD over one namespaced collection. The namespace is fixed at
/// construction time.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    fn namespace(&self) -> &str;

    /// Fetch a named document; `ClientError::NotFound` when absent.
    async fn get(&self, name: &str) -> Result<Json, ClientError>;

    async fn list(&self) -> Result<Vec<Json>, ClientError>;

    /// Create a document; `ClientError::Conflict` when the name is taken.
    async fn create(&self, doc: &Json) -> Result<Json, ClientError>;

    /// Merge-patch the named document with `doc`.
    async fn update(&self, name: &str, doc: &Json) -> Result<Json, ClientError>;

    async fn delete(&self, name: &str) -> Result<(), ClientError>;

    async fn get_opt(&self, name: &str) -> Result<Option<Json>, ClientError> {
        match self.get(name).await {
            Ok(v) => Ok(Some(v)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Primary container status of a workload instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub ready: bool,
    pub restart_count: i32,
    /// Rendered container state (waiting/running/terminated), for logging.
    pub state: String,
}

/// A running (or pending) instance of some workload, i.e. a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadInstance {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
    pub terminating: bool,
    /// `None` while no container has reported yet.
    pub container: Option<ContainerStatus>,
}

impl WorkloadInstance {
    pub fn label(&self, key: &str) -> Option<&str> { self.labels.get(key).map(String::as_str) }
}

/// Cluster-wide listing of workload instances.
#[async_trait::async_trait]
pub trait InstanceSource: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<WorkloadInstance>, ClientError>;
}

/// Factory for the per-namespace clients a run needs. Immutable and shared
/// read-only for the duration of a run.
pub trait Cluster: Send + Sync {
    fn functions(&self, namespace: &str) -> Arc<dyn ResourceClient>;
    fn ingresses(&self, namespace: &str) -> Arc<dyn ResourceClient>;
    fn instances(&self) -> Arc<dyn InstanceSource>;
    /// Hostname of the API endpoint; seeds default ingress hostnames.
    fn api_host(&self) -> String;
}
