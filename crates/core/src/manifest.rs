//! Wire shape of the `Function` resource submitted to the orchestration API.
//!
//! Every map is a `BTreeMap` so serialization is canonical: two manifests
//! built from the same inputs serialize byte-identically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub const API_GROUP: &str = "kubeless.io";
pub const API_VERSION: &str = "v1beta1";
pub const KIND: &str = "Function";
pub const PLURAL: &str = "functions";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMeta,
    pub spec: FunctionBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMeta {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionBody {
    pub deps: String,
    pub function: String,
    #[serde(rename = "function-content-type")]
    pub content_type: String,
    pub handler: String,
    pub runtime: String,
    /// Seconds, always serialized as a string.
    pub timeout: String,
    pub service: ServiceSpec,
    #[serde(rename = "type")]
    pub function_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Pod template overrides; present only when the function customizes its container.
    #[serde(rename = "deployment", default, skip_serializing_if = "Option::is_none")]
    pub template: Option<DeploymentTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub ports: Vec<ServicePort>,
    pub selector: BTreeMap<String, String>,
    #[serde(rename = "type")]
    pub service_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    pub target_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTemplate {
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub template: PodTemplate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    pub spec: PodSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// `{name, value}` or `{name, valueFrom}` entries, order preserved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<Json>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub limits: BTreeMap<String, String>,
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub secret: SecretSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    pub secret_name: String,
}

impl FunctionManifest {
    pub fn name(&self) -> &str { &self.metadata.name }
    pub fn namespace(&self) -> &str { &self.metadata.namespace }

    /// Full document as sent to the API.
    pub fn to_json(&self) -> Result<Json, serde_json::Error> { serde_json::to_value(self) }

    /// Canonical `spec` used for the skip-if-unchanged comparison.
    pub fn spec_json(&self) -> Result<Json, serde_json::Error> { serde_json::to_value(&self.spec) }
}

/// Routing document coordinates. The rule shape (`serviceName`/`servicePort`
/// backends) is the v1beta1 one.
pub mod ingress_kind {
    pub const API_GROUP: &str = "networking.k8s.io";
    pub const API_VERSION: &str = "v1beta1";
    pub const KIND: &str = "Ingress";
    pub const PLURAL: &str = "ingresses";
}
