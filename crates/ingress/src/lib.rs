//! Skiff ingress: derive HTTP routing rules from the functions' `http`
//! events and upsert one routing document per service and namespace.
//!
//! Rules are rebuilt in full on every run, never patched incrementally.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use skiff_core::manifest::ingress_kind;
use skiff_core::{Cluster, DeployError, Event, FunctionSpec, ResourceClient, DEFAULT_PORT};
use tracing::{info, warn};

pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
pub const REWRITE_TARGET_ANNOTATION: &str = "ingress.kubernetes.io/rewrite-target";

/// Run-level routing options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressOptions {
    /// Host used for events without an explicit hostname.
    pub hostname: Option<String>,
    /// Suffix appended to the API host when no hostname is configured.
    pub dns_suffix: String,
    pub additional_annotations: BTreeMap<String, String>,
    /// Passed through verbatim as `spec.tls`.
    pub tls: Option<Json>,
}

impl Default for IngressOptions {
    fn default() -> Self {
        Self {
            hostname: None,
            dns_suffix: std::env::var("SKIFF_DNS_SUFFIX").unwrap_or_else(|_| "nip.io".to_string()),
            additional_annotations: BTreeMap::new(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "servicePort")]
    pub service_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressPath {
    pub path: String,
    pub backend: Backend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRule {
    pub paths: Vec<IngressPath>,
}

/// All routes of one hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub host: String,
    pub http: HttpRule,
}

pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') { path.to_string() } else { format!("/{}", path) }
}

/// Derive host-grouped rules. A bare root-path event without hostname is
/// served by the default route and contributes nothing.
pub fn derive_rules(functions: &[&FunctionSpec], opts: &IngressOptions, api_host: &str) -> Vec<IngressRule> {
    let default_host = format!("{}.{}", api_host, opts.dns_suffix);
    let mut rules: Vec<IngressRule> = Vec::new();
    for f in functions {
        let (path, hostname) = match f.event() {
            Ok(Event::Http { path, hostname }) => (path, hostname),
            _ => continue,
        };
        if path == "/" && hostname.is_none() {
            continue;
        }
        let host = hostname.or_else(|| opts.hostname.clone()).unwrap_or_else(|| default_host.clone());
        let entry = IngressPath {
            path: normalize_path(&path),
            backend: Backend { service_name: f.id.clone(), service_port: f.port.unwrap_or(DEFAULT_PORT) },
        };
        match rules.iter_mut().find(|r| r.host == host) {
            Some(rule) => rule.http.paths.push(entry),
            None => rules.push(IngressRule { host, http: HttpRule { paths: vec![entry] } }),
        }
    }
    rules
}

/// Fixed routing document name for a service.
pub fn ingress_name(service: &str) -> String {
    let escaped: String = service
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    format!("ingress-{}", escaped.trim_matches('-'))
}

/// One label per served function, identifying what the document routes.
pub fn ingress_labels<'a>(ids: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, String> {
    ids.into_iter().map(|id| (id.to_string(), "1".to_string())).collect()
}

pub fn ingress_document(name: &str, namespace: &str, labels: BTreeMap<String, String>, rules: &[IngressRule], opts: &IngressOptions) -> Json {
    let mut annotations = BTreeMap::from([
        (INGRESS_CLASS_ANNOTATION.to_string(), "nginx".to_string()),
        (REWRITE_TARGET_ANNOTATION.to_string(), "/".to_string()),
    ]);
    annotations.extend(opts.additional_annotations.clone());
    let mut spec = serde_json::json!({ "rules": rules });
    if let Some(tls) = &opts.tls {
        spec["tls"] = tls.clone();
    }
    serde_json::json!({
        "apiVersion": format!("{}/{}", ingress_kind::API_GROUP, ingress_kind::API_VERSION),
        "kind": ingress_kind::KIND,
        "metadata": { "name": name, "namespace": namespace, "labels": labels, "annotations": annotations },
        "spec": spec,
    })
}

/// Replace `live` with `doc` when present, create `doc` otherwise.
pub async fn upsert(client: &dyn ResourceClient, doc: &Json, live: Option<&Json>) -> Result<(), DeployError> {
    let name = doc["metadata"]["name"].as_str().unwrap_or_default().to_string();
    match live {
        Some(live) => {
            let mut patch = doc.clone();
            skiff_apply::null_out_removed(&mut patch, live);
            client.update(&name, &patch).await.map_err(|e| DeployError::Ingress(e.to_string()))?;
            info!(name = %name, ns = %client.namespace(), "updated ingress rule");
        }
        None => {
            client.create(doc).await.map_err(|e| DeployError::Ingress(e.to_string()))?;
            info!(name = %name, ns = %client.namespace(), "deployed ingress rule");
        }
    }
    counter!("ingress_upserts", 1u64);
    Ok(())
}

/// Rules of a live routing document; unreadable rules yield none.
pub fn live_rules(doc: &Json) -> Vec<IngressRule> {
    serde_json::from_value(doc["spec"]["rules"].clone()).unwrap_or_default()
}

/// Copy the live paths served by `retained` into `rules`. Paths already
/// present for the same host are left alone.
pub fn carry_over(rules: &mut Vec<IngressRule>, live: &Json, retained: &[&str]) {
    for rule in live_rules(live) {
        for entry in rule.http.paths {
            if !retained.contains(&entry.backend.service_name.as_str()) {
                continue;
            }
            match rules.iter_mut().find(|r| r.host == rule.host) {
                Some(r) if r.http.paths.iter().any(|p| p.path == entry.path) => {}
                Some(r) => r.http.paths.push(entry),
                None => rules.push(IngressRule { host: rule.host.clone(), http: HttpRule { paths: vec![entry] } }),
            }
        }
    }
}

/// Group functions by effective namespace.
fn by_namespace<'a>(functions: &[&'a FunctionSpec], default_ns: &str) -> BTreeMap<String, Vec<&'a FunctionSpec>> {
    let mut out: BTreeMap<String, Vec<&'a FunctionSpec>> = BTreeMap::new();
    for f in functions {
        out.entry(f.namespace.clone().unwrap_or_else(|| default_ns.to_string())).or_default().push(*f);
    }
    out
}

/// Derive and upsert routing for `functions`. Functions in `retained` were
/// not redeployed; they keep whatever paths the live document gives them.
/// Returns the number of documents written; zero rules is a logged no-op.
pub async fn apply_ingress(
    cluster: &dyn Cluster,
    service: &str,
    functions: &[&FunctionSpec],
    retained: &[&FunctionSpec],
    default_ns: &str,
    opts: &IngressOptions,
) -> Result<usize, DeployError> {
    let api_host = cluster.api_host();
    let name = ingress_name(service);
    let routed = by_namespace(functions, default_ns);
    let kept = by_namespace(retained, default_ns);
    let namespaces: BTreeSet<&String> = routed.keys().chain(kept.keys()).collect();

    let mut written = 0usize;
    for ns in namespaces {
        let group = routed.get(ns).cloned().unwrap_or_default();
        let mut rules = derive_rules(&group, opts, &api_host);
        let kept_ids: Vec<&str> = kept.get(ns).map(|fs| fs.iter().map(|f| f.id.as_str()).collect()).unwrap_or_default();
        if rules.is_empty() && kept_ids.is_empty() {
            info!(ns = %ns, "skipping ingress rule generation");
            continue;
        }
        let client = cluster.ingresses(ns);
        let live = client.get_opt(&name).await.map_err(|e| DeployError::Ingress(e.to_string()))?;
        if let Some(live) = &live {
            carry_over(&mut rules, live, &kept_ids);
        }
        if rules.is_empty() {
            info!(ns = %ns, "skipping ingress rule generation");
            continue;
        }
        let served: BTreeSet<&str> =
            rules.iter().flat_map(|r| r.http.paths.iter().map(|p| p.backend.service_name.as_str())).collect();
        let labels = ingress_labels(served);
        let doc = ingress_document(&name, ns, labels, &rules, opts);
        upsert(client.as_ref(), &doc, live.as_ref()).await?;
        written += 1;
    }
    Ok(written)
}

/// Delete the service's routing documents; absent documents are skipped.
pub async fn remove_ingress(cluster: &dyn Cluster, service: &str, namespaces: &[String]) -> Result<(), DeployError> {
    let name = ingress_name(service);
    for ns in namespaces {
        match cluster.ingresses(ns).delete(&name).await {
            Ok(()) => info!(name = %name, ns = %ns, "removed ingress rule"),
            Err(e) if e.is_not_found() => info!(ns = %ns, "skipping ingress rule clean up"),
            Err(e) => {
                warn!(name = %name, ns = %ns, error = %e, "ingress removal failed");
                return Err(DeployError::Remove { name, code: e.code().unwrap_or(500), message: e.message().to_string() });
            }
        }
    }
    Ok(())
}
