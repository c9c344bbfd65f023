//! Describe the live state of a service's functions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use skiff_apply::manifest::DESCRIPTION_ANNOTATION;
use skiff_core::{Cluster, DeployError, FunctionSpec};
use skiff_ingress::{ingress_name, live_rules};
use tracing::info;

/// What the cluster knows about one deployed function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub namespace: String,
    /// First routed address, when the function has a route.
    pub url: Option<String>,
    pub description: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub handler: String,
    pub runtime: String,
    pub function_type: String,
    pub topic: Option<String>,
    pub schedule: Option<String>,
    pub deps: String,
    pub service_type: Option<String>,
    /// Service ports as stored on the resource.
    pub ports: Vec<Json>,
    pub uid: Option<String>,
    pub created: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InfoEntry {
    Found(FunctionInfo),
    /// The function has no live resource.
    Missing(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoReport {
    /// One entry per requested function, in request order.
    pub entries: Vec<InfoEntry>,
}

impl InfoReport {
    pub fn render(&self, verbose: bool) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match entry {
                InfoEntry::Found(f) => out.push_str(&f.render(verbose)),
                InfoEntry::Missing(name) => {
                    let _ = writeln!(out, "Not found any information about the function \"{}\"", name);
                }
            }
        }
        out
    }
}

/// `targetPort` → `Target Port`.
fn to_words(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 1);
    let mut split = false;
    for (i, c) in key.chars().enumerate() {
        if i == 0 {
            out.extend(c.to_uppercase());
        } else if c.is_ascii_uppercase() && !split {
            out.push(' ');
            out.push(c);
            split = true;
        } else {
            out.push(c);
        }
    }
    out
}

impl FunctionInfo {
    pub fn render(&self, verbose: bool) -> String {
        let mut m = String::new();
        let _ = writeln!(m, "\nService Information \"{}\"", self.name);
        if let Some(t) = &self.service_type {
            let _ = writeln!(m, "Type: {}", t);
        }
        let _ = writeln!(m, "Ports:");
        for port in &self.ports {
            if let Some(fields) = port.as_object() {
                for (k, v) in fields {
                    let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                    let _ = writeln!(m, "  {}: {}", to_words(k), value);
                }
            }
        }
        let _ = writeln!(m, "Function Info");
        if let Some(url) = &self.url {
            let _ = writeln!(m, "URL: {}", url);
        }
        if let Some(d) = &self.description {
            let _ = writeln!(m, "Description: {}", d);
        }
        if !self.labels.is_empty() {
            let _ = writeln!(m, "Labels:");
            for (k, v) in &self.labels {
                let _ = writeln!(m, "  {}: {}", k, v);
            }
        }
        let _ = writeln!(m, "Handler: {}", self.handler);
        let _ = writeln!(m, "Runtime: {}", self.runtime);
        let _ = writeln!(m, "Type: {}", self.function_type);
        if let Some(t) = &self.topic {
            let _ = writeln!(m, "Topic: {}", t);
        }
        if let Some(s) = &self.schedule {
            let _ = writeln!(m, "Schedule: {}", s);
        }
        let _ = writeln!(m, "Dependencies: {}", self.deps.trim());
        if verbose {
            let _ = writeln!(m, "Metadata:");
            let _ = writeln!(m, "  Namespace: {}", self.namespace);
            let _ = writeln!(m, "  UID: {}", self.uid.as_deref().unwrap_or("-"));
            let _ = writeln!(m, "  Timestamp: {}", self.created.as_deref().unwrap_or("-"));
        }
        m
    }
}

fn text(doc: &Json, pointer: &str) -> Option<String> {
    doc.pointer(pointer).and_then(Json::as_str).map(str::to_string)
}

/// Address of the first path routed to `id`.
fn function_url(routing: &Json, id: &str) -> Option<String> {
    let tls = routing["spec"]["tls"].as_array().map(|t| !t.is_empty()).unwrap_or(false);
    let scheme = if tls { "https" } else { "http" };
    live_rules(routing).into_iter().find_map(|rule| {
        rule.http
            .paths
            .iter()
            .find(|p| p.backend.service_name == id)
            .map(|p| format!("{}://{}{}", scheme, rule.host, p.path))
    })
}

fn describe(doc: &Json, namespace: &str, routing: Option<&Json>) -> FunctionInfo {
    let name = text(doc, "/metadata/name").unwrap_or_default();
    let labels: BTreeMap<String, String> = doc["metadata"]["labels"]
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))).collect())
        .unwrap_or_default();
    let url = routing.and_then(|r| function_url(r, &name));
    FunctionInfo {
        url,
        description: doc["metadata"]["annotations"][DESCRIPTION_ANNOTATION].as_str().map(str::to_string),
        labels,
        handler: text(doc, "/spec/handler").unwrap_or_default(),
        runtime: text(doc, "/spec/runtime").unwrap_or_default(),
        function_type: text(doc, "/spec/type").unwrap_or_default(),
        topic: text(doc, "/spec/topic"),
        schedule: text(doc, "/spec/schedule"),
        deps: text(doc, "/spec/deps").unwrap_or_default(),
        service_type: text(doc, "/spec/service/type"),
        ports: doc["spec"]["service"]["ports"].as_array().cloned().unwrap_or_default(),
        uid: text(doc, "/metadata/uid"),
        created: text(doc, "/metadata/creationTimestamp"),
        namespace: namespace.to_string(),
        name,
    }
}

/// Fetch every function and the service's routing documents. Absent
/// functions are reported, not failed; any other read error fails the call.
pub async fn info(cluster: &dyn Cluster, service: &str, functions: &[FunctionSpec], default_ns: &str) -> Result<InfoReport, DeployError> {
    let namespace_of = |f: &FunctionSpec| f.namespace.clone().unwrap_or_else(|| default_ns.to_string());
    let namespaces: BTreeSet<String> = functions.iter().map(namespace_of).collect();

    let name = ingress_name(service);
    let mut routing: BTreeMap<String, Json> = BTreeMap::new();
    for ns in namespaces {
        let doc = cluster
            .ingresses(&ns)
            .get_opt(&name)
            .await
            .map_err(|e| DeployError::client(format!("Unable to fetch the ingress rule {}", name), e))?;
        if let Some(doc) = doc {
            routing.insert(ns, doc);
        }
    }

    let lookups = functions.iter().map(|f| async move {
        let ns = namespace_of(f);
        let live = cluster.functions(&ns).get_opt(&f.id).await;
        (f, ns, live)
    });
    let mut report = InfoReport::default();
    for (f, ns, live) in join_all(lookups).await {
        match live.map_err(|e| DeployError::client(format!("Unable to fetch the function {}", f.id), e))? {
            Some(doc) => report.entries.push(InfoEntry::Found(describe(&doc, &ns, routing.get(&ns)))),
            None => {
                info!(function = %f.id, ns = %ns, "function not found");
                report.entries.push(InfoEntry::Missing(f.id.clone()));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deploy, DeployOptions};
    use serde_json::json;
    use skiff_core::mock::MemCluster;
    use skiff_core::{EventSpec, ProviderDefaults};

    fn opts() -> DeployOptions {
        let mut o = DeployOptions::new("svc");
        o.defaults = ProviderDefaults { runtime: Some("python2.7".into()), ..Default::default() };
        o.ingress.dns_suffix = "nip.io".into();
        o
    }

    fn hello() -> FunctionSpec {
        let mut f = FunctionSpec::new("hello", "handler.hello");
        f.description = Some("says hello".into());
        f.deps = Some("requests\n".into());
        f.labels.insert("tier".into(), json!("web"));
        f.events = vec![EventSpec::http(Some("/hello"), None)];
        f
    }

    #[test]
    fn port_keys_are_split_into_words() {
        assert_eq!(to_words("targetPort"), "Target Port");
        assert_eq!(to_words("name"), "Name");
    }

    #[tokio::test(start_paused = true)]
    async fn describes_deployed_functions_and_reports_missing_ones() {
        let c = MemCluster::new().with_api_host("10.0.0.9");
        deploy(&c, &[hello()], &opts()).await.into_result().unwrap();

        let ghost = FunctionSpec::new("ghost", "handler.ghost");
        let report = info(&c, "svc", &[hello(), ghost], "default").await.unwrap();
        assert_eq!(report.entries.len(), 2);

        let InfoEntry::Found(f) = &report.entries[0] else { panic!("hello should be found") };
        assert_eq!(f.handler, "handler.hello");
        assert_eq!(f.runtime, "python2.7");
        assert_eq!(f.function_type, "HTTP");
        assert_eq!(f.description.as_deref(), Some("says hello"));
        assert_eq!(f.labels["tier"], "web");
        assert_eq!(f.labels["function"], "hello");
        assert_eq!(f.url.as_deref(), Some("http://10.0.0.9.nip.io/hello"));
        assert_eq!(f.service_type.as_deref(), Some("ClusterIP"));
        assert_eq!(report.entries[1], InfoEntry::Missing("ghost".into()));

        let text = report.render(false);
        assert!(text.contains("Handler: handler.hello"));
        assert!(text.contains("Dependencies: requests\n"));
        assert!(text.contains("  Target Port: 8080"));
        assert!(text.contains("Not found any information about the function \"ghost\""));
        assert!(!text.contains("Metadata:"));
        assert!(report.render(true).contains("  Namespace: default"));
    }

    #[tokio::test]
    async fn unrouted_function_has_no_url() {
        let c = MemCluster::new();
        let mut f = FunctionSpec::new("cron", "handler.cron");
        f.events = vec![EventSpec::schedule("*/5 * * * *")];
        c.insert("functions", "default", json!({
            "metadata": { "name": "cron", "labels": { "function": "cron" } },
            "spec": { "handler": "handler.cron", "runtime": "go1.10", "type": "Scheduled", "schedule": "*/5 * * * *", "deps": "" }
        }));
        let report = info(&c, "svc", &[f], "default").await.unwrap();
        let InfoEntry::Found(found) = &report.entries[0] else { panic!("cron should be found") };
        assert_eq!(found.url, None);
        assert_eq!(found.schedule.as_deref(), Some("*/5 * * * *"));
        assert!(found.ports.is_empty());
    }

    #[tokio::test]
    async fn read_errors_other_than_not_found_fail() {
        let c = MemCluster::new();
        c.fail("get functions/default/hello", skiff_core::ClientError::Api { code: 403, message: "forbidden".into() });
        let err = info(&c, "svc", &[hello()], "default").await.unwrap_err();
        assert!(err.to_string().starts_with("Unable to fetch the function hello"), "{}", err);
    }
}
