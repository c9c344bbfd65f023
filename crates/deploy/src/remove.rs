//! Remove every function of a service, then its routing documents.

use std::collections::BTreeSet;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use skiff_core::{Cluster, DeployError, FunctionSpec};
use skiff_ingress::remove_ingress;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveReport {
    pub removed: usize,
    /// Functions that did not exist.
    pub missing: usize,
    pub errors: Vec<String>,
}

impl RemoveReport {
    pub fn into_result(self) -> Result<usize, DeployError> {
        if self.errors.is_empty() { Ok(self.removed) } else { Err(DeployError::Aggregate(self.errors)) }
    }
}

pub async fn remove(cluster: &dyn Cluster, service: &str, functions: &[FunctionSpec], default_ns: &str) -> RemoveReport {
    let mut report = RemoveReport::default();
    let namespaces: BTreeSet<String> =
        functions.iter().map(|f| f.namespace.clone().unwrap_or_else(|| default_ns.to_string())).collect();

    let deletions = functions.iter().map(|f| async move {
        let ns = f.namespace.as_deref().unwrap_or(default_ns);
        info!(function = %f.id, ns = %ns, "removing function");
        (f, cluster.functions(ns).delete(&f.id).await)
    });
    for (f, res) in join_all(deletions).await {
        match res {
            Ok(()) => {
                info!(function = %f.id, "function successfully deleted");
                report.removed += 1;
            }
            Err(e) if e.is_not_found() => {
                info!(function = %f.id, "function doesn't exist; skipping removal");
                report.missing += 1;
            }
            Err(e) => report.errors.push(
                DeployError::Remove { name: f.id.clone(), code: e.code().unwrap_or(500), message: e.message().to_string() }.to_string(),
            ),
        }
    }

    let namespaces: Vec<String> = namespaces.into_iter().collect();
    if let Err(e) = remove_ingress(cluster, service, &namespaces).await {
        report.errors.push(e.to_string());
    }
    report
}
