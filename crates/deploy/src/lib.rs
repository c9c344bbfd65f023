//! Skiff deploy: the reconciliation orchestrator.
//!
//! Every function runs its own synthesize → decide → apply → watch pipeline;
//! pipelines run concurrently and a failing one never cancels its siblings.
//! Once all have settled, failures are folded into one aggregate error, or,
//! when none failed, routing is rebuilt for the deployed functions while
//! conflicting ones keep the routes they already have.

#![forbid(unsafe_code)]

pub mod info;
pub mod remove;

pub use info::{info, FunctionInfo, InfoEntry, InfoReport};
pub use remove::{remove, RemoveReport};

use futures::future::join_all;
use metrics::histogram;
use serde::{Deserialize, Serialize};
use skiff_apply::{apply_function, synthesize};
use skiff_core::{Cluster, DeployError, FunctionSpec, Outcome, ProviderDefaults};
use skiff_ingress::{apply_ingress, IngressOptions};
use skiff_rollout::{RolloutWatcher, WatchConfig};
use tokio::time::Instant;
use tracing::{error, info};

/// Options for one deployment run.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Service (deployment group) name; names the routing document.
    pub service: String,
    pub defaults: ProviderDefaults,
    /// Overwrite functions whose live spec differs.
    pub force: bool,
    pub verbose: bool,
    pub ingress: IngressOptions,
    pub watch: WatchConfig,
}

impl DeployOptions {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            defaults: ProviderDefaults::default(),
            force: false,
            verbose: false,
            ingress: IngressOptions::default(),
            watch: WatchConfig::from_env(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub created: usize,
    pub updated: usize,
    /// Functions already converged.
    pub skipped: usize,
    /// Functions without a handler; never deployed.
    pub no_handler: usize,
    /// Existing functions left alone because force was not requested.
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionReport {
    pub id: String,
    /// `None` when the function failed or had no handler.
    pub outcome: Option<Outcome>,
    pub error: Option<String>,
}

/// Everything a run produced. Partial success is normal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub functions: Vec<FunctionReport>,
    /// Failure messages in function order, ingress failure last.
    pub errors: Vec<String>,
    pub ingress_documents: usize,
}

impl RunReport {
    pub fn failed(&self) -> bool { !self.errors.is_empty() }

    /// Collapse into the summary, or one error joining every failure.
    pub fn into_result(self) -> Result<RunSummary, DeployError> {
        if self.errors.is_empty() { Ok(self.summary) } else { Err(DeployError::Aggregate(self.errors)) }
    }

    fn record(&mut self, id: &str, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.summary.created += 1,
            Outcome::Updated => self.summary.updated += 1,
            Outcome::Unchanged => self.summary.skipped += 1,
            Outcome::AlreadyExists => self.summary.conflicts += 1,
        }
        self.functions.push(FunctionReport { id: id.to_string(), outcome: Some(outcome), error: None });
    }
}

/// Full pipeline for one function.
pub async fn deploy_function(cluster: &dyn Cluster, f: &FunctionSpec, opts: &DeployOptions) -> Result<Outcome, DeployError> {
    let manifest = synthesize(f, &opts.defaults)?;
    let functions = cluster.functions(manifest.namespace());
    let applied = apply_function(functions.as_ref(), &manifest, opts.force).await?;
    if let Some(moment) = applied.request_moment {
        let cfg = opts.watch.clone().verbose(opts.verbose);
        let source = cluster.instances();
        RolloutWatcher::new(manifest.name(), manifest.namespace(), moment, cfg).run(source.as_ref()).await?;
    }
    Ok(applied.outcome)
}

/// Reconcile every function, then routing.
pub async fn deploy(cluster: &dyn Cluster, functions: &[FunctionSpec], opts: &DeployOptions) -> RunReport {
    let t0 = Instant::now();
    let mut report = RunReport::default();

    let mut pipelines = Vec::new();
    for f in functions {
        if f.has_handler() {
            pipelines.push(async move { (f, deploy_function(cluster, f, opts).await) });
        } else {
            info!(function = %f.id, "skipping deployment since it doesn't have a handler");
            report.summary.no_handler += 1;
            report.functions.push(FunctionReport { id: f.id.clone(), outcome: None, error: None });
        }
    }

    let mut routed: Vec<&FunctionSpec> = Vec::new();
    let mut retained: Vec<&FunctionSpec> = Vec::new();
    for (f, res) in join_all(pipelines).await {
        match res {
            Ok(outcome) => {
                report.record(&f.id, outcome);
                if outcome.is_deployed() {
                    routed.push(f);
                } else {
                    retained.push(f);
                }
            }
            Err(e) => {
                error!(function = %f.id, error = %e, "deployment failed");
                report.errors.push(e.to_string());
                report.functions.push(FunctionReport { id: f.id.clone(), outcome: None, error: Some(e.to_string()) });
            }
        }
    }

    if report.failed() {
        error!(failed = report.errors.len(), "found errors while deploying the given functions; skipping ingress");
    } else {
        match apply_ingress(cluster, &opts.service, &routed, &retained, &opts.defaults.namespace, &opts.ingress).await {
            Ok(n) => report.ingress_documents = n,
            Err(e) => {
                error!(error = %e, "ingress failed");
                report.errors.push(e.to_string());
            }
        }
    }

    histogram!("deploy_run_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(
        created = report.summary.created,
        updated = report.summary.updated,
        skipped = report.summary.skipped,
        no_handler = report.summary.no_handler,
        conflicts = report.summary.conflicts,
        errors = report.errors.len(),
        took_ms = %t0.elapsed().as_millis(),
        "deploy finished"
    );
    report
}
