//! Skiff apply: synthesize the target `Function` manifest, decide between
//! create / update / skip against the live resource, and issue the write.

#![forbid(unsafe_code)]

pub mod manifest;

pub use manifest::synthesize;

use chrono::{DateTime, SubsecRound, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use skiff_core::{ClientError, DeployError, FunctionManifest, Outcome, ResourceClient};
use tracing::{info, warn};

/// What to do with one function given the live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Create,
    Update,
    Skip,
    /// Live resource differs but overwrite was not requested.
    Conflict,
}

/// Compare the target spec against the live document (if any).
pub fn decide(target_spec: &Json, live: Option<&Json>, force: bool) -> Decision {
    match live {
        None => Decision::Create,
        Some(doc) if doc.get("spec") == Some(target_spec) => Decision::Skip,
        Some(_) if force => Decision::Update,
        Some(_) => Decision::Conflict,
    }
}

/// Result of the apply step. `request_moment` is set when a write was
/// issued and marks the earliest creation time of pods that belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub outcome: Outcome,
    pub request_moment: Option<DateTime<Utc>>,
}

impl Applied {
    fn unchanged(outcome: Outcome) -> Self { Self { outcome, request_moment: None } }
}

/// Pod creation timestamps have second resolution.
pub fn request_moment() -> DateTime<Utc> { Utc::now().trunc_subsecs(0) }

fn encode(name: &str, e: serde_json::Error) -> DeployError {
    DeployError::client(format!("Unable to encode the function {}", name), ClientError::Decode(e.to_string()))
}

/// Reconcile one manifest against its collection.
pub async fn apply_function(client: &dyn ResourceClient, target: &FunctionManifest, force: bool) -> Result<Applied, DeployError> {
    let name = target.name();
    let spec = target.spec_json().map_err(|e| encode(name, e))?;
    let live = client
        .get_opt(name)
        .await
        .map_err(|e| DeployError::client(format!("Unable to fetch the function {}", name), e))?;

    let decision = decide(&spec, live.as_ref(), force);
    if let (Some(live), Decision::Update | Decision::Conflict) = (&live, decision) {
        let changed = changed_fields(&spec, live.get("spec").unwrap_or(&Json::Null));
        info!(function = %name, fields = ?changed, "live spec differs");
    }

    match decision {
        Decision::Skip => {
            info!(function = %name, ns = %client.namespace(), "function unchanged; skipping deployment");
            counter!("deploy_skipped", 1u64);
            Ok(Applied::unchanged(Outcome::Unchanged))
        }
        Decision::Conflict => {
            already_exists(name);
            Ok(Applied::unchanged(Outcome::AlreadyExists))
        }
        Decision::Create => {
            let doc = target.to_json().map_err(|e| encode(name, e))?;
            let moment = request_moment();
            info!(function = %name, ns = %client.namespace(), "deploying function");
            match client.create(&doc).await {
                Ok(_) => {
                    counter!("deploy_created", 1u64);
                    Ok(Applied { outcome: Outcome::Created, request_moment: Some(moment) })
                }
                // Lost a race against another creator; never retried.
                Err(ClientError::Conflict(_)) => {
                    already_exists(name);
                    Ok(Applied::unchanged(Outcome::AlreadyExists))
                }
                Err(e) => {
                    counter!("deploy_err", 1u64);
                    Err(DeployError::apply("deploy", name, &e))
                }
            }
        }
        Decision::Update => {
            let mut doc = target.to_json().map_err(|e| encode(name, e))?;
            if let Some(live) = &live {
                null_out_removed(&mut doc, live);
            }
            let moment = request_moment();
            info!(function = %name, ns = %client.namespace(), "redeploying function");
            match client.update(name, &doc).await {
                Ok(_) => {
                    counter!("deploy_updated", 1u64);
                    Ok(Applied { outcome: Outcome::Updated, request_moment: Some(moment) })
                }
                Err(e) => {
                    counter!("deploy_err", 1u64);
                    Err(DeployError::apply("update", name, &e))
                }
            }
        }
    }
}

fn already_exists(name: &str) {
    warn!(function = %name, "function already exists; redeploy it using --force or `deploy-function {}`", name);
    counter!("deploy_conflict", 1u64);
}

/// Under merge-patch semantics a key missing from the patch is kept. Mark
/// every `spec` key the live object has and the target lacks with `null`
/// so the patched object ends up equal to the target.
pub fn null_out_removed(target: &mut Json, live: &Json) {
    fn walk(t: &mut Json, l: &Json) {
        if let (Json::Object(tm), Json::Object(lm)) = (t, l) {
            for (k, lv) in lm {
                match tm.get_mut(k) {
                    Some(tv) => walk(tv, lv),
                    None => { tm.insert(k.clone(), Json::Null); }
                }
            }
        }
    }
    if let (Some(t), Some(l)) = (target.get_mut("spec"), live.get("spec")) {
        walk(t, l);
    }
}

/// Top-level `spec` fields that differ between `target` and `live`: added,
/// changed or dropped, in sorted order.
pub fn changed_fields(target: &Json, live: &Json) -> Vec<String> {
    let empty = serde_json::Map::new();
    let t = target.as_object().unwrap_or(&empty);
    let l = live.as_object().unwrap_or(&empty);
    let mut keys: Vec<&String> = t.keys().chain(l.keys()).collect();
    keys.sort();
    keys.dedup();
    keys.into_iter().filter(|k| t.get(*k) != l.get(*k)).cloned().collect()
}
