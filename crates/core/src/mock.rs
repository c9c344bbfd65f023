//! In-memory cluster used by engine tests and dry runs.
//!
//! Stores documents per `(kind, namespace, name)`, records every call, lets
//! tests inject failures per call key (`"create functions/default/foo"`) and
//! either scripts pod listings or derives them from the stored functions.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

use crate::client::{Cluster, ContainerStatus, InstanceSource, ResourceClient, WorkloadInstance};
use crate::error::ClientError;
use crate::FUNCTION_LABEL;

type Key = (String, String, String);
type Listing = Result<Vec<WorkloadInstance>, ClientError>;

#[derive(Default)]
struct MemState {
    docs: BTreeMap<Key, Json>,
    written_at: BTreeMap<String, DateTime<Utc>>,
    calls: Vec<String>,
    failures: BTreeMap<String, ClientError>,
    script: VecDeque<Listing>,
    crashing: BTreeSet<String>,
    unscheduled: BTreeSet<String>,
}

/// Shared in-memory cluster. Cloning shares state.
#[derive(Clone)]
pub struct MemCluster {
    state: Arc<Mutex<MemState>>,
    api_host: String,
}

impl Default for MemCluster {
    fn default() -> Self { Self::new() }
}

impl MemCluster {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(MemState::default())), api_host: "192.168.99.100".to_string() }
    }

    pub fn with_api_host(mut self, host: &str) -> Self { self.api_host = host.to_string(); self }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a document without recording a call.
    pub fn insert(&self, kind: &str, namespace: &str, doc: Json) {
        let name = doc_name(&doc).unwrap_or_default();
        self.lock().docs.insert((kind.to_string(), namespace.to_string(), name), doc);
    }

    pub fn doc(&self, kind: &str, namespace: &str, name: &str) -> Option<Json> {
        self.lock().docs.get(&(kind.to_string(), namespace.to_string(), name.to_string())).cloned()
    }

    pub fn docs(&self, kind: &str) -> Vec<Json> {
        self.lock().docs.iter().filter(|((k, _, _), _)| k == kind).map(|(_, v)| v.clone()).collect()
    }

    /// Every recorded call, formatted as `"<verb> <kind>/<ns>/<name>"`.
    pub fn calls(&self) -> Vec<String> { self.lock().calls.clone() }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Make the call identified by `key` fail with `err` (every time).
    pub fn fail(&self, key: &str, err: ClientError) {
        self.lock().failures.insert(key.to_string(), err);
    }

    /// Queue explicit pod listings; consumed one per poll before falling back
    /// to derived pods.
    pub fn script_instances(&self, listings: impl IntoIterator<Item = Listing>) {
        self.lock().script.extend(listings);
    }

    /// Derived pods for `name` never become ready and report 3 restarts.
    pub fn crash(&self, name: &str) { self.lock().crashing.insert(name.to_string()); }

    /// Derived pods for `name` never appear.
    pub fn unschedulable(&self, name: &str) { self.lock().unscheduled.insert(name.to_string()); }

    fn record(&self, verb: &str, kind: &str, ns: &str, name: &str) -> Result<(), ClientError> {
        let key = if name.is_empty() { format!("{} {}/{}", verb, kind, ns) } else { format!("{} {}/{}/{}", verb, kind, ns, name) };
        let mut st = self.lock();
        st.calls.push(key.clone());
        match st.failures.get(&key) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn derived_instances(&self) -> Vec<WorkloadInstance> {
        let st = self.lock();
        st.docs
            .iter()
            .filter(|((kind, _, name), _)| kind == crate::manifest::PLURAL && !st.unscheduled.contains(name))
            .map(|((_, ns, name), _)| {
                let crashing = st.crashing.contains(name);
                WorkloadInstance {
                    name: format!("{}-0", name),
                    namespace: ns.clone(),
                    labels: BTreeMap::from([(FUNCTION_LABEL.to_string(), name.clone())]),
                    created: st.written_at.get(name).copied().unwrap_or_else(Utc::now),
                    terminating: false,
                    container: Some(ContainerStatus {
                        ready: !crashing,
                        restart_count: if crashing { 3 } else { 0 },
                        state: if crashing { "waiting: CrashLoopBackOff".into() } else { "running".into() },
                    }),
                }
            })
            .collect()
    }
}

impl Cluster for MemCluster {
    fn functions(&self, namespace: &str) -> Arc<dyn ResourceClient> {
        Arc::new(MemCollection { cluster: self.clone(), kind: crate::manifest::PLURAL.to_string(), namespace: namespace.to_string() })
    }

    fn ingresses(&self, namespace: &str) -> Arc<dyn ResourceClient> {
        Arc::new(MemCollection { cluster: self.clone(), kind: crate::manifest::ingress_kind::PLURAL.to_string(), namespace: namespace.to_string() })
    }

    fn instances(&self) -> Arc<dyn InstanceSource> { Arc::new(self.clone()) }

    fn api_host(&self) -> String { self.api_host.clone() }
}

#[async_trait::async_trait]
impl InstanceSource for MemCluster {
    async fn list_instances(&self) -> Result<Vec<WorkloadInstance>, ClientError> {
        self.record("list", "pods", "*", "")?;
        let scripted = self.lock().script.pop_front();
        match scripted {
            Some(listing) => listing,
            None => Ok(self.derived_instances()),
        }
    }
}

/// One namespaced collection of a [`MemCluster`].
pub struct MemCollection {
    cluster: MemCluster,
    kind: String,
    namespace: String,
}

impl MemCollection {
    fn key(&self, name: &str) -> Key { (self.kind.clone(), self.namespace.clone(), name.to_string()) }
}

#[async_trait::async_trait]
impl ResourceClient for MemCollection {
    fn namespace(&self) -> &str { &self.namespace }

    async fn get(&self, name: &str) -> Result<Json, ClientError> {
        self.cluster.record("get", &self.kind, &self.namespace, name)?;
        self.cluster.lock().docs.get(&self.key(name)).cloned().ok_or_else(|| ClientError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<Json>, ClientError> {
        self.cluster.record("list", &self.kind, &self.namespace, "")?;
        let st = self.cluster.lock();
        Ok(st.docs.iter().filter(|((k, ns, _), _)| *k == self.kind && *ns == self.namespace).map(|(_, v)| v.clone()).collect())
    }

    async fn create(&self, doc: &Json) -> Result<Json, ClientError> {
        let name = doc_name(doc).ok_or_else(|| ClientError::Api { code: 422, message: "metadata.name required".into() })?;
        self.cluster.record("create", &self.kind, &self.namespace, &name)?;
        let mut st = self.cluster.lock();
        if st.docs.contains_key(&self.key(&name)) {
            return Err(ClientError::Conflict(name));
        }
        st.docs.insert(self.key(&name), doc.clone());
        st.written_at.insert(name, Utc::now());
        Ok(doc.clone())
    }

    async fn update(&self, name: &str, doc: &Json) -> Result<Json, ClientError> {
        self.cluster.record("update", &self.kind, &self.namespace, name)?;
        let mut st = self.cluster.lock();
        let slot = st.docs.get_mut(&self.key(name)).ok_or_else(|| ClientError::NotFound(name.to_string()))?;
        merge_patch(slot, doc);
        let out = slot.clone();
        st.written_at.insert(name.to_string(), Utc::now());
        Ok(out)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        self.cluster.record("delete", &self.kind, &self.namespace, name)?;
        match self.cluster.lock().docs.remove(&self.key(name)) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(name.to_string())),
        }
    }
}

fn doc_name(doc: &Json) -> Option<String> {
    doc.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).map(str::to_string)
}

/// JSON merge patch: objects merge recursively, `null` removes, anything else replaces.
fn merge_patch(target: &mut Json, patch: &Json) {
    match (target, patch) {
        (Json::Object(t), Json::Object(p)) => {
            for (k, pv) in p {
                if pv.is_null() {
                    t.remove(k);
                } else {
                    merge_patch(t.entry(k.clone()).or_insert(Json::Null), pv);
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}
