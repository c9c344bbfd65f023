//! Skiff rollout watcher.
//!
//! After a create/update, polls the cluster's pods until the function's
//! fresh pods are ready on `stable_polls` consecutive polls. Pods that
//! never show up exhaust a retry budget; a crash-looping pod fails at once.

#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use skiff_core::{ClientError, DeployError, InstanceSource, WorkloadInstance, FUNCTION_LABEL};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Polling policy for one rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    pub poll_interval: Duration,
    /// Empty polls tolerated before giving up.
    pub max_retries: u32,
    /// Consecutive fully-ready polls required.
    pub stable_polls: u32,
    /// A not-ready container restarted more often than this is crash-looping.
    pub crashloop_restarts: i32,
    /// Log pod status changes at info instead of debug.
    pub verbose: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(2), max_retries: 3, stable_polls: 2, crashloop_restarts: 2, verbose: false }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

impl WatchConfig {
    /// Defaults overridable through `SKIFF_ROLLOUT_*` variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: Duration::from_millis(env_or("SKIFF_ROLLOUT_POLL_MS", d.poll_interval.as_millis() as u64).max(1)),
            max_retries: env_or("SKIFF_ROLLOUT_MAX_RETRIES", d.max_retries),
            stable_polls: env_or("SKIFF_ROLLOUT_STABLE_POLLS", d.stable_polls).max(1),
            crashloop_restarts: env_or("SKIFF_CRASHLOOP_RESTARTS", d.crashloop_restarts),
            verbose: d.verbose,
        }
    }

    pub fn verbose(mut self, on: bool) -> Self { self.verbose = on; self }
}

/// Outcome of a single poll that did not end the watch with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Pending,
    Stable,
}

/// Mutable per-watch state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutState {
    pub retries: u32,
    pub stable_observations: u32,
    pub last_snapshot: Vec<String>,
}

/// Watches the pods of one function created at or after `request_moment`.
pub struct RolloutWatcher {
    name: String,
    namespace: String,
    request_moment: DateTime<Utc>,
    cfg: WatchConfig,
    state: RolloutState,
}

impl RolloutWatcher {
    pub fn new(name: &str, namespace: &str, request_moment: DateTime<Utc>, cfg: WatchConfig) -> Self {
        Self { name: name.to_string(), namespace: namespace.to_string(), request_moment, cfg, state: RolloutState::default() }
    }

    pub fn state(&self) -> &RolloutState { &self.state }

    /// Pods of this function from this rollout; stale and terminating pods are excluded.
    fn owned<'a>(&self, all: &'a [WorkloadInstance]) -> Vec<&'a WorkloadInstance> {
        all.iter()
            .filter(|p| {
                p.label(FUNCTION_LABEL) == Some(self.name.as_str())
                    && p.namespace == self.namespace
                    && !p.terminating
                    && p.created >= self.request_moment
            })
            .collect()
    }

    /// Feed one pod listing into the state machine.
    pub fn observe(&mut self, listing: Result<Vec<WorkloadInstance>, ClientError>) -> Result<Step, DeployError> {
        let all = match listing {
            Ok(all) => all,
            Err(e) if e.is_timeout() => {
                warn!(function = %self.name, "request timed out; retrying");
                return Ok(Step::Pending);
            }
            Err(e) => {
                return Err(DeployError::client(format!("Unable to retrieve the status of the {} deployment", self.name), e));
            }
        };

        let pods = self.owned(&all);
        if pods.is_empty() {
            self.state.retries += 1;
            if self.state.retries > self.cfg.max_retries {
                warn!(function = %self.name, retries = self.state.retries, "giving up, unable to retrieve the status of the deployment");
                return Err(DeployError::GaveUp { name: self.name.clone() });
            }
            warn!(function = %self.name, retries = self.state.retries, "unable to find any running pod; retrying");
            return Ok(Step::Pending);
        }

        let mut ready = 0usize;
        for p in &pods {
            match &p.container {
                Some(c) if c.ready => ready += 1,
                Some(c) if c.restart_count > self.cfg.crashloop_restarts => {
                    warn!(function = %self.name, pod = %p.name, restarts = c.restart_count, state = %c.state, "failed to deploy the function");
                    return Err(DeployError::CrashLoop { name: self.name.clone(), restarts: c.restart_count });
                }
                _ => {}
            }
        }

        if ready == pods.len() {
            self.state.stable_observations += 1;
            if self.state.stable_observations >= self.cfg.stable_polls {
                return Ok(Step::Stable);
            }
            debug!(function = %self.name, observations = self.state.stable_observations, "pods ready; confirming stability");
            return Ok(Step::Pending);
        }

        self.state.stable_observations = 0;
        let snapshot: Vec<String> = pods
            .iter()
            .map(|p| p.container.as_ref().map(|c| c.state.clone()).unwrap_or_else(|| "unknown".to_string()))
            .collect();
        if snapshot != self.state.last_snapshot {
            if self.cfg.verbose {
                info!(function = %self.name, ready, total = pods.len(), status = ?snapshot, "pods status");
            } else {
                debug!(function = %self.name, ready, total = pods.len(), status = ?snapshot, "pods status");
            }
            self.state.last_snapshot = snapshot;
        }
        Ok(Step::Pending)
    }

    /// Poll until the rollout settles. The ticker is dropped with the future,
    /// so no periodic work outlives the watch.
    pub async fn run(mut self, source: &dyn InstanceSource) -> Result<(), DeployError> {
        let t0 = Instant::now();
        // tokio rejects a zero period
        let period = self.cfg.poll_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let listing = source.list_instances().await;
            match self.observe(listing) {
                Ok(Step::Pending) => continue,
                Ok(Step::Stable) => {
                    info!(function = %self.name, took_ms = %t0.elapsed().as_millis(), "function successfully deployed");
                    counter!("rollout_stable", 1u64);
                    histogram!("rollout_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    return Ok(());
                }
                Err(e) => {
                    match &e {
                        DeployError::CrashLoop { .. } => counter!("rollout_crashloop", 1u64),
                        DeployError::GaveUp { .. } => counter!("rollout_gave_up", 1u64),
                        _ => counter!("rollout_err", 1u64),
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::client::ContainerStatus;
    use std::collections::BTreeMap;

    fn moment() -> DateTime<Utc> { DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().with_timezone(&Utc) }

    fn pod(name: &str, offset_secs: i64, ready: bool, restarts: i32) -> WorkloadInstance {
        WorkloadInstance {
            name: format!("{}-abc", name),
            namespace: "default".into(),
            labels: BTreeMap::from([("function".to_string(), name.to_string())]),
            created: moment() + chrono::Duration::seconds(offset_secs),
            terminating: false,
            container: Some(ContainerStatus { ready, restart_count: restarts, state: if ready { "running".into() } else { "waiting".into() } }),
        }
    }

    fn watcher() -> RolloutWatcher { RolloutWatcher::new("hello", "default", moment(), WatchConfig::default()) }

    #[test]
    fn two_ready_polls_are_needed() {
        let mut w = watcher();
        assert_eq!(w.observe(Ok(vec![pod("hello", 1, true, 0)])).unwrap(), Step::Pending);
        assert_eq!(w.observe(Ok(vec![pod("hello", 1, true, 0)])).unwrap(), Step::Stable);
    }

    #[test]
    fn not_ready_poll_resets_stability() {
        let mut w = watcher();
        assert_eq!(w.observe(Ok(vec![pod("hello", 1, true, 0)])).unwrap(), Step::Pending);
        assert_eq!(w.observe(Ok(vec![pod("hello", 1, false, 0)])).unwrap(), Step::Pending);
        assert_eq!(w.state().stable_observations, 0);
        assert_eq!(w.observe(Ok(vec![pod("hello", 1, true, 0)])).unwrap(), Step::Pending);
        assert_eq!(w.observe(Ok(vec![pod("hello", 1, true, 0)])).unwrap(), Step::Stable);
    }

    #[test]
    fn stale_and_foreign_pods_are_ignored() {
        let mut w = watcher();
        let stale = pod("hello", -5, true, 0);
        let other = pod("world", 5, true, 0);
        let mut terminating = pod("hello", 5, true, 0);
        terminating.terminating = true;
        assert_eq!(w.observe(Ok(vec![stale, other, terminating])).unwrap(), Step::Pending);
        assert_eq!(w.state().retries, 1);
        assert_eq!(w.state().stable_observations, 0);
    }

    #[test]
    fn a_stale_ready_pod_does_not_mask_a_fresh_pending_one() {
        let mut w = watcher();
        for _ in 0..3 {
            let step = w.observe(Ok(vec![pod("hello", -30, true, 0), pod("hello", 2, false, 0)])).unwrap();
            assert_eq!(step, Step::Pending);
        }
        assert_eq!(w.state().stable_observations, 0);
    }

    #[test]
    fn crash_loop_fails_immediately() {
        let mut w = watcher();
        let err = w.observe(Ok(vec![pod("hello", 1, false, 3)])).unwrap_err();
        assert_eq!(err, DeployError::CrashLoop { name: "hello".into(), restarts: 3 });
        // restarts within budget keep polling
        let mut w = watcher();
        assert_eq!(w.observe(Ok(vec![pod("hello", 1, false, 2)])).unwrap(), Step::Pending);
    }

    #[test]
    fn gives_up_after_retry_budget() {
        let mut w = watcher();
        for _ in 0..3 {
            assert_eq!(w.observe(Ok(vec![])).unwrap(), Step::Pending);
        }
        assert_eq!(w.observe(Ok(vec![])).unwrap_err(), DeployError::GaveUp { name: "hello".into() });
        assert_eq!(
            DeployError::GaveUp { name: "hello".into() }.to_string(),
            "Unable to retrieve the status of the hello deployment"
        );
    }

    #[test]
    fn timeouts_are_free_and_other_errors_fatal() {
        let mut w = watcher();
        for _ in 0..10 {
            assert_eq!(w.observe(Err(ClientError::Timeout("pods".into()))).unwrap(), Step::Pending);
        }
        assert_eq!(w.state().retries, 0);
        let err = w.observe(Err(ClientError::Transport("connection refused".into()))).unwrap_err();
        assert!(matches!(err, DeployError::Client { .. }));
    }

    #[test]
    fn zero_poll_interval_from_env_is_clamped() {
        std::env::set_var("SKIFF_ROLLOUT_POLL_MS", "0");
        let cfg = WatchConfig::from_env();
        std::env::remove_var("SKIFF_ROLLOUT_POLL_MS");
        assert_eq!(cfg.poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn pod_without_container_status_is_not_ready() {
        let mut w = watcher();
        let mut p = pod("hello", 1, true, 0);
        p.container = None;
        assert_eq!(w.observe(Ok(vec![p])).unwrap(), Step::Pending);
        assert_eq!(w.state().last_snapshot, vec!["unknown".to_string()]);
    }
}
