use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{DomainError, ServiceSpec, ServiceState, ServiceTopology};
use crate::ports::{ContainerRuntime, HealthProbe};

/// Services that came up healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningSet {
    pub healthy: Vec<String>,
    pub states: BTreeMap<String, ServiceState>,
}

/// Outcome of an `up` that did not bring every service to health.
#[derive(Debug, Clone)]
pub struct OrchestratorFailure {
    /// Services that were started but never became healthy.
    pub failed: Vec<String>,
    /// Services never started because a dependency failed.
    pub blocked: Vec<String>,
    /// Recent log lines per failed service.
    pub diagnostics: BTreeMap<String, Vec<String>>,
    pub states: BTreeMap<String, ServiceState>,
    pub interrupted: bool,
}

impl std::fmt::Display for OrchestratorFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.interrupted {
            return write!(f, "startup interrupted");
        }
        write!(f, "unhealthy: {}", self.failed.join(", "))?;
        if !self.blocked.is_empty() {
            write!(f, "; not started: {}", self.blocked.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for OrchestratorFailure {}

impl From<OrchestratorFailure> for DomainError {
    fn from(failure: OrchestratorFailure) -> Self {
        if failure.interrupted {
            return DomainError::Interrupted;
        }
        let diagnostics = failure
            .diagnostics
            .iter()
            .flat_map(|(service, lines)| lines.iter().map(move |l| format!("{} | {}", service, l)))
            .collect();
        DomainError::ServiceUnhealthy {
            service: failure.failed.join(", "),
            diagnostics,
        }
    }
}

enum WaitOutcome {
    Healthy,
    TimedOut,
    Cancelled,
}

/// Starts and stops a service topology with health gating.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
    diagnostic_lines: usize,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
        diagnostic_lines: usize,
    ) -> Self {
        Self {
            runtime,
            probe,
            diagnostic_lines,
        }
    }

    /// Start services in dependency order, waiting for each to pass its check.
    ///
    /// A failure does not roll back healthy services; independent services
    /// still start. Dependents of a failed service stay `Stopped`.
    pub async fn up(
        &self,
        topology: &ServiceTopology,
        cancel: CancellationToken,
    ) -> Result<RunningSet, OrchestratorFailure> {
        let mut states: BTreeMap<String, ServiceState> = topology
            .names()
            .into_iter()
            .map(|n| (n.to_string(), ServiceState::Stopped))
            .collect();
        let mut unusable: HashSet<String> = HashSet::new();
        let mut failed = Vec::new();
        let mut blocked = Vec::new();
        let mut healthy = Vec::new();
        let mut diagnostics = BTreeMap::new();

        for service in topology.startup_order() {
            if cancel.is_cancelled() {
                return Err(interrupted(states, failed, blocked, diagnostics));
            }

            if let Some(dep) = service.depends_on.iter().find(|d| unusable.contains(*d)) {
                warn!(service = %service.name, dependency = %dep, "Skipping service, dependency unavailable");
                unusable.insert(service.name.clone());
                blocked.push(service.name.clone());
                continue;
            }

            states.insert(service.name.clone(), ServiceState::Starting);
            if let Err(e) = self.runtime.start(service).await {
                warn!(service = %service.name, error = %e, "Start failed");
                let mut lines = vec![e.to_string()];
                lines.extend(self.tail(service).await);
                states.insert(service.name.clone(), ServiceState::Failed);
                diagnostics.insert(service.name.clone(), lines);
                unusable.insert(service.name.clone());
                failed.push(service.name.clone());
                continue;
            }

            states.insert(service.name.clone(), ServiceState::WaitingHealthy);
            match self.wait_healthy(service, &cancel).await {
                WaitOutcome::Healthy => {
                    info!(service = %service.name, "Service healthy");
                    states.insert(service.name.clone(), ServiceState::Healthy);
                    healthy.push(service.name.clone());
                }
                WaitOutcome::TimedOut => {
                    warn!(
                        service = %service.name,
                        timeout = ?service.startup_timeout(),
                        "Service did not become healthy"
                    );
                    states.insert(service.name.clone(), ServiceState::Failed);
                    diagnostics.insert(service.name.clone(), self.tail(service).await);
                    unusable.insert(service.name.clone());
                    failed.push(service.name.clone());
                }
                WaitOutcome::Cancelled => {
                    return Err(interrupted(states, failed, blocked, diagnostics));
                }
            }
        }

        if failed.is_empty() {
            Ok(RunningSet { healthy, states })
        } else {
            Err(OrchestratorFailure {
                failed,
                blocked,
                diagnostics,
                states,
                interrupted: false,
            })
        }
    }

    async fn wait_healthy(&self, service: &ServiceSpec, cancel: &CancellationToken) -> WaitOutcome {
        for attempt in 1..=service.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                _ = tokio::time::sleep(service.poll_interval) => {}
            }
            if self.probe.probe(&service.health).await {
                return WaitOutcome::Healthy;
            }
            debug!(service = %service.name, attempt, max = service.max_attempts, "Not healthy yet");
        }
        WaitOutcome::TimedOut
    }

    async fn tail(&self, service: &ServiceSpec) -> Vec<String> {
        match self.runtime.log_tail(service, self.diagnostic_lines).await {
            Ok(lines) => lines,
            Err(e) => vec![format!("logs unavailable: {}", e)],
        }
    }

    /// Stop running services in reverse dependency order.
    ///
    /// Services that are not running are left alone, so calling this twice is harmless.
    pub async fn down(&self, topology: &ServiceTopology) -> Result<Vec<String>, DomainError> {
        let running = self.runtime.running_services().await?;
        let mut stopped = Vec::new();
        for service in topology.shutdown_order() {
            if running.contains(&service.name) {
                self.runtime.stop(service).await?;
                stopped.push(service.name.clone());
            }
        }
        info!(count = stopped.len(), "Stack stopped");
        Ok(stopped)
    }

    /// Current state of every service: probed when running, `Stopped` otherwise.
    pub async fn status(
        &self,
        topology: &ServiceTopology,
    ) -> Result<BTreeMap<String, ServiceState>, DomainError> {
        let running = self.runtime.running_services().await?;
        let mut states = BTreeMap::new();
        for service in topology.startup_order() {
            let state = if !running.contains(&service.name) {
                ServiceState::Stopped
            } else if self.probe.probe(&service.health).await {
                ServiceState::Healthy
            } else {
                ServiceState::WaitingHealthy
            };
            states.insert(service.name.clone(), state);
        }
        Ok(states)
    }

    /// Recent log lines of one service.
    pub async fn logs(
        &self,
        topology: &ServiceTopology,
        service: &str,
        lines: usize,
    ) -> Result<Vec<String>, DomainError> {
        let spec = topology.get(service).ok_or_else(|| {
            DomainError::ConfigurationInvalid(format!(
                "unknown service '{}' (known: {})",
                service,
                topology.names().join(", ")
            ))
        })?;
        self.runtime.log_tail(spec, lines).await
    }
}

fn interrupted(
    states: BTreeMap<String, ServiceState>,
    failed: Vec<String>,
    blocked: Vec<String>,
    diagnostics: BTreeMap<String, Vec<String>>,
) -> OrchestratorFailure {
    warn!("Startup interrupted");
    OrchestratorFailure {
        failed,
        blocked,
        diagnostics,
        states,
        interrupted: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HealthCheck;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Default)]
    struct FakeRuntime {
        running: Mutex<HashSet<String>>,
        calls: Mutex<Vec<String>>,
        refuse: HashSet<String>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn start(&self, service: &ServiceSpec) -> Result<(), DomainError> {
            self.calls.lock().push(format!("start {}", service.name));
            if self.refuse.contains(&service.name) {
                return Err(DomainError::command("compose up", "image not found"));
            }
            self.running.lock().insert(service.name.clone());
            Ok(())
        }

        async fn stop(&self, service: &ServiceSpec) -> Result<(), DomainError> {
            self.calls.lock().push(format!("stop {}", service.name));
            self.running.lock().remove(&service.name);
            Ok(())
        }

        async fn running_services(&self) -> Result<HashSet<String>, DomainError> {
            Ok(self.running.lock().clone())
        }

        async fn exec(&self, service: &str, _command: &[String]) -> Result<(), DomainError> {
            if self.running.lock().contains(service) {
                Ok(())
            } else {
                Err(DomainError::command("compose exec", "service is not running"))
            }
        }

        async fn log_tail(
            &self,
            service: &ServiceSpec,
            lines: usize,
        ) -> Result<Vec<String>, DomainError> {
            Ok((0..lines.min(2))
                .map(|i| format!("{} log {}", service.name, i))
                .collect())
        }
    }

    /// Healthy after N probes per port; ports not listed never become healthy.
    #[derive(Default)]
    struct FakeProbe {
        healthy_after: HashMap<u16, u32>,
        probes: Mutex<HashMap<u16, u32>>,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self, check: &HealthCheck) -> bool {
            let HealthCheck::Tcp { port, .. } = check else {
                return false;
            };
            let mut probes = self.probes.lock();
            let count = probes.entry(*port).or_insert(0);
            *count += 1;
            self.healthy_after
                .get(port)
                .map(|needed| *count >= *needed)
                .unwrap_or(false)
        }
    }

    fn svc(name: &str, port: u16, deps: &[&str]) -> ServiceSpec {
        ServiceSpec::new(name, "img", HealthCheck::tcp("127.0.0.1", port))
            .depends_on(deps)
            .polling(Duration::from_secs(1), 5)
    }

    fn orchestrator(runtime: Arc<FakeRuntime>, probe: Arc<FakeProbe>) -> Orchestrator {
        Orchestrator::new(runtime, probe, 20)
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_healthy_in_dependency_order() {
        let topology = ServiceTopology::new(vec![
            svc("chirpstack", 3, &["postgres", "redis"]),
            svc("postgres", 1, &[]),
            svc("redis", 2, &[]),
        ])
        .unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let probe = Arc::new(FakeProbe {
            healthy_after: HashMap::from([(1, 3), (2, 1), (3, 2)]),
            ..Default::default()
        });

        let start = Instant::now();
        let running = orchestrator(runtime.clone(), probe)
            .up(&topology, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(running.healthy, vec!["postgres", "redis", "chirpstack"]);
        assert!(running.states.values().all(|s| *s == ServiceState::Healthy));
        assert_eq!(
            *runtime.calls.lock(),
            vec!["start postgres", "start redis", "start chirpstack"]
        );
        // 3 + 1 + 2 poll intervals
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_dependency_blocks_dependents_only() {
        // a healthy, b never healthy, c depends on b, d independent
        let topology = ServiceTopology::new(vec![
            svc("a", 1, &[]),
            svc("b", 2, &["a"]),
            svc("c", 3, &["b"]),
            svc("d", 4, &[]),
        ])
        .unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let probe = Arc::new(FakeProbe {
            healthy_after: HashMap::from([(1, 1), (3, 1), (4, 1)]),
            ..Default::default()
        });

        let start = Instant::now();
        let failure = orchestrator(runtime.clone(), probe)
            .up(&topology, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.failed, vec!["b"]);
        assert_eq!(failure.blocked, vec!["c"]);
        assert!(!failure.interrupted);
        assert_eq!(failure.states["a"], ServiceState::Healthy);
        assert_eq!(failure.states["b"], ServiceState::Failed);
        assert_eq!(failure.states["c"], ServiceState::Stopped);
        assert_eq!(failure.states["d"], ServiceState::Healthy);
        assert_eq!(failure.diagnostics["b"], vec!["b log 0", "b log 1"]);
        assert!(!runtime.calls.lock().contains(&"start c".to_string()));
        // a: 1s, b: full 5s budget, d: 1s
        assert_eq!(start.elapsed(), Duration::from_secs(7));

        match DomainError::from(failure) {
            DomainError::ServiceUnhealthy {
                service,
                diagnostics,
            } => {
                assert_eq!(service, "b");
                assert_eq!(diagnostics[0], "b | b log 0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_error_counts_as_failure() {
        let topology = ServiceTopology::new(vec![svc("a", 1, &[]), svc("b", 2, &["a"])]).unwrap();
        let runtime = Arc::new(FakeRuntime {
            refuse: HashSet::from(["a".to_string()]),
            ..Default::default()
        });
        let failure = orchestrator(runtime, Arc::new(FakeProbe::default()))
            .up(&topology, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.failed, vec!["a"]);
        assert_eq!(failure.blocked, vec!["b"]);
        assert!(failure.diagnostics["a"][0].contains("image not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_waiting() {
        let topology = ServiceTopology::new(vec![
            svc("slow", 1, &[]).polling(Duration::from_secs(1), 100),
            svc("after", 2, &["slow"]),
        ])
        .unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let failure = orchestrator(runtime.clone(), Arc::new(FakeProbe::default()))
            .up(&topology, token)
            .await
            .unwrap_err();

        assert!(failure.interrupted);
        assert_eq!(failure.states["slow"], ServiceState::WaitingHealthy);
        assert_eq!(start.elapsed(), Duration::from_millis(3500));
        assert!(matches!(DomainError::from(failure), DomainError::Interrupted));
        assert_eq!(*runtime.calls.lock(), vec!["start slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_is_idempotent_and_reversed() {
        let topology = ServiceTopology::new(vec![
            svc("db", 1, &[]),
            svc("app", 2, &["db"]),
            svc("idle", 3, &[]),
        ])
        .unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        runtime.running.lock().extend(["db".to_string(), "app".to_string()]);
        let orch = orchestrator(runtime.clone(), Arc::new(FakeProbe::default()));

        assert_eq!(orch.down(&topology).await.unwrap(), vec!["app", "db"]);
        assert!(orch.down(&topology).await.unwrap().is_empty());
        assert_eq!(*runtime.calls.lock(), vec!["stop app", "stop db"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_probe_results() {
        let topology =
            ServiceTopology::new(vec![svc("a", 1, &[]), svc("b", 2, &[]), svc("c", 3, &[])])
                .unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        runtime.running.lock().extend(["a".to_string(), "b".to_string()]);
        let probe = Arc::new(FakeProbe {
            healthy_after: HashMap::from([(1, 1)]),
            ..Default::default()
        });

        let states = orchestrator(runtime, probe).status(&topology).await.unwrap();
        assert_eq!(states["a"], ServiceState::Healthy);
        assert_eq!(states["b"], ServiceState::WaitingHealthy);
        assert_eq!(states["c"], ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_logs_for_unknown_service() {
        let topology = ServiceTopology::new(vec![svc("a", 1, &[])]).unwrap();
        let orch = orchestrator(Arc::new(FakeRuntime::default()), Arc::new(FakeProbe::default()));
        assert_eq!(orch.logs(&topology, "a", 5).await.unwrap().len(), 2);
        assert!(matches!(
            orch.logs(&topology, "nope", 5).await,
            Err(DomainError::ConfigurationInvalid(_))
        ));
    }
}
