use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Predicate deciding whether a service is ready for its dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCheck {
    /// TCP connect succeeds.
    Tcp { host: String, port: u16 },
    /// Host command exits with status 0.
    Command { program: String, args: Vec<String> },
    /// Command run inside the service's own container exits with status 0.
    Exec {
        service: String,
        program: String,
        args: Vec<String>,
    },
    /// HTTP GET returns a non-5xx response.
    Http { url: String },
}

impl HealthCheck {
    pub fn tcp(host: &str, port: u16) -> Self {
        HealthCheck::Tcp {
            host: host.to_string(),
            port,
        }
    }

    pub fn command(program: &str, args: &[&str]) -> Self {
        HealthCheck::Command {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Run through the container runtime, so it shares its compose invocation.
    pub fn exec(service: &str, program: &str, args: &[&str]) -> Self {
        HealthCheck::Exec {
            service: service.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn http(url: &str) -> Self {
        HealthCheck::Http {
            url: url.to_string(),
        }
    }
}

/// One container in the backend stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub depends_on: Vec<String>,
    pub health: HealthCheck,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl ServiceSpec {
    pub fn new(name: &str, image: &str, health: HealthCheck) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            depends_on: Vec::new(),
            health,
            poll_interval: Duration::from_secs(1),
            max_attempts: 15,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_attempts = max_attempts;
        self
    }

    /// Total time the orchestrator waits for this service.
    pub fn startup_timeout(&self) -> Duration {
        self.poll_interval * self.max_attempts
    }
}

/// Lifecycle of a service during orchestration.
///
/// Transitions: Stopped -> Starting -> WaitingHealthy -> Healthy | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Stopped,
    Starting,
    WaitingHealthy,
    Healthy,
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::WaitingHealthy => write!(f, "waiting for health"),
            ServiceState::Healthy => write!(f, "healthy"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

/// Validated, dependency-ordered set of services.
#[derive(Debug, Clone)]
pub struct ServiceTopology {
    services: Vec<ServiceSpec>,
    order: Vec<usize>,
}

impl ServiceTopology {
    /// Validate and sort a set of services.
    ///
    /// Rejects duplicate names, unknown dependencies and dependency cycles.
    pub fn new(services: Vec<ServiceSpec>) -> Result<Self, DomainError> {
        let mut index = HashMap::new();
        for (i, svc) in services.iter().enumerate() {
            if index.insert(svc.name.clone(), i).is_some() {
                return Err(DomainError::ConfigurationInvalid(format!(
                    "service '{}' is declared twice",
                    svc.name
                )));
            }
        }

        for svc in &services {
            for dep in &svc.depends_on {
                if !index.contains_key(dep) {
                    return Err(DomainError::ConfigurationInvalid(format!(
                        "service '{}' depends on unknown service '{}'",
                        svc.name, dep
                    )));
                }
            }
        }

        // Kahn's algorithm; ties resolved by declaration order.
        let mut placed: HashSet<usize> = HashSet::new();
        let mut order = Vec::with_capacity(services.len());
        while order.len() < services.len() {
            let next = services.iter().enumerate().find(|(i, svc)| {
                !placed.contains(i) && svc.depends_on.iter().all(|d| placed.contains(&index[d]))
            });
            match next {
                Some((i, _)) => {
                    placed.insert(i);
                    order.push(i);
                }
                None => {
                    let stuck = services
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| !placed.contains(i))
                        .map(|(_, s)| s.name.clone())
                        .collect();
                    return Err(DomainError::TopologyCycle { services: stuck });
                }
            }
        }

        Ok(Self { services, order })
    }

    /// Services in startup order.
    pub fn startup_order(&self) -> impl Iterator<Item = &ServiceSpec> + '_ {
        self.order.iter().map(move |&i| &self.services[i])
    }

    /// Services in shutdown order (reverse of startup).
    pub fn shutdown_order(&self) -> impl Iterator<Item = &ServiceSpec> + '_ {
        self.order.iter().rev().map(move |&i| &self.services[i])
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.startup_order().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// The local ChirpStack v4 stack.
    ///
    /// ChirpStack fronts PostgreSQL and needs the longest cold-start budget.
    pub fn chirpstack_default() -> Self {
        let services = vec![
            ServiceSpec::new("mosquitto", "eclipse-mosquitto:2", HealthCheck::tcp("127.0.0.1", 1883))
                .polling(Duration::from_secs(1), 15),
            ServiceSpec::new(
                "postgres",
                "postgres:14-alpine",
                HealthCheck::exec("postgres", "pg_isready", &["-U", "chirpstack"]),
            )
            .polling(Duration::from_secs(2), 30),
            ServiceSpec::new("redis", "redis:7-alpine", HealthCheck::tcp("127.0.0.1", 6379))
                .polling(Duration::from_secs(1), 15),
            ServiceSpec::new(
                "chirpstack-gateway-bridge",
                "chirpstack/chirpstack-gateway-bridge:4",
                HealthCheck::exec("chirpstack-gateway-bridge", "true", &[]),
            )
            .depends_on(&["mosquitto"])
            .polling(Duration::from_secs(2), 15),
            ServiceSpec::new(
                "chirpstack",
                "chirpstack/chirpstack:4",
                HealthCheck::http("http://127.0.0.1:8080"),
            )
            .depends_on(&["postgres", "redis", "mosquitto"])
            .polling(Duration::from_secs(3), 40),
            ServiceSpec::new(
                "chirpstack-rest-api",
                "chirpstack/chirpstack-rest-api:4",
                HealthCheck::tcp("127.0.0.1", 8090),
            )
            .depends_on(&["chirpstack"])
            .polling(Duration::from_secs(2), 20),
        ];

        match Self::new(services) {
            Ok(topology) => topology,
            // The built-in stack is acyclic; an error here is a programming mistake.
            Err(e) => unreachable!("built-in topology is invalid: {}", e),
        }
    }
}
