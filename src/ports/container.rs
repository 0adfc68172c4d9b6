use std::collections::HashSet;

use async_trait::async_trait;

use crate::domain::{DomainError, HealthCheck, ServiceSpec};

/// Port for the container runtime driving the backend stack.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Issue a non-blocking start for one service.
    async fn start(&self, service: &ServiceSpec) -> Result<(), DomainError>;

    /// Stop one service.
    async fn stop(&self, service: &ServiceSpec) -> Result<(), DomainError>;

    /// Names of currently running services.
    async fn running_services(&self) -> Result<HashSet<String>, DomainError>;

    /// Run a command inside a running service container; Ok when it exits 0.
    async fn exec(&self, service: &str, command: &[String]) -> Result<(), DomainError>;

    /// Most recent log lines of a service.
    async fn log_tail(&self, service: &ServiceSpec, lines: usize)
        -> Result<Vec<String>, DomainError>;
}

/// Port for evaluating health predicates.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Single probe attempt. Errors count as unhealthy.
    async fn probe(&self, check: &HealthCheck) -> bool;
}
