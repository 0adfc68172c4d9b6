use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::domain::{DomainError, ServiceSpec};
use crate::ports::{CommandOutput, CommandRunner, CommandSpec, ContainerRuntime};

/// First start may pull images.
const START_TIMEOUT: Duration = Duration::from_secs(600);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives the backend stack through Docker Compose.
pub struct ComposeRuntime {
    runner: Arc<dyn CommandRunner>,
    project_dir: PathBuf,
    compose_file: String,
    invocation: OnceCell<Vec<String>>,
}

impl ComposeRuntime {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        project_dir: impl Into<PathBuf>,
        compose_file: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            project_dir: project_dir.into(),
            compose_file: compose_file.into(),
            invocation: OnceCell::new(),
        }
    }

    /// `docker compose` when the plugin is installed, else legacy `docker-compose`.
    async fn invocation(&self) -> Result<&[String], DomainError> {
        let words = self
            .invocation
            .get_or_try_init(|| async {
                let plugin = CommandSpec::new("docker", &["compose", "version"]);
                if matches!(self.runner.run(&plugin, QUERY_TIMEOUT).await, Ok(o) if o.success()) {
                    return Ok(vec!["docker".to_string(), "compose".to_string()]);
                }
                let legacy = CommandSpec::new("docker-compose", &["version"]);
                if matches!(self.runner.run(&legacy, QUERY_TIMEOUT).await, Ok(o) if o.success()) {
                    return Ok(vec!["docker-compose".to_string()]);
                }
                Err(DomainError::command(
                    "docker compose version",
                    "neither `docker compose` nor `docker-compose` is available",
                ))
            })
            .await?;
        debug!(compose = ?words, "Compose command detected");
        Ok(words.as_slice())
    }

    async fn compose(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput, DomainError> {
        let words = self.invocation().await?;
        let mut spec = CommandSpec {
            program: words[0].clone(),
            args: words[1..].to_vec(),
            cwd: Some(self.project_dir.clone()),
        };
        spec.args.push("-f".to_string());
        spec.args.push(self.compose_file.clone());
        spec.args.extend(args.iter().map(|a| a.to_string()));

        let output = self.runner.run(&spec, timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(DomainError::command(spec.to_string(), output.summary()))
        }
    }
}

#[async_trait]
impl ContainerRuntime for ComposeRuntime {
    async fn start(&self, service: &ServiceSpec) -> Result<(), DomainError> {
        info!(service = %service.name, "Starting service");
        self.compose(&["up", "-d", "--no-deps", &service.name], START_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn stop(&self, service: &ServiceSpec) -> Result<(), DomainError> {
        info!(service = %service.name, "Stopping service");
        self.compose(&["stop", &service.name], START_TIMEOUT).await?;
        Ok(())
    }

    async fn running_services(&self) -> Result<HashSet<String>, DomainError> {
        let output = self
            .compose(
                &["ps", "--services", "--filter", "status=running"],
                QUERY_TIMEOUT,
            )
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn exec(&self, service: &str, command: &[String]) -> Result<(), DomainError> {
        let mut args = vec!["exec", "-T", service];
        args.extend(command.iter().map(String::as_str));
        self.compose(&args, QUERY_TIMEOUT).await?;
        Ok(())
    }

    async fn log_tail(
        &self,
        service: &ServiceSpec,
        lines: usize,
    ) -> Result<Vec<String>, DomainError> {
        let tail = lines.to_string();
        let output = self
            .compose(
                &["logs", "--no-color", "--tail", &tail, &service.name],
                QUERY_TIMEOUT,
            )
            .await?;
        Ok(output.stdout.lines().map(str::to_string).collect())
    }
}
