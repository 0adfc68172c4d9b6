use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

use crate::domain::HealthCheck;
use crate::ports::{CommandRunner, CommandSpec, ContainerRuntime, HealthProbe};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Evaluates health checks over TCP, HTTP, or by running a command.
///
/// Checks that run inside a service container go through `runtime`, so
/// they use the same compose invocation and file that started it.
pub struct NetworkHealthProbe {
    runner: Arc<dyn CommandRunner>,
    runtime: Arc<dyn ContainerRuntime>,
    work_dir: PathBuf,
    client: reqwest::Client,
}

impl NetworkHealthProbe {
    /// Host command checks run inside `work_dir` (the compose project).
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        runtime: Arc<dyn ContainerRuntime>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            runner,
            runtime,
            work_dir: work_dir.into(),
            client,
        }
    }

    async fn tcp(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }

    async fn http(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                trace!(url, error = %e, "HTTP probe failed");
                false
            }
        }
    }

    async fn command(&self, program: &str, args: &[String]) -> bool {
        let spec = CommandSpec {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: Some(self.work_dir.clone()),
        };
        matches!(self.runner.run(&spec, COMMAND_TIMEOUT).await, Ok(o) if o.success())
    }

    async fn exec(&self, service: &str, program: &str, args: &[String]) -> bool {
        let mut command = Vec::with_capacity(args.len() + 1);
        command.push(program.to_string());
        command.extend_from_slice(args);
        match self.runtime.exec(service, &command).await {
            Ok(()) => true,
            Err(e) => {
                trace!(service, error = %e, "Container probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl HealthProbe for NetworkHealthProbe {
    async fn probe(&self, check: &HealthCheck) -> bool {
        let healthy = match check {
            HealthCheck::Tcp { host, port } => self.tcp(host, *port).await,
            HealthCheck::Http { url } => self.http(url).await,
            HealthCheck::Command { program, args } => self.command(program, args).await,
            HealthCheck::Exec {
                service,
                program,
                args,
            } => self.exec(service, program, args).await,
        };
        trace!(?check, healthy, "Health probe");
        healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainError;
    use crate::adapters::ComposeRuntime;
    use crate::ports::CommandOutput;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct ExitWith(i32);

    #[async_trait]
    impl CommandRunner for ExitWith {
        async fn run(
            &self,
            command: &CommandSpec,
            _timeout: Duration,
        ) -> Result<CommandOutput, DomainError> {
            assert_eq!(command.cwd.as_deref(), Some(std::path::Path::new("/srv/stack")));
            Ok(CommandOutput {
                code: Some(self.0),
                ..Default::default()
            })
        }
    }

    /// Compose project where only the legacy `docker-compose` binary exists.
    #[derive(Default)]
    struct LegacyComposeHost {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for LegacyComposeHost {
        async fn run(
            &self,
            command: &CommandSpec,
            _timeout: Duration,
        ) -> Result<CommandOutput, DomainError> {
            let line = command.to_shell_line();
            self.calls.lock().push(line.clone());
            let code = if line.starts_with("docker compose") { 1 } else { 0 };
            Ok(CommandOutput {
                code: Some(code),
                ..Default::default()
            })
        }
    }

    fn probe(code: i32) -> NetworkHealthProbe {
        let runner = Arc::new(ExitWith(code));
        let runtime = Arc::new(ComposeRuntime::new(runner.clone(), "/srv/stack", "docker-compose.yml"));
        NetworkHealthProbe::new(runner, runtime, "/srv/stack")
    }

    /// Serves one canned HTTP response per connection.
    async fn http_server(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status_line
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        assert!(probe(0).probe(&HealthCheck::tcp("127.0.0.1", open)).await);

        drop(listener);
        assert!(!probe(0).probe(&HealthCheck::tcp("127.0.0.1", open)).await);
    }

    #[tokio::test]
    async fn test_http_probe_treats_4xx_as_up() {
        let ok = http_server("HTTP/1.1 404 Not Found").await;
        let down = http_server("HTTP/1.1 503 Service Unavailable").await;
        let p = probe(0);
        assert!(p.probe(&HealthCheck::http(&format!("http://127.0.0.1:{}/", ok))).await);
        assert!(!p.probe(&HealthCheck::http(&format!("http://127.0.0.1:{}/", down))).await);
    }

    #[tokio::test]
    async fn test_command_probe_uses_exit_status() {
        let check = HealthCheck::command("pg_isready", &["-U", "chirpstack"]);
        assert!(probe(0).probe(&check).await);
        assert!(!probe(1).probe(&check).await);
    }

    #[tokio::test]
    async fn test_container_check_follows_legacy_compose() {
        let host = Arc::new(LegacyComposeHost::default());
        let runtime = Arc::new(ComposeRuntime::new(host.clone(), "/srv/stack", "lorawan.yml"));
        let probe = NetworkHealthProbe::new(host.clone(), runtime, "/srv/stack");

        let check = HealthCheck::exec("postgres", "pg_isready", &["-U", "chirpstack"]);
        assert!(probe.probe(&check).await);
        assert!(host
            .calls
            .lock()
            .contains(&"docker-compose -f lorawan.yml exec -T postgres pg_isready -U chirpstack".to_string()));
        assert!(!host.calls.lock().iter().any(|c| c.starts_with("docker compose exec")));
    }
}
