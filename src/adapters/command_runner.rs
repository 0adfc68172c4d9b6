use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::DomainError;
use crate::ports::command::shell_quote;
use crate::ports::{CommandOutput, CommandRunner, CommandSpec};

/// Runs programs directly on this host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, DomainError> {
        debug!(command = %command, cwd = ?command.cwd, "Running command");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DomainError::command(
                    command.to_string(),
                    format!("failed to spawn: {}", e),
                ))
            }
            Err(_) => {
                warn!(command = %command, ?timeout, "Command timed out");
                return Err(DomainError::command(
                    command.to_string(),
                    format!("timed out after {:?}", timeout),
                ));
            }
        };

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(command = %command, code = ?result.code, "Command finished");
        Ok(result)
    }
}

/// Relays every command into another Linux shell context (WSL or a VM).
///
/// Commands become `<prefix...> bash -lc '<cd> && <command line>'`. Relative
/// working directories resolve against the remote user's home.
pub struct RelayedCommandRunner {
    prefix: Vec<String>,
    inner: Arc<dyn CommandRunner>,
}

impl RelayedCommandRunner {
    pub fn new(prefix: Vec<String>, inner: Arc<dyn CommandRunner>) -> Result<Self, DomainError> {
        if prefix.is_empty() {
            return Err(DomainError::ConfigurationInvalid(
                "relay command prefix is empty".to_string(),
            ));
        }
        Ok(Self { prefix, inner })
    }

    /// Relay into the default WSL distribution.
    pub fn wsl(inner: Arc<dyn CommandRunner>) -> Self {
        Self {
            prefix: vec!["wsl.exe".to_string(), "-e".to_string()],
            inner,
        }
    }

    pub fn relay(&self, command: &CommandSpec) -> CommandSpec {
        let mut script = String::from("cd ~");
        if let Some(dir) = &command.cwd {
            script.push_str(" && cd ");
            script.push_str(&shell_quote(&dir.to_string_lossy()));
        }
        script.push_str(" && ");
        script.push_str(&command.to_shell_line());

        let mut args: Vec<String> = self.prefix[1..].to_vec();
        args.extend(["bash".to_string(), "-lc".to_string(), script]);

        CommandSpec {
            program: self.prefix[0].clone(),
            args,
            cwd: None,
        }
    }
}

#[async_trait]
impl CommandRunner for RelayedCommandRunner {
    async fn run(
        &self,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, DomainError> {
        let relayed = self.relay(command);
        self.inner.run(&relayed, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_output() {
        let runner = TokioCommandRunner::new();
        let output = runner
            .run(&CommandSpec::new("echo", &["hello"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let runner = TokioCommandRunner::new();
        let output = runner
            .run(&CommandSpec::shell("exit 3"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let runner = TokioCommandRunner::new();
        let result = runner
            .run(
                &CommandSpec::new("nonexistent_command_12345", &[]),
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(DomainError::Command { .. })));
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = TokioCommandRunner::new();
        let result = runner
            .run(&CommandSpec::new("sleep", &["5"]), Duration::from_millis(50))
            .await;
        match result {
            Err(DomainError::Command { message, .. }) => assert!(message.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_wsl_relay_wraps_command() {
        let relay = RelayedCommandRunner::wsl(Arc::new(TokioCommandRunner::new()));
        let spec = CommandSpec::new("make", &["-j4"]).in_dir("loractl/sx1302_hal");
        let relayed = relay.relay(&spec);
        assert_eq!(relayed.program, "wsl.exe");
        assert_eq!(
            relayed.args,
            vec!["-e", "bash", "-lc", "cd ~ && cd loractl/sx1302_hal && make -j4"]
        );
        assert!(relayed.cwd.is_none());
    }

    #[test]
    fn test_vm_relay_prefix() {
        let relay = RelayedCommandRunner::new(
            vec!["multipass".into(), "exec".into(), "gw".into(), "--".into()],
            Arc::new(TokioCommandRunner::new()),
        )
        .unwrap();
        let relayed = relay.relay(&CommandSpec::new("echo", &["a b"]));
        assert_eq!(relayed.program, "multipass");
        assert_eq!(relayed.args[..3], ["exec", "gw", "--"]);
        assert_eq!(relayed.args.last().unwrap(), "cd ~ && echo 'a b'");

        assert!(RelayedCommandRunner::new(vec![], Arc::new(TokioCommandRunner::new())).is_err());
    }
}
