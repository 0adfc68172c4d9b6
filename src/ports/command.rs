use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::DomainError;

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
        }
    }

    /// `sh -c <script>`
    pub fn shell(script: &str) -> Self {
        Self::new("sh", &["-c", script])
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Render as a single shell-quoted command line.
    pub fn to_shell_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|a| a.as_str()))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_shell_line())
    }
}

/// Quote a word for POSIX sh when it contains anything but safe characters.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last non-empty stderr line, or stdout when stderr is empty.
    pub fn summary(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        source
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output")
            .trim()
            .to_string()
    }
}

/// Port for running external programs.
///
/// Returns `Err` only when the program could not run to completion
/// (spawn failure, timeout); a non-zero exit is a normal `CommandOutput`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec, timeout: Duration)
        -> Result<CommandOutput, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quoting() {
        assert_eq!(shell_quote("make"), "make");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_shell_line() {
        let cmd = CommandSpec::new("git", &["clone", "https://x/y.git", "my dir"]);
        assert_eq!(cmd.to_shell_line(), "git clone https://x/y.git 'my dir'");
    }

    #[test]
    fn test_output_summary_prefers_stderr() {
        let out = CommandOutput {
            code: Some(2),
            stdout: "building\n".into(),
            stderr: "cc: error\nmake: *** [all] Error 1\n\n".into(),
        };
        assert!(!out.success());
        assert_eq!(out.summary(), "make: *** [all] Error 1");
    }
}
