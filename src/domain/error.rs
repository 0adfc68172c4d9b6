use thiserror::Error;

/// Domain-level errors for loractl.
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Prerequisite installation failed: {0}")]
    PrerequisiteInstall(String),

    #[error("Build failed during {step}: {message}")]
    Build { step: String, message: String },

    #[error("No gateway device found")]
    DeviceNotFound,

    #[error("Unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    #[error("Service topology contains a dependency cycle through: {}", services.join(", "))]
    TopologyCycle { services: Vec<String> },

    #[error("Service '{service}' did not become healthy")]
    ServiceUnhealthy {
        service: String,
        diagnostics: Vec<String>,
    },

    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("HTTP request failed: {0}")]
    HttpRequest(String),

    #[error("Interrupted")]
    Interrupted,
}

impl DomainError {
    /// Process exit code for this failure category.
    pub fn exit_code(&self) -> i32 {
        match self {
            DomainError::DeviceNotFound => 2,
            DomainError::PrerequisiteInstall(_) | DomainError::Build { .. } => 3,
            DomainError::ServiceUnhealthy { .. } => 4,
            DomainError::ConfigurationInvalid(_) | DomainError::TopologyCycle { .. } => 5,
            DomainError::UnsupportedEnvironment(_) => 6,
            DomainError::Interrupted => 130,
            _ => 1,
        }
    }

    pub fn build(step: impl Into<String>, message: impl Into<String>) -> Self {
        DomainError::Build {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        DomainError::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for DomainError {
    fn from(err: toml::de::Error) -> Self {
        DomainError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for DomainError {
    fn from(err: toml::ser::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for DomainError {
    fn from(err: reqwest::Error) -> Self {
        DomainError::HttpRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        assert_eq!(DomainError::DeviceNotFound.exit_code(), 2);
        assert_eq!(DomainError::build("make", "boom").exit_code(), 3);
        assert_eq!(
            DomainError::PrerequisiteInstall("apt".into()).exit_code(),
            3
        );
        assert_eq!(
            DomainError::ServiceUnhealthy {
                service: "redis".into(),
                diagnostics: vec![]
            }
            .exit_code(),
            4
        );
        assert_eq!(
            DomainError::ConfigurationInvalid("ZZ000".into()).exit_code(),
            5
        );
        assert_eq!(DomainError::Io("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_cycle_message_lists_services() {
        let err = DomainError::TopologyCycle {
            services: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("a, b"));
    }
}
