//! CLI error handling with remediation hints.
//!
//! Every failure leaves the process through [`CliError::exit`], which maps
//! it to the exit code of its category.

use std::fmt;
use std::process;

use crate::domain::DomainError;

/// CLI-level errors.
#[derive(Debug)]
pub enum CliError {
    /// Invalid arguments, or `--help` / `--version` output.
    Usage(clap::Error),
    /// The async runtime could not be created
    Runtime(std::io::Error),
    /// A command failed
    Domain(DomainError),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(e) if !e.use_stderr() => 0,
            CliError::Usage(_) | CliError::Runtime(_) => 1,
            CliError::Domain(e) => e.exit_code(),
        }
    }

    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        if let CliError::Usage(e) = self {
            // clap uses 2 for usage errors, which is taken by device-not-found
            let _ = e.print();
            process::exit(self.exit_code());
        }

        eprintln!("Error: {}", self);

        match self {
            CliError::Domain(DomainError::DeviceNotFound) => {
                eprintln!();
                eprintln!("Make sure that:");
                eprintln!("  1. The RAK7271/RAK7371 is plugged in (try another USB port or cable)");
                eprintln!("  2. On Windows, usbipd-win is installed: winget install usbipd");
                eprintln!("  3. On Linux, your user is in the 'dialout' group");
            }
            CliError::Domain(DomainError::PrerequisiteInstall(_)) => {
                eprintln!();
                eprintln!("Install the missing packages manually and retry:");
                eprintln!("  sudo apt-get install git make gcc libusb-1.0-0-dev");
            }
            CliError::Domain(DomainError::Build { step, .. }) => {
                eprintln!();
                eprintln!("The '{}' step failed. Run with LORACTL_DEBUG=1 for the full command output.", step);
            }
            CliError::Domain(DomainError::ServiceUnhealthy { diagnostics, .. }) => {
                if !diagnostics.is_empty() {
                    eprintln!();
                    eprintln!("Recent logs:");
                    for line in diagnostics {
                        eprintln!("  {}", line);
                    }
                }
                eprintln!();
                eprintln!("Inspect a service with: loractl logs <service>");
            }
            CliError::Domain(DomainError::ConfigurationInvalid(_)) => {
                eprintln!();
                eprintln!("Supported regions: EU868, US915, AS923, AU915, KR920, IN865, CN470, RU864");
            }
            CliError::Domain(DomainError::UnsupportedEnvironment(_)) => {
                eprintln!();
                eprintln!("Supported hosts: Linux, Windows with WSL2, macOS (Docker or a Linux VM)");
            }
            _ => {}
        }

        process::exit(self.exit_code())
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Usage(e) => write!(f, "{}", e),
            CliError::Runtime(e) => write!(f, "Failed to start async runtime: {}", e),
            CliError::Domain(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Usage(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            CliError::Domain(e) => Some(e),
        }
    }
}

impl From<DomainError> for CliError {
    fn from(e: DomainError) -> Self {
        CliError::Domain(e)
    }
}

impl From<clap::Error> for CliError {
    fn from(e: clap::Error) -> Self {
        CliError::Usage(e)
    }
}
