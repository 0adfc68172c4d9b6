//! Command-line surface.
//!
//! Parsing lives here; every command delegates to [`AppController`] and
//! only formats its result.

mod error;

pub use error::CliError;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::app::controller::{ConfigureRequest, InstallRequest};
use crate::app::{AppController, ControllerOptions, MonitorFilter};
use crate::domain::template::PLACEHOLDER_GATEWAY_ID;
use crate::domain::{DeviceModel, DomainError};

#[derive(Parser, Debug)]
#[command(name = "loractl", version)]
#[command(about = "Install and run a RAK USB LoRaWAN gateway with a local ChirpStack stack", long_about = None)]
pub struct Cli {
    /// Configuration file (default: OS data directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Trust cached session state instead of probing the host again
    #[arg(long, global = true, env = "LORACTL_QUICK", value_parser = clap::builder::FalseyValueParser::new())]
    pub quick: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Identify the host environment and look for the gateway
    Detect,

    /// Build and install the packet forwarder for this host
    Install {
        /// Gateway model (RAK7271 or RAK7371)
        #[arg(long)]
        model: Option<DeviceModel>,

        /// LoRaWAN region, e.g. EU868
        #[arg(long)]
        region: Option<String>,

        /// On macOS, build inside a Linux VM instead of a container
        #[arg(long)]
        prefer_vm: bool,
    },

    /// Render the forwarder and ChirpStack configuration
    Configure {
        /// LoRaWAN region, e.g. EU868
        region: String,

        /// Network server address the forwarder sends to
        #[arg(long)]
        server: Option<String>,

        /// UDP uplink port
        #[arg(long)]
        port_up: Option<u16>,

        /// UDP downlink port
        #[arg(long)]
        port_down: Option<u16>,
    },

    /// Start the ChirpStack stack and the packet forwarder
    Start {
        /// Only start the stack
        #[arg(long)]
        no_forwarder: bool,
    },

    /// Stop the ChirpStack stack
    Stop,

    /// Show installation and service state
    Status,

    /// Show recent service logs
    Logs {
        /// Service name (default: all)
        service: Option<String>,

        /// Number of lines per service
        #[arg(long, default_value = "50")]
        tail: usize,
    },

    /// Read the concentrator EUI
    Eui,

    /// Register the gateway with ChirpStack
    Register {
        /// Gateway name (default from configuration)
        #[arg(long)]
        name: Option<String>,
    },

    /// Decode forwarder output read from stdin
    Monitor {
        /// Print packets that do not match --dev-addr as well
        #[arg(long)]
        all: bool,

        /// Only report this device address (8 hex digits)
        #[arg(long, value_parser = MonitorFilter::parse_dev_addr)]
        dev_addr: Option<u32>,
    },

    /// Stop the stack and remove the installed gateway software
    Uninstall {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

/// Run a parsed command line to completion.
pub async fn execute(cli: Cli) -> Result<(), CliError> {
    let controller = AppController::new(ControllerOptions {
        config_path: cli.config,
        quick: cli.quick,
    })?;
    let cancel = interrupt_token();

    match cli.command {
        Command::Detect => detect(&controller)?,
        Command::Install {
            model,
            region,
            prefer_vm,
        } => {
            let (strategy, record) = controller
                .install(InstallRequest {
                    model,
                    region,
                    prefer_vm,
                })
                .await?;
            println!("Installed with {}", strategy);
            println!("  Model:  {}", record.device_model);
            println!("  Region: {}", record.region);
            if let Some(path) = &record.install_path {
                println!("  Path:   {}", path.display());
            }
        }
        Command::Configure {
            region,
            server,
            port_up,
            port_down,
        } => {
            let region_name = region.clone();
            let report = controller
                .configure(ConfigureRequest {
                    region,
                    server_address: server,
                    port_up,
                    port_down,
                })
                .await?;
            for path in &report.written {
                println!("wrote {}", path.display());
            }
            match (&report.gateway_eui, &report.eui_error) {
                (Some(eui), _) => println!("Gateway EUI: {}", eui),
                (None, reason) => {
                    println!(
                        "Placeholder gateway ID {} deployed: {}",
                        PLACEHOLDER_GATEWAY_ID,
                        reason.as_deref().unwrap_or("concentrator EUI unavailable")
                    );
                    println!("Re-run `loractl configure {}` once the gateway is attached", region_name);
                }
            }
        }
        Command::Start { no_forwarder } => {
            let mut stdout = io::stdout();
            let running = controller
                .start(!no_forwarder, &mut stdout, cancel)
                .await?;
            if no_forwarder {
                println!("Healthy: {}", running.healthy.join(", "));
            }
        }
        Command::Stop => {
            let stopped = controller.stop().await?;
            if stopped.is_empty() {
                println!("Nothing was running");
            } else {
                println!("Stopped: {}", stopped.join(", "));
            }
        }
        Command::Status => {
            let report = controller.status().await;
            match report.environment {
                Some(env) => println!("Environment: {}", env),
                None => println!("Environment: not detected yet"),
            }
            println!(
                "Device:      {}",
                report.device_path.as_deref().unwrap_or("not found")
            );
            match &report.installation {
                Some(record) => println!(
                    "Install:     {} ({} {})",
                    record.status, record.device_model, record.region
                ),
                None => println!("Install:     not_installed"),
            }
            match &report.stack_error {
                Some(e) => println!("Stack:       unavailable ({})", e),
                None => {
                    println!("Stack:");
                    for (service, state) in &report.services {
                        println!("  {:<28} {}", service, state);
                    }
                }
            }
        }
        Command::Logs { service, tail } => {
            for (name, lines) in controller.logs(service.as_deref(), tail).await? {
                println!("==> {} <==", name);
                for line in lines {
                    println!("{}", line);
                }
            }
        }
        Command::Eui => {
            let eui = controller.read_eui().await?;
            println!("{}", eui);
        }
        Command::Register { name } => {
            let registration = controller.register(name).await?;
            println!(
                "Registered gateway {} as '{}'",
                registration.gateway_id, registration.name
            );
        }
        Command::Monitor { all, dev_addr } => {
            let filter = MonitorFilter {
                dev_addr,
                show_all: all,
            };
            let mut stdout = io::stdout();
            controller
                .monitor(
                    BufReader::new(tokio::io::stdin()),
                    &mut stdout,
                    filter,
                    cancel,
                )
                .await?;
        }
        Command::Uninstall { yes } => {
            if !yes && !confirm("Stop the stack and remove the gateway installation?")? {
                println!("Aborted");
                return Ok(());
            }
            if controller.uninstall().await? {
                println!("Gateway software removed");
            } else {
                println!("Nothing was installed");
            }
        }
    }
    Ok(())
}

fn detect(controller: &AppController) -> Result<(), DomainError> {
    let report = controller.detect()?;
    println!(
        "Environment: {}{}",
        report.environment,
        if report.cached { " (cached)" } else { "" }
    );
    match (&report.device.path, &report.device.bus_id) {
        (Some(path), _) => println!("Device:      {}", path),
        (None, Some(bus)) => println!("Device:      on USB bus {} (not attached)", bus),
        (None, None) => println!("Device:      not found"),
    }
    match &report.strategy {
        Ok(strategy) => println!("Strategy:    {}", strategy),
        Err(reason) => println!("Strategy:    none ({})", reason),
    }
    Ok(())
}

/// Cancelled on the first Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupt received");
            child.cancel();
        }
    });
    token
}

fn confirm(question: &str) -> Result<bool, DomainError> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_install_flags() {
        let cli = Cli::try_parse_from([
            "loractl", "install", "--model", "rak7371", "--region", "us915", "--prefer-vm",
        ])
        .unwrap();
        match cli.command {
            Command::Install {
                model,
                region,
                prefer_vm,
            } => {
                assert_eq!(model, Some(DeviceModel::Rak7371));
                assert_eq!(region.as_deref(), Some("us915"));
                assert!(prefer_vm);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_monitor_dev_addr() {
        let cli = Cli::try_parse_from(["loractl", "monitor", "--dev-addr", "26011BDA", "--all"])
            .unwrap();
        match cli.command {
            Command::Monitor { all, dev_addr } => {
                assert!(all);
                assert_eq!(dev_addr, Some(0x2601_1BDA));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["loractl", "monitor", "--dev-addr", "xyz"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "loractl", "status", "--quick", "--config", "/tmp/loractl.toml",
        ])
        .unwrap();
        assert!(cli.quick);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/loractl.toml")));
    }

    #[test]
    fn test_configure_requires_region() {
        let err = Cli::try_parse_from(["loractl", "configure"]).unwrap_err();
        assert!(CliError::from(err).exit_code() == 1);
    }
}
