use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::adapters::{
    ChirpstackRegistry, ComposeRuntime, KeyValueSessionStore, NetworkHealthProbe,
    RelayedCommandRunner, SystemDeviceLocator, SystemEnvironmentDetector, TokioCommandRunner,
    TomlConfigStore,
};
use crate::app::artifacts::write_artifacts;
use crate::app::installer::{InstallPlan, Installer};
use crate::app::monitor::{run_monitor, MonitorFilter, PacketMonitor};
use crate::app::orchestrator::{Orchestrator, RunningSet};
use crate::domain::packet::MonitorStats;
use crate::domain::template::{
    merge_frequency_plan, render_backend, render_compose, render_gateway, MERGED_GATEWAY_CONF,
    PLACEHOLDER_GATEWAY_ID,
};
use crate::domain::{
    select_strategy, AppConfig, ConfigArtifact, DeviceHandle, DeviceModel, DeviceStatus,
    DomainError, EnvironmentProfile, GatewayEui, InstallStatus, InstallStrategy,
    InstallationRecord, OsType, Region, RegionProfile, ServiceState, ServiceTopology, SessionSnapshot,
};
use crate::infrastructure::init_logging;
use crate::ports::command::shell_quote;
use crate::ports::{
    CommandRunner, CommandSpec, ConfigStore, ContainerRuntime, DeviceLocator,
    EnvironmentDetector, GatewayRegistration, GatewayRegistry, SessionStore,
};

/// Install root inside WSL or the VM, relative to the remote home.
const RELAYED_INSTALL_DIR: &str = "loractl/gateway";

const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Process-level options chosen on the command line.
#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// Alternative configuration file.
    pub config_path: Option<PathBuf>,
    /// Trust the cached session instead of probing the host again.
    pub quick: bool,
}

/// Host environment and gateway as seen by `detect`.
#[derive(Debug, Clone)]
pub struct DetectionReport {
    pub environment: EnvironmentProfile,
    pub device: DeviceHandle,
    /// Selected strategy, or why none applies.
    pub strategy: Result<InstallStrategy, String>,
    /// True when the report came from the session cache.
    pub cached: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub model: Option<DeviceModel>,
    pub region: Option<String>,
    pub prefer_vm: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigureRequest {
    pub region: String,
    pub server_address: Option<String>,
    pub port_up: Option<u16>,
    pub port_down: Option<u16>,
}

/// Files produced by `configure`.
#[derive(Debug, Clone, Default)]
pub struct ConfigureReport {
    pub written: Vec<PathBuf>,
    pub gateway_eui: Option<GatewayEui>,
    /// Why the concentrator EUI could not be read, when
    /// [`PLACEHOLDER_GATEWAY_ID`] was deployed instead.
    pub eui_error: Option<String>,
    /// Whether a merged forwarder configuration was deployed.
    pub merged: bool,
}

/// What `configure` puts where the forwarder runs.
enum GatewayDeployment {
    /// Nothing installed yet: `local_conf.json` is staged for later.
    Staged(ConfigArtifact),
    Installed {
        record: InstallationRecord,
        strategy: InstallStrategy,
        artifacts: Vec<ConfigArtifact>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub environment: Option<EnvironmentProfile>,
    pub device_path: Option<String>,
    pub installation: Option<InstallationRecord>,
    pub services: BTreeMap<String, ServiceState>,
    /// Set when the container runtime could not be queried.
    pub stack_error: Option<String>,
}

/// Wires configuration, logging and the adapters behind every CLI command.
pub struct AppController {
    config: RwLock<AppConfig>,
    config_store: Arc<dyn ConfigStore>,
    session: Arc<dyn SessionStore>,
    detector: Arc<dyn EnvironmentDetector>,
    locator: Arc<dyn DeviceLocator>,
    host: Arc<dyn CommandRunner>,
    quick: bool,
    _log_guard: Option<WorkerGuard>,
}

impl AppController {
    /// Initialize the application controller.
    /// This loads configuration, sets up logging and the session store.
    pub fn new(options: ControllerOptions) -> Result<Self, DomainError> {
        // Step 1: Initialize config store
        let config_store: Arc<dyn ConfigStore> = match &options.config_path {
            Some(path) => Arc::new(TomlConfigStore::with_config_path(path)?),
            None => Arc::new(TomlConfigStore::new()?),
        };

        // Step 2: Load configuration
        let config = config_store.load()?;

        // Step 3: Initialize logging
        let log_guard = init_logging(
            &config_store.logs_dir(),
            &config.logging.level,
            config.logging.file_logging,
        )?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            config = ?config_store.config_path(),
            quick = options.quick,
            "loractl starting up"
        );

        // Step 4: Session state and host probes
        let session = Arc::new(KeyValueSessionStore::new(config_store.session_path()));

        let mut controller = Self::with_parts(
            config_store,
            session,
            Arc::new(SystemEnvironmentDetector::new()),
            Arc::new(SystemDeviceLocator::new()),
            Arc::new(TokioCommandRunner::new()),
            options.quick,
        )?;
        controller._log_guard = log_guard;
        Ok(controller)
    }

    /// Assemble a controller from explicit parts, without touching logging.
    pub fn with_parts(
        config_store: Arc<dyn ConfigStore>,
        session: Arc<dyn SessionStore>,
        detector: Arc<dyn EnvironmentDetector>,
        locator: Arc<dyn DeviceLocator>,
        host: Arc<dyn CommandRunner>,
        quick: bool,
    ) -> Result<Self, DomainError> {
        let config = config_store.load()?;
        Ok(Self {
            config: RwLock::new(config),
            config_store,
            session,
            detector,
            locator,
            host,
            quick,
            _log_guard: None,
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Persist and adopt `config`.
    pub fn update_config(&self, config: AppConfig) -> Result<(), DomainError> {
        self.config_store.save(&config)?;
        *self.config.write() = config;
        debug!("Configuration updated");
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_store.config_path()
    }

    pub fn session_path(&self) -> PathBuf {
        self.session.path()
    }

    /// Probe the host and the gateway, or reuse the cached result in quick mode.
    pub fn detect(&self) -> Result<DetectionReport, DomainError> {
        let mut snapshot = self.session.load().unwrap_or_default();

        if self.quick {
            if let Some(environment) = snapshot.environment {
                debug!(%environment, "Using cached environment");
                return Ok(report(environment, cached_device(&snapshot), true));
            }
            debug!("Quick mode requested but nothing is cached, probing");
        }

        let environment = self.detector.detect();
        let device = self.locator.locate(&environment);
        info!(%environment, status = ?device.status, path = ?device.path, "Detection finished");

        snapshot.environment = Some(environment);
        snapshot.remember_device(&device);
        self.session.save(&snapshot)?;

        Ok(report(environment, device, false))
    }

    /// Build and stage the gateway software for this host.
    pub async fn install(
        &self,
        request: InstallRequest,
    ) -> Result<(InstallStrategy, InstallationRecord), DomainError> {
        let detection = self.detect()?;
        let strategy = select_strategy(detection.environment, request.prefer_vm)?;

        let mut device = detection.device;
        if device.status == DeviceStatus::FoundBus {
            info!(bus_id = ?device.bus_id, "Gateway is on the bus only, attaching");
            device = self.locator.attach(&detection.environment, &device).await?;
        }

        let mut config = self.config();
        if let Some(model) = request.model {
            config.gateway.model = model;
        }
        if let Some(region) = &request.region {
            config.gateway.region = RegionProfile::lookup(region)?.region.name().to_string();
        }
        let region = config.gateway.region_profile()?;

        let plan = InstallPlan::new(
            &config.install,
            self.install_dir_for(strategy, &config),
            config.gateway.model,
            region,
        );
        let installer = Installer::new(self.runner_for(strategy)?, self.session.clone());
        let record = installer.install(strategy, &device, &plan).await?;

        self.update_config(config)?;
        Ok((strategy, record))
    }

    /// Render and write the forwarder and backend configuration.
    ///
    /// Nothing is written unless every template rendered.
    pub async fn configure(
        &self,
        request: ConfigureRequest,
    ) -> Result<ConfigureReport, DomainError> {
        let profile = RegionProfile::lookup(&request.region)?;
        let mut config = self.config();
        config.gateway.region = profile.region.name().to_string();
        if let Some(server) = request.server_address {
            config.gateway.server_address = server;
        }
        if let Some(up) = request.port_up {
            config.gateway.port_up = up;
        }
        if let Some(down) = request.port_down {
            config.gateway.port_down = down;
        }
        let ports = config.gateway.ports();

        let (gateway_eui, eui_error) = match self.read_eui().await {
            Ok(eui) => (Some(eui), None),
            Err(e) => {
                warn!(error = %e, placeholder = PLACEHOLDER_GATEWAY_ID, "Concentrator EUI unavailable, deploying placeholder gateway ID");
                (None, Some(e.to_string()))
            }
        };

        let gateway = render_gateway(
            &profile,
            &config.gateway.server_address,
            ports,
            gateway_eui.as_ref(),
        )?;
        let backend = render_backend(&profile, &config.stack.endpoints(), ports)?;
        let compose = render_compose(
            &ServiceTopology::chirpstack_default(),
            ports,
            &config.stack.compose_file,
        )?;

        // The frequency plan is resolved before anything is written
        let deployment = self.prepare_gateway_conf(gateway, &profile, &config).await?;

        let compose_dir = self.compose_dir(&config);
        let mut written = write_artifacts(&compose_dir.join("configuration"), &backend)?;
        written.extend(write_artifacts(&compose_dir, &compose)?);
        let merged = matches!(deployment, GatewayDeployment::Installed { .. });
        written.extend(self.deploy_gateway_conf(deployment).await?);
        if merged {
            self.record_region(profile.region)?;
        }

        self.update_config(config)?;
        info!(region = %profile.region, files = written.len(), "Configuration written");

        Ok(ConfigureReport {
            written,
            gateway_eui,
            eui_error,
            merged,
        })
    }

    /// Bring the stack up and, unless told otherwise, run the forwarder attached.
    pub async fn start<W: Write>(
        &self,
        with_forwarder: bool,
        out: &mut W,
        cancel: CancellationToken,
    ) -> Result<RunningSet, DomainError> {
        let config = self.config();
        let compose_dir = self.compose_dir(&config);
        if !compose_dir.join(&config.stack.compose_file).is_file() {
            return Err(DomainError::ConfigurationInvalid(format!(
                "no compose project in {}; run `loractl configure <region>` first",
                compose_dir.display()
            )));
        }

        let topology = ServiceTopology::chirpstack_default();
        let running = match self.orchestrator(&config).up(&topology, cancel.clone()).await {
            Ok(running) => running,
            Err(failure) => {
                if failure.interrupted {
                    self.touch_session();
                }
                return Err(failure.into());
            }
        };

        if with_forwarder {
            self.run_forwarder(out, cancel).await?;
        }
        Ok(running)
    }

    /// Stop the stack in reverse dependency order.
    pub async fn stop(&self) -> Result<Vec<String>, DomainError> {
        let config = self.config();
        self.orchestrator(&config)
            .down(&ServiceTopology::chirpstack_default())
            .await
    }

    pub async fn status(&self) -> StatusReport {
        let config = self.config();
        let snapshot = self.session.load().unwrap_or_default();
        let mut report = StatusReport {
            environment: snapshot.environment,
            device_path: snapshot.device_path.clone(),
            installation: snapshot.installation.clone(),
            ..StatusReport::default()
        };

        match self
            .orchestrator(&config)
            .status(&ServiceTopology::chirpstack_default())
            .await
        {
            Ok(services) => report.services = services,
            Err(e) => {
                warn!(error = %e, "Stack status unavailable");
                report.stack_error = Some(e.to_string());
            }
        }
        report
    }

    /// Recent log lines of one service, or of all of them in startup order.
    pub async fn logs(
        &self,
        service: Option<&str>,
        lines: usize,
    ) -> Result<Vec<(String, Vec<String>)>, DomainError> {
        let config = self.config();
        let orchestrator = self.orchestrator(&config);
        let topology = ServiceTopology::chirpstack_default();

        let names: Vec<String> = match service {
            Some(name) => vec![name.to_string()],
            None => topology.names().into_iter().map(String::from).collect(),
        };
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let tail = orchestrator.logs(&topology, &name, lines).await?;
            out.push((name, tail));
        }
        Ok(out)
    }

    /// Read the concentrator EUI with the installed `chip_id` tool.
    pub async fn read_eui(&self) -> Result<GatewayEui, DomainError> {
        let snapshot = self.session.load().unwrap_or_default();
        let record = installed_record(&snapshot)?;
        let environment = self.environment(&snapshot);

        let device = if self.quick && snapshot.device_path.is_some() {
            cached_device(&snapshot)
        } else {
            self.locator.locate(&environment)
        };
        let path = device.path.ok_or(DomainError::DeviceNotFound)?;

        let strategy = active_strategy(environment, Some(&record))?;
        let config = self.config();
        let command = match strategy {
            InstallStrategy::ContainerizedBuild => CommandSpec::new(
                "docker",
                &[
                    "run",
                    "--rm",
                    "--device",
                    &path,
                    "--entrypoint",
                    "./chip_id",
                    &config.install.forwarder_image,
                    "-u",
                    "-d",
                    &path,
                ],
            ),
            _ => CommandSpec::new("./chip_id", &["-u", "-d", &path])
                .in_dir(remote_bin_dir(&record)),
        };

        let output = self.runner_for(strategy)?.run(&command, TOOL_TIMEOUT).await?;
        if !output.success() {
            return Err(DomainError::command(command.to_string(), output.summary()));
        }
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        let eui = GatewayEui::from_chip_id_output(&combined).ok_or_else(|| {
            DomainError::command(command.to_string(), "no concentrator EUI in output")
        })?;
        info!(%eui, device = %path, "Concentrator EUI read");
        Ok(eui)
    }

    /// Register the gateway with the local ChirpStack.
    pub async fn register(&self, name: Option<String>) -> Result<GatewayRegistration, DomainError> {
        let config = self.config();
        if config.stack.tenant_id.trim().is_empty() {
            return Err(DomainError::ConfigurationInvalid(format!(
                "stack.tenant_id is not set in {}",
                self.config_store.config_path().display()
            )));
        }
        let registry = ChirpstackRegistry::new(&config.stack.api_url, config.stack.api_token.clone())?;

        let eui = self.read_eui().await?;
        let name = name.unwrap_or_else(|| config.gateway.name.clone());
        let registration = GatewayRegistration::new(&eui, &name, &config.stack.tenant_id);
        registry.register(&registration).await?;
        info!(gateway_id = %registration.gateway_id, name = %registration.name, "Gateway registered");
        Ok(registration)
    }

    /// Decode forwarder output from `reader` until EOF or cancellation.
    pub async fn monitor<R, W>(
        &self,
        reader: R,
        out: &mut W,
        filter: MonitorFilter,
        cancel: CancellationToken,
    ) -> Result<MonitorStats, DomainError>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut monitor = PacketMonitor::new(filter);
        run_monitor(reader, out, &mut monitor, false, cancel).await?;
        writeln!(out, "{}", monitor.summary())?;
        Ok(monitor.stats().clone())
    }

    /// Stop the stack and remove the installed gateway software.
    ///
    /// Returns false when nothing was installed.
    pub async fn uninstall(&self) -> Result<bool, DomainError> {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "Could not stop the stack, continuing with removal");
        }

        let snapshot = self.session.load().unwrap_or_default();
        let Some(record) = snapshot.installation.clone() else {
            info!("Nothing installed");
            return Ok(false);
        };

        let strategy = active_strategy(self.environment(&snapshot), Some(&record))?;
        let config = self.config();
        Installer::new(self.runner_for(strategy)?, self.session.clone())
            .uninstall(&record, &config.install.forwarder_image)
            .await?;
        Ok(true)
    }

    fn orchestrator(&self, config: &AppConfig) -> Orchestrator {
        let compose_dir = self.compose_dir(config);
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(ComposeRuntime::new(
            self.host.clone(),
            compose_dir.clone(),
            config.stack.compose_file.clone(),
        ));
        let probe = NetworkHealthProbe::new(self.host.clone(), runtime.clone(), compose_dir);
        Orchestrator::new(runtime, Arc::new(probe), config.stack.diagnostic_log_lines)
    }

    fn compose_dir(&self, config: &AppConfig) -> PathBuf {
        config
            .stack
            .compose_dir
            .clone()
            .unwrap_or_else(|| self.config_store.default_compose_dir())
    }

    fn install_dir_for(&self, strategy: InstallStrategy, config: &AppConfig) -> String {
        match (&config.install.install_dir, strategy) {
            (Some(dir), _) => dir.to_string_lossy().into_owned(),
            (None, InstallStrategy::WslRelayedBuild | InstallStrategy::VmPassthrough) => {
                RELAYED_INSTALL_DIR.to_string()
            }
            (None, _) => self
                .config_store
                .default_install_dir()
                .to_string_lossy()
                .into_owned(),
        }
    }

    fn relay_for(&self, strategy: InstallStrategy) -> Result<Option<RelayedCommandRunner>, DomainError> {
        match strategy {
            InstallStrategy::WslRelayedBuild => Ok(Some(RelayedCommandRunner::wsl(self.host.clone()))),
            InstallStrategy::VmPassthrough => Ok(Some(RelayedCommandRunner::new(
                self.config.read().install.vm_relay.clone(),
                self.host.clone(),
            )?)),
            InstallStrategy::NativeBuild | InstallStrategy::ContainerizedBuild => Ok(None),
        }
    }

    fn runner_for(&self, strategy: InstallStrategy) -> Result<Arc<dyn CommandRunner>, DomainError> {
        Ok(match self.relay_for(strategy)? {
            Some(relay) => Arc::new(relay),
            None => self.host.clone(),
        })
    }

    fn environment(&self, snapshot: &SessionSnapshot) -> EnvironmentProfile {
        snapshot
            .environment
            .unwrap_or_else(|| self.detector.detect())
    }

    /// Read the region's frequency plan from the installation and merge it.
    ///
    /// A plan missing from the installation is an error. Any merged file
    /// left from an earlier region is removed so the forwarder cannot
    /// start on the wrong channels.
    async fn prepare_gateway_conf(
        &self,
        local: ConfigArtifact,
        profile: &RegionProfile,
        config: &AppConfig,
    ) -> Result<GatewayDeployment, DomainError> {
        let snapshot = self.session.load().unwrap_or_default();
        let Ok(record) = installed_record(&snapshot) else {
            return Ok(GatewayDeployment::Staged(local));
        };

        let strategy = active_strategy(self.environment(&snapshot), Some(&record))?;
        let runner = self.runner_for(strategy)?;

        let read_plan = match strategy {
            InstallStrategy::ContainerizedBuild => CommandSpec::new(
                "docker",
                &[
                    "run",
                    "--rm",
                    "--entrypoint",
                    "cat",
                    &config.install.forwarder_image,
                    profile.frequency_plan,
                ],
            ),
            _ => CommandSpec::new("cat", &[profile.frequency_plan]).in_dir(remote_bin_dir(&record)),
        };
        let reason = match runner.run(&read_plan, TOOL_TIMEOUT).await {
            Ok(output) if output.success() => {
                let merged = merge_frequency_plan(&output.stdout, &local)?;
                return Ok(GatewayDeployment::Installed {
                    record,
                    strategy,
                    artifacts: vec![local, merged],
                });
            }
            Ok(output) => output.summary(),
            Err(e) => e.to_string(),
        };

        warn!(plan = profile.frequency_plan, error = %reason, "Frequency plan missing from installation");
        self.remove_merged_conf(strategy, &record, runner.as_ref()).await;
        Err(DomainError::ConfigurationInvalid(format!(
            "frequency plan {} is not in the {} installation ({}); run `loractl install --region {}`",
            profile.frequency_plan, record.region, reason, profile.region
        )))
    }

    /// Write the prepared forwarder configuration where it is used.
    async fn deploy_gateway_conf(
        &self,
        deployment: GatewayDeployment,
    ) -> Result<Vec<PathBuf>, DomainError> {
        let (record, strategy, artifacts) = match deployment {
            GatewayDeployment::Staged(local) => {
                let staging = self.config_store.data_dir().join("gateway-config");
                info!(dir = ?staging, "Gateway software not installed, staging forwarder configuration");
                return write_artifacts(&staging, [&local]);
            }
            GatewayDeployment::Installed {
                record,
                strategy,
                artifacts,
            } => (record, strategy, artifacts),
        };

        if strategy == InstallStrategy::ContainerizedBuild {
            let dir = record.install_path.clone().unwrap_or_default();
            return write_artifacts(&dir, &artifacts);
        }

        let runner = self.runner_for(strategy)?;
        let bin = remote_bin_dir(&record);
        let mut written = Vec::new();
        for artifact in &artifacts {
            let target = format!("{}/{}", bin, artifact.path.to_string_lossy());
            let script = format!(
                "printf '%s' {} > {}",
                shell_quote(&artifact.contents),
                shell_quote(&target)
            );
            let output = runner.run(&CommandSpec::shell(&script), TOOL_TIMEOUT).await?;
            if !output.success() {
                return Err(DomainError::command(
                    format!("write {}", target),
                    output.summary(),
                ));
            }
            written.push(PathBuf::from(target));
        }
        Ok(written)
    }

    /// Best effort: a failure leaves the error from the caller as the one reported.
    async fn remove_merged_conf(
        &self,
        strategy: InstallStrategy,
        record: &InstallationRecord,
        runner: &dyn CommandRunner,
    ) {
        if strategy == InstallStrategy::ContainerizedBuild {
            let stale = record
                .install_path
                .clone()
                .unwrap_or_default()
                .join(MERGED_GATEWAY_CONF);
            if stale.is_file() {
                if let Err(e) = std::fs::remove_file(&stale) {
                    warn!(path = ?stale, error = %e, "Could not remove stale forwarder configuration");
                }
            }
            return;
        }

        let stale = format!("{}/{}", remote_bin_dir(record), MERGED_GATEWAY_CONF);
        let remove = CommandSpec::new("rm", &["-f", &stale]);
        match runner.run(&remove, TOOL_TIMEOUT).await {
            Ok(output) if output.success() => debug!(path = %stale, "Stale forwarder configuration removed"),
            Ok(output) => warn!(path = %stale, error = %output.summary(), "Could not remove stale forwarder configuration"),
            Err(e) => warn!(path = %stale, error = %e, "Could not remove stale forwarder configuration"),
        }
    }

    /// Keep the installation record's region in step with the deployed plan.
    fn record_region(&self, region: Region) -> Result<(), DomainError> {
        let mut snapshot = self.session.load().unwrap_or_default();
        if let Some(record) = snapshot.installation.as_mut() {
            if record.region != region {
                info!(from = %record.region, to = %region, "Installation reconfigured");
                record.region = region;
                self.session.save(&snapshot)?;
            }
        }
        Ok(())
    }

    async fn run_forwarder<W: Write>(
        &self,
        out: &mut W,
        cancel: CancellationToken,
    ) -> Result<(), DomainError> {
        let snapshot = self.session.load().unwrap_or_default();
        let record = installed_record(&snapshot)?;
        let strategy = active_strategy(self.environment(&snapshot), Some(&record))?;
        let config = self.config();
        let plan = record.region.profile().frequency_plan;

        let command = match strategy {
            InstallStrategy::ContainerizedBuild => {
                let merged = record
                    .install_path
                    .clone()
                    .unwrap_or_default()
                    .join(MERGED_GATEWAY_CONF);
                let mut args: Vec<String> = ["run", "--rm", "-i", "--privileged"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                let conf = if merged.is_file() {
                    args.push("-v".to_string());
                    args.push(format!("{}:/opt/gateway/{}", merged.display(), MERGED_GATEWAY_CONF));
                    MERGED_GATEWAY_CONF
                } else {
                    plan
                };
                args.extend([
                    "--entrypoint".to_string(),
                    "./lora_pkt_fwd".to_string(),
                    config.install.forwarder_image.clone(),
                    "-c".to_string(),
                    conf.to_string(),
                ]);
                CommandSpec {
                    program: "docker".to_string(),
                    args,
                    cwd: None,
                }
            }
            _ => {
                let bin = remote_bin_dir(&record);
                let runner = self.runner_for(strategy)?;
                let probe = CommandSpec::shell(&format!("test -f {}", MERGED_GATEWAY_CONF))
                    .in_dir(bin.clone());
                let conf = match runner.run(&probe, TOOL_TIMEOUT).await {
                    Ok(o) if o.success() => MERGED_GATEWAY_CONF,
                    _ => plan,
                };
                CommandSpec::new("./lora_pkt_fwd", &["-c", conf]).in_dir(bin)
            }
        };
        let command = match self.relay_for(strategy)? {
            Some(relay) => relay.relay(&command),
            None => command,
        };

        info!(command = %command, "Starting packet forwarder");
        let mut process = tokio::process::Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            process.current_dir(cwd);
        }
        let mut child = process
            .spawn()
            .map_err(|e| DomainError::command(command.to_string(), e.to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            DomainError::command(command.to_string(), "forwarder output not captured")
        })?;

        let mut monitor = PacketMonitor::new(MonitorFilter::default());
        run_monitor(BufReader::new(stdout), out, &mut monitor, true, cancel.clone()).await?;

        if cancel.is_cancelled() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Forwarder already gone");
            }
            self.touch_session();
            writeln!(out, "{}", monitor.summary())?;
            return Err(DomainError::Interrupted);
        }

        let status = child.wait().await?;
        writeln!(out, "{}", monitor.summary())?;
        if !status.success() {
            return Err(DomainError::command(
                command.to_string(),
                format!("forwarder exited with {}", status),
            ));
        }
        Ok(())
    }

    /// Re-save the session so the last-run stamp survives an interrupt.
    fn touch_session(&self) {
        let snapshot = self.session.load().unwrap_or_default();
        if let Err(e) = self.session.save(&snapshot) {
            warn!(error = %e, "Could not save session state");
        }
    }
}

fn report(environment: EnvironmentProfile, device: DeviceHandle, cached: bool) -> DetectionReport {
    DetectionReport {
        environment,
        device,
        strategy: select_strategy(environment, false).map_err(|e| e.to_string()),
        cached,
    }
}

fn cached_device(snapshot: &SessionSnapshot) -> DeviceHandle {
    match (&snapshot.device_path, &snapshot.bus_id) {
        (Some(path), bus) => DeviceHandle::serial(path.clone(), bus.clone()),
        (None, Some(bus)) => DeviceHandle::on_bus(bus.clone()),
        (None, None) => DeviceHandle::not_found(),
    }
}

fn installed_record(snapshot: &SessionSnapshot) -> Result<InstallationRecord, DomainError> {
    snapshot
        .installation
        .clone()
        .filter(|r| r.status.is_installed())
        .ok_or_else(|| {
            DomainError::Config(
                "gateway software is not installed; run `loractl install` first".to_string(),
            )
        })
}

/// Strategy that produced `record`, so later commands use the same shell.
fn active_strategy(
    environment: EnvironmentProfile,
    record: Option<&InstallationRecord>,
) -> Result<InstallStrategy, DomainError> {
    match record.map(|r| r.status) {
        Some(InstallStatus::InstalledContainerized) => Ok(InstallStrategy::ContainerizedBuild),
        Some(InstallStatus::Installed) if environment.os == OsType::MacOS => {
            Ok(InstallStrategy::VmPassthrough)
        }
        _ => select_strategy(environment, false),
    }
}

/// POSIX bin directory as seen by the build shell.
fn remote_bin_dir(record: &InstallationRecord) -> String {
    let root = record
        .install_path
        .as_ref()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    format!("{}/bin", root.trim_end_matches('/'))
}
