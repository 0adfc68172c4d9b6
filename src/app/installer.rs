//! Gateway software installation.
//!
//! Every strategy runs the same ordered steps through a [`CommandRunner`];
//! relayed strategies just hand in a runner that forwards into WSL or a VM.
//! Paths inside commands are POSIX paths because they are interpreted by
//! the Linux shell doing the build, whatever the host OS is.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::domain::config::InstallConfig;
use crate::domain::{
    DeviceHandle, DeviceModel, DomainError, InstallStatus, InstallStrategy, InstallationRecord,
    RegionProfile,
};
use crate::ports::command::shell_quote;
use crate::ports::{CommandOutput, CommandRunner, CommandSpec, SessionStore};

/// Build dependencies of the concentrator HAL.
const NATIVE_PACKAGES: &[&str] = &["git", "make", "gcc", "libusb-1.0-0-dev"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Files staged into `<install dir>/bin`, relative to the HAL checkout.
const STAGED_FILES: &[&str] = &[
    "packet_forwarder/lora_pkt_fwd",
    "util_chip_id/chip_id",
    "tools/reset_lgw.sh",
];

/// Every USB frequency plan shipped with the HAL, so `configure` can
/// switch regions without a rebuild.
const FREQUENCY_PLANS: &str = "packet_forwarder/global_conf.json.sx1250.*.USB";

/// Everything the installer needs to know about one install.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub model: DeviceModel,
    pub region: RegionProfile,
    /// POSIX path as seen by the build shell.
    pub install_dir: String,
    pub hal_repository: String,
    pub hal_branch: String,
    pub forwarder_image: String,
    pub step_timeout: Duration,
}

impl InstallPlan {
    pub fn new(
        config: &InstallConfig,
        install_dir: impl Into<String>,
        model: DeviceModel,
        region: RegionProfile,
    ) -> Self {
        Self {
            model,
            region,
            install_dir: install_dir.into(),
            hal_repository: config.hal_repository.clone(),
            hal_branch: config.hal_branch.clone(),
            forwarder_image: config.forwarder_image.clone(),
            step_timeout: Duration::from_secs(config.step_timeout_secs),
        }
    }

    fn hal_dir(&self) -> String {
        format!("{}/sx1302_hal", self.install_dir.trim_end_matches('/'))
    }

    fn bin_dir(&self) -> String {
        format!("{}/bin", self.install_dir.trim_end_matches('/'))
    }

    fn matches(&self, record: &InstallationRecord) -> bool {
        record.status.is_installed()
            && record.device_model == self.model
            && record.region == self.region.region
            && record.install_path.as_deref() == Some(PathBuf::from(&self.install_dir).as_path())
    }
}

/// Runs installation strategies and records their outcome.
pub struct Installer {
    runner: Arc<dyn CommandRunner>,
    session: Arc<dyn SessionStore>,
}

impl Installer {
    pub fn new(runner: Arc<dyn CommandRunner>, session: Arc<dyn SessionStore>) -> Self {
        Self { runner, session }
    }

    /// Install the gateway software with `strategy`.
    ///
    /// Re-running with the same plan after a successful install is a no-op.
    /// The installation record is only written once every step succeeded.
    pub async fn install(
        &self,
        strategy: InstallStrategy,
        device: &DeviceHandle,
        plan: &InstallPlan,
    ) -> Result<InstallationRecord, DomainError> {
        if strategy.requires_device() && !device.is_found() {
            return Err(DomainError::DeviceNotFound);
        }

        let mut snapshot = self.session.load().unwrap_or_default();
        if let Some(record) = snapshot.installation.as_ref().filter(|r| plan.matches(r)) {
            if self.artifact_present(strategy, plan).await {
                info!(path = %plan.install_dir, "Already installed, skipping");
                return Ok(record.clone());
            }
            warn!(path = %plan.install_dir, "Installation record found but artifacts are missing, reinstalling");
            snapshot.installation = None;
            self.session.save(&snapshot)?;
        }

        info!(%strategy, model = %plan.model, region = %plan.region.region, path = %plan.install_dir, "Installing gateway software");

        let status = match strategy {
            InstallStrategy::ContainerizedBuild => {
                self.ensure_docker().await?;
                self.build_image(plan).await?;
                InstallStatus::InstalledContainerized
            }
            InstallStrategy::NativeBuild
            | InstallStrategy::WslRelayedBuild
            | InstallStrategy::VmPassthrough => {
                self.ensure_packages(NATIVE_PACKAGES).await?;
                self.build_native(plan).await?;
                InstallStatus::Installed
            }
        };

        let record = InstallationRecord {
            status,
            install_path: Some(PathBuf::from(&plan.install_dir)),
            device_model: plan.model,
            region: plan.region.region,
        };
        snapshot.installation = Some(record.clone());
        if device.is_found() {
            snapshot.remember_device(device);
        }
        self.session.save(&snapshot)?;

        info!(%strategy, status = %record.status, "Installation complete");
        Ok(record)
    }

    /// Remove the installed files and forget the installation.
    pub async fn uninstall(
        &self,
        record: &InstallationRecord,
        forwarder_image: &str,
    ) -> Result<(), DomainError> {
        if let Some(path) = &record.install_path {
            let dir = path.to_string_lossy().into_owned();
            let exists = self
                .probe(&CommandSpec::shell(&format!("test -d {}", shell_quote(&dir))))
                .await;
            if exists {
                self.run_step("uninstall", CommandSpec::new("rm", &["-rf", &dir]), PROBE_TIMEOUT)
                    .await?;
                info!(path = %dir, "Installation directory removed");
            }
        }

        if record.status == InstallStatus::InstalledContainerized {
            // the image may already be gone
            let _ = self
                .runner
                .run(
                    &CommandSpec::new("docker", &["image", "rm", "-f", forwarder_image]),
                    PROBE_TIMEOUT,
                )
                .await;
        }

        if let Some(mut snapshot) = self.session.load() {
            snapshot.installation = None;
            self.session.save(&snapshot)?;
        }
        info!("Installation record cleared");
        Ok(())
    }

    async fn artifact_present(&self, strategy: InstallStrategy, plan: &InstallPlan) -> bool {
        let check = match strategy {
            InstallStrategy::ContainerizedBuild => {
                CommandSpec::new("docker", &["image", "inspect", &plan.forwarder_image])
            }
            _ => CommandSpec::shell(&format!(
                "test -x {}/lora_pkt_fwd",
                shell_quote(&plan.bin_dir())
            )),
        };
        self.probe(&check).await
    }

    async fn probe(&self, command: &CommandSpec) -> bool {
        matches!(self.runner.run(command, PROBE_TIMEOUT).await, Ok(o) if o.success())
    }

    async fn ensure_packages(&self, packages: &[&str]) -> Result<(), DomainError> {
        let mut missing = Vec::new();
        for package in packages {
            let quoted = shell_quote(package);
            let check = CommandSpec::shell(&format!(
                "command -v {0} >/dev/null 2>&1 || dpkg -s {0} >/dev/null 2>&1",
                quoted
            ));
            if !self.probe(&check).await {
                missing.push(*package);
            }
        }
        if missing.is_empty() {
            info!("All prerequisites present");
            return Ok(());
        }

        info!(packages = ?missing, "Installing missing prerequisites");
        let script = format!(
            "sudo apt-get update -qq && sudo DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
            missing.join(" ")
        );
        let output = self
            .runner
            .run(&CommandSpec::shell(&script), Duration::from_secs(900))
            .await
            .map_err(|e| DomainError::PrerequisiteInstall(e.to_string()))?;
        if !output.success() {
            return Err(DomainError::PrerequisiteInstall(format!(
                "apt-get install {} failed: {}",
                missing.join(" "),
                output.summary()
            )));
        }
        Ok(())
    }

    async fn ensure_docker(&self) -> Result<(), DomainError> {
        if self.probe(&CommandSpec::new("docker", &["version"])).await {
            return Ok(());
        }
        Err(DomainError::PrerequisiteInstall(
            "docker is not available; install Docker Desktop and start it".to_string(),
        ))
    }

    async fn build_native(&self, plan: &InstallPlan) -> Result<(), DomainError> {
        let hal = plan.hal_dir();
        let bin = plan.bin_dir();

        self.run_step(
            "prepare",
            CommandSpec::new("mkdir", &["-p", &bin]),
            PROBE_TIMEOUT,
        )
        .await?;

        let checkout_exists = self
            .probe(&CommandSpec::shell(&format!("test -d {}/.git", shell_quote(&hal))))
            .await;
        let fetch = if checkout_exists {
            CommandSpec::new("git", &["-C", &hal, "pull", "--ff-only"])
        } else {
            CommandSpec::new(
                "git",
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--branch",
                    &plan.hal_branch,
                    &plan.hal_repository,
                    &hal,
                ],
            )
        };
        self.run_step("fetch", fetch, plan.step_timeout).await?;

        self.run_step(
            "compile",
            CommandSpec::new("make", &["-C", &hal, "all"]),
            plan.step_timeout,
        )
        .await?;

        let mut sources: Vec<String> = STAGED_FILES
            .iter()
            .map(|f| format!("{}/{}", hal, f))
            .collect();
        sources.push(format!("{}/packet_forwarder/{}", hal, plan.region.frequency_plan));
        let mut args: Vec<&str> = vec!["-f"];
        args.extend(sources.iter().map(String::as_str));
        args.push(&bin);
        self.run_step("stage", CommandSpec::new("cp", &args), PROBE_TIMEOUT)
            .await?;
        let plans = format!(
            "cp -f {}/{} {}/",
            shell_quote(&hal),
            FREQUENCY_PLANS,
            shell_quote(&bin)
        );
        self.run_step("stage", CommandSpec::shell(&plans), PROBE_TIMEOUT)
            .await?;

        Ok(())
    }

    async fn build_image(&self, plan: &InstallPlan) -> Result<(), DomainError> {
        let dir = PathBuf::from(&plan.install_dir);
        fs::create_dir_all(&dir).map_err(|e| DomainError::build("prepare", e.to_string()))?;
        fs::write(dir.join("Dockerfile"), forwarder_dockerfile(plan))
            .map_err(|e| DomainError::build("prepare", e.to_string()))?;

        self.run_step(
            "image",
            CommandSpec::new(
                "docker",
                &["build", "-t", &plan.forwarder_image, &plan.install_dir],
            ),
            plan.step_timeout,
        )
        .await?;
        Ok(())
    }

    /// Run one build step; any failure is reported as a build error for `step`.
    async fn run_step(
        &self,
        step: &str,
        command: CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, DomainError> {
        info!(step, command = %command, "Build step");
        let output = self
            .runner
            .run(&command, timeout)
            .await
            .map_err(|e| DomainError::build(step, e.to_string()))?;
        if !output.success() {
            return Err(DomainError::build(step, output.summary()));
        }
        Ok(output)
    }
}

fn forwarder_dockerfile(plan: &InstallPlan) -> String {
    format!(
        "FROM debian:bookworm-slim AS build\n\
         RUN apt-get update && apt-get install -y --no-install-recommends \\\n    \
         ca-certificates git make gcc libc6-dev libusb-1.0-0-dev && rm -rf /var/lib/apt/lists/*\n\
         RUN git clone --depth 1 --branch {branch} {repo} /src/sx1302_hal && make -C /src/sx1302_hal all\n\
         \n\
         FROM debian:bookworm-slim\n\
         RUN apt-get update && apt-get install -y --no-install-recommends libusb-1.0-0 && rm -rf /var/lib/apt/lists/*\n\
         WORKDIR /opt/gateway\n\
         COPY --from=build /src/sx1302_hal/packet_forwarder/lora_pkt_fwd /src/sx1302_hal/util_chip_id/chip_id /src/sx1302_hal/tools/reset_lgw.sh /src/sx1302_hal/{plans} ./\n\
         ENTRYPOINT [\"./lora_pkt_fwd\", \"-c\", \"{plan_file}\"]\n",
        branch = plan.hal_branch,
        repo = plan.hal_repository,
        plan_file = plan.region.frequency_plan,
        plans = FREQUENCY_PLANS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::KeyValueSessionStore;
    use crate::domain::{DeviceStatus, Region, SessionSnapshot};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Succeeds unless the command line contains one of `fail_on`.
    #[derive(Default)]
    struct FakeRunner {
        calls: Mutex<Vec<String>>,
        fail_on: Vec<&'static str>,
    }

    impl FakeRunner {
        fn failing(patterns: &[&'static str]) -> Self {
            Self {
                fail_on: patterns.to_vec(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            command: &CommandSpec,
            _timeout: Duration,
        ) -> Result<CommandOutput, DomainError> {
            let line = command.to_shell_line();
            self.calls.lock().push(line.clone());
            let failed = self.fail_on.iter().any(|p| line.contains(p));
            Ok(CommandOutput {
                code: Some(if failed { 2 } else { 0 }),
                stdout: String::new(),
                stderr: if failed { "boom\n".into() } else { String::new() },
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        runner: Arc<FakeRunner>,
        session: Arc<KeyValueSessionStore>,
        installer: Installer,
        plan: InstallPlan,
    }

    fn fixture(runner: FakeRunner) -> Fixture {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(runner);
        let session = Arc::new(KeyValueSessionStore::new(dir.path().join("session.env")));
        let installer = Installer::new(runner.clone(), session.clone());
        let plan = InstallPlan::new(
            &InstallConfig::default(),
            dir.path().join("gw").to_string_lossy(),
            DeviceModel::Rak7271,
            Region::EU868.profile(),
        );
        Fixture {
            _dir: dir,
            runner,
            session,
            installer,
            plan,
        }
    }

    fn device() -> DeviceHandle {
        DeviceHandle::serial("/dev/ttyACM0", Some("1-1".into()))
    }

    #[tokio::test]
    async fn test_missing_device_fails_before_any_side_effect() {
        let f = fixture(FakeRunner::default());
        let result = f
            .installer
            .install(InstallStrategy::NativeBuild, &DeviceHandle::not_found(), &f.plan)
            .await;
        assert!(matches!(result, Err(DomainError::DeviceNotFound)));
        assert!(f.runner.calls().is_empty());
        assert!(!f.session.path().exists());
    }

    #[tokio::test]
    async fn test_native_install_runs_steps_and_records() {
        let f = fixture(FakeRunner::failing(&["test -d"]));
        let record = f
            .installer
            .install(InstallStrategy::NativeBuild, &device(), &f.plan)
            .await
            .unwrap();
        assert_eq!(record.status, InstallStatus::Installed);

        let calls = f.runner.calls();
        let clone = calls.iter().position(|c| c.starts_with("git clone")).unwrap();
        let make = calls.iter().position(|c| c.starts_with("make -C")).unwrap();
        let stage = calls.iter().position(|c| c.starts_with("cp -f")).unwrap();
        assert!(clone < make && make < stage);
        assert!(calls[stage].contains("global_conf.json.sx1250.EU868.USB"));
        // every region's plan lands next to the forwarder
        assert!(calls[stage + 1..]
            .iter()
            .any(|c| c.starts_with("sh -c") && c.contains("global_conf.json.sx1250.*.USB")));
        assert!(!calls.iter().any(|c| c.contains("apt-get")));

        let saved = f.session.load().unwrap();
        assert_eq!(saved.installation, Some(record));
        assert_eq!(saved.device_path.as_deref(), Some("/dev/ttyACM0"));
    }

    #[tokio::test]
    async fn test_rerun_is_skipped() {
        let f = fixture(FakeRunner::default());
        f.installer
            .install(InstallStrategy::NativeBuild, &device(), &f.plan)
            .await
            .unwrap();
        f.runner.calls.lock().clear();

        f.installer
            .install(InstallStrategy::NativeBuild, &device(), &f.plan)
            .await
            .unwrap();
        let calls = f.runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("test -x"));
    }

    #[tokio::test]
    async fn test_failed_rebuild_does_not_keep_stale_record() {
        let f = fixture(FakeRunner::failing(&["test -x", "make -C"]));
        let snapshot = SessionSnapshot {
            installation: Some(InstallationRecord {
                status: InstallStatus::Installed,
                install_path: Some(PathBuf::from(&f.plan.install_dir)),
                device_model: f.plan.model,
                region: f.plan.region.region,
            }),
            ..SessionSnapshot::default()
        };
        f.session.save(&snapshot).unwrap();

        let result = f
            .installer
            .install(InstallStrategy::NativeBuild, &device(), &f.plan)
            .await;
        assert!(matches!(result, Err(DomainError::Build { .. })));
        assert!(f.session.load().unwrap().installation.is_none());
    }

    #[tokio::test]
    async fn test_existing_checkout_is_pulled() {
        let f = fixture(FakeRunner::default());
        f.installer
            .install(InstallStrategy::WslRelayedBuild, &device(), &f.plan)
            .await
            .unwrap();
        assert!(f
            .runner
            .calls()
            .iter()
            .any(|c| c.starts_with("git -C") && c.ends_with("pull --ff-only")));
    }

    #[tokio::test]
    async fn test_prerequisite_failure_is_distinct_and_not_recorded() {
        let f = fixture(FakeRunner::failing(&["libusb", "apt-get"]));
        let result = f
            .installer
            .install(InstallStrategy::NativeBuild, &device(), &f.plan)
            .await;
        match result {
            Err(DomainError::PrerequisiteInstall(message)) => {
                assert!(message.contains("libusb-1.0-0-dev"))
            }
            other => panic!("expected prerequisite failure, got {:?}", other),
        }
        assert!(f.session.load().is_none());
    }

    #[tokio::test]
    async fn test_build_failure_names_step() {
        let f = fixture(FakeRunner::failing(&["make -C"]));
        let result = f
            .installer
            .install(InstallStrategy::NativeBuild, &device(), &f.plan)
            .await;
        match result {
            Err(DomainError::Build { step, message }) => {
                assert_eq!(step, "compile");
                assert_eq!(message, "boom");
            }
            other => panic!("expected build failure, got {:?}", other),
        }
        assert!(f.session.load().is_none());
        assert!(!f.runner.calls().iter().any(|c| c.starts_with("cp")));
    }

    #[tokio::test]
    async fn test_containerized_needs_no_device() {
        let f = fixture(FakeRunner::failing(&["image inspect"]));
        let record = f
            .installer
            .install(
                InstallStrategy::ContainerizedBuild,
                &DeviceHandle::not_found(),
                &f.plan,
            )
            .await
            .unwrap();
        assert_eq!(record.status, InstallStatus::InstalledContainerized);

        let dockerfile =
            fs::read_to_string(PathBuf::from(&f.plan.install_dir).join("Dockerfile")).unwrap();
        assert!(dockerfile.contains("\"-c\", \"global_conf.json.sx1250.EU868.USB\""));
        assert!(dockerfile.contains("packet_forwarder/global_conf.json.sx1250.*.USB ./"));
        assert!(f
            .runner
            .calls()
            .iter()
            .any(|c| c.starts_with("docker build -t loractl/packet-forwarder:latest")));
        assert_eq!(f.session.load().unwrap().device_path, None);
    }

    #[tokio::test]
    async fn test_bus_only_device_is_enough_for_relay() {
        let f = fixture(FakeRunner::default());
        let handle = DeviceHandle::on_bus("2-1");
        assert_eq!(handle.status, DeviceStatus::FoundBus);
        assert!(f
            .installer
            .install(InstallStrategy::VmPassthrough, &handle, &f.plan)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_uninstall_clears_record() {
        let f = fixture(FakeRunner::default());
        let record = f
            .installer
            .install(InstallStrategy::NativeBuild, &device(), &f.plan)
            .await
            .unwrap();

        f.installer
            .uninstall(&record, &f.plan.forwarder_image)
            .await
            .unwrap();
        assert!(f.runner.calls().iter().any(|c| c.starts_with("rm -rf")));
        let snapshot = f.session.load().unwrap();
        assert!(snapshot.installation.is_none());
        assert_eq!(snapshot.device_path.as_deref(), Some("/dev/ttyACM0"));
    }
}
