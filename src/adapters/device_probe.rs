use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::adapters::TokioCommandRunner;
use crate::domain::device::{match_signature, SERIAL_NAME_PATTERNS};
use crate::domain::{DeviceHandle, DomainError, EnvironmentProfile, OsType, Virtualization};
use crate::ports::{CommandRunner, CommandSpec, DeviceLocator};

/// `usbipd attach` waits for WSL to accept the device.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs a host tool and returns stdout on success, a message otherwise.
pub type ToolRunner = Box<dyn Fn(&str, &[&str]) -> Result<String, String> + Send + Sync>;

/// A USB device as listed by a platform tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbEntry {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_id: Option<String>,
}

impl UsbEntry {
    fn is_gateway(&self) -> bool {
        match_signature(self.vendor_id, self.product_id).is_some()
    }
}

fn parse_hex_id(raw: &str) -> Option<u16> {
    let token = raw.split_whitespace().next()?;
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u16::from_str_radix(digits, 16).ok()
}

/// Parse the "Connected" table of `usbipd list`.
pub fn parse_usbipd_list(output: &str) -> Vec<UsbEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        if line.trim_start().starts_with("Persisted") {
            break;
        }
        let mut cols = line.split_whitespace();
        let (Some(bus), Some(vid_pid)) = (cols.next(), cols.next()) else {
            continue;
        };
        let Some((vid, pid)) = vid_pid.split_once(':') else {
            continue;
        };
        if let (Some(vendor_id), Some(product_id)) = (parse_hex_id(vid), parse_hex_id(pid)) {
            entries.push(UsbEntry {
                vendor_id,
                product_id,
                bus_id: Some(bus.to_string()),
            });
        }
    }
    entries
}

/// Parse `system_profiler SPUSBDataType`. Each device block starts at `Product ID:`.
pub fn parse_system_profiler(output: &str) -> Vec<UsbEntry> {
    let mut entries = Vec::new();
    let mut current: Option<(u16, Option<u16>, Option<String>)> = None;

    let mut flush = |entry: Option<(u16, Option<u16>, Option<String>)>| {
        if let Some((product_id, Some(vendor_id), bus_id)) = entry {
            entries.push(UsbEntry {
                vendor_id,
                product_id,
                bus_id,
            });
        }
    };

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        match key.trim() {
            "Product ID" => {
                flush(current.take());
                current = parse_hex_id(value).map(|pid| (pid, None, None));
            }
            "Vendor ID" => {
                if let Some(entry) = current.as_mut() {
                    entry.1 = parse_hex_id(value);
                }
            }
            "Location ID" => {
                if let Some(entry) = current.as_mut() {
                    entry.2 = value.split_whitespace().next().map(str::to_string);
                }
            }
            _ => {}
        }
    }
    flush(current);
    entries
}

/// Locates the concentrator through sysfs, `/dev`, and platform USB tools.
pub struct SystemDeviceLocator {
    os: OsType,
    sysfs_usb: PathBuf,
    dev_dir: PathBuf,
    tool: ToolRunner,
    runner: Arc<dyn CommandRunner>,
}

impl SystemDeviceLocator {
    pub fn new() -> Self {
        Self {
            os: OsType::current(),
            sysfs_usb: PathBuf::from("/sys/bus/usb/devices"),
            dev_dir: PathBuf::from("/dev"),
            tool: Box::new(run_tool),
            runner: Arc::new(TokioCommandRunner::new()),
        }
    }

    /// Run passthrough commands (`usbipd bind`/`attach`) through `runner`.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Probe alternate roots with a custom tool runner (used by tests).
    pub fn with_paths(
        os: OsType,
        sysfs_usb: impl Into<PathBuf>,
        dev_dir: impl Into<PathBuf>,
        tool: ToolRunner,
    ) -> Self {
        Self {
            os,
            sysfs_usb: sysfs_usb.into(),
            dev_dir: dev_dir.into(),
            tool,
            runner: Arc::new(TokioCommandRunner::new()),
        }
    }

    fn locate_linux(&self) -> DeviceHandle {
        let bus = self.scan_sysfs();
        if let Some((bus_id, Some(tty))) = &bus {
            let path = self.dev_dir.join(tty);
            return DeviceHandle::serial(path.to_string_lossy(), Some(bus_id.clone()));
        }

        let bus_id = bus.map(|(id, _)| id);
        if let Some(path) = self.scan_dev(&SERIAL_NAME_PATTERNS[..2]) {
            return DeviceHandle::serial(path.to_string_lossy(), bus_id);
        }

        match bus_id {
            Some(id) => DeviceHandle::on_bus(id),
            None => DeviceHandle::not_found(),
        }
    }

    /// First sysfs device with a known signature, plus its tty child if bound.
    fn scan_sysfs(&self) -> Option<(String, Option<String>)> {
        let mut devices: Vec<PathBuf> = fs::read_dir(&self.sysfs_usb)
            .ok()?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        devices.sort();

        for device in devices {
            let read_id = |file: &str| {
                fs::read_to_string(device.join(file))
                    .ok()
                    .and_then(|s| parse_hex_id(&s))
            };
            let (Some(vendor_id), Some(product_id)) = (read_id("idVendor"), read_id("idProduct"))
            else {
                continue;
            };
            if let Some(sig) = match_signature(vendor_id, product_id) {
                let bus_id = device
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                debug!(bus_id = %bus_id, device = sig.description, "Gateway found on USB bus");
                return Some((bus_id, find_tty_child(&device, 3)));
            }
        }
        None
    }

    /// First serial node matching `patterns`, in pattern then name order.
    fn scan_dev(&self, patterns: &[&str]) -> Option<PathBuf> {
        let mut names: Vec<String> = fs::read_dir(&self.dev_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        patterns.iter().find_map(|prefix| {
            names
                .iter()
                .find(|n| n.starts_with(prefix))
                .map(|n| self.dev_dir.join(n))
        })
    }

    fn locate_windows(&self, profile: &EnvironmentProfile) -> DeviceHandle {
        let listing = match (self.tool)("usbipd", &["list"]) {
            Ok(out) => out,
            Err(e) => {
                debug!(error = %e, "usbipd not available");
                return DeviceHandle::not_found();
            }
        };
        let Some(entry) = parse_usbipd_list(&listing).into_iter().find(UsbEntry::is_gateway)
        else {
            return DeviceHandle::not_found();
        };
        let bus_id = entry.bus_id.unwrap_or_default();

        if profile.virtualization == Virtualization::Wsl {
            if let Some(path) = self.wsl_serial_node() {
                return DeviceHandle::serial(path, Some(bus_id));
            }
        }
        DeviceHandle::on_bus(bus_id)
    }

    fn wsl_serial_node(&self) -> Option<String> {
        let out = (self.tool)(
            "wsl.exe",
            &["-e", "sh", "-c", "ls /dev/ttyACM* /dev/ttyUSB* 2>/dev/null"],
        )
        .ok()?;
        out.lines()
            .map(str::trim)
            .find(|l| l.starts_with("/dev/tty"))
            .map(str::to_string)
    }

    fn locate_macos(&self) -> DeviceHandle {
        let listing = match (self.tool)("system_profiler", &["SPUSBDataType"]) {
            Ok(out) => out,
            Err(e) => {
                debug!(error = %e, "system_profiler failed");
                return DeviceHandle::not_found();
            }
        };
        let Some(entry) = parse_system_profiler(&listing)
            .into_iter()
            .find(UsbEntry::is_gateway)
        else {
            return DeviceHandle::not_found();
        };

        match self.scan_dev(&SERIAL_NAME_PATTERNS[2..]) {
            Some(path) => DeviceHandle::serial(path.to_string_lossy(), entry.bus_id),
            None => DeviceHandle::on_bus(entry.bus_id.unwrap_or_default()),
        }
    }
}

impl Default for SystemDeviceLocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceLocator for SystemDeviceLocator {
    fn locate(&self, profile: &EnvironmentProfile) -> DeviceHandle {
        let handle = match self.os {
            OsType::Linux => self.locate_linux(),
            OsType::Windows => self.locate_windows(profile),
            OsType::MacOS => self.locate_macos(),
            OsType::Unknown => DeviceHandle::not_found(),
        };
        info!(status = ?handle.status, path = ?handle.path, bus_id = ?handle.bus_id, "Device probe finished");
        handle
    }

    async fn attach(
        &self,
        profile: &EnvironmentProfile,
        device: &DeviceHandle,
    ) -> Result<DeviceHandle, DomainError> {
        let needs_passthrough = self.os == OsType::Windows
            && profile.virtualization == Virtualization::Wsl
            && device.path.is_none();
        let Some(bus_id) = device.bus_id.as_deref().filter(|_| needs_passthrough) else {
            return Ok(self.locate(profile));
        };

        // Already shared devices make `bind` fail; `attach` is the step that matters.
        let bind = CommandSpec::new("usbipd", &["bind", "--busid", bus_id]);
        match self.runner.run(&bind, ATTACH_TIMEOUT).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(bus_id, error = %output.summary(), "usbipd bind failed"),
            Err(e) => warn!(bus_id, error = %e, "usbipd bind failed"),
        }
        let attach = CommandSpec::new("usbipd", &["attach", "--wsl", "--busid", bus_id]);
        let output = self.runner.run(&attach, ATTACH_TIMEOUT).await?;
        if !output.success() {
            return Err(DomainError::command(attach.to_string(), output.summary()));
        }
        info!(bus_id, "Device passed through to WSL");

        Ok(self.locate(profile))
    }
}

fn find_tty_child(dir: &Path, depth: u8) -> Option<String> {
    if depth == 0 {
        return None;
    }
    let mut entries: Vec<_> = fs::read_dir(dir).ok()?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in &entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if SERIAL_NAME_PATTERNS[..2].iter().any(|p| name.starts_with(p)) {
            return Some(name);
        }
    }
    // sysfs is full of symlink loops; only descend into real directories
    entries
        .iter()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .find_map(|e| find_tty_child(&e.path(), depth - 1))
}

fn run_tool(program: &str, args: &[&str]) -> Result<String, String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| format!("failed to run {}: {}", program, e))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::CommandOutput;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const USBIPD: &str = "\
Connected:
BUSID  VID:PID    DEVICE                                     STATE
1-7    0483:5740  USB Serial Device (COM3)                   Not shared
2-1    8087:0026  Intel(R) Wireless Bluetooth(R)             Not shared

Persisted:
GUID                                  DEVICE
";

    const PROFILER: &str = "\
USB:
    USB 3.1 Bus:
        STM32 Virtual ComPort:

          Product ID: 0x5740
          Vendor ID: 0x0483  (STMicroelectronics)
          Version: 2.00
          Location ID: 0x14200000 / 5

        Keyboard:

          Product ID: 0x0340
          Vendor ID: 0x05ac (Apple Inc.)
";

    fn no_tools() -> ToolRunner {
        Box::new(|program, _| Err(format!("{} not installed", program)))
    }

    fn linux_profile() -> EnvironmentProfile {
        EnvironmentProfile::new(OsType::Linux, Virtualization::Native)
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_parse_usbipd() {
        let entries = parse_usbipd_list(USBIPD);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].bus_id.as_deref(), Some("1-7"));
        assert!(entries[0].is_gateway());
        assert!(!entries[1].is_gateway());
    }

    #[test]
    fn test_parse_system_profiler() {
        let entries = parse_system_profiler(PROFILER);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].vendor_id, 0x0483);
        assert_eq!(entries[0].bus_id.as_deref(), Some("0x14200000"));
        assert_eq!(entries[1].vendor_id, 0x05ac);
    }

    #[test]
    fn test_linux_nothing_attached() {
        let sys = TempDir::new().unwrap();
        let dev = TempDir::new().unwrap();
        touch(&dev.path().join("tty0"));
        let locator = SystemDeviceLocator::with_paths(OsType::Linux, sys.path(), dev.path(), no_tools());
        assert_eq!(locator.locate(&linux_profile()), DeviceHandle::not_found());
    }

    #[test]
    fn test_linux_bus_match_with_tty_child() {
        let sys = TempDir::new().unwrap();
        let dev = TempDir::new().unwrap();
        let device = sys.path().join("1-1");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("idVendor"), "0483\n").unwrap();
        fs::write(device.join("idProduct"), "5740\n").unwrap();
        fs::create_dir_all(device.join("1-1:1.0/tty/ttyACM1")).unwrap();

        let locator = SystemDeviceLocator::with_paths(OsType::Linux, sys.path(), dev.path(), no_tools());
        let handle = locator.locate(&linux_profile());
        assert_eq!(handle.status, crate::domain::DeviceStatus::FoundSerial);
        assert!(handle.path.unwrap().ends_with("ttyACM1"));
        assert_eq!(handle.bus_id.as_deref(), Some("1-1"));
    }

    #[test]
    fn test_linux_dev_scan_prefers_acm() {
        let sys = TempDir::new().unwrap();
        let dev = TempDir::new().unwrap();
        touch(&dev.path().join("ttyUSB0"));
        touch(&dev.path().join("ttyACM2"));
        touch(&dev.path().join("ttyACM0"));

        let locator = SystemDeviceLocator::with_paths(OsType::Linux, sys.path(), dev.path(), no_tools());
        let handle = locator.locate(&linux_profile());
        assert!(handle.path.unwrap().ends_with("ttyACM0"));
        assert!(handle.bus_id.is_none());
    }

    #[test]
    fn test_linux_bus_only() {
        let sys = TempDir::new().unwrap();
        let dev = TempDir::new().unwrap();
        let device = sys.path().join("3-2");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("idVendor"), "1a86").unwrap();
        fs::write(device.join("idProduct"), "7523").unwrap();

        let locator = SystemDeviceLocator::with_paths(OsType::Linux, sys.path(), dev.path(), no_tools());
        assert_eq!(locator.locate(&linux_profile()), DeviceHandle::on_bus("3-2"));
    }

    #[test]
    fn test_windows_without_usbipd_is_not_found() {
        let locator = SystemDeviceLocator::with_paths(OsType::Windows, "nowhere", "nowhere", no_tools());
        let profile = EnvironmentProfile::new(OsType::Windows, Virtualization::Wsl);
        assert!(!locator.locate(&profile).is_found());
    }

    /// Host shell for `usbipd`: `bind` reports the device as already shared.
    struct Usbipd {
        calls: Arc<Mutex<Vec<String>>>,
        attached: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl CommandRunner for Usbipd {
        async fn run(
            &self,
            command: &CommandSpec,
            timeout: Duration,
        ) -> Result<CommandOutput, DomainError> {
            assert_eq!(timeout, ATTACH_TIMEOUT);
            let line = command.to_shell_line();
            self.calls.lock().unwrap().push(line.clone());
            let code = if line.starts_with("usbipd attach") {
                *self.attached.lock().unwrap() = true;
                0
            } else {
                1
            };
            Ok(CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: "already shared\n".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_windows_attach_passes_through_and_relocates() {
        let calls = Arc::new(Mutex::new(Vec::<String>::new()));
        let attached = Arc::new(Mutex::new(false));
        let tool: ToolRunner = {
            let attached = attached.clone();
            Box::new(move |program, args| match (program, args.first().copied()) {
                ("usbipd", Some("list")) => Ok(USBIPD.to_string()),
                ("wsl.exe", _) if *attached.lock().unwrap() => Ok("/dev/ttyACM0\n".into()),
                _ => Err("no device".into()),
            })
        };
        let locator = SystemDeviceLocator::with_paths(OsType::Windows, "nowhere", "nowhere", tool)
            .with_runner(Arc::new(Usbipd {
                calls: calls.clone(),
                attached: attached.clone(),
            }));
        let profile = EnvironmentProfile::new(OsType::Windows, Virtualization::Wsl);

        let before = locator.locate(&profile);
        assert_eq!(before, DeviceHandle::on_bus("1-7"));

        let after = locator.attach(&profile, &before).await.unwrap();
        assert_eq!(after.path.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "usbipd bind --busid 1-7".to_string(),
                "usbipd attach --wsl --busid 1-7".to_string(),
            ]
        );
    }

    #[test]
    fn test_macos_profiler_and_usbmodem() {
        let dev = TempDir::new().unwrap();
        touch(&dev.path().join("cu.usbmodem14201"));
        let tool: ToolRunner = Box::new(|_, _| Ok(PROFILER.to_string()));
        let locator = SystemDeviceLocator::with_paths(OsType::MacOS, "nowhere", dev.path(), tool);
        let handle = locator.locate(&EnvironmentProfile::new(OsType::MacOS, Virtualization::Native));
        assert!(handle.path.unwrap().ends_with("cu.usbmodem14201"));
    }

    #[test]
    fn test_unknown_os_not_found() {
        let locator = SystemDeviceLocator::with_paths(OsType::Unknown, "nowhere", "nowhere", no_tools());
        assert!(!locator.locate(&EnvironmentProfile::unknown()).is_found());
    }
}
