use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::domain::{EnvironmentProfile, OsType, Virtualization};
use crate::ports::EnvironmentDetector;

/// Hypervisor names as reported by DMI or `systemd-detect-virt`.
const HYPERVISOR_MARKERS: &[&str] = &[
    "vmware",
    "virtualbox",
    "qemu",
    "kvm",
    "parallels",
    "hyper-v",
    "microsoft corporation virtual",
    "utm",
    "xen",
    "bochs",
    "apple virtualization",
];

/// Raw observations gathered on a Linux host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinuxProbeFacts {
    pub wsl_interop: bool,
    pub proc_version: Option<String>,
    pub container_marker: bool,
    pub detect_virt: Option<String>,
    pub dmi: Option<String>,
}

/// Classify a Linux host. Order: WSL, container, hypervisor, native.
pub fn classify_linux(facts: &LinuxProbeFacts) -> Virtualization {
    let version = facts
        .proc_version
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();
    if facts.wsl_interop || version.contains("microsoft") || version.contains("wsl") {
        return Virtualization::Wsl;
    }

    if facts.container_marker {
        return Virtualization::Container;
    }

    if let Some(virt) = facts.detect_virt.as_deref().map(str::trim) {
        if !virt.is_empty() && virt != "none" {
            return Virtualization::Vm;
        }
    }

    let dmi = facts.dmi.as_deref().unwrap_or("").to_ascii_lowercase();
    if HYPERVISOR_MARKERS.iter().any(|m| dmi.contains(m)) {
        return Virtualization::Vm;
    }

    Virtualization::Native
}

/// Probes the running host through marker files and platform tools.
pub struct SystemEnvironmentDetector {
    root: PathBuf,
    os: OsType,
}

impl SystemEnvironmentDetector {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/"),
            os: OsType::current(),
        }
    }

    /// Probe a different filesystem root (used by tests).
    pub fn with_root(root: impl Into<PathBuf>, os: OsType) -> Self {
        Self {
            root: root.into(),
            os,
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.path(rel)).ok()
    }

    fn gather_linux_facts(&self) -> LinuxProbeFacts {
        let dmi = ["sys/class/dmi/id/sys_vendor", "sys/class/dmi/id/product_name"]
            .iter()
            .filter_map(|p| self.read(p))
            .collect::<Vec<_>>()
            .join(" ");

        LinuxProbeFacts {
            wsl_interop: self.path("proc/sys/fs/binfmt_misc/WSLInterop").exists(),
            proc_version: self.read("proc/version"),
            container_marker: self.path(".dockerenv").exists()
                || self.path("run/.containerenv").exists(),
            detect_virt: if self.root == Path::new("/") {
                command_stdout("systemd-detect-virt", &["--vm"])
            } else {
                None
            },
            dmi: if dmi.is_empty() { None } else { Some(dmi) },
        }
    }
}

impl Default for SystemEnvironmentDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentDetector for SystemEnvironmentDetector {
    fn detect(&self) -> EnvironmentProfile {
        let virtualization = match self.os {
            OsType::Linux => {
                let facts = self.gather_linux_facts();
                debug!(?facts, "Linux probe facts");
                classify_linux(&facts)
            }
            OsType::Windows => {
                // A working `wsl.exe --status` means commands can be relayed.
                if command_succeeds("wsl.exe", &["--status"]) {
                    Virtualization::Wsl
                } else {
                    Virtualization::Native
                }
            }
            OsType::MacOS => match command_stdout("sysctl", &["-n", "kern.hv_vmm_present"]) {
                Some(v) if v.trim() == "1" => Virtualization::Vm,
                Some(_) => Virtualization::Native,
                None => Virtualization::Unknown,
            },
            OsType::Unknown => Virtualization::Unknown,
        };

        let profile = EnvironmentProfile::new(self.os, virtualization);
        info!(os = %profile.os, virtualization = %profile.virtualization, "Environment detected");
        profile
    }
}

fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    // systemd-detect-virt exits 1 with "none" on bare metal
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        None
    } else {
        Some(stdout)
    }
}

fn command_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_wsl_wins_over_hypervisor() {
        let facts = LinuxProbeFacts {
            proc_version: Some("Linux version 5.15.90.1-microsoft-standard-WSL2".into()),
            dmi: Some("Microsoft Corporation Virtual Machine".into()),
            ..Default::default()
        };
        assert_eq!(classify_linux(&facts), Virtualization::Wsl);
    }

    #[test]
    fn test_container_then_vm_then_native() {
        let container = LinuxProbeFacts {
            container_marker: true,
            detect_virt: Some("kvm".into()),
            ..Default::default()
        };
        assert_eq!(classify_linux(&container), Virtualization::Container);

        let vm = LinuxProbeFacts {
            detect_virt: Some("oracle".into()),
            ..Default::default()
        };
        assert_eq!(classify_linux(&vm), Virtualization::Vm);

        let bare = LinuxProbeFacts {
            detect_virt: Some("none".into()),
            dmi: Some("Raspberry Pi 4 Model B".into()),
            ..Default::default()
        };
        assert_eq!(classify_linux(&bare), Virtualization::Native);
    }

    #[test]
    fn test_detect_from_fake_root() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "proc/version", "Linux version 6.1.0 (gcc 12)");
        write(dir.path(), "sys/class/dmi/id/sys_vendor", "QEMU");
        let detector = SystemEnvironmentDetector::with_root(dir.path(), OsType::Linux);
        assert_eq!(
            detector.detect(),
            EnvironmentProfile::new(OsType::Linux, Virtualization::Vm)
        );
    }

    #[test]
    fn test_empty_root_is_native() {
        let dir = TempDir::new().unwrap();
        let detector = SystemEnvironmentDetector::with_root(dir.path(), OsType::Linux);
        assert_eq!(detector.detect().virtualization, Virtualization::Native);
    }

    #[test]
    fn test_unknown_os_never_fails() {
        let dir = TempDir::new().unwrap();
        let detector = SystemEnvironmentDetector::with_root(dir.path(), OsType::Unknown);
        assert_eq!(detector.detect(), EnvironmentProfile::unknown());
    }
}
