use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::device::{DeviceHandle, DeviceModel};
use super::environment::{EnvironmentProfile, OsType, Virtualization};
use super::install::{InstallStatus, InstallationRecord};
use super::region::Region;

/// Cached state from the previous run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub environment: Option<EnvironmentProfile>,
    pub device_path: Option<String>,
    pub bus_id: Option<String>,
    pub installation: Option<InstallationRecord>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn remember_device(&mut self, device: &DeviceHandle) {
        self.device_path = device.path.clone();
        self.bus_id = device.bus_id.clone();
    }

    pub fn is_installed(&self) -> bool {
        self.installation
            .as_ref()
            .map(|r| r.status.is_installed())
            .unwrap_or(false)
    }

    /// Serialize as flat `key=value` lines.
    pub fn to_key_values(&self) -> String {
        let mut out = String::from("# loractl session state\n");
        let mut put = |key: &str, value: &str| {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        };

        if let Some(env) = &self.environment {
            put("os", &env.os.to_string());
            put("virtualization", &env.virtualization.to_string());
        }
        if let Some(path) = &self.device_path {
            put("device_path", path);
        }
        if let Some(bus) = &self.bus_id {
            put("bus_id", bus);
        }
        if let Some(record) = &self.installation {
            put("install_status", &record.status.to_string());
            if let Some(path) = &record.install_path {
                put("install_path", &path.to_string_lossy());
            }
            put("device_model", &record.device_model.to_string());
            put("region", record.region.name());
        }
        if let Some(at) = &self.saved_at {
            put("saved_at", &at.to_rfc3339());
        }
        out
    }

    /// Parse `key=value` lines. Unknown keys are ignored, malformed values are errors.
    pub fn from_key_values(input: &str) -> Result<Self, String> {
        let mut os = None;
        let mut virt = None;
        let mut snapshot = SessionSnapshot::default();
        let mut status = None;
        let mut install_path = None;
        let mut model = None;
        let mut region = None;

        for (lineno, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected key=value", lineno + 1))?;
            let value = value.trim();

            match key.trim() {
                "os" => os = Some(value.parse::<OsType>()?),
                "virtualization" => virt = Some(value.parse::<Virtualization>()?),
                "device_path" => snapshot.device_path = Some(value.to_string()),
                "bus_id" => snapshot.bus_id = Some(value.to_string()),
                "install_status" => status = Some(value.parse::<InstallStatus>()?),
                "install_path" => install_path = Some(PathBuf::from(value)),
                "device_model" => {
                    model = Some(value.parse::<DeviceModel>().map_err(|e| e.to_string())?)
                }
                "region" => region = Some(value.parse::<Region>().map_err(|e| e.to_string())?),
                "saved_at" => {
                    let at = DateTime::parse_from_rfc3339(value)
                        .map_err(|e| format!("line {}: {}", lineno + 1, e))?;
                    snapshot.saved_at = Some(at.with_timezone(&Utc));
                }
                _ => {}
            }
        }

        snapshot.environment = match (os, virt) {
            (Some(os), Some(v)) => Some(EnvironmentProfile::new(os, v)),
            (None, None) => None,
            _ => return Err("os and virtualization must be stored together".to_string()),
        };

        snapshot.installation = match (status, model, region) {
            (Some(status), Some(device_model), Some(region)) => Some(InstallationRecord {
                status,
                install_path,
                device_model,
                region,
            }),
            (None, None, None) => None,
            _ => return Err("incomplete installation record".to_string()),
        };

        Ok(snapshot)
    }
}
