use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Outcome of the device probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// No gateway found. A normal outcome, not an error.
    NotFound,
    /// Found on the USB bus, but no usable serial node yet.
    FoundBus,
    /// Serial character device available.
    FoundSerial,
}

/// Handle to an attached gateway. Re-detected after any passthrough action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub status: DeviceStatus,
    /// Serial device path, e.g. `/dev/ttyACM0`.
    pub path: Option<String>,
    /// Bus identifier for USB rebinding (sysfs name or usbipd BUSID).
    pub bus_id: Option<String>,
}

impl DeviceHandle {
    pub fn not_found() -> Self {
        Self {
            status: DeviceStatus::NotFound,
            path: None,
            bus_id: None,
        }
    }

    pub fn on_bus(bus_id: impl Into<String>) -> Self {
        Self {
            status: DeviceStatus::FoundBus,
            path: None,
            bus_id: Some(bus_id.into()),
        }
    }

    pub fn serial(path: impl Into<String>, bus_id: Option<String>) -> Self {
        Self {
            status: DeviceStatus::FoundSerial,
            path: Some(path.into()),
            bus_id,
        }
    }

    pub fn is_found(&self) -> bool {
        self.status != DeviceStatus::NotFound
    }
}

/// Supported gateway hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceModel {
    #[default]
    Rak7271,
    Rak7371,
}

impl std::fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceModel::Rak7271 => write!(f, "RAK7271"),
            DeviceModel::Rak7371 => write!(f, "RAK7371"),
        }
    }
}

impl FromStr for DeviceModel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RAK7271" | "7271" => Ok(DeviceModel::Rak7271),
            "RAK7371" | "7371" => Ok(DeviceModel::Rak7371),
            other => Err(DomainError::ConfigurationInvalid(format!(
                "unknown device model '{}' (expected RAK7271 or RAK7371)",
                other
            ))),
        }
    }
}

/// USB vendor/product pair identifying a concentrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbSignature {
    pub vendor_id: u16,
    pub product_id: u16,
    pub description: &'static str,
}

impl UsbSignature {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// Signatures of the USB concentrators we drive.
pub const KNOWN_SIGNATURES: &[UsbSignature] = &[
    UsbSignature {
        vendor_id: 0x0483,
        product_id: 0x5740,
        description: "STM32 virtual COM port (RAK5146 USB concentrator)",
    },
    UsbSignature {
        vendor_id: 0x1a86,
        product_id: 0x7523,
        description: "CH340 serial bridge",
    },
];

/// Find a known signature for a vendor/product pair.
pub fn match_signature(vendor_id: u16, product_id: u16) -> Option<&'static UsbSignature> {
    KNOWN_SIGNATURES
        .iter()
        .find(|sig| sig.matches(vendor_id, product_id))
}

/// Serial device name prefixes tried in order of preference.
pub const SERIAL_NAME_PATTERNS: &[&str] = &["ttyACM", "ttyUSB", "cu.usbmodem"];

/// 64-bit concentrator EUI, stored as 16 upper-case hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayEui(String);

impl GatewayEui {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract the EUI from `chip_id` output (`concentrator EUI: 0x...`).
    pub fn from_chip_id_output(output: &str) -> Option<Self> {
        output.lines().find_map(|line| {
            // lines carry a log-level prefix such as `INFO: `
            let (label, value) = line.rsplit_once(':')?;
            let label = label.trim().to_ascii_lowercase();
            if label.ends_with("concentrator eui") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
    }
}

impl std::fmt::Display for GatewayEui {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GatewayEui {
    type Err = DomainError;

    /// Accepts `0x` prefixes and `:`/`-` separators.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits: String = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed)
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();

        if digits.len() != 16 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::ConfigurationInvalid(format!(
                "'{}' is not a 64-bit EUI",
                s
            )));
        }
        Ok(GatewayEui(digits.to_ascii_uppercase()))
    }
}
