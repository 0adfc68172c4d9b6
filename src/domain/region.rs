use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// LoRaWAN regional frequency plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    EU868,
    US915,
    AS923,
    AU915,
    KR920,
    IN865,
    CN470,
    RU864,
}

impl Region {
    pub const ALL: [Region; 8] = [
        Region::EU868,
        Region::US915,
        Region::AS923,
        Region::AU915,
        Region::KR920,
        Region::IN865,
        Region::CN470,
        Region::RU864,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Region::EU868 => "EU868",
            Region::US915 => "US915",
            Region::AS923 => "AS923",
            Region::AU915 => "AU915",
            Region::KR920 => "KR920",
            Region::IN865 => "IN865",
            Region::CN470 => "CN470",
            Region::RU864 => "RU864",
        }
    }

    /// Lookup the static profile for this region.
    pub fn profile(&self) -> RegionProfile {
        match self {
            Region::EU868 => RegionProfile::new(*self, "global_conf.json.sx1250.EU868.USB", "eu868"),
            Region::US915 => RegionProfile::new(*self, "global_conf.json.sx1250.US915.USB", "us915_1"),
            Region::AS923 => RegionProfile::new(*self, "global_conf.json.sx1250.AS923.USB", "as923"),
            Region::AU915 => RegionProfile::new(*self, "global_conf.json.sx1250.AU915.USB", "au915_1"),
            Region::KR920 => RegionProfile::new(*self, "global_conf.json.sx1250.KR920.USB", "kr920"),
            Region::IN865 => RegionProfile::new(*self, "global_conf.json.sx1250.IN865.USB", "in865"),
            Region::CN470 => RegionProfile::new(*self, "global_conf.json.sx1250.CN490.USB", "cn470_10"),
            Region::RU864 => RegionProfile::new(*self, "global_conf.json.sx1250.RU864.USB", "ru864"),
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Region {
    type Err = DomainError;

    /// Unknown names are rejected; there is no fallback region.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Region::ALL
            .iter()
            .copied()
            .find(|r| r.name() == wanted)
            .ok_or_else(|| {
                DomainError::ConfigurationInvalid(format!(
                    "unknown region '{}' (supported: {})",
                    s.trim(),
                    Region::ALL
                        .iter()
                        .map(|r| r.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// Semtech UDP uplink/downlink ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub up: u16,
    pub down: u16,
}

impl PortPair {
    pub fn new(up: u16, down: u16) -> Self {
        Self { up, down }
    }
}

impl Default for PortPair {
    fn default() -> Self {
        Self { up: 1700, down: 1700 }
    }
}

/// Static description of a region used by the templater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionProfile {
    pub region: Region,
    /// Frequency-plan file shipped with the concentrator HAL.
    pub frequency_plan: &'static str,
    /// ChirpStack region configuration id, also the MQTT topic prefix.
    pub chirpstack_id: &'static str,
    pub ports: PortPair,
}

impl RegionProfile {
    const fn new(region: Region, frequency_plan: &'static str, chirpstack_id: &'static str) -> Self {
        Self {
            region,
            frequency_plan,
            chirpstack_id,
            ports: PortPair { up: 1700, down: 1700 },
        }
    }

    /// Resolve a user-supplied region name.
    pub fn lookup(name: &str) -> Result<Self, DomainError> {
        name.parse::<Region>().map(|r| r.profile())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_eu868() {
        let profile = RegionProfile::lookup("eu868").unwrap();
        assert_eq!(profile.region, Region::EU868);
        assert!(profile.frequency_plan.contains("EU868"));
        assert_eq!(profile.ports, PortPair::new(1700, 1700));
    }

    #[test]
    fn test_unknown_region_is_rejected() {
        let err = RegionProfile::lookup("ZZ000").unwrap_err();
        assert!(matches!(err, DomainError::ConfigurationInvalid(_)));
        assert!(err.to_string().contains("ZZ000"));
    }

    #[test]
    fn test_every_region_has_a_profile() {
        for region in Region::ALL {
            let profile = region.profile();
            assert_eq!(profile.region, region);
            assert!(profile.frequency_plan.starts_with("global_conf.json"));
            assert_eq!(region.name().parse::<Region>().unwrap(), region);
        }
    }
}
