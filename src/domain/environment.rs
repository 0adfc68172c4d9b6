use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Host operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OsType {
    Linux,
    Windows,
    MacOS,
    Unknown,
}

impl OsType {
    /// Operating system this binary was compiled for.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => OsType::Linux,
            "windows" => OsType::Windows,
            "macos" => OsType::MacOS,
            _ => OsType::Unknown,
        }
    }
}

impl std::fmt::Display for OsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsType::Linux => write!(f, "linux"),
            OsType::Windows => write!(f, "windows"),
            OsType::MacOS => write!(f, "macos"),
            OsType::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(OsType::Linux),
            "windows" => Ok(OsType::Windows),
            "macos" => Ok(OsType::MacOS),
            "unknown" => Ok(OsType::Unknown),
            other => Err(format!("unknown os '{}'", other)),
        }
    }
}

/// Virtualization context the tool runs in.
///
/// On Windows hosts `Wsl` means a WSL distribution is available to relay
/// commands into, not that the tool itself runs inside WSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Virtualization {
    Native,
    Vm,
    Wsl,
    Container,
    Unknown,
}

impl std::fmt::Display for Virtualization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Virtualization::Native => write!(f, "native"),
            Virtualization::Vm => write!(f, "vm"),
            Virtualization::Wsl => write!(f, "wsl"),
            Virtualization::Container => write!(f, "container"),
            Virtualization::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for Virtualization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Virtualization::Native),
            "vm" => Ok(Virtualization::Vm),
            "wsl" => Ok(Virtualization::Wsl),
            "container" => Ok(Virtualization::Container),
            "unknown" => Ok(Virtualization::Unknown),
            other => Err(format!("unknown virtualization '{}'", other)),
        }
    }
}

/// Result of environment detection. Computed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentProfile {
    pub os: OsType,
    pub virtualization: Virtualization,
}

impl EnvironmentProfile {
    pub fn new(os: OsType, virtualization: Virtualization) -> Self {
        Self { os, virtualization }
    }

    pub fn unknown() -> Self {
        Self::new(OsType::Unknown, Virtualization::Unknown)
    }

    /// All (os, virtualization) combinations.
    pub fn all() -> Vec<EnvironmentProfile> {
        let oses = [OsType::Linux, OsType::Windows, OsType::MacOS, OsType::Unknown];
        let virts = [
            Virtualization::Native,
            Virtualization::Vm,
            Virtualization::Wsl,
            Virtualization::Container,
            Virtualization::Unknown,
        ];
        oses.iter()
            .flat_map(|os| virts.iter().map(move |v| EnvironmentProfile::new(*os, *v)))
            .collect()
    }
}

impl std::fmt::Display for EnvironmentProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.virtualization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_parse_display_roundtrip() {
        for os in [OsType::Linux, OsType::Windows, OsType::MacOS, OsType::Unknown] {
            assert_eq!(os.to_string().parse::<OsType>().unwrap(), os);
        }
        assert!("beos".parse::<OsType>().is_err());
    }

    #[test]
    fn test_virtualization_parse_is_case_insensitive() {
        assert_eq!("WSL".parse::<Virtualization>().unwrap(), Virtualization::Wsl);
        assert_eq!(" vm ".parse::<Virtualization>().unwrap(), Virtualization::Vm);
    }

    #[test]
    fn test_all_profiles_cover_every_pair() {
        assert_eq!(EnvironmentProfile::all().len(), 20);
    }

    #[test]
    fn test_current_os() {
        let os = OsType::current();
        #[cfg(target_os = "linux")]
        assert_eq!(os, OsType::Linux);
        #[cfg(target_os = "macos")]
        assert_eq!(os, OsType::MacOS);
        let _ = os;
    }
}
