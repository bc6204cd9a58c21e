//! Plugin metadata shared by the registry, the node agent and result aggregation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Info,
}

impl Severity {
    /// Severities scanned under the redline policy
    pub fn is_redline(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
            Self::Info => write!(f, "info"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "info" => Ok(Self::Info),
            _ => Err(format!("Unknown severity: {s}")),
        }
    }
}

/// Metadata for one loaded check or tool. Immutable once installed in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Hex SHA-256 of the plugin artifact
    pub checksum: String,
    /// Capability tags; empty means the plugin is generic
    pub tags: BTreeSet<String>,
    pub severity: Severity,
    pub enabled: bool,
}

impl PluginDescriptor {
    pub fn is_generic(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn matches_any(&self, fingerprint: &BTreeSet<String>) -> bool {
        !self.tags.is_disjoint(fingerprint)
    }
}
