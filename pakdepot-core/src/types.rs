use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// How the coordinator is allowed to source packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionMode {
    /// Mirrors only.
    Centralized,
    /// Peers only (mirrors are still used as the fallback of last resort).
    P2p,
    /// Peers first when requested, mirrors otherwise.
    Hybrid,
}

impl std::str::FromStr for DistributionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "centralized" => Ok(Self::Centralized),
            "p2p" => Ok(Self::P2p),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown distribution mode: {}", other)),
        }
    }
}

/// Health state of a mirror, driven by probes and real transfer outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorStatus {
    Online,
    Offline,
    Slow,
    Error,
}

/// A centralized HTTP source serving packages for one or more managers.
///
/// Owned exclusively by the mirror registry; mutated only through its
/// status-update operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mirror {
    pub id: String,
    pub name: String,
    pub url: String,
    pub location: String,
    /// Rated bandwidth in Mbps.
    pub bandwidth_mbps: u32,
    pub status: MirrorStatus,
    pub last_check: DateTime<Utc>,
    /// Rolling success rate in [0, 1], exponentially smoothed. 0.0 means
    /// "never measured".
    pub success_rate: f64,
    /// Most recent response time in seconds.
    pub response_time: f64,
    pub supported_managers: Vec<String>,
    /// Higher is preferred.
    pub priority: i32,
    pub max_connections: u32,
    pub current_connections: u32,
}

/// A node participating in direct package sharing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerNode {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub capabilities: Vec<String>,
    pub shared_packages: HashSet<String>,
    /// Advertised bandwidth in Mbps.
    pub bandwidth_mbps: u32,
    pub last_seen: DateTime<Utc>,
    pub trusted: bool,
    /// Trust/quality score in [0, 1] used to bias source selection.
    pub reputation: f64,
}

/// Identifies one artifact: `(manager, name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageKey {
    pub manager: String,
    pub name: String,
    pub version: String,
}

impl PackageKey {
    pub fn new(manager: &str, name: &str, version: &str) -> Self {
        Self {
            manager: manager.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    /// The `manager:name` key peers use to advertise shared packages.
    pub fn share_key(&self) -> String {
        format!("{}:{}", self.manager, self.name)
    }
}

impl std::fmt::Display for PackageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.manager, self.name, self.version)
    }
}

/// Distribution metadata for one package, supplied per request by the
/// catalog collaborator. Never persisted by this subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub manager: String,
    pub version: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Declared sha256 hex digest, if the catalog knows one.
    pub checksum: Option<String>,
    /// Candidate mirror ids, if the catalog pins any.
    pub mirrors: Vec<String>,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

impl PackageInfo {
    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.manager, &self.name, &self.version)
    }
}

/// Which source satisfied (or failed) a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Cache,
    P2p,
    Mirror,
}

/// Outcome of one download attempt; the only transfer state exposed to
/// external reporting.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadAttempt {
    pub package: String,
    pub source: SourceKind,
    pub success: bool,
    #[serde(rename = "duration_secs", serialize_with = "serialize_secs")]
    pub duration: Duration,
    pub finished_at: DateTime<Utc>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}
