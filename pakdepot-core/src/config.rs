//! Configuration for the distribution services.
//!
//! Every knob has a default and can be overridden through a `PAKDEPOT_`
//! environment variable, so deployments tune behaviour without a config file.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::DistributionMode;

/// Parse an environment variable as a typed value with a default fallback
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Bandwidth arbiter configuration
#[derive(Debug, Clone)]
pub struct BandwidthConfig {
    /// Global bandwidth ceiling in Mbps shared by all transfers
    pub max_mbps: f64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            max_mbps: env_var_or_default("PAKDEPOT_MAX_BANDWIDTH_MBPS", 100.0),
        }
    }
}

/// Mirror registry and health prober configuration
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// A mirror is re-probed once this much time has passed since its last check
    pub health_check_interval: Duration,
    /// Timeout for one `GET /health` probe
    pub probe_timeout: Duration,
    /// Cadence of the background prober
    pub probe_tick: Duration,
    /// Backoff after an unexpected prober iteration failure
    pub error_backoff: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(env_var_or_default(
                "PAKDEPOT_HEALTH_CHECK_INTERVAL_SECS",
                300,
            )),
            probe_timeout: Duration::from_secs(env_var_or_default(
                "PAKDEPOT_PROBE_TIMEOUT_SECS",
                10,
            )),
            probe_tick: Duration::from_secs(env_var_or_default("PAKDEPOT_PROBE_TICK_SECS", 60)),
            error_backoff: Duration::from_secs(env_var_or_default(
                "PAKDEPOT_PROBER_BACKOFF_SECS",
                300,
            )),
        }
    }
}

/// Peer network configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// TCP port the peer server listens on
    pub listen_port: u16,
    /// Bandwidth in Mbps advertised to remote peers during handshake
    pub advertised_bandwidth_mbps: u32,
    /// A peer unseen for this long is evicted
    pub peer_timeout: Duration,
    /// Cadence of the stale-peer sweep
    pub cleanup_tick: Duration,
    /// Cadence of the discovery duty
    pub discovery_tick: Duration,
    /// Timeout for individual peer socket operations
    pub socket_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_port: env_var_or_default("PAKDEPOT_PEER_PORT", 8080),
            advertised_bandwidth_mbps: env_var_or_default("PAKDEPOT_ADVERTISED_BANDWIDTH", 100),
            peer_timeout: Duration::from_secs(env_var_or_default(
                "PAKDEPOT_PEER_TIMEOUT_SECS",
                300,
            )),
            cleanup_tick: Duration::from_secs(env_var_or_default(
                "PAKDEPOT_PEER_CLEANUP_SECS",
                60,
            )),
            discovery_tick: Duration::from_secs(env_var_or_default(
                "PAKDEPOT_PEER_DISCOVERY_SECS",
                60,
            )),
            socket_timeout: Duration::from_secs(env_var_or_default(
                "PAKDEPOT_PEER_SOCKET_TIMEOUT_SECS",
                5,
            )),
        }
    }
}

/// Artifact cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding one artifact file per `(manager, name, version)` key
    pub dir: PathBuf,
    /// Entries older than this many days are removed by maintenance
    pub max_age_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(env_var_or_default(
                "PAKDEPOT_CACHE_DIR",
                "./depot-cache".to_string(),
            )),
            max_age_days: env_var_or_default("PAKDEPOT_CACHE_MAX_AGE_DAYS", 7),
        }
    }
}

/// Chunk store configuration
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Fixed chunk size in bytes used when slicing artifacts
    pub chunk_size: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: env_var_or_default("PAKDEPOT_CHUNK_SIZE_BYTES", 1024 * 1024),
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub mode: DistributionMode,
    /// How many ranked mirrors to try per request
    pub mirror_candidates: usize,
    /// Slack added on top of the bandwidth-derived transfer bound
    pub transfer_slack: Duration,
    /// How many recent download attempts to retain for reporting
    pub history_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mode: env_var_or_default("PAKDEPOT_MODE", DistributionMode::Hybrid),
            mirror_candidates: env_var_or_default("PAKDEPOT_MIRROR_CANDIDATES", 3),
            transfer_slack: Duration::from_secs(env_var_or_default(
                "PAKDEPOT_TRANSFER_SLACK_SECS",
                5,
            )),
            history_limit: env_var_or_default("PAKDEPOT_HISTORY_LIMIT", 256),
        }
    }
}

/// Aggregate configuration for one pakdepot node
#[derive(Debug, Clone, Default)]
pub struct DepotConfig {
    pub bandwidth: BandwidthConfig,
    pub mirror: MirrorConfig,
    pub peer: PeerConfig,
    pub cache: CacheConfig,
    pub chunk: ChunkConfig,
    pub coordinator: CoordinatorConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DepotConfig::default();
        assert!(config.bandwidth.max_mbps > 0.0);
        assert_eq!(config.mirror.health_check_interval, Duration::from_secs(300));
        assert_eq!(config.peer.peer_timeout, Duration::from_secs(300));
        assert_eq!(config.cache.max_age_days, 7);
        assert_eq!(config.coordinator.mirror_candidates, 3);
    }
}
