//! Distribution coordinator: the top-level download API.
//!
//! Per request the source order is strict: cache, then peers (when P2P is
//! preferred and the mode permits), then ranked mirrors. Per-source failures
//! are absorbed and degrade that source's health state; only total
//! exhaustion reaches the caller.

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bandwidth::{AllocationStrategy, BandwidthArbiter, BandwidthUsage};
use crate::cache::{CacheStats, PackageCache};
use crate::catalog::PackageCatalog;
use crate::chunk_store::ChunkStore;
use crate::config::CoordinatorConfig;
use crate::error::{DepotError, DepotResult};
use crate::mirror_registry::{MirrorRegistry, MirrorStats};
use crate::peer_network::{PeerNetwork, PeerStats};
use crate::types::{
    DistributionMode, DownloadAttempt, Mirror, PackageInfo, PackageKey, SourceKind,
};

/// Aggregate snapshot consumed by reporting/automation collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct DistributionStats {
    pub mode: DistributionMode,
    pub bandwidth: BandwidthUsage,
    pub mirrors: MirrorStats,
    pub p2p: PeerStats,
    pub cache: CacheStats,
}

pub struct DistributionCoordinator {
    config: CoordinatorConfig,
    bandwidth: Arc<BandwidthArbiter>,
    mirrors: Arc<MirrorRegistry>,
    peers: Arc<PeerNetwork>,
    cache: Arc<PackageCache>,
    chunks: Arc<ChunkStore>,
    catalog: Arc<dyn PackageCatalog>,
    http: reqwest::Client,
    history: Mutex<VecDeque<DownloadAttempt>>,
}

impl DistributionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        bandwidth: Arc<BandwidthArbiter>,
        mirrors: Arc<MirrorRegistry>,
        peers: Arc<PeerNetwork>,
        cache: Arc<PackageCache>,
        chunks: Arc<ChunkStore>,
        catalog: Arc<dyn PackageCatalog>,
    ) -> Self {
        Self {
            config,
            bandwidth,
            mirrors,
            peers,
            cache,
            chunks,
            catalog,
            http: reqwest::Client::new(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Download a package from the best available source and return the
    /// local artifact path.
    ///
    /// Fails with [`DepotError::PackageNotFound`] when the catalog does not
    /// know the package and [`DepotError::AllSourcesFailed`] when every
    /// source has been exhausted.
    pub async fn download_package(
        &self,
        name: &str,
        manager: &str,
        version: Option<&str>,
        prefer_p2p: bool,
    ) -> DepotResult<PathBuf> {
        let key = PackageKey::new(manager, name, version.unwrap_or("latest"));

        if let Some(path) = self.cache.lookup(&key) {
            info!(package = %key, "cache hit");
            self.record_attempt(&key, SourceKind::Cache, true, Duration::ZERO);
            return Ok(path);
        }

        let info = self.catalog.resolve(name, manager, version).await?;

        if prefer_p2p && self.config.mode != DistributionMode::Centralized {
            let started = Instant::now();
            match self.try_p2p(&key, &info).await {
                Ok(path) => {
                    self.record_attempt(&key, SourceKind::P2p, true, started.elapsed());
                    return Ok(path);
                }
                // Peer failures never propagate; the mirror path decides.
                Err(e) => {
                    warn!(package = %key, error = %e, "p2p download failed, falling back to mirrors");
                    self.record_attempt(&key, SourceKind::P2p, false, started.elapsed());
                }
            }
        }

        self.try_mirrors(&key, &info).await
    }

    /// Pick the best peer by `reputation x bandwidth` and transfer from it.
    async fn try_p2p(&self, key: &PackageKey, info: &PackageInfo) -> DepotResult<PathBuf> {
        let candidates = self.peers.peers_sharing(&key.manager, &key.name).await;
        let best = candidates
            .into_iter()
            .max_by(|a, b| {
                let score_a = a.reputation * f64::from(a.bandwidth_mbps);
                let score_b = b.reputation * f64::from(b.bandwidth_mbps);
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| DepotError::NoPeers {
                package: key.share_key(),
            })?;

        debug!(package = %key, peer_id = %best.id, "downloading from peer");
        let bound = transfer_bound(info.size, f64::from(best.bandwidth_mbps))
            + self.config.transfer_slack;
        let payload = timeout(bound, self.peers.download_from_peer(&best, info))
            .await
            .map_err(|_| DepotError::Timeout {
                operation: format!("p2p transfer of {}", key),
                duration: bound,
            })??;

        self.verify_checksum(key, info, &payload)?;
        self.finish_transfer(key, &payload)
    }

    /// Try the ranked mirrors in order; the first success wins.
    async fn try_mirrors(&self, key: &PackageKey, info: &PackageInfo) -> DepotResult<PathBuf> {
        let candidates = self
            .mirrors
            .best_mirrors(&key.manager, self.config.mirror_candidates)
            .await;
        if candidates.is_empty() {
            warn!(package = %key, "no suitable mirrors");
        }

        for mirror in candidates {
            if !self.mirrors.begin_transfer(&mirror.id).await {
                continue;
            }
            let started = Instant::now();
            let result = self.fetch_from_mirror(&mirror, key, info).await;
            self.mirrors.end_transfer(&mirror.id).await;
            let elapsed = started.elapsed();

            match result {
                Ok(path) => {
                    self.report_mirror(&mirror.id, true, elapsed).await;
                    self.record_attempt(key, SourceKind::Mirror, true, elapsed);
                    return Ok(path);
                }
                // A zero grant means our own ledger is full, not that the
                // mirror misbehaved; skip it without touching its health.
                Err(DepotError::ResourceExhausted { resource }) => {
                    debug!(package = %key, mirror = %mirror.name, resource = %resource, "no bandwidth for mirror transfer");
                }
                Err(e) => {
                    warn!(package = %key, mirror = %mirror.name, error = %e, "mirror transfer failed");
                    self.report_mirror(&mirror.id, false, elapsed).await;
                    self.record_attempt(key, SourceKind::Mirror, false, elapsed);
                }
            }
        }

        Err(DepotError::AllSourcesFailed {
            package: key.to_string(),
        })
    }

    /// One mirror transfer under a bandwidth grant. The grant is released on
    /// every exit path; the transfer is bounded by the time the grant
    /// implies for the declared size.
    async fn fetch_from_mirror(
        &self,
        mirror: &Mirror,
        key: &PackageKey,
        info: &PackageInfo,
    ) -> DepotResult<PathBuf> {
        let connection_id = format!("mirror_{}_{}", mirror.id, key.name);
        let granted = self.bandwidth.allocate(
            &connection_id,
            f64::from(mirror.bandwidth_mbps),
            AllocationStrategy::Adaptive,
            1,
        );
        let bandwidth = self.bandwidth.clone();
        let _release = scopeguard::guard(connection_id.clone(), move |id| {
            bandwidth.release(&id);
        });

        if granted <= 0.0 {
            return Err(DepotError::ResourceExhausted {
                resource: format!("bandwidth for {}", connection_id),
            });
        }

        let bound = transfer_bound(info.size, granted) + self.config.transfer_slack;
        let url = format!(
            "{}/packages/{}/{}/{}",
            mirror.url, key.manager, key.name, key.version
        );
        debug!(package = %key, url = %url, granted_mbps = granted, "mirror transfer");

        let payload = timeout(bound, async {
            let response = self.http.get(&url).send().await?.error_for_status()?;
            response.bytes().await
        })
        .await
        .map_err(|_| DepotError::Timeout {
            operation: format!("mirror transfer of {}", key),
            duration: bound,
        })??;

        self.verify_checksum(key, info, &payload)?;
        self.finish_transfer(key, &payload)
    }

    /// Cache the artifact and start sharing its chunks with peers.
    fn finish_transfer(&self, key: &PackageKey, payload: &[u8]) -> DepotResult<PathBuf> {
        let path = self.cache.store_bytes(key, payload)?;
        self.chunks.register_artifact(&key.share_key(), &path)?;
        Ok(path)
    }

    fn verify_checksum(
        &self,
        key: &PackageKey,
        info: &PackageInfo,
        payload: &[u8],
    ) -> DepotResult<()> {
        if let Some(expected) = info.checksum.as_deref().filter(|c| !c.is_empty()) {
            let actual = hex::encode(Sha256::digest(payload));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(DepotError::ChecksumMismatch {
                    package: key.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(())
    }

    async fn report_mirror(&self, mirror_id: &str, success: bool, elapsed: Duration) {
        let status = if success {
            crate::types::MirrorStatus::Online
        } else {
            crate::types::MirrorStatus::Error
        };
        if let Err(e) = self
            .mirrors
            .update_status(mirror_id, status, Some(elapsed.as_secs_f64()), Some(success))
            .await
        {
            warn!(mirror_id, error = %e, "failed to record mirror outcome");
        }
    }

    fn record_attempt(&self, key: &PackageKey, source: SourceKind, success: bool, duration: Duration) {
        let mut history = self.history.lock();
        history.push_back(DownloadAttempt {
            package: key.to_string(),
            source,
            success,
            duration,
            finished_at: chrono::Utc::now(),
        });
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Recent download attempts, oldest first.
    pub fn recent_attempts(&self) -> Vec<DownloadAttempt> {
        self.history.lock().iter().cloned().collect()
    }

    /// Remove cached artifacts older than the given age.
    pub fn cleanup_cache(&self, max_age_days: u64) -> DepotResult<usize> {
        self.cache.cleanup_older_than(max_age_days)
    }

    /// Aggregate statistics snapshot for external reporting.
    pub async fn distribution_stats(&self) -> DepotResult<DistributionStats> {
        Ok(DistributionStats {
            mode: self.config.mode,
            bandwidth: self.bandwidth.usage_stats(),
            mirrors: self.mirrors.mirror_stats().await,
            p2p: self.peers.peer_stats().await,
            cache: self.cache.stats()?,
        })
    }
}

/// Time a transfer of `size` bytes should take at `mbps`, used to bound the
/// operation rather than merely log it.
fn transfer_bound(size: u64, mbps: f64) -> Duration {
    let bytes_per_sec = (mbps * 1024.0 * 1024.0 / 8.0).max(1.0);
    Duration::from_secs_f64(size as f64 / bytes_per_sec)
}
