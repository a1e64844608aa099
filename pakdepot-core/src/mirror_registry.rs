//! Mirror registry: records, health probing and ranking.
//!
//! The registry exclusively owns the mirror table. Callers mutate health
//! state only through [`MirrorRegistry::update_status`], which also persists
//! the record and appends to the health log. Network I/O always happens
//! outside the table lock.

use chrono::Utc;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MirrorConfig;
use crate::error::{DepotError, DepotResult};
use crate::storage::{HealthLogEntry, MirrorStore};
use crate::types::{Mirror, MirrorStatus};

/// Parameters for a new mirror record.
#[derive(Debug, Clone)]
pub struct NewMirror {
    pub name: String,
    pub url: String,
    pub location: String,
    pub bandwidth_mbps: u32,
    pub supported_managers: Vec<String>,
    pub priority: i32,
    pub max_connections: u32,
}

/// Snapshot of registry health for external reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
}

pub struct MirrorRegistry {
    mirrors: RwLock<std::collections::HashMap<String, Mirror>>,
    store: MirrorStore,
    config: MirrorConfig,
    http: reqwest::Client,
}

impl MirrorRegistry {
    /// Load persisted mirrors and build the registry.
    pub fn new(store: MirrorStore, config: MirrorConfig) -> DepotResult<Self> {
        let mut mirrors = std::collections::HashMap::new();
        for mirror in store.load_mirrors()? {
            mirrors.insert(mirror.id.clone(), mirror);
        }
        info!(mirrors = mirrors.len(), "mirror registry loaded");
        Ok(Self {
            mirrors: RwLock::new(mirrors),
            store,
            config,
            http: reqwest::Client::new(),
        })
    }

    /// Register a mirror. New mirrors start `Offline` until the first probe.
    pub async fn add_mirror(&self, new: NewMirror) -> DepotResult<String> {
        let mirror = Mirror {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            url: new.url.trim_end_matches('/').to_string(),
            location: new.location,
            bandwidth_mbps: new.bandwidth_mbps,
            status: MirrorStatus::Offline,
            last_check: Utc::now(),
            success_rate: 0.0,
            response_time: 0.0,
            supported_managers: new.supported_managers,
            priority: new.priority,
            max_connections: new.max_connections,
            current_connections: 0,
        };
        let id = mirror.id.clone();
        self.store.save_mirror(&mirror)?;
        self.mirrors.write().await.insert(id.clone(), mirror);
        info!(mirror_id = %id, "mirror added");
        Ok(id)
    }

    /// Remove a mirror; returns `false` when it was not registered.
    pub async fn remove_mirror(&self, mirror_id: &str) -> DepotResult<bool> {
        let removed = self.mirrors.write().await.remove(mirror_id).is_some();
        if removed {
            self.store.delete_mirror(mirror_id)?;
            info!(mirror_id, "mirror removed");
        }
        Ok(removed)
    }

    /// Owned snapshot of every mirror record.
    pub async fn list_mirrors(&self) -> Vec<Mirror> {
        self.mirrors.read().await.values().cloned().collect()
    }

    /// Update a mirror's health state after a probe or a real transfer.
    ///
    /// The success rate is an exponential moving average with alpha 0.1; the
    /// 0.0 sentinel means "never measured" and is replaced outright by the
    /// first result.
    pub async fn update_status(
        &self,
        mirror_id: &str,
        status: MirrorStatus,
        response_time: Option<f64>,
        success: Option<bool>,
    ) -> DepotResult<()> {
        let updated = {
            let mut mirrors = self.mirrors.write().await;
            let mirror = mirrors
                .get_mut(mirror_id)
                .ok_or_else(|| DepotError::MirrorNotFound {
                    mirror_id: mirror_id.to_string(),
                })?;

            mirror.status = status;
            mirror.last_check = Utc::now();
            if let Some(rt) = response_time {
                mirror.response_time = rt;
            }
            if let Some(success) = success {
                let sample = if success { 1.0 } else { 0.0 };
                if mirror.success_rate == 0.0 {
                    mirror.success_rate = sample;
                } else {
                    mirror.success_rate = mirror.success_rate * 0.9 + sample * 0.1;
                }
            }
            mirror.clone()
        };

        // Persist outside the table lock.
        self.store.save_mirror(&updated)?;
        self.store.append_health_log(&HealthLogEntry::record(
            mirror_id,
            status,
            response_time,
            success,
        ))?;
        Ok(())
    }

    /// The best `count` mirrors for a package manager: online, supporting
    /// the manager, below their connection cap, ranked by priority, then
    /// success rate, then response time, with the id as a stable tie-break.
    pub async fn best_mirrors(&self, manager: &str, count: usize) -> Vec<Mirror> {
        let mut candidates: Vec<Mirror> = self
            .mirrors
            .read()
            .await
            .values()
            .filter(|m| {
                m.status == MirrorStatus::Online
                    && m.supported_managers.iter().any(|s| s == manager)
                    && m.current_connections < m.max_connections
            })
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| {
                    b.success_rate
                        .partial_cmp(&a.success_rate)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| {
                    a.response_time
                        .partial_cmp(&b.response_time)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(count);
        candidates
    }

    /// Reserve a connection slot on a mirror; `false` when it is saturated.
    pub async fn begin_transfer(&self, mirror_id: &str) -> bool {
        let mut mirrors = self.mirrors.write().await;
        match mirrors.get_mut(mirror_id) {
            Some(m) if m.current_connections < m.max_connections => {
                m.current_connections += 1;
                true
            }
            _ => false,
        }
    }

    pub async fn end_transfer(&self, mirror_id: &str) {
        let mut mirrors = self.mirrors.write().await;
        if let Some(m) = mirrors.get_mut(mirror_id) {
            m.current_connections = m.current_connections.saturating_sub(1);
        }
    }

    pub async fn mirror_stats(&self) -> MirrorStats {
        let mirrors = self.mirrors.read().await;
        MirrorStats {
            total: mirrors.len(),
            online: mirrors
                .values()
                .filter(|m| m.status == MirrorStatus::Online)
                .count(),
            offline: mirrors
                .values()
                .filter(|m| m.status == MirrorStatus::Offline)
                .count(),
        }
    }

    /// Probe one mirror's `/health` endpoint and fold the result into its
    /// status: 200 within the timeout is `Online`, a non-200 reply is
    /// `Error`, a timeout is `Slow`, a connection failure is `Offline`.
    pub async fn probe_mirror(&self, mirror_id: &str, url: &str) -> DepotResult<()> {
        let start = Instant::now();
        let request = self.http.get(format!("{}/health", url)).send();

        let (status, response_time, success) =
            match timeout(self.config.probe_timeout, request).await {
                Ok(Ok(response)) => {
                    let elapsed = start.elapsed().as_secs_f64();
                    if response.status().is_success() {
                        (MirrorStatus::Online, elapsed, true)
                    } else {
                        debug!(mirror_id, status = %response.status(), "health probe non-200");
                        (MirrorStatus::Error, elapsed, false)
                    }
                }
                Ok(Err(e)) => {
                    debug!(mirror_id, error = %e, "health probe connection failed");
                    (MirrorStatus::Offline, 0.0, false)
                }
                Err(_) => (
                    MirrorStatus::Slow,
                    self.config.probe_timeout.as_secs_f64(),
                    false,
                ),
            };

        self.update_status(mirror_id, status, Some(response_time), Some(success))
            .await
    }

    /// Background health prober: every tick, probe mirrors not checked
    /// within the health-check interval. One failing iteration never stops
    /// the loop.
    pub fn spawn_health_prober(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(registry.config.probe_tick);
            loop {
                tick.tick().await;
                if let Err(e) = registry.probe_due_mirrors().await {
                    warn!(error = %e, "health prober iteration failed");
                    sleep(registry.config.error_backoff).await;
                }
            }
        })
    }

    async fn probe_due_mirrors(&self) -> DepotResult<()> {
        let now = Utc::now();
        let due: Vec<(String, String)> = self
            .mirrors
            .read()
            .await
            .values()
            .filter(|m| {
                (now - m.last_check).num_seconds()
                    > self.config.health_check_interval.as_secs() as i64
            })
            .map(|m| (m.id.clone(), m.url.clone()))
            .collect();

        for (mirror_id, url) in due {
            if let Err(e) = self.probe_mirror(&mirror_id, &url).await {
                warn!(mirror_id = %mirror_id, error = %e, "mirror probe failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn test_registry(dir: &std::path::Path) -> Arc<MirrorRegistry> {
        let store = MirrorStore::open(&dir.join("mirrors.redb")).unwrap();
        Arc::new(MirrorRegistry::new(store, MirrorConfig::default()).unwrap())
    }

    fn new_mirror(name: &str, priority: i32) -> NewMirror {
        NewMirror {
            name: name.to_string(),
            url: format!("http://{}.example", name),
            location: "test".to_string(),
            bandwidth_mbps: 100,
            supported_managers: vec!["apt".to_string()],
            priority,
            max_connections: 10,
        }
    }

    #[tokio::test]
    async fn new_mirrors_start_offline() {
        let dir = tempdir().unwrap();
        let registry = test_registry(dir.path());
        let id = registry.add_mirror(new_mirror("a", 1)).await.unwrap();

        let mirrors = registry.list_mirrors().await;
        assert_eq!(mirrors[0].id, id);
        assert_eq!(mirrors[0].status, MirrorStatus::Offline);
        assert!(registry.best_mirrors("apt", 3).await.is_empty());
    }

    #[tokio::test]
    async fn success_rate_is_exponentially_smoothed() {
        let dir = tempdir().unwrap();
        let registry = test_registry(dir.path());
        let id = registry.add_mirror(new_mirror("a", 1)).await.unwrap();

        registry
            .update_status(&id, MirrorStatus::Online, Some(0.2), Some(true))
            .await
            .unwrap();
        assert_eq!(registry.list_mirrors().await[0].success_rate, 1.0);

        registry
            .update_status(&id, MirrorStatus::Online, Some(0.2), Some(false))
            .await
            .unwrap();
        let rate = registry.list_mirrors().await[0].success_rate;
        assert!((rate - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn best_mirrors_ranks_by_priority_then_success_then_latency() {
        let dir = tempdir().unwrap();
        let registry = test_registry(dir.path());

        let a = registry.add_mirror(new_mirror("a", 2)).await.unwrap();
        let b = registry.add_mirror(new_mirror("b", 2)).await.unwrap();
        let c = registry.add_mirror(new_mirror("c", 1)).await.unwrap();

        // A(priority=2, success=0.9, rt=0.5), B(2, 0.95, 0.3), C(1, 0.99, 0.1)
        set_health(&registry, &a, 0.9, 0.5).await;
        set_health(&registry, &b, 0.95, 0.3).await;
        set_health(&registry, &c, 0.99, 0.1).await;

        let best = registry.best_mirrors("apt", 2).await;
        let names: Vec<&str> = best.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    async fn set_health(registry: &MirrorRegistry, id: &str, success_rate: f64, rt: f64) {
        registry
            .update_status(id, MirrorStatus::Online, Some(rt), None)
            .await
            .unwrap();
        // Drive the EMA to an exact value for the test.
        let mut mirrors = registry.mirrors.write().await;
        mirrors.get_mut(id).unwrap().success_rate = success_rate;
    }

    #[tokio::test]
    async fn saturated_mirrors_are_excluded() {
        let dir = tempdir().unwrap();
        let registry = test_registry(dir.path());
        let id = registry.add_mirror(new_mirror("a", 1)).await.unwrap();
        registry
            .update_status(&id, MirrorStatus::Online, Some(0.1), Some(true))
            .await
            .unwrap();

        {
            let mut mirrors = registry.mirrors.write().await;
            let m = mirrors.get_mut(&id).unwrap();
            m.current_connections = m.max_connections;
        }
        assert!(registry.best_mirrors("apt", 3).await.is_empty());
    }

    #[tokio::test]
    async fn begin_transfer_respects_connection_cap() {
        let dir = tempdir().unwrap();
        let registry = test_registry(dir.path());
        let mut params = new_mirror("a", 1);
        params.max_connections = 1;
        let id = registry.add_mirror(params).await.unwrap();

        assert!(registry.begin_transfer(&id).await);
        assert!(!registry.begin_transfer(&id).await);
        registry.end_transfer(&id).await;
        assert!(registry.begin_transfer(&id).await);
    }

    #[tokio::test]
    async fn mirrors_survive_restart() {
        let dir = tempdir().unwrap();
        let id = {
            let registry = test_registry(dir.path());
            registry.add_mirror(new_mirror("a", 1)).await.unwrap()
        };
        let registry = test_registry(dir.path());
        let mirrors = registry.list_mirrors().await;
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].id, id);
    }
}
