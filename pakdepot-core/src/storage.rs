//! Persistent state for the mirror registry.
//!
//! Two redb tables: `mirrors` (id -> bincode [`Mirror`]) and
//! `mirror_health_log` (log id -> bincode [`HealthLogEntry`]). Peer state is
//! deliberately in-memory only.

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::DepotResult;
use crate::types::{Mirror, MirrorStatus};

pub const MIRROR_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("mirrors");
pub const MIRROR_HEALTH_LOG_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("mirror_health_log");

/// One append-only health check record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthLogEntry {
    pub id: String,
    pub mirror_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: MirrorStatus,
    pub response_time: Option<f64>,
    pub success: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct MirrorStore {
    database: Arc<Database>,
}

impl MirrorStore {
    /// Open (or create) the mirror database and make sure both tables exist.
    pub fn open(path: &Path) -> DepotResult<Self> {
        let database = Database::create(path)?;
        let write_txn = database.begin_write()?;
        {
            write_txn.open_table(MIRROR_TABLE)?;
            write_txn.open_table(MIRROR_HEALTH_LOG_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self {
            database: Arc::new(database),
        })
    }

    pub fn load_mirrors(&self) -> DepotResult<Vec<Mirror>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(MIRROR_TABLE)?;
        let mut mirrors = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let mut mirror: Mirror = bincode::deserialize(value.value())?;
            // Connection counts are runtime state, not durable state.
            mirror.current_connections = 0;
            mirrors.push(mirror);
        }
        Ok(mirrors)
    }

    pub fn save_mirror(&self, mirror: &Mirror) -> DepotResult<()> {
        let encoded = bincode::serialize(mirror)?;
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(MIRROR_TABLE)?;
            table.insert(mirror.id.as_str(), encoded.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Returns `false` when the mirror was not present.
    pub fn delete_mirror(&self, mirror_id: &str) -> DepotResult<bool> {
        let write_txn = self.database.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(MIRROR_TABLE)?;
            // Bind before the table drops; the removed value borrows it.
            let removed = table.remove(mirror_id)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    pub fn append_health_log(&self, entry: &HealthLogEntry) -> DepotResult<()> {
        let encoded = bincode::serialize(entry)?;
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(MIRROR_HEALTH_LOG_TABLE)?;
            table.insert(entry.id.as_str(), encoded.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// All health log rows for one mirror, oldest first.
    pub fn health_log(&self, mirror_id: &str) -> DepotResult<Vec<HealthLogEntry>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(MIRROR_HEALTH_LOG_TABLE)?;
        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: HealthLogEntry = bincode::deserialize(value.value())?;
            if record.mirror_id == mirror_id {
                entries.push(record);
            }
        }
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}

impl HealthLogEntry {
    pub fn record(
        mirror_id: &str,
        status: MirrorStatus,
        response_time: Option<f64>,
        success: Option<bool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mirror_id: mirror_id.to_string(),
            timestamp: Utc::now(),
            status,
            response_time,
            success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_mirror(id: &str) -> Mirror {
        Mirror {
            id: id.to_string(),
            name: "test".to_string(),
            url: "http://mirror.example".to_string(),
            location: "eu-west".to_string(),
            bandwidth_mbps: 100,
            status: MirrorStatus::Offline,
            last_check: Utc::now(),
            success_rate: 0.0,
            response_time: 0.0,
            supported_managers: vec!["apt".to_string()],
            priority: 1,
            max_connections: 10,
            current_connections: 3,
        }
    }

    #[test]
    fn save_and_reload_mirror() {
        let dir = tempdir().unwrap();
        let store = MirrorStore::open(&dir.path().join("mirrors.redb")).unwrap();
        store.save_mirror(&sample_mirror("m1")).unwrap();

        let loaded = store.load_mirrors().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "m1");
        // Connection counts reset on load.
        assert_eq!(loaded[0].current_connections, 0);
    }

    #[test]
    fn delete_mirror_reports_presence() {
        let dir = tempdir().unwrap();
        let store = MirrorStore::open(&dir.path().join("mirrors.redb")).unwrap();
        store.save_mirror(&sample_mirror("m1")).unwrap();

        assert!(store.delete_mirror("m1").unwrap());
        assert!(!store.delete_mirror("m1").unwrap());
        assert!(store.load_mirrors().unwrap().is_empty());
    }

    #[test]
    fn health_log_is_per_mirror_and_ordered() {
        let dir = tempdir().unwrap();
        let store = MirrorStore::open(&dir.path().join("mirrors.redb")).unwrap();

        store
            .append_health_log(&HealthLogEntry::record(
                "m1",
                MirrorStatus::Online,
                Some(0.2),
                Some(true),
            ))
            .unwrap();
        store
            .append_health_log(&HealthLogEntry::record(
                "m2",
                MirrorStatus::Offline,
                None,
                Some(false),
            ))
            .unwrap();
        store
            .append_health_log(&HealthLogEntry::record(
                "m1",
                MirrorStatus::Slow,
                Some(10.0),
                Some(false),
            ))
            .unwrap();

        let log = store.health_log("m1").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].status, MirrorStatus::Online);
        assert_eq!(log[1].status, MirrorStatus::Slow);
    }
}
