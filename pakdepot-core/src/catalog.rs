//! Catalog collaborator seam.
//!
//! Package name -> size/checksum/version metadata comes from an external
//! catalog/search system. The coordinator only needs [`PackageCatalog`];
//! [`StaticCatalog`] is the in-memory implementation used by the CLI and
//! tests.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{DepotError, DepotResult};
use crate::types::PackageInfo;

#[async_trait]
pub trait PackageCatalog: Send + Sync {
    /// Resolve a package to its distribution metadata, or
    /// [`DepotError::PackageNotFound`].
    async fn resolve(
        &self,
        name: &str,
        manager: &str,
        version: Option<&str>,
    ) -> DepotResult<PackageInfo>;
}

/// In-memory catalog keyed by `manager:name`.
#[derive(Default)]
pub struct StaticCatalog {
    packages: RwLock<std::collections::HashMap<String, PackageInfo>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, info: PackageInfo) {
        let key = format!("{}:{}", info.manager, info.name);
        self.packages.write().await.insert(key, info);
    }
}

#[async_trait]
impl PackageCatalog for StaticCatalog {
    async fn resolve(
        &self,
        name: &str,
        manager: &str,
        version: Option<&str>,
    ) -> DepotResult<PackageInfo> {
        let key = format!("{}:{}", manager, name);
        let mut info = self
            .packages
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| DepotError::PackageNotFound {
                manager: manager.to_string(),
                name: name.to_string(),
            })?;
        if let Some(version) = version {
            info.version = version.to_string();
        }
        Ok(info)
    }
}
