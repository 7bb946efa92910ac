//! Region registry: top-level CIDR pools per region and cloud provider.
//!
//! - [`RegionRegistry`] - async lookup of a region's pools
//! - [`StaticRegistry`] - in-memory registry, built up front
//! - [`FileRegistry`] - JSON document on disk, re-read on each lookup

mod file;

pub use file::FileRegistry;

use crate::models::AddressBlock;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No root CIDR list found for region {0}")]
    RegionNotFound(String),
    #[error("Error reading region registry {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Error parsing region registry {file}: path={path} error={message}")]
    Parse {
        file: String,
        path: String,
        message: String,
    },
}

/// Pools of one cloud provider.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CloudPool {
    #[serde(default)]
    pub cidrs: Vec<AddressBlock>,
}

/// Registry value of one region: `{"master-cidr": {"AWS": {"cidrs": [..]}}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RegionPools {
    #[serde(rename = "master-cidr", default)]
    master_cidr: BTreeMap<String, CloudPool>,
}

impl RegionPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cloud(mut self, cloud: &str, cidrs: Vec<AddressBlock>) -> Self {
        self.master_cidr
            .insert(cloud.to_uppercase(), CloudPool { cidrs });
        self
    }

    /// Top-level blocks of `cloud`, in registry order; `None` if the cloud is unknown.
    pub fn blocks(&self, cloud: &str) -> Option<&[AddressBlock]> {
        let cloud = cloud.to_uppercase();
        self.master_cidr
            .iter()
            .find(|(name, _)| name.to_uppercase() == cloud)
            .map(|(_, pool)| pool.cidrs.as_slice())
    }

    pub fn clouds(&self) -> impl Iterator<Item = &str> {
        self.master_cidr.keys().map(String::as_str)
    }
}

#[async_trait]
pub trait RegionRegistry: Send + Sync {
    /// Pools configured for `region`, matched case-insensitively.
    async fn lookup(&self, region: &str) -> Result<RegionPools, RegistryError>;
}

/// Registry held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    // Keyed by lower-cased region name
    regions: HashMap<String, RegionPools>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, region: &str, pools: RegionPools) -> Self {
        self.regions.insert(region.to_lowercase(), pools);
        self
    }

    pub fn from_map(regions: BTreeMap<String, RegionPools>) -> Self {
        StaticRegistry {
            regions: regions
                .into_iter()
                .map(|(region, pools)| (region.to_lowercase(), pools))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn get(&self, region: &str) -> Result<RegionPools, RegistryError> {
        self.regions
            .get(&region.to_lowercase())
            .cloned()
            .ok_or_else(|| RegistryError::RegionNotFound(region.to_string()))
    }
}

#[async_trait]
impl RegionRegistry for StaticRegistry {
    async fn lookup(&self, region: &str) -> Result<RegionPools, RegistryError> {
        self.get(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> RegionPools {
        serde_json::from_str(
            r#"{"master-cidr": {"AWS": {"cidrs": ["10.0.0.0/16", "10.1.0.0/16"]}, "azure": {"cidrs": []}}}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_blocks_by_cloud() {
        let pools = pools();
        let aws = pools.blocks("aws").unwrap();
        assert_eq!(aws.len(), 2);
        assert_eq!(aws[1].to_string(), "10.1.0.0/16");
        assert_eq!(pools.blocks("AZURE").unwrap().len(), 0);
        assert!(pools.blocks("gcp").is_none());
        assert_eq!(pools.clouds().collect::<Vec<_>>(), vec!["AWS", "azure"]);
    }

    #[test]
    fn test_invalid_cidr_in_pool_is_rejected() {
        let err = serde_json::from_str::<RegionPools>(
            r#"{"master-cidr": {"AWS": {"cidrs": ["10.0.0.1/16"]}}}"#,
        );
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_static_lookup_ignores_case() {
        let registry = StaticRegistry::new().with_region("US-West-2", pools());
        assert_eq!(registry.lookup("us-west-2").await.unwrap(), pools());
        assert_eq!(registry.lookup("US-WEST-2").await.unwrap(), pools());
        assert!(matches!(
            registry.lookup("eu-west-1").await,
            Err(RegistryError::RegionNotFound(r)) if r == "eu-west-1"
        ));
    }

    #[test]
    fn test_with_cloud_uppercases() {
        let pools = RegionPools::new().with_cloud("aws", vec!["10.0.0.0/8".parse().unwrap()]);
        assert_eq!(pools.clouds().collect::<Vec<_>>(), vec!["AWS"]);
        assert!(pools.blocks("Aws").is_some());
    }
}
