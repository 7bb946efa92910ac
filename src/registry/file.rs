//! Region registry kept in a JSON file.
//!
//! The file maps region names to their registry value:
//! `{"us-west-2": {"master-cidr": {"AWS": {"cidrs": ["10.0.0.0/16"]}}}}`.

use super::{RegionPools, RegionRegistry, RegistryError, StaticRegistry};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn open(path: impl AsRef<Path>) -> Self {
        FileRegistry {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the whole registry file.
    pub fn load(&self) -> Result<StaticRegistry, RegistryError> {
        let file = self.path.display().to_string();
        let json = std::fs::read_to_string(&self.path).map_err(|source| RegistryError::Io {
            path: file.clone(),
            source,
        })?;

        let mut deserializer = serde_json::Deserializer::from_str(&json);
        let regions: BTreeMap<String, RegionPools> =
            serde_path_to_error::deserialize(&mut deserializer).map_err(|e| {
                log::error!("Error parsing region registry {file}: path={}", e.path());
                RegistryError::Parse {
                    file: file.clone(),
                    path: e.path().to_string(),
                    message: e.inner().to_string(),
                }
            })?;
        log::debug!("Loaded {} regions from {file}", regions.len());
        Ok(StaticRegistry::from_map(regions))
    }
}

#[async_trait]
impl RegionRegistry for FileRegistry {
    async fn lookup(&self, region: &str) -> Result<RegionPools, RegistryError> {
        let pools = self.load()?.lookup(region).await?;
        log::info!(
            "Retrieved region CIDR pools for {region}: clouds={:?}",
            pools.clouds().collect::<Vec<_>>()
        );
        Ok(pools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, json: &str) -> FileRegistry {
        let path = dir.path().join("regions.json");
        std::fs::write(&path, json).unwrap();
        FileRegistry::open(path)
    }

    #[tokio::test]
    async fn test_lookup_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = write(
            &dir,
            r#"{
                "us-west-2": {"master-cidr": {"AWS": {"cidrs": ["10.0.0.0/16"]}}},
                "EU-WEST-1": {"master-cidr": {"AWS": {"cidrs": ["10.8.0.0/14"]}}}
            }"#,
        );
        let pools = registry.lookup("US-WEST-2").await.unwrap();
        assert_eq!(pools.blocks("aws").unwrap()[0].to_string(), "10.0.0.0/16");
        let pools = registry.lookup("eu-west-1").await.unwrap();
        assert_eq!(pools.blocks("AWS").unwrap()[0].to_string(), "10.8.0.0/14");
        assert!(matches!(
            registry.lookup("ap-south-1").await,
            Err(RegistryError::RegionNotFound(_))
        ));
    }

    #[test]
    fn test_parse_error_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let registry = write(
            &dir,
            r#"{"us-west-2": {"master-cidr": {"AWS": {"cidrs": ["10.0.0.0/16", "bogus"]}}}}"#,
        );
        match registry.load() {
            Err(RegistryError::Parse { path, .. }) => {
                assert_eq!(path, "us-west-2.master-cidr.AWS.cidrs[1]")
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::open(dir.path().join("absent.json"));
        assert!(matches!(registry.load(), Err(RegistryError::Io { .. })));
    }
}
