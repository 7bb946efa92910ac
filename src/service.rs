//! Reserve, list and flag operations over the allocation table.
//!
//! Reservation and availability listing run under the table lock so the
//! scan and the write that follows it see one consistent table. Flag updates
//! and used-block listing are single store calls and run without it.

use crate::error::{AllocationError, Result};
use crate::lock::{DistributedLock, LockSettings};
use crate::models::{AddressBlock, ReservationRecord};
use crate::processing::{find_all, find_first};
use crate::registry::RegionRegistry;
use crate::request::{FlagRequest, ListRequest, ReserveRequest, UsedRequest};
use crate::store::{AllocationStore, ScanFilter};
use std::sync::Arc;

pub struct AllocationService {
    store: Arc<dyn AllocationStore>,
    registry: Arc<dyn RegionRegistry>,
    lock: DistributedLock,
}

impl AllocationService {
    /// Service whose lock sentinel lives in `store`.
    pub fn new(
        store: Arc<dyn AllocationStore>,
        registry: Arc<dyn RegionRegistry>,
        settings: LockSettings,
    ) -> Self {
        let lock = DistributedLock::on_store(store.clone(), settings);
        Self::with_lock(store, registry, lock)
    }

    pub fn with_lock(
        store: Arc<dyn AllocationStore>,
        registry: Arc<dyn RegionRegistry>,
        lock: DistributedLock,
    ) -> Self {
        AllocationService {
            store,
            registry,
            lock,
        }
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Top-level blocks configured for `region` and `cloud`.
    async fn top_blocks(&self, region: &str, cloud: &str) -> Result<Vec<AddressBlock>> {
        let pools = self.registry.lookup(region).await?;
        let blocks = pools
            .blocks(cloud)
            .ok_or_else(|| AllocationError::InvalidCloudProvider {
                region: region.to_string(),
                cloud: cloud.to_uppercase(),
            })?;
        log::info!("Retrieved region CIDR list for {region}/{cloud}: {blocks:?}");
        Ok(blocks.to_vec())
    }

    /// Every locked block of `region` and `cloud`.
    async fn used_blocks(&self, region: &str, cloud: &str) -> Result<Vec<AddressBlock>> {
        let used: Vec<AddressBlock> = self
            .store
            .scan(&ScanFilter::locked(region, cloud))
            .await?
            .into_iter()
            .map(|r| r.cidr_block)
            .collect();
        log::info!("Retrieved {} locked CIDR blocks in {region}", used.len());
        Ok(used)
    }

    /// Reserve the first free block of `/prefix_len` for `account_alias`.
    pub async fn reserve(
        &self,
        region: &str,
        cloud: &str,
        prefix_len: u8,
        account_alias: &str,
    ) -> Result<ReservationRecord> {
        log::info!(
            "Request info: subnet size /{prefix_len}, region {region}, cloud {cloud}, account_alias {account_alias}"
        );
        self.lock
            .run_locked(async {
                let top = self.top_blocks(region, cloud).await?;
                let used = self.used_blocks(region, cloud).await?;
                let candidate = find_first(&top, &used, prefix_len).map_err(|e| {
                    log::info!("No valid subnet found: {e}");
                    e
                })?;

                log::info!("Allocating CIDR block {candidate} in {region}");
                let record = ReservationRecord::reserve(candidate, region, cloud, account_alias);
                match self.store.put_if_absent_or_unlocked(&record).await {
                    Ok(()) => {
                        log::info!("Reserved CIDR block {candidate} for {}", record.account_alias);
                        Ok(record)
                    }
                    Err(e) if e.is_conditional_check_failed() => {
                        log::warn!("CIDR block {candidate} already exists");
                        Err(AllocationError::AlreadyReserved(candidate))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    pub async fn reserve_request(&self, req: &ReserveRequest) -> Result<ReservationRecord> {
        self.reserve(&req.region, &req.cloud, req.prefix_len, &req.account_alias)
            .await
    }

    /// Set or clear `assigned` on a reserved block.
    ///
    /// Fails with [`AllocationError::InvalidTransition`] when the block is not
    /// reserved in this region and cloud, or is already assigned and
    /// `assigned` is true.
    pub async fn update_assignment_flag(
        &self,
        cidr: &AddressBlock,
        assigned: bool,
        cloud: &str,
        region: &str,
    ) -> Result<ReservationRecord> {
        log::info!("Updating CIDR {cidr} in {region}/{cloud}: assigned={assigned}");
        match self
            .store
            .update_assigned_flag(cidr, assigned, cloud, region)
            .await
        {
            Ok(record) => {
                log::info!("Updated CIDR {cidr}: assigned={}", record.assigned);
                Ok(record)
            }
            Err(e) if e.is_conditional_check_failed() => {
                log::warn!("CIDR {cidr} cannot be assigned={assigned}");
                Err(AllocationError::InvalidTransition(*cidr))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn flag(&self, req: &FlagRequest) -> Result<ReservationRecord> {
        self.update_assignment_flag(&req.cidr, req.assigned, &req.cloud, &req.region)
            .await
    }

    /// Every free block of `/prefix_len`, possibly none.
    pub async fn list_available(
        &self,
        region: &str,
        cloud: &str,
        prefix_len: u8,
    ) -> Result<Vec<AddressBlock>> {
        self.lock
            .run_locked(async {
                let top = self.top_blocks(region, cloud).await?;
                let used = self.used_blocks(region, cloud).await?;
                let available = find_all(&top, &used, prefix_len);
                log::info!("All available /{prefix_len} CIDRs in {region}: {}", available.len());
                Ok(available)
            })
            .await
    }

    /// Records of `region` and `cloud` in use.
    ///
    /// With `locked` set, only locked records whose `assigned` equals
    /// `assigned`; otherwise every locked record.
    pub async fn list_used(
        &self,
        region: &str,
        cloud: &str,
        locked: bool,
        assigned: bool,
    ) -> Result<Vec<ReservationRecord>> {
        let mut filter = ScanFilter::locked(region, cloud);
        if locked {
            filter = filter.with_assigned(assigned);
        }
        Ok(self.store.scan(&filter).await?)
    }

    pub async fn used(&self, req: &UsedRequest) -> Result<Vec<ReservationRecord>> {
        self.list_used(&req.region, &req.cloud, req.locked, req.assigned)
            .await
    }

    /// Used blocks when `locked` was requested, else available blocks.
    ///
    /// An empty availability list is [`AllocationError::NoCapacity`].
    pub async fn list(&self, req: &ListRequest) -> Result<Vec<AddressBlock>> {
        log::info!(
            "Request info: subnet size /{}, region {}, assigned {}, locked {}, cloud {}",
            req.prefix_len,
            req.region,
            req.assigned,
            req.locked,
            req.cloud
        );
        if req.locked {
            self.top_blocks(&req.region, &req.cloud).await?;
            let used = self
                .list_used(&req.region, &req.cloud, req.locked, req.assigned)
                .await?;
            return Ok(used.into_iter().map(|r| r.cidr_block).collect());
        }

        let available = self
            .list_available(&req.region, &req.cloud, req.prefix_len)
            .await?;
        if available.is_empty() {
            return Err(AllocationError::NoCapacity(req.prefix_len));
        }
        Ok(available)
    }
}
