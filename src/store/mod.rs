//! Allocation table storage.
//!
//! This module defines the key-value contract the allocator relies on:
//! - [`AllocationStore`] - single-record atomic primitives plus paginated scan
//! - [`memory`] - in-process table, the reference implementation
//! - [`file`] - JSON file table for single-host use

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::{MemoryStore, Table};

use crate::models::{AddressBlock, LockRecord, ReservationRecord, StoreItem};
use async_trait::async_trait;

/// Default number of items evaluated per scan page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The precondition of a conditional write did not hold.
    #[error("conditional check failed for {0}")]
    ConditionalCheckFailed(String),
    #[error("scan continuation key {0} repeated, possible infinite loop")]
    PaginationLoop(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conditional_check_failed(&self) -> bool {
        matches!(self, StoreError::ConditionalCheckFailed(_))
    }
}

/// Filter applied to reservation records during a scan.
///
/// Region and cloud are compared upper-cased. The lock sentinel never
/// matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub region: String,
    pub cloud: String,
    pub locked: Option<bool>,
    pub assigned: Option<bool>,
}

impl ScanFilter {
    /// Every locked record of a region and cloud, assigned or not.
    pub fn locked(region: &str, cloud: &str) -> Self {
        ScanFilter {
            region: region.to_uppercase(),
            cloud: cloud.to_uppercase(),
            locked: Some(true),
            assigned: None,
        }
    }

    pub fn with_assigned(mut self, assigned: bool) -> Self {
        self.assigned = Some(assigned);
        self
    }

    pub fn matches(&self, item: &StoreItem) -> bool {
        let Some(record) = item.as_reservation() else {
            return false;
        };
        record.region == self.region
            && record.cloud == self.cloud
            && self.locked.map_or(true, |l| record.locked == l)
            && self.assigned.map_or(true, |a| record.assigned == a)
    }
}

/// One page of scan results.
#[derive(Debug, Default)]
pub struct ScanPage {
    pub items: Vec<ReservationRecord>,
    /// Key to resume after; `None` once the table is exhausted.
    pub last_evaluated_key: Option<String>,
}

/// Key-value store holding reservations and the lock sentinel.
///
/// Every method is atomic for the single record it touches. Conditional
/// writes whose precondition fails return
/// [`StoreError::ConditionalCheckFailed`]; any other error is a backend fault.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoreItem>, StoreError>;

    /// Write `record` iff its key is absent or the existing record is unlocked.
    async fn put_if_absent_or_unlocked(&self, record: &ReservationRecord)
        -> Result<(), StoreError>;

    /// Set `assigned` on an existing, locked record of the given cloud and region.
    ///
    /// Setting `true` additionally requires the record to be unassigned.
    async fn update_assigned_flag(
        &self,
        cidr: &AddressBlock,
        assigned: bool,
        cloud: &str,
        region: &str,
    ) -> Result<ReservationRecord, StoreError>;

    /// Evaluate one page of items after `start_after`.
    async fn scan_page(
        &self,
        filter: &ScanFilter,
        start_after: Option<&str>,
    ) -> Result<ScanPage, StoreError>;

    async fn delete_if_exists(&self, key: &str) -> Result<(), StoreError>;

    /// Create the lock sentinel iff no sentinel exists.
    async fn put_lock_if_absent(&self, lock: &LockRecord) -> Result<(), StoreError>;

    async fn get_lock(&self) -> Result<Option<LockRecord>, StoreError>;

    /// Overwrite the sentinel iff it still equals `expected`.
    async fn replace_lock(&self, expected: &LockRecord, lock: &LockRecord)
        -> Result<(), StoreError>;

    /// Scan all pages, following continuation keys until exhausted.
    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ReservationRecord>, StoreError> {
        let mut records = Vec::new();
        let mut start_after: Option<String> = None;
        let mut count_pages = 0;

        loop {
            let page = self.scan_page(filter, start_after.as_deref()).await?;
            count_pages += 1;
            log::trace!(
                "scan page#{count_pages:2} matched=+{:3} next={:?}",
                page.items.len(),
                page.last_evaluated_key
            );
            records.extend(page.items);

            match page.last_evaluated_key {
                None => break,
                Some(key) if start_after.as_deref() == Some(key.as_str()) => {
                    return Err(StoreError::PaginationLoop(key));
                }
                Some(key) => start_after = Some(key),
            }
        }

        log::debug!(
            "scan {}/{} locked={:?} assigned={:?}: {} records in {count_pages} pages",
            filter.region,
            filter.cloud,
            filter.locked,
            filter.assigned,
            records.len()
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn record(cidr: &str, region: &str, cloud: &str, assigned: bool) -> ReservationRecord {
        let mut rec = ReservationRecord::reserve(cidr.parse().unwrap(), region, cloud, "acct");
        rec.assigned = assigned;
        rec
    }

    #[test]
    fn test_filter_matches() {
        let filter = ScanFilter::locked("us-west-2", "aws");
        let item = StoreItem::Reservation(record("10.0.0.0/24", "us-west-2", "AWS", true));
        assert!(filter.matches(&item));
        assert!(!filter.clone().with_assigned(false).matches(&item));
        assert!(!filter.matches(&StoreItem::Reservation(record(
            "10.0.0.0/24",
            "us-east-1",
            "AWS",
            true
        ))));
        assert!(!filter.matches(&StoreItem::Lock(LockRecord::expiring_in(60))));

        let mut unlocked = record("10.0.1.0/24", "us-west-2", "aws", false);
        unlocked.locked = false;
        assert!(!filter.matches(&StoreItem::Reservation(unlocked)));
    }

    /// Returns canned pages, used to drive the default `scan` loop.
    struct PagedStub {
        pages: Mutex<Vec<ScanPage>>,
    }

    #[async_trait]
    impl AllocationStore for PagedStub {
        async fn get(&self, _key: &str) -> Result<Option<StoreItem>, StoreError> {
            Ok(None)
        }
        async fn put_if_absent_or_unlocked(&self, _r: &ReservationRecord) -> Result<(), StoreError> {
            Ok(())
        }
        async fn update_assigned_flag(
            &self,
            cidr: &AddressBlock,
            _assigned: bool,
            _cloud: &str,
            _region: &str,
        ) -> Result<ReservationRecord, StoreError> {
            Err(StoreError::ConditionalCheckFailed(cidr.to_string()))
        }
        async fn scan_page(
            &self,
            _filter: &ScanFilter,
            _start_after: Option<&str>,
        ) -> Result<ScanPage, StoreError> {
            let mut pages = self.pages.lock().unwrap();
            Ok(if pages.is_empty() {
                ScanPage::default()
            } else {
                pages.remove(0)
            })
        }
        async fn delete_if_exists(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn put_lock_if_absent(&self, _lock: &LockRecord) -> Result<(), StoreError> {
            Ok(())
        }
        async fn get_lock(&self) -> Result<Option<LockRecord>, StoreError> {
            Ok(None)
        }
        async fn replace_lock(&self, _e: &LockRecord, _l: &LockRecord) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scan_follows_continuation_keys() {
        let stub = PagedStub {
            pages: Mutex::new(vec![
                ScanPage {
                    items: vec![record("10.0.0.0/24", "r", "c", false)],
                    last_evaluated_key: Some("10.0.0.0/24".into()),
                },
                ScanPage {
                    items: vec![],
                    last_evaluated_key: Some("10.0.5.0/24".into()),
                },
                ScanPage {
                    items: vec![record("10.0.9.0/24", "r", "c", true)],
                    last_evaluated_key: None,
                },
            ]),
        };
        let records = stub.scan(&ScanFilter::locked("r", "c")).await.unwrap();
        let cidrs: Vec<String> = records.iter().map(|r| r.key()).collect();
        assert_eq!(cidrs, vec!["10.0.0.0/24", "10.0.9.0/24"]);
    }

    #[tokio::test]
    async fn test_scan_detects_repeated_key() {
        let stub = PagedStub {
            pages: Mutex::new(vec![
                ScanPage {
                    items: vec![],
                    last_evaluated_key: Some("k".into()),
                },
                ScanPage {
                    items: vec![],
                    last_evaluated_key: Some("k".into()),
                },
            ]),
        };
        let err = stub.scan(&ScanFilter::locked("r", "c")).await.unwrap_err();
        assert!(matches!(err, StoreError::PaginationLoop(k) if k == "k"));
    }
}
