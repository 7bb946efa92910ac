//! In-process allocation table.

use super::{AllocationStore, ScanFilter, ScanPage, StoreError, DEFAULT_PAGE_SIZE};
use crate::models::{AddressBlock, LockRecord, ReservationRecord, StoreItem, LOCK_KEY};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

/// Ordered table of items keyed by `cidr_block`.
///
/// Holds the conditional-write rules shared by every store adapter; callers
/// provide the atomicity by holding exclusive access for each call.
#[derive(Debug, Clone, Default)]
pub struct Table {
    items: BTreeMap<String, StoreItem>,
}

impl Table {
    pub fn from_items(items: Vec<StoreItem>) -> Self {
        Table {
            items: items.into_iter().map(|i| (i.key(), i)).collect(),
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &StoreItem> {
        self.items.values()
    }

    pub fn get(&self, key: &str) -> Option<&StoreItem> {
        self.items.get(key)
    }

    pub fn put_if_absent_or_unlocked(&mut self, record: &ReservationRecord) -> Result<(), StoreError> {
        let key = record.key();
        let writable = match self.items.get(&key) {
            None => true,
            Some(StoreItem::Reservation(existing)) => !existing.locked,
            Some(StoreItem::Lock(_)) => false,
        };
        if !writable {
            return Err(StoreError::ConditionalCheckFailed(key));
        }
        self.items.insert(key, StoreItem::Reservation(record.clone()));
        Ok(())
    }

    pub fn update_assigned_flag(
        &mut self,
        cidr: &AddressBlock,
        assigned: bool,
        cloud: &str,
        region: &str,
    ) -> Result<ReservationRecord, StoreError> {
        let key = cidr.to_string();
        match self.items.get_mut(&key) {
            Some(StoreItem::Reservation(record))
                if record.cloud == cloud.to_uppercase()
                    && record.region == region.to_uppercase()
                    && record.locked
                    && !(assigned && record.assigned) =>
            {
                record.assigned = assigned;
                Ok(record.clone())
            }
            _ => Err(StoreError::ConditionalCheckFailed(key)),
        }
    }

    /// Evaluate up to `page_size` items after `start_after`, then filter them.
    pub fn scan_page(
        &self,
        filter: &ScanFilter,
        start_after: Option<&str>,
        page_size: usize,
    ) -> ScanPage {
        let lower = match start_after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Unbounded,
        };
        let mut evaluated = self
            .items
            .range::<String, _>((lower, Bound::Unbounded))
            .peekable();

        let mut page = ScanPage::default();
        let mut last_key = None;
        for _ in 0..page_size.max(1) {
            let Some((key, item)) = evaluated.next() else {
                break;
            };
            if filter.matches(item) {
                if let Some(record) = item.as_reservation() {
                    page.items.push(record.clone());
                }
            }
            last_key = Some(key.clone());
        }
        if evaluated.peek().is_some() {
            page.last_evaluated_key = last_key;
        }
        page
    }

    pub fn delete(&mut self, key: &str) {
        self.items.remove(key);
    }

    pub fn put_lock_if_absent(&mut self, lock: &LockRecord) -> Result<(), StoreError> {
        if self.items.contains_key(LOCK_KEY) {
            return Err(StoreError::ConditionalCheckFailed(LOCK_KEY.to_string()));
        }
        self.items
            .insert(LOCK_KEY.to_string(), StoreItem::Lock(lock.clone()));
        Ok(())
    }

    pub fn get_lock(&self) -> Option<LockRecord> {
        match self.items.get(LOCK_KEY) {
            Some(StoreItem::Lock(lock)) => Some(lock.clone()),
            _ => None,
        }
    }

    pub fn replace_lock(&mut self, expected: &LockRecord, lock: &LockRecord) -> Result<(), StoreError> {
        match self.items.get_mut(LOCK_KEY) {
            Some(StoreItem::Lock(current)) if current == expected => {
                *current = lock.clone();
                Ok(())
            }
            _ => Err(StoreError::ConditionalCheckFailed(LOCK_KEY.to_string())),
        }
    }
}

/// [`AllocationStore`] over a mutex-guarded [`Table`].
#[derive(Debug)]
pub struct MemoryStore {
    table: Mutex<Table>,
    page_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        MemoryStore {
            table: Mutex::new(Table::default()),
            page_size,
        }
    }

    /// Seed the table, e.g. with existing reservations.
    pub fn with_items(self, items: Vec<StoreItem>) -> Self {
        MemoryStore {
            table: Mutex::new(Table::from_items(items)),
            page_size: self.page_size,
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, Table>, StoreError> {
        self.table
            .lock()
            .map_err(|e| StoreError::Backend(format!("table mutex poisoned: {e}")))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AllocationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoreItem>, StoreError> {
        Ok(self.table()?.get(key).cloned())
    }

    async fn put_if_absent_or_unlocked(&self, record: &ReservationRecord) -> Result<(), StoreError> {
        self.table()?.put_if_absent_or_unlocked(record)
    }

    async fn update_assigned_flag(
        &self,
        cidr: &AddressBlock,
        assigned: bool,
        cloud: &str,
        region: &str,
    ) -> Result<ReservationRecord, StoreError> {
        self.table()?
            .update_assigned_flag(cidr, assigned, cloud, region)
    }

    async fn scan_page(
        &self,
        filter: &ScanFilter,
        start_after: Option<&str>,
    ) -> Result<ScanPage, StoreError> {
        Ok(self.table()?.scan_page(filter, start_after, self.page_size))
    }

    async fn delete_if_exists(&self, key: &str) -> Result<(), StoreError> {
        self.table()?.delete(key);
        Ok(())
    }

    async fn put_lock_if_absent(&self, lock: &LockRecord) -> Result<(), StoreError> {
        self.table()?.put_lock_if_absent(lock)
    }

    async fn get_lock(&self) -> Result<Option<LockRecord>, StoreError> {
        Ok(self.table()?.get_lock())
    }

    async fn replace_lock(&self, expected: &LockRecord, lock: &LockRecord) -> Result<(), StoreError> {
        self.table()?.replace_lock(expected, lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> AddressBlock {
        s.parse().unwrap()
    }

    fn reserved(c: &str) -> ReservationRecord {
        ReservationRecord::reserve(cidr(c), "us-west-2", "aws", "itx-001")
    }

    #[tokio::test]
    async fn test_put_if_absent_or_unlocked() {
        let store = MemoryStore::new();
        store.put_if_absent_or_unlocked(&reserved("10.0.1.0/24")).await.unwrap();

        let err = store
            .put_if_absent_or_unlocked(&reserved("10.0.1.0/24"))
            .await
            .unwrap_err();
        assert!(err.is_conditional_check_failed());

        let mut released = reserved("10.0.2.0/24");
        released.locked = false;
        let store = store.with_items(vec![StoreItem::Reservation(released)]);
        store.put_if_absent_or_unlocked(&reserved("10.0.2.0/24")).await.unwrap();
        match store.get("10.0.2.0/24").await.unwrap() {
            Some(StoreItem::Reservation(r)) => assert!(r.locked),
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_assigned_flag_transitions() {
        let store = MemoryStore::new();
        let block = cidr("10.0.1.0/24");
        store.put_if_absent_or_unlocked(&reserved("10.0.1.0/24")).await.unwrap();

        let rec = store
            .update_assigned_flag(&block, true, "aws", "us-west-2")
            .await
            .unwrap();
        assert!(rec.assigned);

        // Double assign is refused, un-assign always allowed
        assert!(store
            .update_assigned_flag(&block, true, "AWS", "US-WEST-2")
            .await
            .unwrap_err()
            .is_conditional_check_failed());
        assert!(!store
            .update_assigned_flag(&block, false, "aws", "us-west-2")
            .await
            .unwrap()
            .assigned);
        assert!(!store
            .update_assigned_flag(&block, false, "aws", "us-west-2")
            .await
            .unwrap()
            .assigned);
    }

    #[tokio::test]
    async fn test_update_assigned_flag_preconditions() {
        let store = MemoryStore::new();
        store.put_if_absent_or_unlocked(&reserved("10.0.1.0/24")).await.unwrap();
        let block = cidr("10.0.1.0/24");

        for (cidr_block, cloud, region) in [
            (cidr("10.0.9.0/24"), "aws", "us-west-2"),
            (block, "azure", "us-west-2"),
            (block, "aws", "eu-west-1"),
        ] {
            assert!(store
                .update_assigned_flag(&cidr_block, true, cloud, region)
                .await
                .unwrap_err()
                .is_conditional_check_failed());
        }

        let mut unlocked = reserved("10.0.3.0/24");
        unlocked.locked = false;
        let store = store.with_items(vec![StoreItem::Reservation(unlocked)]);
        assert!(store
            .update_assigned_flag(&cidr("10.0.3.0/24"), false, "aws", "us-west-2")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_scan_paginates_and_skips_sentinel() {
        let store = MemoryStore::with_page_size(2);
        store.put_lock_if_absent(&LockRecord::expiring_in(60)).await.unwrap();
        for i in 0..5 {
            store
                .put_if_absent_or_unlocked(&reserved(&format!("10.0.{i}.0/24")))
                .await
                .unwrap();
        }
        let other = ReservationRecord::reserve(cidr("10.9.0.0/24"), "eu-west-1", "aws", "x");
        store.put_if_absent_or_unlocked(&other).await.unwrap();

        let filter = ScanFilter::locked("us-west-2", "aws");
        let first = store.scan_page(&filter, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.last_evaluated_key.as_deref(), Some("10.0.1.0/24"));

        let all = store.scan(&filter).await.unwrap();
        let keys: Vec<String> = all.iter().map(|r| r.key()).collect();
        assert_eq!(
            keys,
            vec![
                "10.0.0.0/24",
                "10.0.1.0/24",
                "10.0.2.0/24",
                "10.0.3.0/24",
                "10.0.4.0/24"
            ]
        );
    }

    #[tokio::test]
    async fn test_lock_primitives() {
        let store = MemoryStore::new();
        let held = LockRecord::expiring_at(100);
        store.put_lock_if_absent(&held).await.unwrap();
        assert!(store
            .put_lock_if_absent(&LockRecord::expiring_at(200))
            .await
            .unwrap_err()
            .is_conditional_check_failed());
        assert_eq!(store.get_lock().await.unwrap(), Some(held.clone()));

        let next = LockRecord::expiring_at(300);
        assert!(store
            .replace_lock(&LockRecord::expiring_at(999), &next)
            .await
            .is_err());
        store.replace_lock(&held, &next).await.unwrap();
        assert_eq!(store.get_lock().await.unwrap(), Some(next));

        store.delete_if_exists(LOCK_KEY).await.unwrap();
        store.delete_if_exists(LOCK_KEY).await.unwrap();
        assert_eq!(store.get_lock().await.unwrap(), None);
        assert!(store
            .replace_lock(&held, &LockRecord::expiring_at(1))
            .await
            .is_err());
    }
}
