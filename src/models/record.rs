//! Persisted allocation table records.

use super::AddressBlock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved key of the table lock sentinel. Never parses as a CIDR.
pub const LOCK_KEY: &str = "LOCKED";

/// A reserved CIDR block.
///
/// `assigned` is only ever true while `locked` is true.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReservationRecord {
    /// Primary key, exact CIDR notation.
    pub cidr_block: AddressBlock,
    /// Upper-cased region name.
    pub region: String,
    /// Upper-cased cloud provider.
    pub cloud: String,
    /// Upper-cased alias of the account the block was reserved for.
    pub account_alias: String,
    pub locked: bool,
    pub assigned: bool,
    /// When the block was reserved.
    pub lock_date: DateTime<Utc>,
}

impl ReservationRecord {
    /// A freshly reserved, not yet assigned block.
    pub fn reserve(cidr_block: AddressBlock, region: &str, cloud: &str, account_alias: &str) -> Self {
        ReservationRecord {
            cidr_block,
            region: region.to_uppercase(),
            cloud: cloud.to_uppercase(),
            account_alias: account_alias.to_uppercase(),
            locked: true,
            assigned: false,
            lock_date: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        self.cidr_block.to_string()
    }
}

/// The table-wide mutex sentinel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Always [`LOCK_KEY`].
    pub cidr_block: String,
    /// Absolute expiry, epoch seconds.
    pub lock_expiration: i64,
}

impl LockRecord {
    pub fn expiring_at(lock_expiration: i64) -> Self {
        LockRecord {
            cidr_block: LOCK_KEY.to_string(),
            lock_expiration,
        }
    }

    /// A sentinel expiring `ttl_secs` from now.
    pub fn expiring_in(ttl_secs: i64) -> Self {
        Self::expiring_at(Utc::now().timestamp() + ttl_secs)
    }

    /// A holder is abandoned once `now` is strictly past its expiration.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.lock_expiration
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }
}

/// One row of the allocation table.
///
/// The sentinel carries none of the reservation fields, so untagged
/// decoding tells the two apart the same way the table itself does.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum StoreItem {
    Reservation(ReservationRecord),
    Lock(LockRecord),
}

impl StoreItem {
    pub fn key(&self) -> String {
        match self {
            StoreItem::Reservation(r) => r.key(),
            StoreItem::Lock(l) => l.cidr_block.clone(),
        }
    }

    pub fn as_reservation(&self) -> Option<&ReservationRecord> {
        match self {
            StoreItem::Reservation(r) => Some(r),
            StoreItem::Lock(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_uppercases_fields() {
        let rec = ReservationRecord::reserve(
            "10.0.1.0/24".parse().unwrap(),
            "us-west-2",
            "aws",
            "itx-001",
        );
        assert_eq!(rec.region, "US-WEST-2");
        assert_eq!(rec.cloud, "AWS");
        assert_eq!(rec.account_alias, "ITX-001");
        assert!(rec.locked);
        assert!(!rec.assigned);
        assert_eq!(rec.key(), "10.0.1.0/24");
    }

    #[test]
    fn test_lock_expiry_is_strict() {
        let lock = LockRecord::expiring_at(100);
        assert!(!lock.is_expired_at(99));
        assert!(!lock.is_expired_at(100));
        assert!(lock.is_expired_at(101));
        assert!(!LockRecord::expiring_in(60).is_expired());
    }

    #[test]
    fn test_store_item_decodes_both_kinds() {
        let json = r#"[
            {"cidr_block": "LOCKED", "lock_expiration": 1700000000},
            {"cidr_block": "10.1.1.0/24", "region": "US-WEST-2", "cloud": "AWS",
             "account_alias": "ITX-001", "locked": true, "assigned": true,
             "lock_date": "2024-01-02T03:04:05Z"}
        ]"#;
        let items: Vec<StoreItem> = serde_json::from_str(json).unwrap();
        assert_eq!(items[0], StoreItem::Lock(LockRecord::expiring_at(1700000000)));
        assert_eq!(items[0].key(), LOCK_KEY);
        let rec = items[1].as_reservation().unwrap();
        assert_eq!(rec.cidr_block.to_string(), "10.1.1.0/24");
        assert!(rec.assigned);
        assert!(items[0].as_reservation().is_none());
    }
}
