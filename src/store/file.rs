//! JSON file backed allocation table.
//!
//! The table lives in one JSON array file and is re-read before every call,
//! so separate processes see each other's writes. Every call holds an
//! exclusive `flock` on a `<table>.flock` sidecar, which makes each
//! read-modify-write atomic across handles and processes on the same host.
//! The lock sentinel is a `<table>.lock` file, only ever written whole via
//! temp file and rename while that flock is held.

use super::{AllocationStore, ScanFilter, ScanPage, StoreError, Table, DEFAULT_PAGE_SIZE};
use crate::models::{AddressBlock, LockRecord, ReservationRecord, StoreItem, LOCK_KEY};
use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Paths of the table and its sidecars.
#[derive(Debug)]
struct TableFiles {
    path: PathBuf,
    lock_path: PathBuf,
    flock_path: PathBuf,
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write `bytes` to a fresh temp file next to `target`, then rename it over `target`.
fn write_replace(target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = sidecar(target, &format!(".tmp.{}.{seq}", std::process::id()));
    if let Err(e) = std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, target)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

impl TableFiles {
    /// Block until this handle holds the table flock.
    fn flock(&self) -> Result<Flock<File>, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&self.flock_path)?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_file, errno)| StoreError::Io(errno.into()))
    }

    fn load(&self) -> Result<Table, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(json) => {
                let items: Vec<StoreItem> = serde_json::from_str(&json)?;
                Ok(Table::from_items(items))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("CIDR table file not found, starting empty: {}", self.path.display());
                Ok(Table::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, table: &Table) -> Result<(), StoreError> {
        let items: Vec<&StoreItem> = table.items().collect();
        let json = serde_json::to_vec_pretty(&items)?;
        write_replace(&self.path, &json)?;
        log::debug!("Wrote {} items to {}", items.len(), self.path.display());
        Ok(())
    }

    /// Run `f` against the current table and persist it if `f` succeeds.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Table) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut table = self.load()?;
        let out = f(&mut table)?;
        self.persist(&table)?;
        Ok(out)
    }

    /// The current sentinel.
    ///
    /// A sentinel file that does not decode (left by a crash or edited by
    /// hand) reads as expired at its modification time, so it gets
    /// reclaimed instead of failing every caller.
    fn read_sentinel(&self) -> Result<Option<LockRecord>, StoreError> {
        let json = match std::fs::read_to_string(&self.lock_path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&json) {
            Ok(lock) => Ok(Some(lock)),
            Err(e) => {
                let modified = std::fs::metadata(&self.lock_path)?.modified()?;
                let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
                log::warn!(
                    "Unreadable lock file {} ({e}), treating it as expired",
                    self.lock_path.display()
                );
                Ok(Some(LockRecord::expiring_at(since_epoch.as_secs() as i64)))
            }
        }
    }

    fn write_sentinel(&self, lock: &LockRecord) -> Result<(), StoreError> {
        write_replace(&self.lock_path, &serde_json::to_vec(lock)?)
    }

    fn create_sentinel(&self, lock: &LockRecord) -> Result<(), StoreError> {
        if self.lock_path.exists() {
            return Err(StoreError::ConditionalCheckFailed(LOCK_KEY.to_string()));
        }
        self.write_sentinel(lock)
    }

    fn replace_sentinel(&self, expected: &LockRecord, lock: &LockRecord) -> Result<(), StoreError> {
        if self.read_sentinel()?.as_ref() != Some(expected) {
            return Err(StoreError::ConditionalCheckFailed(LOCK_KEY.to_string()));
        }
        self.write_sentinel(lock)
    }

    fn remove_sentinel(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug)]
pub struct JsonFileStore {
    files: Arc<TableFiles>,
    page_size: usize,
}

impl JsonFileStore {
    /// Open (or lazily create) the table at `path`.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        log::info!("Using CIDR table file: {}", path.display());
        JsonFileStore {
            files: Arc::new(TableFiles {
                lock_path: sidecar(&path, ".lock"),
                flock_path: sidecar(&path, ".flock"),
                path,
            }),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn path(&self) -> &Path {
        &self.files.path
    }

    /// Run `f` on the blocking pool while holding the table flock.
    async fn locked<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&TableFiles) -> Result<T, StoreError> + Send + 'static,
    {
        let files = self.files.clone();
        tokio::task::spawn_blocking(move || {
            let _flock = files.flock()?;
            f(&files)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("table file task failed: {e}")))?
    }
}

#[async_trait]
impl AllocationStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<StoreItem>, StoreError> {
        if key == LOCK_KEY {
            return Ok(self.get_lock().await?.map(StoreItem::Lock));
        }
        let key = key.to_string();
        self.locked(move |files| Ok(files.load()?.get(&key).cloned()))
            .await
    }

    async fn put_if_absent_or_unlocked(&self, record: &ReservationRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.locked(move |files| files.mutate(|table| table.put_if_absent_or_unlocked(&record)))
            .await
    }

    async fn update_assigned_flag(
        &self,
        cidr: &AddressBlock,
        assigned: bool,
        cloud: &str,
        region: &str,
    ) -> Result<ReservationRecord, StoreError> {
        let (cidr, cloud, region) = (*cidr, cloud.to_string(), region.to_string());
        self.locked(move |files| {
            files.mutate(|table| table.update_assigned_flag(&cidr, assigned, &cloud, &region))
        })
        .await
    }

    async fn scan_page(
        &self,
        filter: &ScanFilter,
        start_after: Option<&str>,
    ) -> Result<ScanPage, StoreError> {
        let filter = filter.clone();
        let start_after = start_after.map(str::to_string);
        let page_size = self.page_size;
        self.locked(move |files| {
            Ok(files
                .load()?
                .scan_page(&filter, start_after.as_deref(), page_size))
        })
        .await
    }

    async fn delete_if_exists(&self, key: &str) -> Result<(), StoreError> {
        if key == LOCK_KEY {
            return self.locked(TableFiles::remove_sentinel).await;
        }
        let key = key.to_string();
        self.locked(move |files| {
            files.mutate(|table| {
                table.delete(&key);
                Ok(())
            })
        })
        .await
    }

    async fn put_lock_if_absent(&self, lock: &LockRecord) -> Result<(), StoreError> {
        let lock = lock.clone();
        self.locked(move |files| files.create_sentinel(&lock)).await
    }

    async fn get_lock(&self) -> Result<Option<LockRecord>, StoreError> {
        self.locked(TableFiles::read_sentinel).await
    }

    async fn replace_lock(&self, expected: &LockRecord, lock: &LockRecord) -> Result<(), StoreError> {
        let (expected, lock) = (expected.clone(), lock.clone());
        self.locked(move |files| files.replace_sentinel(&expected, &lock))
            .await
    }
}
