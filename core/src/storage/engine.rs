//! Data item storage coordinating the page cache, page index, and log

use std::path::Path;

use crate::error::{KeelError, KeelResult};
use crate::storage::data_item::{self, DataItem, wrap_raw};
use crate::storage::ledger::TransactionLedger;
use crate::storage::page::{MAX_FREE_SPACE, Page, page_one};
use crate::storage::recovery::{self, RecoveryReport};
use crate::storage::{LogRecord, PageCache, PageIndex, PageNo, Uid, Wal, Xid};
use crate::storage::{address_to_uid, uid_to_address};

/// Attempts at finding or making a page with room before giving up
const MAX_INSERT_ATTEMPTS: usize = 5;

/// Page holding the shutdown marker
const META_PAGE: PageNo = 1;

/// Uid bits between the 16-bit page offset and the page number
const OFFSET_HIGH_BITS: Uid = 0xFFFF_0000;

/// Data item storage
pub struct StorageEngine {
    cache: PageCache,
    index: PageIndex,
    wal: Wal,
    recovery: RecoveryReport,
    clean_shutdown: bool,
}

impl StorageEngine {
    /// Create the page file and log for a new database
    pub fn create<P: AsRef<Path>>(db_path: P, log_path: P, memory: u64) -> KeelResult<Self> {
        let cache = PageCache::create(db_path, memory)?;
        let wal = Wal::create(log_path)?;
        cache.new_page(&page_one::init_raw());

        tracing::info!("Created page file with {} cache slots", cache.capacity());

        Ok(Self {
            cache,
            index: PageIndex::new(),
            wal,
            recovery: RecoveryReport {
                max_page_no: META_PAGE,
                ..RecoveryReport::default()
            },
            clean_shutdown: true,
        })
    }

    /// Open an existing database, running recovery against `ledger`
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        log_path: P,
        memory: u64,
        ledger: &TransactionLedger,
    ) -> KeelResult<Self> {
        let cache = PageCache::open(db_path, memory)?;
        let wal = Wal::open(log_path)?;

        let clean_shutdown = {
            let meta = cache.get_page(META_PAGE)?;
            page_one::closed_cleanly(&meta)
        };
        if !clean_shutdown {
            tracing::warn!("Previous run did not shut down cleanly");
        }

        let recovery = recovery::recover(ledger, &wal, &cache)?;

        {
            let meta = cache.get_page(META_PAGE)?;
            page_one::set_open(&meta);
            cache.flush(&meta);
        }

        let engine = Self {
            cache,
            index: PageIndex::new(),
            wal,
            recovery,
            clean_shutdown,
        };
        engine.fill_index()?;

        tracing::info!(
            "Opened page file: {} pages, {} cache slots",
            engine.cache.page_count(),
            engine.cache.capacity()
        );
        Ok(engine)
    }

    /// Register every data page with its free space
    fn fill_index(&self) -> KeelResult<()> {
        for page_no in META_PAGE + 1..=self.cache.page_count() {
            let page = self.cache.get_page(page_no)?;
            self.index.add(page_no, page.free_space());
        }
        Ok(())
    }

    /// Store `payload` as a new live item on behalf of `xid`
    pub fn insert(&self, xid: Xid, payload: &[u8]) -> KeelResult<Uid> {
        let raw = wrap_raw(payload);
        if raw.len() > MAX_FREE_SPACE {
            return Err(KeelError::DataTooLarge {
                size: raw.len(),
                max: MAX_FREE_SPACE,
            });
        }

        let mut target = None;
        for _ in 0..MAX_INSERT_ATTEMPTS {
            match self.index.select(raw.len()) {
                Some(info) if info.free_space >= raw.len() => {
                    target = Some(info);
                    break;
                }
                Some(info) => {
                    self.index.add(info.page_no, info.free_space);
                    self.allocate_data_page();
                }
                None => self.allocate_data_page(),
            }
        }
        let Some(info) = target else {
            tracing::warn!(
                "No page with {} free bytes after {} attempts",
                raw.len(),
                MAX_INSERT_ATTEMPTS
            );
            return Err(KeelError::DatabaseBusy);
        };

        let page = match self.cache.get_page(info.page_no) {
            Ok(page) => page,
            Err(e) => {
                // Give the page back so it is not lost to the index
                self.index.add(info.page_no, info.free_space);
                return Err(e);
            }
        };

        // Nobody else can insert here until the page goes back to the index
        self.wal.append(&LogRecord::Insert {
            xid,
            page_no: info.page_no,
            offset: page.fso(),
            raw: raw.clone(),
        });
        let offset = page.insert(&raw);
        self.index.add(info.page_no, page.free_space());

        tracing::trace!("Inserted {} bytes at page {} offset {}", raw.len(), info.page_no, offset);
        Ok(address_to_uid(info.page_no, offset))
    }

    fn allocate_data_page(&self) {
        let page_no = self.cache.new_page(&Page::init_raw());
        tracing::debug!("Allocated data page {}", page_no);
        self.index.add(page_no, MAX_FREE_SPACE);
    }

    /// Read the item at `uid`; `None` if it does not exist or is tombstoned
    pub fn read(&self, uid: Uid) -> KeelResult<Option<DataItem<'_>>> {
        let Some(item) = self.item(uid)? else {
            return Ok(None);
        };
        Ok(item.is_valid().then_some(item))
    }

    /// The item at `uid` whatever its valid flag
    fn item(&self, uid: Uid) -> KeelResult<Option<DataItem<'_>>> {
        if uid & OFFSET_HIGH_BITS != 0 {
            return Ok(None);
        }
        let (page_no, offset) = uid_to_address(uid);
        if page_no <= META_PAGE || page_no > self.cache.page_count() {
            return Ok(None);
        }

        let page = self.cache.get_page(page_no)?;
        if !data_item::in_bounds(&page.read(), offset) {
            return Ok(None);
        }
        Ok(Some(DataItem::parse(page, offset)))
    }

    /// Rewrite `item` in place on behalf of `xid`, returning its old image.
    ///
    /// `f` edits a copy of the image and must not change its length. The
    /// change is logged before it touches the page.
    pub fn update_item<F>(&self, xid: Xid, item: &DataItem<'_>, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut writer = item.lock_for_update();
        let old_raw = writer.raw().to_vec();
        let mut new_raw = old_raw.clone();
        f(&mut new_raw);
        debug_assert_eq!(old_raw.len(), new_raw.len());

        self.wal.append(&LogRecord::Update {
            xid,
            uid: item.uid(),
            old_raw: old_raw.clone(),
            new_raw: new_raw.clone(),
        });
        writer.write_raw(&new_raw);
        old_raw
    }

    /// Tombstone an item inserted by a transaction being aborted
    pub fn revert_insert(&self, uid: Uid) -> KeelResult<()> {
        if let Some(item) = self.item(uid)? {
            let mut writer = item.lock_for_update();
            let mut raw = writer.raw().to_vec();
            data_item::set_raw_invalid(&mut raw);
            writer.write_raw(&raw);
        }
        Ok(())
    }

    /// Restore the image an aborted transaction overwrote
    pub fn revert_update(&self, uid: Uid, old_raw: &[u8]) -> KeelResult<()> {
        if let Some(item) = self.item(uid)? {
            item.lock_for_update().write_raw(old_raw);
        }
        Ok(())
    }

    /// What the last open's recovery did
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Whether the previous run closed the database cleanly
    pub fn clean_shutdown(&self) -> bool {
        self.clean_shutdown
    }

    /// Number of pages in the page file
    pub fn page_count(&self) -> PageNo {
        self.cache.page_count()
    }

    /// Pages currently resident in the cache
    pub fn resident_pages(&self) -> usize {
        self.cache.resident()
    }

    /// Page cache capacity
    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Mark a clean shutdown and write everything back
    pub fn close(&self) -> KeelResult<()> {
        {
            let meta = self.cache.get_page(META_PAGE)?;
            page_one::set_closed(&meta);
        }
        self.cache.close()?;
        self.wal.flush()?;
        tracing::info!("Page file closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ledger::TxnStatus;
    use crate::storage::page::PAGE_SIZE;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const MEM: u64 = 32 * PAGE_SIZE as u64;

    fn paths(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
        (dir.join("t.db"), dir.join("t.log"), dir.join("t.xid"))
    }

    #[test]
    fn test_storage_engine_basic() {
        let dir = tempdir().unwrap();
        let (db, log, xid_path) = paths(dir.path());
        let ledger = TransactionLedger::create(&xid_path).unwrap();
        let engine = StorageEngine::create(&db, &log, MEM).unwrap();

        let xid = ledger.begin();
        let uid = engine.insert(xid, b"hello world").unwrap();
        ledger.commit(xid);

        let item = engine.read(uid).unwrap().unwrap();
        assert_eq!(item.payload(), b"hello world");
        assert_eq!(item.uid(), uid);
        drop(item);

        engine.close().unwrap();
        drop(engine);

        let engine = StorageEngine::open(&db, &log, MEM, &ledger).unwrap();
        assert!(engine.clean_shutdown());
        assert_eq!(engine.recovery_report().redone, 1);
        assert_eq!(engine.read(uid).unwrap().unwrap().payload(), b"hello world");
    }

    #[test]
    fn test_read_missing_and_tombstoned() {
        let dir = tempdir().unwrap();
        let (db, log, xid_path) = paths(dir.path());
        let ledger = TransactionLedger::create(&xid_path).unwrap();
        let engine = StorageEngine::create(&db, &log, MEM).unwrap();

        assert!(engine.read(address_to_uid(1, 2)).unwrap().is_none());
        assert!(engine.read(address_to_uid(9, 2)).unwrap().is_none());

        let xid = ledger.begin();
        let uid = engine.insert(xid, b"doomed").unwrap();
        assert!(engine.read(uid + 1).unwrap().is_none());
        assert!(engine.read(uid | (1 << 16)).unwrap().is_none());
        assert!(engine.revert_insert(uid | (1 << 20)).is_ok());
        assert!(engine.read(uid).unwrap().unwrap().is_valid());

        engine.revert_insert(uid).unwrap();
        assert!(engine.read(uid).unwrap().is_none());
    }

    #[test]
    fn test_update_item_and_revert() {
        let dir = tempdir().unwrap();
        let (db, log, xid_path) = paths(dir.path());
        let ledger = TransactionLedger::create(&xid_path).unwrap();
        let engine = StorageEngine::create(&db, &log, MEM).unwrap();

        let xid = ledger.begin();
        let uid = engine.insert(xid, b"aaaa").unwrap();
        let item = engine.read(uid).unwrap().unwrap();
        let old = engine.update_item(xid, &item, |raw| {
            raw[data_item::OF_DATA..].copy_from_slice(b"bbbb")
        });
        assert_eq!(old, wrap_raw(b"aaaa"));
        assert_eq!(item.payload(), b"bbbb");
        drop(item);

        engine.revert_update(uid, &old).unwrap();
        assert_eq!(engine.read(uid).unwrap().unwrap().payload(), b"aaaa");

        let records: Vec<_> = engine.wal.records().unwrap().map(Result::unwrap).collect();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[1], LogRecord::Update { .. }));
    }

    #[test]
    fn test_data_too_large() {
        let dir = tempdir().unwrap();
        let (db, log, _) = paths(dir.path());
        let engine = StorageEngine::create(&db, &log, MEM).unwrap();

        let res = engine.insert(1, &vec![0u8; MAX_FREE_SPACE]);
        assert!(matches!(res, Err(KeelError::DataTooLarge { .. })));

        // Exactly one page worth fits
        let uid = engine.insert(1, &vec![7u8; MAX_FREE_SPACE - data_item::OF_DATA]).unwrap();
        assert_eq!(uid_to_address(uid), (2, 2));
    }

    #[test]
    fn test_inserts_fill_pages() {
        let dir = tempdir().unwrap();
        let (db, log, _) = paths(dir.path());
        let engine = StorageEngine::create(&db, &log, MEM).unwrap();

        let payload = vec![1u8; 3000];
        let uids: Vec<_> = (0..5).map(|_| engine.insert(1, &payload).unwrap()).collect();
        let pages: Vec<_> = uids.iter().map(|uid| uid_to_address(*uid).0).collect();

        // Two 3003-byte items share a page, a third does not fit
        assert_eq!(pages, vec![2, 2, 3, 3, 4]);
        assert_eq!(engine.page_count(), 4);
    }

    #[test]
    fn test_crash_undoes_uncommitted() {
        let dir = tempdir().unwrap();
        let (db, log, xid_path) = paths(dir.path());
        let ledger = TransactionLedger::create(&xid_path).unwrap();
        let engine = StorageEngine::create(&db, &log, MEM).unwrap();

        let committed = ledger.begin();
        let kept = engine.insert(committed, b"kept").unwrap();
        ledger.commit(committed);
        let active = ledger.begin();
        let lost = engine.insert(active, b"lost").unwrap();

        // No close: simulate a crash
        drop(engine);
        drop(ledger);

        let ledger = TransactionLedger::open(&xid_path).unwrap();
        let engine = StorageEngine::open(&db, &log, MEM, &ledger).unwrap();
        assert!(!engine.clean_shutdown());
        assert!(ledger.is_aborted(active));
        assert_eq!(engine.read(kept).unwrap().unwrap().payload(), b"kept");
        assert!(engine.read(lost).unwrap().is_none());

        // The page went back to the index with its remaining space
        let next = engine.insert(ledger.begin(), b"next").unwrap();
        assert_eq!(uid_to_address(next).0, uid_to_address(kept).0);
    }
}
