//! Database handle tying the ledger, storage engine, and version manager
//! together.

use serde::Serialize;

use crate::config::Config;
use crate::error::KeelResult;
use crate::storage::recovery::RecoveryReport;
use crate::storage::{
    IsolationLevel, PageCache, PageNo, StorageEngine, TransactionLedger, Uid, VersionManager, Xid,
};

/// Point-in-time engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub page_count: PageNo,
    pub resident_pages: usize,
    pub cache_capacity: usize,
    pub active_transactions: usize,
}

/// An open database
pub struct Database {
    vm: VersionManager,
}

impl Database {
    /// Create a new, empty database; fails if any of its files exist
    pub fn create(config: &Config) -> KeelResult<Self> {
        PageCache::capacity_for(config.memory.as_bytes())?;
        let ledger = TransactionLedger::create(config.ledger_path())?;
        let engine = StorageEngine::create(
            config.db_path(),
            config.log_path(),
            config.memory.as_bytes(),
        )?;

        tracing::info!("Created database at {:?} ({} cache)", config.path, config.memory);
        Ok(Self {
            vm: VersionManager::new(ledger, engine),
        })
    }

    /// Open an existing database, recovering from any crash
    pub fn open(config: &Config) -> KeelResult<Self> {
        PageCache::capacity_for(config.memory.as_bytes())?;
        let ledger = TransactionLedger::open(config.ledger_path())?;
        let engine = StorageEngine::open(
            config.db_path(),
            config.log_path(),
            config.memory.as_bytes(),
            &ledger,
        )?;

        tracing::info!("Opened database at {:?} ({} cache)", config.path, config.memory);
        Ok(Self {
            vm: VersionManager::new(ledger, engine),
        })
    }

    pub fn begin(&self, level: IsolationLevel) -> Xid {
        self.vm.begin(level)
    }

    pub fn read(&self, xid: Xid, uid: Uid) -> KeelResult<Option<Vec<u8>>> {
        self.vm.read(xid, uid)
    }

    pub fn insert(&self, xid: Xid, data: &[u8]) -> KeelResult<Uid> {
        self.vm.insert(xid, data)
    }

    pub fn delete(&self, xid: Xid, uid: Uid) -> KeelResult<bool> {
        self.vm.delete(xid, uid)
    }

    pub fn update(&self, xid: Xid, uid: Uid, data: &[u8]) -> KeelResult<Option<Uid>> {
        self.vm.update(xid, uid, data)
    }

    pub fn commit(&self, xid: Xid) -> KeelResult<()> {
        self.vm.commit(xid)
    }

    pub fn abort(&self, xid: Xid) -> KeelResult<()> {
        self.vm.abort(xid)
    }

    /// Get engine statistics
    pub fn stats(&self) -> DatabaseStats {
        let engine = self.vm.engine();
        DatabaseStats {
            page_count: engine.page_count(),
            resident_pages: engine.resident_pages(),
            cache_capacity: engine.cache_capacity(),
            active_transactions: self.vm.active_count(),
        }
    }

    /// What recovery did when this database was opened
    pub fn recovery_report(&self) -> &RecoveryReport {
        self.vm.engine().recovery_report()
    }

    /// Whether the previous run shut down cleanly
    pub fn clean_shutdown(&self) -> bool {
        self.vm.engine().clean_shutdown()
    }

    /// Abort open transactions, write everything back, and mark a clean
    /// shutdown
    pub fn close(self) -> KeelResult<()> {
        self.vm.close()?;
        tracing::info!("Database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySize;
    use crate::error::KeelError;
    use crate::storage::PAGE_SIZE;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().join("db"));

        let db = Database::create(&config).unwrap();
        let xid = db.begin(IsolationLevel::ReadCommitted);
        let uid = db.insert(xid, b"persisted").unwrap();
        db.commit(xid).unwrap();
        db.close().unwrap();

        let db = Database::open(&config).unwrap();
        assert!(db.clean_shutdown());
        let xid = db.begin(IsolationLevel::RepeatableRead);
        assert_eq!(db.read(xid, uid).unwrap(), Some(b"persisted".to_vec()));
        db.commit(xid).unwrap();

        let stats = db.stats();
        assert_eq!(stats.page_count, 2);
        assert_eq!(stats.cache_capacity, (64 << 20) / PAGE_SIZE);
        assert_eq!(stats.active_transactions, 0);
    }

    #[test]
    fn test_create_existing_and_open_missing() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().join("db"));

        assert!(matches!(Database::open(&config), Err(KeelError::FileNotExists(_))));
        Database::create(&config).unwrap().close().unwrap();
        assert!(matches!(Database::create(&config), Err(KeelError::FileExists(_))));
    }

    #[test]
    fn test_memory_too_small() {
        let dir = tempdir().unwrap();
        let config =
            Config::new(dir.path().join("db")).with_memory(MemorySize::bytes(4 * PAGE_SIZE as u64));
        assert!(matches!(
            Database::create(&config),
            Err(KeelError::MemoryTooSmall { pages: 4, .. })
        ));
        assert!(!config.ledger_path().exists());
    }
}
