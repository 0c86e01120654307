//! Transaction management

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{KeelError, KeelResult};
use crate::storage::mvcc::{self, Entry, Snapshot};
use crate::storage::{StorageEngine, TransactionLedger, Uid, Xid};
use crate::storage::lock::LockTable;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
}

/// A change to undo if the transaction aborts
#[derive(Debug)]
enum Undo {
    Insert(Uid),
    Update { uid: Uid, old_raw: Vec<u8> },
}

#[derive(Default)]
struct TxnState {
    undo: Vec<Undo>,
    /// Aborted by the engine; the caller has not acknowledged it yet
    auto_aborted: bool,
}

/// A running transaction
pub struct Transaction {
    snapshot: Snapshot,
    state: Mutex<TxnState>,
}

impl Transaction {
    fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            state: Mutex::new(TxnState::default()),
        }
    }

    pub fn xid(&self) -> Xid {
        self.snapshot.xid
    }

    pub fn level(&self) -> IsolationLevel {
        self.snapshot.level
    }

    /// Whether the engine has already aborted this transaction
    pub fn is_aborted(&self) -> bool {
        self.state.lock().auto_aborted
    }

    /// Number of changes that would be reverted on abort
    pub fn pending_changes(&self) -> usize {
        self.state.lock().undo.len()
    }
}

/// Versioned reads and writes on top of the storage engine
pub struct VersionManager {
    ledger: TransactionLedger,
    engine: StorageEngine,
    locks: LockTable,
    active: Mutex<HashMap<Xid, Arc<Transaction>>>,
}

impl VersionManager {
    pub fn new(ledger: TransactionLedger, engine: StorageEngine) -> Self {
        Self {
            ledger,
            engine,
            locks: LockTable::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction
    pub fn begin(&self, level: IsolationLevel) -> Xid {
        let mut active = self.active.lock();
        let xid = self.ledger.begin();

        let running = match level {
            IsolationLevel::RepeatableRead => active.keys().copied().collect(),
            IsolationLevel::ReadCommitted => HashSet::new(),
        };
        active.insert(xid, Arc::new(Transaction::new(Snapshot::new(xid, level, running))));

        tracing::debug!("Began transaction {} ({:?})", xid, level);
        xid
    }

    /// Look up a live transaction
    pub fn transaction(&self, xid: Xid) -> Option<Arc<Transaction>> {
        self.active.lock().get(&xid).cloned()
    }

    fn usable(&self, xid: Xid) -> KeelResult<Arc<Transaction>> {
        let txn = self
            .transaction(xid)
            .ok_or(KeelError::NoSuchTransaction(xid))?;
        if txn.is_aborted() {
            return Err(KeelError::TransactionAborted(xid));
        }
        Ok(txn)
    }

    /// Read the version of `uid` visible to `xid`
    pub fn read(&self, xid: Xid, uid: Uid) -> KeelResult<Option<Vec<u8>>> {
        let txn = self.usable(xid)?;
        let Some(item) = self.engine.read(uid)? else {
            return Ok(None);
        };

        let entry = Entry::decode(&item.payload())?;
        if mvcc::is_visible(&self.ledger, &txn.snapshot, &entry) {
            Ok(Some(entry.data))
        } else {
            Ok(None)
        }
    }

    /// Insert a new row version
    pub fn insert(&self, xid: Xid, data: &[u8]) -> KeelResult<Uid> {
        let txn = self.usable(xid)?;
        let uid = self.engine.insert(xid, &Entry::new(xid, data).encode())?;
        txn.state.lock().undo.push(Undo::Insert(uid));
        Ok(uid)
    }

    /// Delete the version of `uid` visible to `xid`.
    ///
    /// Returns `false` if there is nothing visible to delete. Blocks while
    /// another transaction holds the row.
    pub fn delete(&self, xid: Xid, uid: Uid) -> KeelResult<bool> {
        let txn = self.usable(xid)?;

        {
            let Some(item) = self.engine.read(uid)? else {
                return Ok(false);
            };
            let entry = Entry::decode(&item.payload())?;
            if !mvcc::is_visible(&self.ledger, &txn.snapshot, &entry) {
                return Ok(false);
            }
        }

        match self.locks.add(xid, uid) {
            Ok(None) => {}
            Ok(Some(wait)) => {
                if !wait.wait() {
                    return Err(KeelError::TransactionAborted(xid));
                }
            }
            Err(deadlock) => {
                self.auto_abort(&txn, "deadlock")?;
                return Err(deadlock.into());
            }
        }

        // The row may have changed while we waited
        let Some(item) = self.engine.read(uid)? else {
            return Ok(false);
        };
        let entry = Entry::decode(&item.payload())?;

        if entry.xmax == xid {
            return Ok(false);
        }
        if mvcc::is_version_skip(&self.ledger, &txn.snapshot, &entry) {
            drop(item);
            self.auto_abort(&txn, "version skip")?;
            return Err(KeelError::ConcurrentUpdate(xid));
        }
        if !mvcc::is_visible(&self.ledger, &txn.snapshot, &entry) {
            return Ok(false);
        }

        let old_raw = self
            .engine
            .update_item(xid, &item, |raw| mvcc::set_raw_xmax(raw, xid));
        txn.state.lock().undo.push(Undo::Update { uid, old_raw });
        Ok(true)
    }

    /// Replace the visible version of `uid` with `data`, returning the new
    /// version's uid, or `None` if nothing was visible.
    pub fn update(&self, xid: Xid, uid: Uid, data: &[u8]) -> KeelResult<Option<Uid>> {
        if !self.delete(xid, uid)? {
            return Ok(None);
        }
        self.insert(xid, data).map(Some)
    }

    /// Commit a transaction
    pub fn commit(&self, xid: Xid) -> KeelResult<()> {
        let txn = self.usable(xid)?;
        {
            // A snapshot taken by `begin` either lists xid as running or sees
            // it committed
            let mut active = self.active.lock();
            self.ledger.commit(xid);
            active.remove(&xid);
        }

        // Waiters must observe the commit once they are woken
        self.locks.remove(xid);

        tracing::debug!("Committed transaction {} ({} changes)", xid, txn.pending_changes());
        Ok(())
    }

    /// Abort a transaction, reverting its changes
    pub fn abort(&self, xid: Xid) -> KeelResult<()> {
        let txn = self
            .transaction(xid)
            .ok_or(KeelError::NoSuchTransaction(xid))?;

        if !txn.is_aborted() {
            self.rollback(&txn)?;
        }
        self.active.lock().remove(&xid);
        tracing::debug!("Aborted transaction {}", xid);
        Ok(())
    }

    fn auto_abort(&self, txn: &Transaction, cause: &str) -> KeelResult<()> {
        tracing::info!("Aborting transaction {}: {}", txn.xid(), cause);
        self.rollback(txn)
    }

    /// Revert changes newest first, then mark the ledger and release locks
    fn rollback(&self, txn: &Transaction) -> KeelResult<()> {
        let mut state = txn.state.lock();
        while let Some(undo) = state.undo.pop() {
            let res = match &undo {
                Undo::Insert(uid) => self.engine.revert_insert(*uid),
                Undo::Update { uid, old_raw } => self.engine.revert_update(*uid, old_raw),
            };
            if let Err(e) = res {
                // Leave it for the next attempt (or crash recovery)
                state.undo.push(undo);
                return Err(e);
            }
        }

        self.ledger.abort(txn.xid());
        self.locks.remove(txn.xid());
        state.auto_aborted = true;
        Ok(())
    }

    /// Number of transactions begun and not yet committed or aborted
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    /// Abort whatever is still running and close the underlying files
    pub fn close(self) -> KeelResult<()> {
        let running: Vec<Xid> = self.active.lock().keys().copied().collect();
        for xid in running {
            tracing::warn!("Aborting transaction {} left open at close", xid);
            self.abort(xid)?;
        }

        self.engine.close()?;
        self.ledger.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;
    use crate::storage::ledger::TxnStatus;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use tempfile::tempdir;

    fn create(dir: &Path) -> VersionManager {
        let ledger = TransactionLedger::create(dir.join("t.xid")).unwrap();
        let engine =
            StorageEngine::create(dir.join("t.db"), dir.join("t.log"), 32 * PAGE_SIZE as u64)
                .unwrap();
        VersionManager::new(ledger, engine)
    }

    #[test]
    fn test_transaction_lifecycle() {
        let dir = tempdir().unwrap();
        let vm = create(dir.path());

        let t1 = vm.begin(IsolationLevel::ReadCommitted);
        let uid = vm.insert(t1, b"row").unwrap();
        assert_eq!(vm.read(t1, uid).unwrap(), Some(b"row".to_vec()));

        // Not visible to others until committed
        let t2 = vm.begin(IsolationLevel::ReadCommitted);
        assert_eq!(vm.read(t2, uid).unwrap(), None);

        vm.commit(t1).unwrap();
        assert_eq!(vm.read(t2, uid).unwrap(), Some(b"row".to_vec()));
        assert!(vm.ledger().is_committed(t1));
        assert_eq!(vm.active_count(), 1);

        assert!(matches!(vm.read(t1, uid), Err(KeelError::NoSuchTransaction(_))));
    }

    #[test]
    fn test_delete_and_abort() {
        let dir = tempdir().unwrap();
        let vm = create(dir.path());

        let t1 = vm.begin(IsolationLevel::ReadCommitted);
        let uid = vm.insert(t1, b"row").unwrap();
        vm.commit(t1).unwrap();

        let t2 = vm.begin(IsolationLevel::ReadCommitted);
        assert!(vm.delete(t2, uid).unwrap());
        assert!(!vm.delete(t2, uid).unwrap());
        assert_eq!(vm.read(t2, uid).unwrap(), None);
        vm.abort(t2).unwrap();
        assert!(vm.ledger().is_aborted(t2));

        // The delete was reverted
        let t3 = vm.begin(IsolationLevel::ReadCommitted);
        assert_eq!(vm.read(t3, uid).unwrap(), Some(b"row".to_vec()));
        let item = vm.engine().read(uid).unwrap().unwrap();
        assert_eq!(Entry::decode(&item.payload()).unwrap().xmax, 0);
    }

    #[test]
    fn test_abort_reverts_inserts() {
        let dir = tempdir().unwrap();
        let vm = create(dir.path());

        let t1 = vm.begin(IsolationLevel::ReadCommitted);
        let uid = vm.insert(t1, b"gone").unwrap();
        vm.abort(t1).unwrap();

        assert!(vm.engine().read(uid).unwrap().is_none());
        assert!(matches!(vm.abort(t1), Err(KeelError::NoSuchTransaction(_))));
    }

    #[test]
    fn test_update_replaces_version() {
        let dir = tempdir().unwrap();
        let vm = create(dir.path());

        let t1 = vm.begin(IsolationLevel::ReadCommitted);
        let old = vm.insert(t1, b"v1").unwrap();
        vm.commit(t1).unwrap();

        let t2 = vm.begin(IsolationLevel::ReadCommitted);
        let new = vm.update(t2, old, b"v2").unwrap().unwrap();
        assert_ne!(old, new);
        assert_eq!(vm.read(t2, old).unwrap(), None);
        assert_eq!(vm.read(t2, new).unwrap(), Some(b"v2".to_vec()));
        vm.commit(t2).unwrap();

        let t3 = vm.begin(IsolationLevel::ReadCommitted);
        assert_eq!(vm.update(t3, old, b"v3").unwrap(), None);
    }

    #[test]
    fn test_repeatable_read_snapshot() {
        let dir = tempdir().unwrap();
        let vm = create(dir.path());

        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let reader = vm.begin(IsolationLevel::RepeatableRead);
        let uid = vm.insert(writer, b"late").unwrap();
        vm.commit(writer).unwrap();

        // The writer was running when the reader began
        assert_eq!(vm.read(reader, uid).unwrap(), None);

        let fresh = vm.begin(IsolationLevel::RepeatableRead);
        assert_eq!(vm.read(fresh, uid).unwrap(), Some(b"late".to_vec()));
    }

    #[test]
    fn test_version_skip_aborts() {
        let dir = tempdir().unwrap();
        let vm = create(dir.path());

        let t1 = vm.begin(IsolationLevel::ReadCommitted);
        let uid = vm.insert(t1, b"row").unwrap();
        vm.commit(t1).unwrap();

        let reader = vm.begin(IsolationLevel::RepeatableRead);
        let mine = vm.insert(reader, b"mine").unwrap();
        let deleter = vm.begin(IsolationLevel::ReadCommitted);
        assert!(vm.delete(deleter, uid).unwrap());
        vm.commit(deleter).unwrap();

        // Still visible to the snapshot, but deleting it would lose an update
        assert_eq!(vm.read(reader, uid).unwrap(), Some(b"row".to_vec()));
        assert!(matches!(vm.delete(reader, uid), Err(KeelError::ConcurrentUpdate(_))));

        assert!(vm.ledger().is_aborted(reader));
        assert!(vm.engine().read(mine).unwrap().is_none());
        assert!(matches!(vm.read(reader, uid), Err(KeelError::TransactionAborted(_))));
        assert!(matches!(vm.commit(reader), Err(KeelError::TransactionAborted(_))));

        // Explicit abort acknowledges it
        vm.abort(reader).unwrap();
        assert_eq!(vm.active_count(), 0);
    }

    #[test]
    fn test_aborted_self_delete_survives_reopen() {
        let dir = tempdir().unwrap();
        let vm = create(dir.path());

        let xid = vm.begin(IsolationLevel::ReadCommitted);
        let uid = vm.insert(xid, b"x").unwrap();
        assert!(vm.delete(xid, uid).unwrap());
        vm.abort(xid).unwrap();
        assert!(vm.engine().read(uid).unwrap().is_none());
        vm.close().unwrap();

        let ledger = TransactionLedger::open(dir.path().join("t.xid")).unwrap();
        let engine = StorageEngine::open(
            dir.path().join("t.db"),
            dir.path().join("t.log"),
            32 * PAGE_SIZE as u64,
            &ledger,
        )
        .unwrap();
        assert!(engine.read(uid).unwrap().is_none());
    }

    #[test]
    fn test_commit_visible_to_later_snapshot() {
        let dir = tempdir().unwrap();
        let vm = create(dir.path());

        let writer = vm.begin(IsolationLevel::ReadCommitted);
        let uid = vm.insert(writer, b"row").unwrap();
        vm.commit(writer).unwrap();
        assert!(vm.transaction(writer).is_none());

        let reader = vm.begin(IsolationLevel::RepeatableRead);
        assert!(!vm.transaction(reader).unwrap().snapshot.contains(writer));
        assert_eq!(vm.read(reader, uid).unwrap(), Some(b"row".to_vec()));
    }

    #[test]
    fn test_close_aborts_open_transactions() {
        let dir = tempdir().unwrap();
        let vm = create(dir.path());
        let xid = vm.begin(IsolationLevel::ReadCommitted);
        vm.insert(xid, b"unfinished").unwrap();
        vm.close().unwrap();

        let ledger = TransactionLedger::open(dir.path().join("t.xid")).unwrap();
        assert!(ledger.is_aborted(xid));
    }
}
