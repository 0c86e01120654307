//! Storage engine: transaction ledger, page store and cache, write-ahead log,
//! recovery, and the MVCC layer on top.

pub mod buffer_pool;
pub mod cache;
pub mod data_item;
pub mod disk;
pub mod engine;
pub mod ledger;
pub mod lock;
pub mod mvcc;
pub mod page;
pub mod page_index;
pub mod recovery;
pub mod transaction;
pub mod wal;

mod files;

pub use buffer_pool::{PageCache, PageHandle};
pub use cache::{CacheHandle, CacheSource, RefCache};
pub use data_item::DataItem;
pub use disk::PageStore;
pub use engine::StorageEngine;
pub use ledger::{TransactionLedger, TxnStatus};
pub use lock::{Deadlock, LockTable, LockWait};
pub use page::{PAGE_SIZE, Page};
pub use page_index::{PageIndex, PageInfo};
pub use recovery::RecoveryReport;
pub use transaction::{IsolationLevel, Transaction, VersionManager};
pub use wal::{LogRecord, Wal};

/// Transaction identifier. 0 is the super-transaction.
pub type Xid = u64;

/// Stable data item identifier: `(page_no << 32) | offset`.
pub type Uid = u64;

/// 1-based page number.
pub type PageNo = u32;

/// The always-committed, never-active transaction.
pub const SUPER_XID: Xid = 0;

/// Pack a page address into a uid.
#[inline]
pub fn address_to_uid(page_no: PageNo, offset: u16) -> Uid {
    ((page_no as u64) << 32) | offset as u64
}

/// Split a uid back into `(page_no, offset)`.
#[inline]
pub fn uid_to_address(uid: Uid) -> (PageNo, u16) {
    ((uid >> 32) as PageNo, (uid & 0xFFFF) as u16)
}
