//! Crash recovery
//!
//! Runs once per open, before any transaction starts. The whole log is
//! replayed from the beginning:
//!
//! 1. the page file is cut back to the highest page the log mentions,
//! 2. records of aborted transactions are reverted newest first, then those
//!    of committed transactions reapply their new image in log order,
//! 3. records of transactions still active are undone newest first, and
//!    those transactions are marked aborted.
//!
//! Every step is idempotent, so a crash during recovery is handled by the next
//! open running it again.

use std::collections::BTreeMap;

use super::buffer_pool::PageCache;
use super::data_item::set_raw_invalid;
use super::ledger::{TransactionLedger, TxnStatus};
use super::wal::{LogRecord, Wal};
use super::{PageNo, Xid, uid_to_address};
use crate::error::KeelResult;

/// What a recovery run did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records scanned
    pub records: usize,
    /// Page file length after truncation
    pub max_page_no: PageNo,
    /// Records replayed for finished transactions
    pub redone: usize,
    /// Records reverted for interrupted transactions
    pub undone: usize,
    /// Transactions found active and marked aborted
    pub aborted: Vec<Xid>,
}

/// Bring the page file in line with the log and the ledger.
pub fn recover(
    ledger: &TransactionLedger,
    wal: &Wal,
    cache: &PageCache,
) -> KeelResult<RecoveryReport> {
    tracing::info!("Starting recovery from {:?}", wal.path());
    let mut report = RecoveryReport::default();

    // Pass 1: valid extent
    let mut max_page_no: PageNo = 1;
    for record in wal.records()? {
        let record = record?;
        report.records += 1;
        max_page_no = max_page_no.max(record.page_no());
    }
    if cache.page_count() != max_page_no {
        tracing::debug!(
            "Truncating page file from {} to {} pages",
            cache.page_count(),
            max_page_no
        );
    }
    cache.truncate(max_page_no);
    report.max_page_no = max_page_no;

    // Pass 2: revert aborted transactions newest first, then redo committed
    // ones in log order
    let mut aborted = Vec::new();
    for record in wal.records()? {
        let record = record?;
        if ledger.is_aborted(record.xid()) {
            aborted.push(record);
        }
    }
    for record in aborted.iter().rev() {
        undo(cache, record)?;
        report.redone += 1;
    }
    for record in wal.records()? {
        let record = record?;
        if ledger.is_committed(record.xid()) {
            redo(cache, &record)?;
            report.redone += 1;
        }
    }
    tracing::debug!("Redo pass applied {} records", report.redone);

    // Pass 3: undo interrupted transactions
    let mut interrupted: BTreeMap<Xid, Vec<LogRecord>> = BTreeMap::new();
    for record in wal.records()? {
        let record = record?;
        if ledger.is_active(record.xid()) {
            interrupted.entry(record.xid()).or_default().push(record);
        }
    }
    for (xid, records) in interrupted {
        for record in records.iter().rev() {
            undo(cache, record)?;
            report.undone += 1;
        }
        ledger.abort(xid);
        report.aborted.push(xid);
    }

    // Transactions that began but never logged anything
    for xid in 1..=ledger.xid_count() {
        if ledger.is_active(xid) {
            ledger.abort(xid);
            report.aborted.push(xid);
        }
    }
    report.aborted.sort_unstable();

    tracing::info!(
        "Recovery complete: {} records, {} redone, {} undone, {} transactions aborted",
        report.records,
        report.redone,
        report.undone,
        report.aborted.len()
    );
    Ok(report)
}

/// Reapply the effect of a record.
pub(crate) fn redo(cache: &PageCache, record: &LogRecord) -> KeelResult<()> {
    let page = cache.get_page(record.page_no())?;
    match record {
        LogRecord::Insert { offset, raw, .. } => page.recover_insert(raw, *offset),
        LogRecord::Update { uid, new_raw, .. } => {
            let (_, offset) = uid_to_address(*uid);
            page.recover_update(new_raw, offset);
        }
    }
    Ok(())
}

/// Revert the effect of a record: tombstone an insert, restore an update.
pub(crate) fn undo(cache: &PageCache, record: &LogRecord) -> KeelResult<()> {
    let page = cache.get_page(record.page_no())?;
    match record {
        LogRecord::Insert { offset, raw, .. } => {
            let mut raw = raw.clone();
            set_raw_invalid(&mut raw);
            page.recover_insert(&raw, *offset);
        }
        LogRecord::Update { uid, old_raw, .. } => {
            let (_, offset) = uid_to_address(*uid);
            page.recover_update(old_raw, offset);
        }
    }
    Ok(())
}
