//! Multi-Version Concurrency Control (MVCC)
//!
//! Every stored row version is an entry `[xmin:8][xmax:8][data]` kept in a
//! data item. `xmin` is the creating transaction, `xmax` the deleting one
//! (0 while live). Which versions a transaction sees depends on its isolation
//! level and, for repeatable read, on the set of transactions that were
//! active when it began.

use std::collections::HashSet;

use super::data_item;
use super::ledger::TxnStatus;
use super::transaction::IsolationLevel;
use super::{SUPER_XID, Xid};
use crate::error::{KeelError, KeelResult};

const OF_XMIN: usize = 0;
const OF_XMAX: usize = OF_XMIN + 8;
const OF_DATA: usize = OF_XMAX + 8;

/// One version of a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Transaction that created this version
    pub xmin: Xid,
    /// Transaction that deleted this version (0 if live)
    pub xmax: Xid,
    pub data: Vec<u8>,
}

impl Entry {
    /// A fresh version created by `xid`
    pub fn new(xid: Xid, data: &[u8]) -> Self {
        Self {
            xmin: xid,
            xmax: SUPER_XID,
            data: data.to_vec(),
        }
    }

    /// Serialize to the item payload layout
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OF_DATA + self.data.len());
        buf.extend_from_slice(&self.xmin.to_be_bytes());
        buf.extend_from_slice(&self.xmax.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parse an item payload
    pub fn decode(payload: &[u8]) -> KeelResult<Self> {
        if payload.len() < OF_DATA {
            return Err(KeelError::CorruptData(format!(
                "entry of {} bytes is shorter than its header",
                payload.len()
            )));
        }
        Ok(Self {
            xmin: u64::from_be_bytes(payload[OF_XMIN..OF_XMAX].try_into().unwrap()),
            xmax: u64::from_be_bytes(payload[OF_XMAX..OF_DATA].try_into().unwrap()),
            data: payload[OF_DATA..].to_vec(),
        })
    }
}

/// Stamp `xmax` into a whole item image holding an entry
pub fn set_raw_xmax(item_raw: &mut [u8], xmax: Xid) {
    let start = data_item::OF_DATA + OF_XMAX;
    item_raw[start..start + 8].copy_from_slice(&xmax.to_be_bytes());
}

/// What a transaction is allowed to see
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub xid: Xid,
    pub level: IsolationLevel,
    /// Transactions active when `xid` began
    active: HashSet<Xid>,
}

impl Snapshot {
    pub fn new(xid: Xid, level: IsolationLevel, active: HashSet<Xid>) -> Self {
        Self { xid, level, active }
    }

    /// Whether `xid` was running when this snapshot was taken
    pub fn contains(&self, xid: Xid) -> bool {
        self.active.contains(&xid)
    }
}

/// Whether `entry` is visible to the snapshot's transaction
pub fn is_visible(status: &impl TxnStatus, snapshot: &Snapshot, entry: &Entry) -> bool {
    match snapshot.level {
        IsolationLevel::ReadCommitted => read_committed(status, snapshot, entry),
        IsolationLevel::RepeatableRead => repeatable_read(status, snapshot, entry),
    }
}

fn read_committed(status: &impl TxnStatus, snapshot: &Snapshot, entry: &Entry) -> bool {
    let xid = snapshot.xid;
    if entry.xmin == xid && entry.xmax == SUPER_XID {
        return true;
    }

    if status.is_committed(entry.xmin) {
        if entry.xmax == SUPER_XID {
            return true;
        }
        if entry.xmax != xid && !status.is_committed(entry.xmax) {
            return true;
        }
    }
    false
}

fn repeatable_read(status: &impl TxnStatus, snapshot: &Snapshot, entry: &Entry) -> bool {
    let xid = snapshot.xid;
    if entry.xmin == xid && entry.xmax == SUPER_XID {
        return true;
    }

    // Created by a transaction that committed before we began
    if status.is_committed(entry.xmin) && entry.xmin < xid && !snapshot.contains(entry.xmin) {
        if entry.xmax == SUPER_XID {
            return true;
        }
        if entry.xmax != xid
            && (!status.is_committed(entry.xmax)
                || entry.xmax > xid
                || snapshot.contains(entry.xmax))
        {
            return true;
        }
    }
    false
}

/// Whether acting on `entry` would overwrite a deletion this transaction
/// cannot see. Only repeatable read can skip versions.
pub fn is_version_skip(status: &impl TxnStatus, snapshot: &Snapshot, entry: &Entry) -> bool {
    if snapshot.level == IsolationLevel::ReadCommitted {
        return false;
    }
    status.is_committed(entry.xmax) && (entry.xmax > snapshot.xid || snapshot.contains(entry.xmax))
}
