//! Transaction ledger: durable per-transaction status.
//!
//! File layout: an 8-byte big-endian header holding the number of
//! transactions ever started, followed by one status byte per xid
//! (xid `n` lives at byte `8 + (n - 1)`).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::files;
use super::{SUPER_XID, Xid};
use crate::error::{KeelError, KeelResult, fatal};

/// Header length in bytes.
const HEADER_LEN: u64 = 8;

const STATUS_ACTIVE: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

/// Read access to transaction status, the seam visibility rules are written
/// against.
pub trait TxnStatus {
    fn is_active(&self, xid: Xid) -> bool;
    fn is_committed(&self, xid: Xid) -> bool;
    fn is_aborted(&self, xid: Xid) -> bool;
}

struct LedgerFile {
    file: File,
    xid_count: u64,
}

/// Durable transaction status ledger
pub struct TransactionLedger {
    inner: Mutex<LedgerFile>,
    path: PathBuf,
}

impl TransactionLedger {
    /// Create a fresh ledger at `path`; fails if the file exists.
    pub fn create<P: AsRef<Path>>(path: P) -> KeelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = files::create_new(&path)?;

        file.write_all(&0u64.to_be_bytes())?;
        file.sync_all()?;

        tracing::debug!("Created transaction ledger at {:?}", path);

        Ok(Self {
            inner: Mutex::new(LedgerFile { file, xid_count: 0 }),
            path,
        })
    }

    /// Open an existing ledger, validating its length against the header.
    pub fn open<P: AsRef<Path>>(path: P) -> KeelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = files::open_existing(&path)?;

        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN {
            return Err(KeelError::CorruptLedger(format!(
                "file is {} bytes, shorter than its header",
                file_len
            )));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let xid_count = u64::from_be_bytes(header);

        let expected = Self::status_offset(xid_count + 1);
        if expected != file_len {
            return Err(KeelError::CorruptLedger(format!(
                "header counts {} transactions ({} bytes) but file is {} bytes",
                xid_count, expected, file_len
            )));
        }

        tracing::debug!(
            "Opened transaction ledger at {:?} with {} transactions",
            path,
            xid_count
        );

        Ok(Self {
            inner: Mutex::new(LedgerFile { file, xid_count }),
            path,
        })
    }

    /// Start a transaction, returning its freshly assigned xid.
    pub fn begin(&self) -> Xid {
        let mut inner = self.inner.lock();
        let xid = inner.xid_count + 1;

        Self::write_status(&mut inner.file, xid, STATUS_ACTIVE);

        inner.xid_count = xid;
        let header = xid.to_be_bytes();
        let res = inner
            .file
            .seek(SeekFrom::Start(0))
            .and_then(|_| inner.file.write_all(&header))
            .and_then(|_| inner.file.sync_data());
        if let Err(e) = res {
            fatal("ledger header write", e);
        }

        xid
    }

    /// Mark `xid` committed.
    pub fn commit(&self, xid: Xid) {
        let mut inner = self.inner.lock();
        Self::write_status(&mut inner.file, xid, STATUS_COMMITTED);
    }

    /// Mark `xid` aborted.
    pub fn abort(&self, xid: Xid) {
        let mut inner = self.inner.lock();
        Self::write_status(&mut inner.file, xid, STATUS_ABORTED);
    }

    /// Number of transactions ever started.
    pub fn xid_count(&self) -> u64 {
        self.inner.lock().xid_count
    }

    /// Location of the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the ledger.
    pub fn close(self) -> KeelResult<()> {
        let inner = self.inner.into_inner();
        inner.file.sync_all()?;
        Ok(())
    }

    fn status_offset(xid: Xid) -> u64 {
        HEADER_LEN + (xid - 1)
    }

    fn write_status(file: &mut File, xid: Xid, status: u8) {
        let res = file
            .seek(SeekFrom::Start(Self::status_offset(xid)))
            .and_then(|_| file.write_all(&[status]))
            .and_then(|_| file.sync_data());
        if let Err(e) = res {
            fatal("ledger status write", e);
        }
    }

    fn check(&self, xid: Xid, status: u8) -> bool {
        let mut inner = self.inner.lock();
        if xid > inner.xid_count {
            return false;
        }

        let mut buf = [0u8; 1];
        let res = inner
            .file
            .seek(SeekFrom::Start(Self::status_offset(xid)))
            .and_then(|_| inner.file.read_exact(&mut buf));
        if let Err(e) = res {
            fatal("ledger status read", e);
        }
        buf[0] == status
    }
}

impl TxnStatus for TransactionLedger {
    fn is_active(&self, xid: Xid) -> bool {
        if xid == SUPER_XID {
            return false;
        }
        self.check(xid, STATUS_ACTIVE)
    }

    fn is_committed(&self, xid: Xid) -> bool {
        if xid == SUPER_XID {
            return true;
        }
        self.check(xid, STATUS_COMMITTED)
    }

    fn is_aborted(&self, xid: Xid) -> bool {
        if xid == SUPER_XID {
            return false;
        }
        self.check(xid, STATUS_ABORTED)
    }
}
