//! Page management
//!
//! A data page is `[fso:2][data...]`: the first two bytes (big-endian) hold
//! the free space offset, the boundary between appended item bytes and the
//! unused tail. Page 1 is reserved and carries the shutdown marker instead.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::PageNo;

/// Page size in bytes (8KB)
pub const PAGE_SIZE: usize = 8192;

/// Offset of the free space offset field
const FSO_OFFSET: usize = 0;

/// First byte available to data items
pub const DATA_START: usize = 2;

/// Largest item that fits in an empty data page
pub const MAX_FREE_SPACE: usize = PAGE_SIZE - DATA_START;

/// A cached page
pub struct Page {
    number: PageNo,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

impl Page {
    /// Wrap raw page bytes
    pub fn new(number: PageNo, data: Box<[u8]>) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self {
            number,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    /// Fresh data page image with an empty payload area
    pub fn init_raw() -> Vec<u8> {
        let mut raw = vec![0u8; PAGE_SIZE];
        set_fso(&mut raw, DATA_START as u16);
        raw
    }

    /// Page number
    pub fn number(&self) -> PageNo {
        self.number
    }

    /// Shared access to the raw bytes
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Exclusive access to the raw bytes; marks the page dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.mark_dirty();
        self.data.write()
    }

    /// Mark page as dirty
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Check if page is dirty
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear dirty flag
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Current free space offset
    pub fn fso(&self) -> u16 {
        fso(&self.read())
    }

    /// Get available free space
    pub fn free_space(&self) -> usize {
        PAGE_SIZE - self.fso() as usize
    }

    /// Append `raw` at the free space offset, returning where it landed.
    pub fn insert(&self, raw: &[u8]) -> u16 {
        let mut data = self.write();
        insert(&mut data, raw)
    }

    /// Replay an insert at a known offset.
    pub fn recover_insert(&self, raw: &[u8], offset: u16) {
        let mut data = self.write();
        recover_insert(&mut data, raw, offset);
    }

    /// Replay an in-place overwrite at a known offset.
    pub fn recover_update(&self, raw: &[u8], offset: u16) {
        let mut data = self.write();
        recover_update(&mut data, raw, offset);
    }
}

/// Read the free space offset from raw page bytes
pub fn fso(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[FSO_OFFSET], data[FSO_OFFSET + 1]])
}

fn set_fso(data: &mut [u8], fso: u16) {
    data[FSO_OFFSET..FSO_OFFSET + 2].copy_from_slice(&fso.to_be_bytes());
}

/// Append at the current free space offset and advance it.
pub fn insert(data: &mut [u8], raw: &[u8]) -> u16 {
    let offset = fso(data);
    let start = offset as usize;
    data[start..start + raw.len()].copy_from_slice(raw);
    set_fso(data, offset + raw.len() as u16);
    offset
}

/// Write at `offset`; the free space offset only ever moves forward.
pub fn recover_insert(data: &mut [u8], raw: &[u8], offset: u16) {
    let start = offset as usize;
    data[start..start + raw.len()].copy_from_slice(raw);

    let end = offset + raw.len() as u16;
    if fso(data) < end {
        set_fso(data, end);
    }
}

/// Overwrite at `offset` without touching the free space offset.
pub fn recover_update(data: &mut [u8], raw: &[u8], offset: u16) {
    let start = offset as usize;
    data[start..start + raw.len()].copy_from_slice(raw);
}

/// Shutdown marker kept on page 1.
///
/// Every open writes a fresh random token at [`MARKER_OPEN`]; a clean close
/// copies it to [`MARKER_CLOSE`]. Differing tokens mean the last run did not
/// shut down cleanly.
pub mod page_one {
    use super::{PAGE_SIZE, Page};

    const MARKER_OPEN: usize = 100;
    const MARKER_CLOSE: usize = MARKER_OPEN + MARKER_LEN;
    const MARKER_LEN: usize = 8;

    /// Initial image for page 1
    pub fn init_raw() -> Vec<u8> {
        let mut raw = vec![0u8; PAGE_SIZE];
        stamp_open(&mut raw);
        raw
    }

    /// Write a fresh open token.
    pub fn set_open(page: &Page) {
        stamp_open(&mut page.write());
    }

    /// Record a clean shutdown.
    pub fn set_closed(page: &Page) {
        let mut data = page.write();
        data.copy_within(MARKER_OPEN..MARKER_OPEN + MARKER_LEN, MARKER_CLOSE);
    }

    /// Whether the previous run closed cleanly.
    pub fn closed_cleanly(page: &Page) -> bool {
        let data = page.read();
        data[MARKER_OPEN..MARKER_OPEN + MARKER_LEN] == data[MARKER_CLOSE..MARKER_CLOSE + MARKER_LEN]
    }

    fn stamp_open(data: &mut [u8]) {
        let token = uuid::Uuid::new_v4();
        data[MARKER_OPEN..MARKER_OPEN + MARKER_LEN].copy_from_slice(&token.as_bytes()[..MARKER_LEN]);
    }
}
