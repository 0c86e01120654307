//! Data items: versioned record slots inside a page.
//!
//! On-page layout is `[valid:1][size:2][payload:size]`. A valid byte of 1
//! marks the item as tombstoned; items are never physically removed.

use std::ops::Range;

use parking_lot::RwLockWriteGuard;

use super::buffer_pool::PageHandle;
use super::page::{self, DATA_START, PAGE_SIZE};
use super::{PageNo, Uid, address_to_uid};

const OF_VALID: usize = 0;
const OF_SIZE: usize = 1;
/// Offset of the payload within an item
pub const OF_DATA: usize = 3;

const TOMBSTONE: u8 = 1;

/// Frame a payload as a live data item.
pub fn wrap_raw(payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(OF_DATA + payload.len());
    raw.push(0);
    raw.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    raw.extend_from_slice(payload);
    raw
}

/// Flip the valid byte of an item image to tombstoned.
pub fn set_raw_invalid(raw: &mut [u8]) {
    raw[OF_VALID] = TOMBSTONE;
}

/// Whether an item starting at `offset` lies wholly inside the used part of
/// a page image.
pub fn in_bounds(data: &[u8], offset: u16) -> bool {
    let start = offset as usize;
    let used = (page::fso(data) as usize).min(PAGE_SIZE);
    if start < DATA_START || start + OF_DATA > used {
        return false;
    }
    let size = u16::from_be_bytes([data[start + OF_SIZE], data[start + OF_SIZE + 1]]) as usize;
    start + OF_DATA + size <= used
}

/// A view of one item inside a pinned page.
///
/// The item owns a page handle, so the page stays resident for as long as the
/// view exists.
pub struct DataItem<'a> {
    page: PageHandle<'a>,
    range: Range<usize>,
    uid: Uid,
}

impl<'a> DataItem<'a> {
    /// Parse the item starting at `offset` of `page`.
    pub fn parse(page: PageHandle<'a>, offset: u16) -> Self {
        let start = offset as usize;
        let size = {
            let data = page.read();
            u16::from_be_bytes([data[start + OF_SIZE], data[start + OF_SIZE + 1]]) as usize
        };
        let uid = address_to_uid(page.number(), offset);
        Self {
            page,
            range: start..start + OF_DATA + size,
            uid,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn page_no(&self) -> PageNo {
        self.page.number()
    }

    /// Start of the item within its page
    pub fn offset(&self) -> u16 {
        self.range.start as u16
    }

    /// Whether the item is live (not tombstoned)
    pub fn is_valid(&self) -> bool {
        self.page.read()[self.range.start + OF_VALID] != TOMBSTONE
    }

    /// Copy of the payload bytes
    pub fn payload(&self) -> Vec<u8> {
        let data = self.page.read();
        data[self.range.start + OF_DATA..self.range.end].to_vec()
    }

    /// Copy of the whole item image (valid byte, size, payload)
    pub fn raw(&self) -> Vec<u8> {
        self.page.read()[self.range.clone()].to_vec()
    }

    /// Lock the page for an in-place rewrite of this item.
    pub fn lock_for_update(&self) -> ItemWriter<'_> {
        ItemWriter {
            data: self.page.write(),
            range: self.range.clone(),
        }
    }
}

/// Exclusive write access to an item's bytes, holding the page write lock.
pub struct ItemWriter<'g> {
    data: RwLockWriteGuard<'g, Box<[u8]>>,
    range: Range<usize>,
}

impl ItemWriter<'_> {
    /// Current item image
    pub fn raw(&self) -> &[u8] {
        &self.data[self.range.clone()]
    }

    /// Overwrite the item image; `raw` must match the item's size.
    pub fn write_raw(&mut self, raw: &[u8]) {
        self.data[self.range.clone()].copy_from_slice(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer_pool::PageCache;
    use crate::storage::page::Page;
    use tempfile::tempdir;

    #[test]
    fn test_wrap_and_parse() {
        let dir = tempdir().unwrap();
        let cache = PageCache::create(dir.path().join("t.db"), 16 * PAGE_SIZE as u64).unwrap();
        let page_no = cache.new_page(&Page::init_raw());

        let page = cache.get_page(page_no).unwrap();
        page.insert(&wrap_raw(b"first"));
        let offset = page.insert(&wrap_raw(b"second item"));

        let item = DataItem::parse(page, offset);
        assert_eq!(item.uid(), address_to_uid(page_no, offset));
        assert!(item.is_valid());
        assert_eq!(item.payload(), b"second item");
        assert_eq!(item.raw().len(), OF_DATA + 11);
    }

    #[test]
    fn test_in_bounds() {
        let mut data = Page::init_raw();
        let offset = page::insert(&mut data, &wrap_raw(b"abc"));
        assert!(in_bounds(&data, offset));
        assert!(!in_bounds(&data, 0));
        assert!(!in_bounds(&data, offset + 1));
        assert!(!in_bounds(&data, 4000));

        // A size field pointing past the used area
        data[offset as usize + OF_SIZE] = 0xFF;
        assert!(!in_bounds(&data, offset));
    }

    #[test]
    fn test_tombstone() {
        let mut raw = wrap_raw(b"gone");
        set_raw_invalid(&mut raw);

        let dir = tempdir().unwrap();
        let cache = PageCache::create(dir.path().join("t.db"), 16 * PAGE_SIZE as u64).unwrap();
        let page_no = cache.new_page(&Page::init_raw());
        let page = cache.get_page(page_no).unwrap();
        let offset = page.insert(&raw);

        let item = DataItem::parse(page, offset);
        assert!(!item.is_valid());
        assert_eq!(item.payload(), b"gone");
    }

    #[test]
    fn test_item_writer() {
        let dir = tempdir().unwrap();
        let cache = PageCache::create(dir.path().join("t.db"), 16 * PAGE_SIZE as u64).unwrap();
        let page_no = cache.new_page(&Page::init_raw());
        let page = cache.get_page(page_no).unwrap();
        let offset = page.insert(&wrap_raw(b"abcd"));
        let item = DataItem::parse(page, offset);

        {
            let mut writer = item.lock_for_update();
            let mut raw = writer.raw().to_vec();
            raw[OF_DATA..].copy_from_slice(b"wxyz");
            writer.write_raw(&raw);
        }
        assert_eq!(item.payload(), b"wxyz");
    }
}
