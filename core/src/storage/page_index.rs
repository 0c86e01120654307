//! Free-space index for picking an insert target page.
//!
//! Pages are bucketed by free space in steps of `PAGE_SIZE / 40` bytes. A
//! selected page is taken out of the index; the inserter puts it back with
//! its new free space once done, so one page has one inserter at a time.

use parking_lot::Mutex;

use super::page::PAGE_SIZE;
use super::PageNo;

const INTERVALS: usize = 40;
const THRESHOLD: usize = PAGE_SIZE / INTERVALS;

/// A page and how much free space it had when indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub page_no: PageNo,
    pub free_space: usize,
}

/// Bucketed free-space index
pub struct PageIndex {
    buckets: Mutex<Vec<Vec<PageInfo>>>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![Vec::new(); INTERVALS + 1]),
        }
    }

    /// Register `page_no` as having `free_space` bytes free.
    pub fn add(&self, page_no: PageNo, free_space: usize) {
        let bucket = (free_space / THRESHOLD).min(INTERVALS);
        self.buckets.lock()[bucket].push(PageInfo {
            page_no,
            free_space,
        });
    }

    /// Take a page with at least `space` bytes free, if any is indexed.
    pub fn select(&self, space: usize) -> Option<PageInfo> {
        let mut buckets = self.buckets.lock();

        // Round up: anything in the next bucket is guaranteed to fit
        let mut bucket = space / THRESHOLD;
        if bucket < INTERVALS {
            bucket += 1;
        }

        while bucket <= INTERVALS {
            if let Some(info) = buckets[bucket].pop() {
                return Some(info);
            }
            bucket += 1;
        }
        None
    }

    /// Number of indexed pages
    pub fn len(&self) -> usize {
        self.buckets.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}
