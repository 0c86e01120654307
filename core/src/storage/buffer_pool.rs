//! Page cache: the reference-counted cache specialised to pages of a
//! [`PageStore`].

use std::path::Path;
use std::sync::Arc;

use super::cache::{CacheHandle, CacheSource, RefCache};
use super::disk::PageStore;
use super::page::{PAGE_SIZE, Page};
use super::PageNo;
use crate::error::{KeelError, KeelResult, fatal};

/// Fewest pages the cache may be configured with
pub const MIN_CACHE_PAGES: usize = 10;

/// Loads pages from and writes dirty pages back to the store
pub struct PageSource {
	store: Arc<PageStore>,
}

impl CacheSource for PageSource {
	type Key = PageNo;
	type Value = Page;

	fn load(&self, page_no: PageNo) -> KeelResult<Page> {
		let data = self.store.read_page(page_no)?;
		Ok(Page::new(page_no, data))
	}

	fn evict(&self, page_no: PageNo, page: &Page) {
		if page.is_dirty() {
			let data = page.read();
			if let Err(e) = self.store.write_page(page_no, &data) {
				fatal("page write-back", e);
			}
			page.clear_dirty();
		}
	}
}

/// A counted reference to a resident page
pub type PageHandle<'a> = CacheHandle<'a, PageSource>;

/// Bounded write-back cache of pages
pub struct PageCache {
	cache: RefCache<PageSource>,
	store: Arc<PageStore>,
}

impl PageCache {
	/// Create a new page file with a cache sized from `memory` bytes
	pub fn create<P: AsRef<Path>>(path: P, memory: u64) -> KeelResult<Self> {
		let capacity = Self::capacity_for(memory)?;
		let store = Arc::new(PageStore::create(path)?);
		Ok(Self::with_store(store, capacity))
	}

	/// Open an existing page file with a cache sized from `memory` bytes
	pub fn open<P: AsRef<Path>>(path: P, memory: u64) -> KeelResult<Self> {
		let capacity = Self::capacity_for(memory)?;
		let store = Arc::new(PageStore::open(path)?);
		Ok(Self::with_store(store, capacity))
	}

	fn with_store(store: Arc<PageStore>, capacity: usize) -> Self {
		let source = PageSource {
			store: Arc::clone(&store),
		};
		Self {
			cache: RefCache::new(source, capacity),
			store,
		}
	}

	/// Number of cache slots `memory` bytes buy, or `MemoryTooSmall`.
	pub fn capacity_for(memory: u64) -> KeelResult<usize> {
		let pages = (memory / PAGE_SIZE as u64) as usize;
		if pages < MIN_CACHE_PAGES {
			return Err(KeelError::MemoryTooSmall {
				pages,
				minimum: MIN_CACHE_PAGES,
			});
		}
		Ok(pages)
	}

	/// Append a page holding `init` and return its number. The page is
	/// written through, not cached.
	pub fn new_page(&self, init: &[u8]) -> PageNo {
		match self.store.allocate_page(init) {
			Ok(page_no) => page_no,
			Err(e) => fatal("page allocation", e),
		}
	}

	/// Fetch a page, pinning it until the handle is released
	pub fn get_page(&self, page_no: PageNo) -> KeelResult<PageHandle<'_>> {
		self.cache.get(page_no)
	}

	/// Release a page handle
	pub fn release(&self, handle: PageHandle<'_>) {
		drop(handle);
	}

	/// Write a page through to disk now, keeping it resident
	pub fn flush(&self, page: &Page) {
		let data = page.read();
		if let Err(e) = self.store.write_page(page.number(), &data) {
			fatal("page flush", e);
		}
		page.clear_dirty();
	}

	/// Cut the page file back so `max_page_no` is the last page
	pub fn truncate(&self, max_page_no: PageNo) {
		if let Err(e) = self.store.truncate(max_page_no) {
			fatal("page file truncate", e);
		}
	}

	/// Number of pages in the page file
	pub fn page_count(&self) -> PageNo {
		self.store.page_count()
	}

	/// Pages currently resident
	pub fn resident(&self) -> usize {
		self.cache.resident()
	}

	/// Configured capacity in pages
	pub fn capacity(&self) -> usize {
		self.cache.capacity()
	}

	/// Write back every resident page and sync the file
	pub fn close(&self) -> KeelResult<()> {
		self.cache.close();
		self.store.sync()
	}
}
