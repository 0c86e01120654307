//! Page store: a single growable file of fixed-size pages.
//!
//! Page `n` (1-based) lives at byte offset `(n - 1) * PAGE_SIZE`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use super::files;
use super::{PAGE_SIZE, PageNo};
use crate::error::{KeelError, KeelResult};

/// Manages page I/O against the page file
pub struct PageStore {
    file: Mutex<File>,
    page_count: AtomicU32,
    path: PathBuf,
}

impl PageStore {
    /// Create a new, empty page file
    pub fn create<P: AsRef<Path>>(path: P) -> KeelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = files::create_new(&path)?;

        Ok(Self {
            file: Mutex::new(file),
            page_count: AtomicU32::new(0),
            path,
        })
    }

    /// Open an existing page file
    pub fn open<P: AsRef<Path>>(path: P) -> KeelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = files::open_existing(&path)?;

        let file_size = file.metadata()?.len();
        let page_count = (file_size / PAGE_SIZE as u64) as PageNo;

        tracing::debug!(
            "Opened page file {:?}: {} bytes, {} pages",
            path,
            file_size,
            page_count
        );

        Ok(Self {
            file: Mutex::new(file),
            page_count: AtomicU32::new(page_count),
            path,
        })
    }

    /// Read a page from disk. Bytes past the end of the file read as zero.
    pub fn read_page(&self, page_no: PageNo) -> KeelResult<Box<[u8]>> {
        let mut buffer = vec![0u8; PAGE_SIZE].into_boxed_slice();

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page_no)))?;

        let mut filled = 0;
        while filled < PAGE_SIZE {
            match file.read(&mut buffer[filled..])? {
                0 => break,
                n => filled += n,
            }
        }

        Ok(buffer)
    }

    /// Write a page to disk and sync it
    pub fn write_page(&self, page_no: PageNo, data: &[u8]) -> KeelResult<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page_no)))?;
        file.write_all(data)?;
        file.sync_data()?;

        Ok(())
    }

    /// Append a new page holding `init`, written through immediately.
    pub fn allocate_page(&self, init: &[u8]) -> KeelResult<PageNo> {
        if init.len() != PAGE_SIZE {
            return Err(KeelError::Config(format!(
                "page image must be {} bytes, got {}",
                PAGE_SIZE,
                init.len()
            )));
        }

        // Holding the file lock keeps the counter and the file length in step
        let mut file = self.file.lock();
        let page_no = self.page_count.fetch_add(1, Ordering::AcqRel) + 1;

        file.seek(SeekFrom::Start(Self::page_offset(page_no)))?;
        file.write_all(init)?;
        file.sync_data()?;

        tracing::trace!("Allocated page {}", page_no);
        Ok(page_no)
    }

    /// Shrink the file so that `max_page_no` is the last page.
    pub fn truncate(&self, max_page_no: PageNo) -> KeelResult<()> {
        let file = self.file.lock();
        file.set_len(Self::page_offset(max_page_no + 1))?;
        file.sync_all()?;
        self.page_count.store(max_page_no, Ordering::Release);
        Ok(())
    }

    /// Number of pages in the file
    pub fn page_count(&self) -> PageNo {
        self.page_count.load(Ordering::Acquire)
    }

    /// Location of the page file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync the file to disk
    pub fn sync(&self) -> KeelResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn page_offset(page_no: PageNo) -> u64 {
        (page_no as u64 - 1) * PAGE_SIZE as u64
    }
}
