//! Disk I/O collaborator.
//!
//! The pool talks to storage through [`IoBackend`]; [`FileIo`] is the
//! bundled implementation keeping one file per tablespace. A real
//! engine substitutes its own submission layer behind the same trait.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::common::{Error, PageId, Result, PAGE_SIZE};

/// Synchronous page I/O contract.
///
/// Reads and writes move whole page images. `read_page` fills the
/// caller's buffer; the completion pipeline owns everything that
/// happens to the bytes afterwards.
pub trait IoBackend: Send + Sync {
    /// Read one page image into `buf` (`buf.len() == PAGE_SIZE`).
    ///
    /// # Errors
    /// - [`Error::TablespaceGone`] if the tablespace was dropped
    /// - [`Error::PageNotFound`] if the page was never allocated
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Write one page image.
    ///
    /// # Errors
    /// - [`Error::TablespaceGone`] if the tablespace was dropped
    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()>;
}

/// File-backed I/O: `<root>/<space>.pd`, pages laid out sequentially.
///
/// Thread safety: the space directory is under an `RwLock`; each file
/// has its own mutex so I/O to different tablespaces proceeds in
/// parallel.
pub struct FileIo {
    root: PathBuf,
    spaces: RwLock<HashMap<u32, Arc<Mutex<File>>>>,
}

impl FileIo {
    /// Open (or create) a directory of tablespace files.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            spaces: RwLock::new(HashMap::new()),
        })
    }

    fn space_path(&self, space: u32) -> PathBuf {
        self.root.join(format!("{space}.pd"))
    }

    /// Create a new, empty tablespace.
    pub fn create_space(&self, space: u32) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.space_path(space))?;
        self.spaces.write().insert(space, Arc::new(Mutex::new(file)));
        Ok(())
    }

    /// Drop a tablespace; subsequent I/O reports [`Error::TablespaceGone`].
    pub fn drop_space(&self, space: u32) -> Result<()> {
        self.spaces.write().remove(&space);
        let path = self.space_path(space);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn handle(&self, space: u32) -> Result<Arc<Mutex<File>>> {
        if let Some(h) = self.spaces.read().get(&space) {
            return Ok(Arc::clone(h));
        }
        // Lazily attach a file left over from a previous run.
        let path = self.space_path(space);
        if !path.exists() {
            return Err(Error::TablespaceGone(space));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let h = Arc::new(Mutex::new(file));
        self.spaces.write().entry(space).or_insert_with(|| Arc::clone(&h));
        Ok(h)
    }
}

impl IoBackend for FileIo {
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let handle = self.handle(id.space())?;
        let mut file = handle.lock();

        let offset = id.page_no() as u64 * PAGE_SIZE as u64;
        let len = file.metadata()?.len();
        if offset + PAGE_SIZE as u64 > len {
            return Err(Error::PageNotFound(id));
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let handle = self.handle(id.space())?;
        let mut file = handle.lock();

        let offset = id.page_no() as u64 * PAGE_SIZE as u64;
        let len = file.metadata()?.len();
        if offset > len {
            // Zero-fill the gap so page offsets stay positional.
            file.seek(SeekFrom::Start(len))?;
            let zeros = vec![0u8; (offset - len) as usize];
            file.write_all(&zeros)?;
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.sync_data()?;
        Ok(())
    }
}
