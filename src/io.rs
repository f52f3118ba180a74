//! Positioned file I/O
//!
//! Page stores and WAL segments never touch `std::fs::File` directly; they
//! go through [`FileIo`] handles obtained from an [`IoFactory`]. This keeps
//! every durability barrier in one place and lets tests inject failures.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

/// Positioned read/write access to one file
pub trait FileIo: Send + Sync {
    /// Read exactly `dst.len()` bytes starting at `offset`
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()>;

    /// Write all of `src` starting at `offset`
    fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<()>;

    /// OS durability barrier for data and metadata
    fn sync(&self) -> io::Result<()>;

    /// Current file length in bytes
    fn len(&self) -> io::Result<u64>;

    /// Truncate or extend the file
    fn set_len(&self, len: u64) -> io::Result<()>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Opens [`FileIo`] handles
pub trait IoFactory: Send + Sync {
    /// Open `path` read-write, creating it if `create` is set
    fn open(&self, path: &Path, create: bool) -> io::Result<Arc<dyn FileIo>>;
}

/// [`FileIo`] over a `std::fs::File`
///
/// The cursor is shared, so seek+read/seek+write pairs run under one mutex.
pub struct StdFileIo {
    file: Mutex<File>,
}

impl StdFileIo {
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(dst)
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(src)
    }

    fn sync(&self) -> io::Result<()> {
        // Clone the handle so the fsync itself runs without the cursor lock
        let file = self.file.lock().try_clone()?;
        file.sync_all()
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.lock().set_len(len)
    }
}

/// Default factory backed by the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct StdIoFactory;

impl IoFactory for StdIoFactory {
    fn open(&self, path: &Path, create: bool) -> io::Result<Arc<dyn FileIo>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;
        Ok(Arc::new(StdFileIo::new(file)))
    }
}

/// fsync a directory so renames and creations inside it are durable
pub fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
