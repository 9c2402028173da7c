//! Append-Only Store File
//!
//! The store is the byte-level half of a segment: a flat file holding the
//! encoded record payloads as length-prefixed frames.
//!
//! ## File Format
//!
//! The file is a plain concatenation of frames. No header, no trailer, no
//! checksum:
//!
//! ```text
//! ┌──────────────────┬───────────────────┐
//! │ Length (u64, BE) │ Payload (N bytes) │
//! └──────────────────┴───────────────────┘
//! ```
//!
//! ## Buffering
//!
//! Appends go through a buffered writer so many small records do not turn
//! into many small syscalls. The buffer is flushed before every positional
//! read, on `flush()`, and on `close()`, so a reader never observes a frame
//! the writer has not finished handing to the OS.
//!
//! ## Thread Safety
//!
//! All operations take the store's own lock. Positions returned by
//! `append` are stable: the store is append-only and frames are never
//! rewritten.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use logmesh_core::Result;
use parking_lot::Mutex;

/// Width of the length prefix on every frame.
pub const LEN_WIDTH: u64 = 8;

/// Append-only, length-prefixed byte file with buffered writes.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    writer: BufWriter<File>,
    size: u64,
}

impl Store {
    /// Open or create the store file at `path`. The logical size is
    /// recovered from the on-disk size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, writer, size }),
        })
    }

    /// Append one frame. Returns the number of bytes written (payload plus
    /// length prefix) and the position the frame starts at.
    pub fn append(&self, payload: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        let pos = inner.size;
        inner.writer.write_all(&(payload.len() as u64).to_be_bytes())?;
        inner.writer.write_all(payload)?;
        let written = LEN_WIDTH + payload.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Read the frame starting at `pos`, returning its payload.
    pub fn read(&self, pos: u64) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        inner.file.read_exact_at(&mut len_buf, pos)?;
        let len = u64::from_be_bytes(len_buf);
        let mut payload = vec![0u8; len as usize];
        inner.file.read_exact_at(&mut payload, pos + LEN_WIDTH)?;
        Ok(payload)
    }

    /// Positional read into a caller-supplied buffer. Returns the number of
    /// bytes read; zero means `off` is at or past the end of the store.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        Ok(inner.file.read_at(buf, off)?)
    }

    /// Flush buffered writes down to the OS.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().writer.flush()?;
        Ok(())
    }

    /// Flush and release the store. The file handles close on drop.
    pub fn close(&self) -> Result<()> {
        self.flush()
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Filesystem path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
