//! Memory-Mapped Offset Index
//!
//! The index is the lookup half of a segment: a file of fixed-width entries
//! mapping a record's offset (relative to the segment's base) to the byte
//! position of its frame in the store.
//!
//! ## File Format
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┐
//! │ rel_offset (u32, BE) │ store_pos (u64, BE)  │  12 bytes per entry
//! └──────────────────────┴──────────────────────┘
//! ```
//!
//! At rest the file size equals `entries × 12`. While the segment is open
//! the file is pre-grown to `max_index_bytes` so it can be memory-mapped
//! (the mapping cannot grow in place), which means the tail of an open
//! index file is zero-filled. `close()` syncs the mapping and truncates the
//! file back to its logical size, so a clean shutdown leaves the entry
//! count recoverable from a plain stat.
//!
//! ## Crash Recovery
//!
//! If the process dies before `close()`, the file is still pre-grown and
//! the stat-based recovery above would over-count. In that case the open
//! path recovers the logical size by scanning for the longest valid entry
//! prefix instead: entry `k` must carry relative offset `k`, point inside
//! the store, and positions must be strictly increasing. The all-zero
//! first slot is disambiguated against the store's size — a real first
//! entry requires a non-empty store.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use logmesh_core::{Error, Result, ENTRY_WIDTH};
use memmap2::MmapMut;
use tracing::debug;

const OFF_WIDTH: usize = 4;

/// Memory-mapped index of `(relative offset, store position)` entries.
#[derive(Debug)]
pub struct OffsetIndex {
    file: File,
    path: PathBuf,
    mmap: MmapMut,
    size: u64,
}

impl OffsetIndex {
    /// Open or create the index at `path`, pre-growing the file to
    /// `max_index_bytes` and mapping it. `store_size` bounds the crash
    /// recovery scan; pass the paired store's current size.
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64, store_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let disk_size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let size = if disk_size == max_index_bytes {
            // No clean close truncated this file (or it closed exactly
            // full); recover the entry count from the contents.
            let recovered = recovered_size(&mmap, store_size);
            if recovered != disk_size {
                debug!(
                    path = %path.display(),
                    recovered_entries = recovered / ENTRY_WIDTH,
                    "index recovered by prefix scan"
                );
            }
            recovered
        } else {
            disk_size
        };

        Ok(Self {
            file,
            path,
            mmap,
            size,
        })
    }

    /// Append an entry. Fails with the end-of-stream signal when the
    /// mapping has no room for another entry.
    pub fn write(&mut self, rel_offset: u32, pos: u64) -> Result<()> {
        if (self.mmap.len() as u64) < self.size + ENTRY_WIDTH {
            return Err(Error::EndOfStream);
        }
        let at = self.size as usize;
        self.mmap[at..at + OFF_WIDTH].copy_from_slice(&rel_offset.to_be_bytes());
        self.mmap[at + OFF_WIDTH..at + ENTRY_WIDTH as usize].copy_from_slice(&pos.to_be_bytes());
        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Read the entry at `slot`. Fails with the end-of-stream signal when
    /// the index is empty or `slot` is past the last entry.
    pub fn read(&self, slot: u64) -> Result<(u32, u64)> {
        if self.size == 0 {
            return Err(Error::EndOfStream);
        }
        let at = slot.checked_mul(ENTRY_WIDTH).ok_or(Error::EndOfStream)?;
        let end = at.checked_add(ENTRY_WIDTH).ok_or(Error::EndOfStream)?;
        if end > self.size {
            return Err(Error::EndOfStream);
        }
        Ok(entry_at(&self.mmap, at as usize))
    }

    /// Read the most recently written entry.
    pub fn read_last(&self) -> Result<(u32, u64)> {
        if self.size == 0 {
            return Err(Error::EndOfStream);
        }
        self.read(self.size / ENTRY_WIDTH - 1)
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Filesystem path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync the mapping, fsync the file and truncate it back to the
    /// logical size so the entry count survives in the on-disk length.
    pub fn close(self) -> Result<()> {
        let Self {
            file, mmap, size, ..
        } = self;
        mmap.flush()?;
        file.sync_all()?;
        // Unmap before shrinking the file underneath the mapping.
        drop(mmap);
        file.set_len(size)?;
        file.sync_all()?;
        Ok(())
    }
}

fn entry_at(mmap: &MmapMut, at: usize) -> (u32, u64) {
    let mut off_buf = [0u8; OFF_WIDTH];
    off_buf.copy_from_slice(&mmap[at..at + OFF_WIDTH]);
    let mut pos_buf = [0u8; 8];
    pos_buf.copy_from_slice(&mmap[at + OFF_WIDTH..at + ENTRY_WIDTH as usize]);
    (u32::from_be_bytes(off_buf), u64::from_be_bytes(pos_buf))
}

/// Longest valid entry prefix of a pre-grown index file, in bytes.
fn recovered_size(mmap: &MmapMut, store_size: u64) -> u64 {
    let mut entries = 0u64;
    let mut prev_pos = 0u64;
    loop {
        let at = entries * ENTRY_WIDTH;
        if at + ENTRY_WIDTH > mmap.len() as u64 {
            break;
        }
        let (rel, pos) = entry_at(mmap, at as usize);
        if rel as u64 != entries || pos >= store_size {
            break;
        }
        if entries > 0 && pos <= prev_pos {
            break;
        }
        prev_pos = pos;
        entries += 1;
    }
    entries * ENTRY_WIDTH
}
