//! Segment - One Store Paired With One Index
//!
//! A segment coordinates the two halves of the storage engine: appends go
//! to the store and the frame position is recorded in the index; reads go
//! through the index to find the frame position and through the store to
//! fetch the bytes.
//!
//! Each segment owns a contiguous offset range `[base_offset, next_offset)`.
//! `base_offset` is fixed at creation and names the on-disk files
//! (`<base_offset>.store`, `<base_offset>.index`); `next_offset` is the
//! offset the next appended record will receive. Index entries hold offsets
//! relative to `base_offset` so they fit in a u32.
//!
//! ## Partial Failure
//!
//! If the store accepts a frame but the index write then fails, the store
//! holds orphan bytes that no index entry points at. The segment marks
//! itself inconsistent and refuses further appends; the log surfaces this
//! as a fatal error. Recovery requires operator truncation.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use logmesh_core::{Error, Result, SegmentConfig};
use logmesh_proto::v1::Record;
use prost::Message;
use tracing::error;

use crate::index::OffsetIndex;
use crate::store::Store;

#[derive(Debug)]
pub struct Segment {
    store: Arc<Store>,
    index: OffsetIndex,
    config: SegmentConfig,
    base_offset: u64,
    next_offset: u64,
    inconsistent: bool,
}

impl Segment {
    /// Open or create the segment with the given base offset inside `dir`.
    /// `next_offset` is recovered from the last index entry.
    pub fn open(dir: &Path, base_offset: u64, config: SegmentConfig) -> Result<Self> {
        let store = Arc::new(Store::open(dir.join(format!("{base_offset}.store")))?);
        let index = OffsetIndex::open(
            dir.join(format!("{base_offset}.index")),
            config.max_index_bytes,
            store.size(),
        )?;

        let next_offset = match index.read_last() {
            Ok((last_rel, _)) => base_offset + u64::from(last_rel) + 1,
            Err(err) if err.is_end_of_stream() => base_offset,
            Err(err) => return Err(err),
        };

        Ok(Self {
            store,
            index,
            config,
            base_offset,
            next_offset,
            inconsistent: false,
        })
    }

    /// Append one record, assigning it this segment's next offset. Returns
    /// the absolute offset the record was stored at.
    pub fn append(&mut self, mut record: Record) -> Result<u64> {
        if self.inconsistent {
            return Err(Error::SegmentInconsistent {
                base_offset: self.base_offset,
            });
        }

        let offset = self.next_offset;
        record.offset = offset;
        let encoded = record.encode_to_vec();

        let (_, pos) = self.store.append(&encoded)?;
        if let Err(err) = self.index.write((offset - self.base_offset) as u32, pos) {
            // The store already holds the frame; nothing points at it and
            // nothing can be appended after it safely.
            self.inconsistent = true;
            error!(
                base_offset = self.base_offset,
                offset,
                error = %err,
                "index write failed after store append"
            );
            return Err(Error::SegmentInconsistent {
                base_offset: self.base_offset,
            });
        }

        self.next_offset += 1;
        Ok(offset)
    }

    /// Read the record stored at the given absolute offset.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let (_, pos) = self.index.read(offset - self.base_offset)?;
        let payload = self.store.read(pos)?;
        Ok(Record::decode(payload.as_slice())?)
    }

    /// True once either the store or the index has reached its configured
    /// maximum. The log rotates to a fresh segment when this trips.
    pub fn is_full(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// The absolute offset the next appended record will receive.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Logical size of the backing store in bytes.
    pub fn store_size(&self) -> u64 {
        self.store.size()
    }

    /// Shared handle on the backing store, for the log's bulk reader.
    pub(crate) fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Close the index (sync + truncate) and then the store.
    pub fn close(self) -> Result<()> {
        let Self { store, index, .. } = self;
        index.close()?;
        store.close()
    }

    /// Close the segment and delete both backing files.
    pub fn remove(self) -> Result<()> {
        let store_path = self.store.path().to_path_buf();
        let index_path = self.index.path().to_path_buf();
        self.close()?;
        fs::remove_file(index_path)?;
        fs::remove_file(store_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logmesh_core::ENTRY_WIDTH;
    use tempfile::TempDir;

    fn record(value: &[u8]) -> Record {
        Record {
            value: value.to_vec(),
            offset: 0,
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        };
        let mut segment = Segment::open(dir.path(), 16, config).unwrap();
        assert_eq!(segment.next_offset(), 16);

        for i in 0..3u64 {
            let offset = segment.append(record(b"hello world")).unwrap();
            assert_eq!(offset, 16 + i);

            let got = segment.read(offset).unwrap();
            assert_eq!(got.value, b"hello world");
            assert_eq!(got.offset, offset);
        }
        assert_eq!(segment.next_offset(), 19);
    }

    #[test]
    fn test_read_unwritten_offset_is_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, SegmentConfig::default()).unwrap();
        segment.append(record(b"x")).unwrap();
        assert!(segment.read(1).unwrap_err().is_end_of_stream());
    }

    #[test]
    fn test_full_via_index() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 3 * ENTRY_WIDTH,
            initial_offset: 0,
        };
        let mut segment = Segment::open(dir.path(), 0, config).unwrap();
        assert!(!segment.is_full());
        for _ in 0..3 {
            segment.append(record(b"hi")).unwrap();
        }
        assert!(segment.is_full());
    }

    #[test]
    fn test_full_via_store() {
        let dir = TempDir::new().unwrap();
        let value = vec![b'x'; 64];
        let config = SegmentConfig {
            // Two frames overshoot this comfortably.
            max_store_bytes: 128,
            max_index_bytes: 1024,
            initial_offset: 0,
        };
        let mut segment = Segment::open(dir.path(), 0, config).unwrap();
        segment.append(record(&value)).unwrap();
        segment.append(record(&value)).unwrap();
        assert!(segment.is_full());
    }

    #[test]
    fn test_reopen_recovers_next_offset() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig::default();

        let mut segment = Segment::open(dir.path(), 16, config.clone()).unwrap();
        for _ in 0..4 {
            segment.append(record(b"persisted")).unwrap();
        }
        segment.close().unwrap();

        let mut segment = Segment::open(dir.path(), 16, config).unwrap();
        assert_eq!(segment.base_offset(), 16);
        assert_eq!(segment.next_offset(), 20);
        assert_eq!(segment.read(17).unwrap().value, b"persisted");

        let offset = segment.append(record(b"more")).unwrap();
        assert_eq!(offset, 20);
    }

    #[test]
    fn test_remove_deletes_files() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, SegmentConfig::default()).unwrap();
        segment.append(record(b"gone")).unwrap();
        segment.remove().unwrap();

        assert!(!dir.path().join("0.store").exists());
        assert!(!dir.path().join("0.index").exists());
    }

    #[test]
    fn test_index_exhaustion_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            // Not a multiple of the entry width: the second append finds the
            // mapping full even though is_full() has not tripped.
            max_index_bytes: ENTRY_WIDTH + 1,
            initial_offset: 0,
        };
        let mut segment = Segment::open(dir.path(), 0, config).unwrap();
        segment.append(record(b"ok")).unwrap();
        assert!(!segment.is_full());

        let err = segment.append(record(b"doomed")).unwrap_err();
        assert!(matches!(err, Error::SegmentInconsistent { base_offset: 0 }));

        // The segment stays wedged.
        let err = segment.append(record(b"still doomed")).unwrap_err();
        assert!(matches!(err, Error::SegmentInconsistent { base_offset: 0 }));
    }
}
