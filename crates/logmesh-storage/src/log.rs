//! The Commit Log
//!
//! `CommitLog` manages an ordered list of segments inside one directory and
//! is the only type the rest of the system talks to for storage. Appends
//! always land in the last segment (the active one); when the active
//! segment fills up a fresh one is created at the next offset. Reads locate
//! the segment whose `[base_offset, next_offset)` range contains the
//! requested offset.
//!
//! ## Directory Layout
//!
//! Two files per segment, named by the segment's base offset in decimal:
//!
//! ```text
//! data/
//!   0.store      0.index
//!   3.store      3.index
//!   7.store      7.index     <- active
//! ```
//!
//! On open the directory is scanned, store/index pairs are matched up,
//! sorted numerically and reopened. An empty directory gets a fresh
//! segment at the configured initial offset.
//!
//! ## Locking
//!
//! One read/write lock guards the segment list. Reads, offset queries and
//! bulk-reader construction take the shared mode; append, truncate, close,
//! remove and reset take the exclusive mode. The store's own lock handles
//! flush-before-read underneath, so concurrent readers are safe in shared
//! mode.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use logmesh_core::{Error, LogConfig, Result};
use logmesh_proto::v1::Record;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::segment::Segment;
use crate::store::Store;

const STORE_EXT: &str = "store";
const INDEX_EXT: &str = "index";

#[derive(Debug)]
pub struct CommitLog {
    dir: PathBuf,
    config: LogConfig,
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Sorted by base offset; the last segment is the active one and the
    /// sole append target. Never empty while the log is open.
    segments: Vec<Segment>,
    /// Set when a segment reported a fatal inconsistency; no further
    /// appends are accepted.
    wedged: bool,
    closed: bool,
}

impl CommitLog {
    /// Open the log rooted at `dir`, creating the directory and an initial
    /// segment if nothing exists yet.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let segments = load_segments(&dir, &config)?;
        info!(
            dir = %dir.display(),
            segments = segments.len(),
            "commit log opened"
        );
        Ok(Self {
            dir,
            config,
            inner: RwLock::new(Inner {
                segments,
                wedged: false,
                closed: false,
            }),
        })
    }

    /// Append a record, returning the absolute offset it was assigned. The
    /// record's own offset field is overwritten.
    pub fn append(&self, record: Record) -> Result<u64> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(Error::Closed);
        }
        if inner.wedged {
            let base = inner.segments.last().map(Segment::base_offset).unwrap_or(0);
            return Err(Error::SegmentInconsistent { base_offset: base });
        }
        let Some(active) = inner.segments.last_mut() else {
            return Err(Error::Closed);
        };

        let offset = match active.append(record) {
            Ok(offset) => offset,
            Err(err) => {
                if matches!(err, Error::SegmentInconsistent { .. }) {
                    inner.wedged = true;
                }
                return Err(err);
            }
        };

        if inner.segments.last().map(Segment::is_full).unwrap_or(false) {
            debug!(next_base = offset + 1, "active segment full, rotating");
            let segment = Segment::open(&self.dir, offset + 1, self.config.segment.clone())?;
            inner.segments.push(segment);
        }
        Ok(offset)
    }

    /// Read the record stored at `offset`.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(Error::Closed);
        }
        let segment = inner
            .segments
            .iter()
            .find(|s| s.base_offset() <= offset && offset < s.next_offset());
        match segment {
            Some(segment) => segment.read(offset),
            None => Err(Error::OffsetOutOfRange(offset)),
        }
    }

    /// The smallest offset held by the log.
    pub fn lowest_offset(&self) -> Result<u64> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(Error::Closed);
        }
        Ok(inner.segments.first().map(Segment::base_offset).unwrap_or(0))
    }

    /// The largest offset ever assigned, or `None` if the log holds no
    /// records (a fresh or fully truncated log).
    pub fn highest_offset(&self) -> Result<Option<u64>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(Error::Closed);
        }
        let first = inner.segments.first().map(Segment::base_offset).unwrap_or(0);
        let next = inner.segments.last().map(Segment::next_offset).unwrap_or(0);
        if next == first {
            Ok(None)
        } else {
            Ok(Some(next - 1))
        }
    }

    /// Total logical byte size across every segment's store.
    pub fn size(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.iter().map(Segment::store_size).sum()
    }

    /// Remove every segment whose highest offset is at most `lowest`. The
    /// active segment is always retained, so the log keeps accepting
    /// appends afterwards. Idempotent.
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(Error::Closed);
        }
        let mut removed = 0usize;
        while inner.segments.len() > 1 {
            // An empty front segment covers nothing and goes too.
            if let Some(highest) = inner.segments[0].next_offset().checked_sub(1) {
                if highest > lowest {
                    break;
                }
            }
            let segment = inner.segments.remove(0);
            segment.remove()?;
            removed += 1;
        }
        if removed > 0 {
            info!(lowest, removed, "log truncated");
        }
        Ok(())
    }

    /// A lazy reader over the raw store contents of every segment in offset
    /// order. The stream is a concatenation of length-prefixed frames;
    /// consumers decode the frames themselves.
    pub fn reader(&self) -> LogReader {
        let inner = self.inner.read();
        LogReader::new(inner.segments.iter().map(Segment::store).collect())
    }

    /// Close every segment, flushing stores and truncating indexes.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        for segment in inner.segments.drain(..) {
            segment.close()?;
        }
        Ok(())
    }

    /// Close the log and delete its directory.
    pub fn remove(&self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Remove the log and re-initialize it empty.
    pub fn reset(&self) -> Result<()> {
        self.remove()?;
        let mut inner = self.inner.write();
        fs::create_dir_all(&self.dir)?;
        inner.segments = load_segments(&self.dir, &self.config)?;
        inner.wedged = false;
        inner.closed = false;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    #[cfg(test)]
    fn segment_count(&self) -> usize {
        self.inner.read().segments.len()
    }

    #[cfg(test)]
    fn segment_ranges(&self) -> Vec<(u64, u64)> {
        self.inner
            .read()
            .segments
            .iter()
            .map(|s| (s.base_offset(), s.next_offset()))
            .collect()
    }
}

/// Scan `dir` for segment file pairs and reopen them in base-offset order,
/// or create a fresh segment at the configured initial offset.
fn load_segments(dir: &Path, config: &LogConfig) -> Result<Vec<Segment>> {
    let mut store_bases = BTreeSet::new();
    let mut index_bases = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let (Some(stem), Some(ext)) = (path.file_stem(), path.extension()) else {
            continue;
        };
        let Ok(base) = stem.to_string_lossy().parse::<u64>() else {
            continue;
        };
        match ext.to_string_lossy().as_ref() {
            STORE_EXT => {
                store_bases.insert(base);
            }
            INDEX_EXT => {
                index_bases.insert(base);
            }
            _ => {}
        }
    }

    if store_bases != index_bases {
        return Err(Error::MalformedDir(format!(
            "unpaired segment files in {}: stores {:?}, indexes {:?}",
            dir.display(),
            store_bases,
            index_bases
        )));
    }

    let mut segments = Vec::with_capacity(store_bases.len().max(1));
    for base in store_bases {
        segments.push(Segment::open(dir, base, config.segment.clone())?);
    }
    if segments.is_empty() {
        segments.push(Segment::open(
            dir,
            config.segment.initial_offset,
            config.segment.clone(),
        )?);
    }
    Ok(segments)
}

/// Sequential reader over the concatenated stores of a log. Holds shared
/// handles on the stores, so it stays valid while the log rotates; segments
/// truncated away keep their bytes alive until the reader is dropped.
pub struct LogReader {
    stores: Vec<Arc<Store>>,
    current: usize,
    pos: u64,
}

impl LogReader {
    fn new(stores: Vec<Arc<Store>>) -> Self {
        Self {
            stores,
            current: 0,
            pos: 0,
        }
    }
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current < self.stores.len() {
            let n = self.stores[self.current]
                .read_at(buf, self.pos)
                .map_err(|err| match err {
                    Error::Io(io_err) => io_err,
                    other => io::Error::new(io::ErrorKind::Other, other.to_string()),
                })?;
            if n > 0 {
                self.pos += n as u64;
                return Ok(n);
            }
            self.current += 1;
            self.pos = 0;
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logmesh_core::{SegmentConfig, ENTRY_WIDTH};
    use prost::Message;
    use tempfile::TempDir;

    fn record(value: &[u8]) -> Record {
        Record {
            value: value.to_vec(),
            offset: 0,
        }
    }

    fn config(max_store_bytes: u64, max_index_bytes: u64) -> LogConfig {
        LogConfig {
            segment: SegmentConfig {
                max_store_bytes,
                max_index_bytes,
                initial_offset: 0,
            },
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(1024, 1024)).unwrap();

        let value: &[u8] = b"a long habit of not thinking a thing wrong, \
                             gives it a superficial appearance of being right";
        let offset = log.append(record(value)).unwrap();
        assert_eq!(offset, 0);

        let got = log.read(offset).unwrap();
        assert_eq!(got.value, value);
        assert_eq!(got.offset, 0);
    }

    #[test]
    fn test_out_of_range_carries_offset() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(1024, 1024)).unwrap();
        let err = log.read(1).unwrap_err();
        assert!(matches!(err, Error::OffsetOutOfRange(1)));
    }

    #[test]
    fn test_fresh_log_has_no_highest_offset() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(1024, 1024)).unwrap();
        assert_eq!(log.lowest_offset().unwrap(), 0);
        assert_eq!(log.highest_offset().unwrap(), None);
    }

    #[test]
    fn test_reload_existing_segments() {
        let dir = TempDir::new().unwrap();
        let value: &[u8] = b"When men yield up the privilege of thinking, \
                             the last shadow of liberty quits the horizon.";
        {
            let log = CommitLog::open(dir.path(), config(1024, 1024)).unwrap();
            for _ in 0..3 {
                log.append(record(value)).unwrap();
            }
            assert_eq!(log.lowest_offset().unwrap(), 0);
            assert_eq!(log.highest_offset().unwrap(), Some(2));
            log.close().unwrap();
        }

        let log = CommitLog::open(dir.path(), config(1024, 1024)).unwrap();
        assert_eq!(log.lowest_offset().unwrap(), 0);
        assert_eq!(log.highest_offset().unwrap(), Some(2));
        for offset in 0..3 {
            assert_eq!(log.read(offset).unwrap().value, value);
        }
    }

    #[test]
    fn test_rotation_keeps_segments_adjacent() {
        let dir = TempDir::new().unwrap();
        // One index entry per segment.
        let log = CommitLog::open(dir.path(), config(1024, ENTRY_WIDTH)).unwrap();

        for i in 0..3u64 {
            let offset = log.append(record(b"Thomas Paine, Common Sense")).unwrap();
            assert_eq!(offset, i);
        }
        // Three full segments plus the empty active one.
        assert_eq!(log.segment_count(), 4);

        let ranges = log.segment_ranges();
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1, pair[1].0, "segments must be adjacent");
        }
        assert_eq!(ranges[3], (3, 3));
    }

    #[test]
    fn test_reader_streams_whole_log() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(1024, ENTRY_WIDTH)).unwrap();
        let value: &[u8] = b"Thomas Paine, Common Sense";

        for _ in 0..3 {
            log.append(record(value)).unwrap();
        }

        let mut bytes = Vec::new();
        log.reader().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes.len() as u64, log.size());

        // Decode the length-prefixed frames back into records.
        let mut at = 0usize;
        for offset in 0..3u64 {
            let len =
                u64::from_be_bytes(bytes[at..at + 8].try_into().unwrap()) as usize;
            let frame = &bytes[at + 8..at + 8 + len];
            let got = Record::decode(frame).unwrap();
            assert_eq!(got.value, value);
            assert_eq!(got.offset, offset);
            at += 8 + len;
        }
        assert_eq!(at, bytes.len());
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(1024, ENTRY_WIDTH)).unwrap();
        let value: &[u8] = b"Society in every state is a blessing";

        for _ in 0..4 {
            log.append(record(value)).unwrap();
        }

        log.truncate(1).unwrap();
        assert!(matches!(
            log.read(0).unwrap_err(),
            Error::OffsetOutOfRange(0)
        ));
        assert!(matches!(
            log.read(1).unwrap_err(),
            Error::OffsetOutOfRange(1)
        ));
        assert_eq!(log.read(2).unwrap().value, value);
        assert_eq!(log.lowest_offset().unwrap(), 2);
        assert_eq!(log.highest_offset().unwrap(), Some(3));
    }

    #[test]
    fn test_truncate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(1024, ENTRY_WIDTH)).unwrap();
        for _ in 0..4 {
            log.append(record(b"r")).unwrap();
        }

        log.truncate(1).unwrap();
        let ranges = log.segment_ranges();
        log.truncate(1).unwrap();
        assert_eq!(log.segment_ranges(), ranges);
    }

    #[test]
    fn test_truncate_never_removes_active_segment() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(1024, ENTRY_WIDTH)).unwrap();
        for _ in 0..2 {
            log.append(record(b"r")).unwrap();
        }

        // Covers every record in the log; the empty active segment stays.
        log.truncate(u64::MAX - 1).unwrap();
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.highest_offset().unwrap(), None);

        // The log still accepts appends at the next offset.
        let offset = log.append(record(b"after")).unwrap();
        assert_eq!(offset, 2);
    }

    #[test]
    fn test_truncate_of_empty_match_removes_nothing() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(1024, ENTRY_WIDTH)).unwrap();
        for _ in 0..3 {
            log.append(record(b"r")).unwrap();
        }
        let before = log.segment_ranges();

        // Offset 0 is the lowest highest-offset in the log, so this removes
        // exactly the first segment and nothing else.
        log.truncate(0).unwrap();
        assert_eq!(log.segment_ranges(), before[1..].to_vec());
    }

    #[test]
    fn test_offsets_are_contiguous_across_rotation() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(64, 1024)).unwrap();

        let mut expected = 0u64;
        for _ in 0..20 {
            let offset = log.append(record(b"payload-of-some-size")).unwrap();
            assert_eq!(offset, expected);
            expected += 1;
        }
        assert_eq!(log.lowest_offset().unwrap(), 0);
        assert_eq!(log.highest_offset().unwrap(), Some(19));
        for offset in 0..20 {
            assert_eq!(log.read(offset).unwrap().offset, offset);
        }
    }

    #[test]
    fn test_initial_offset() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig {
            segment: SegmentConfig {
                initial_offset: 10,
                ..Default::default()
            },
        };
        let log = CommitLog::open(dir.path(), config).unwrap();
        assert_eq!(log.lowest_offset().unwrap(), 10);
        assert_eq!(log.highest_offset().unwrap(), None);
        assert_eq!(log.append(record(b"first")).unwrap(), 10);
        assert_eq!(log.highest_offset().unwrap(), Some(10));
    }

    #[test]
    fn test_reset() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(1024, 1024)).unwrap();
        for _ in 0..3 {
            log.append(record(b"r")).unwrap();
        }
        log.reset().unwrap();
        assert_eq!(log.highest_offset().unwrap(), None);
        assert_eq!(log.append(record(b"fresh")).unwrap(), 0);
    }

    #[test]
    fn test_closed_log_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), config(1024, 1024)).unwrap();
        log.append(record(b"r")).unwrap();
        log.close().unwrap();
        log.close().unwrap(); // idempotent

        assert!(matches!(log.append(record(b"r")).unwrap_err(), Error::Closed));
        assert!(matches!(log.read(0).unwrap_err(), Error::Closed));
    }

    #[test]
    fn test_unpaired_files_are_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("0.store"), b"").unwrap();
        let err = CommitLog::open(dir.path(), config(1024, 1024)).unwrap_err();
        assert!(matches!(err, Error::MalformedDir(_)));
    }
}
