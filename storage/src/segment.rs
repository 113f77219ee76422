//! A single log segment: one file, one contiguous index range.
//!
//! Segments are created with a fixed entry capacity and sealed implicitly
//! when the manager rolls to a successor. Each segment keeps its decoded
//! entries in memory alongside the file offsets of their frames; both are
//! rebuilt on open by scanning the file, so no separate index is persisted.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::entry::{Entry, Index, Record, Term, TYPE_SKIP};
use crate::error::{Error, Result};

const SEGMENT_VERSION: u8 = 1;
// version | id | first_index | max_entries | timestamp
const HEADER_LEN: u64 = 1 + 8 + 8 + 4 + 8;

pub(crate) struct Segment {
    id: u64,
    first_index: Index,
    timestamp: i64,
    path: PathBuf,
    file: File,
    /// Slot per assigned index; `None` marks a compacted-out hole.
    slots: Vec<Option<Entry>>,
    /// File offset of each slot's frame, parallel to `slots`.
    offsets: Vec<u64>,
    size: u64,
    capacity: usize,
}

impl Segment {
    /// Creates a fresh segment file and writes its header.
    pub(crate) fn create(
        dir: &Path,
        id: u64,
        first_index: Index,
        capacity: usize,
        timestamp: i64,
    ) -> Result<Self> {
        let path = dir.join(format!("segment-{}.log", id));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut header = BytesMut::with_capacity(HEADER_LEN as usize);
        header.put_u8(SEGMENT_VERSION);
        header.put_u64(id);
        header.put_u64(first_index);
        header.put_u32(capacity as u32);
        header.put_i64(timestamp);
        file.write_all(&header)?;

        Ok(Self {
            id,
            first_index,
            timestamp,
            path,
            file,
            slots: Vec::new(),
            offsets: Vec::new(),
            size: HEADER_LEN,
            capacity,
        })
    }

    /// Opens an existing segment file, rebuilding the in-memory index by
    /// scanning frames. A torn frame at the tail is discarded. The entry
    /// capacity recorded in the header wins over the configured one.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        if raw.len() < HEADER_LEN as usize {
            return Err(Error::Corruption(format!(
                "segment {} shorter than header",
                path.display()
            )));
        }
        let mut buf = Bytes::from(raw);
        let version = buf.get_u8();
        if version != SEGMENT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported segment version {}",
                version
            )));
        }
        let id = buf.get_u64();
        let first_index = buf.get_u64();
        let capacity = buf.get_u32() as usize;
        let timestamp = buf.get_i64();

        let mut slots = Vec::new();
        let mut offsets = Vec::new();
        let mut offset = HEADER_LEN;
        loop {
            if buf.remaining() == 0 {
                break;
            }
            if buf.remaining() < 4 {
                tracing::warn!("segment {}: discarding torn frame tail", path.display());
                break;
            }
            let len = buf.get_u32() as usize;
            if buf.remaining() < len || len < 9 {
                tracing::warn!("segment {}: discarding torn frame tail", path.display());
                break;
            }
            let mut body = buf.split_to(len);
            let term = body.get_u64();
            let type_id = body.get_u8();
            let index = first_index + slots.len() as Index;
            if type_id == TYPE_SKIP {
                slots.push(None);
            } else {
                let record = Record::decode_payload(type_id, body)?;
                slots.push(Some(Entry::new(index, term, record)));
            }
            offsets.push(offset);
            offset += 4 + len as u64;
        }

        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;

        Ok(Self {
            id,
            first_index,
            timestamp,
            path: path.to_path_buf(),
            file,
            slots,
            offsets,
            size: offset,
            capacity,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn first_index(&self) -> Index {
        self.first_index
    }

    /// Index the next appended entry will receive.
    pub(crate) fn next_index(&self) -> Index {
        self.first_index + self.slots.len() as Index
    }

    pub(crate) fn last_index(&self) -> Option<Index> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.next_index() - 1)
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Number of live (non-hole) entries.
    pub(crate) fn live_entries(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn append(&mut self, entry: Entry) -> Result<Index> {
        if entry.index != self.next_index() {
            return Err(Error::IllegalState(format!(
                "entry index {} does not follow segment tail {}",
                entry.index,
                self.next_index()
            )));
        }
        if self.is_full() {
            return Err(Error::IllegalState("segment is full".into()));
        }

        let index = entry.index;
        self.write_frame(entry.term, entry.record.type_id(), |buf| {
            entry.record.encode_payload(buf)
        })?;
        self.slots.push(Some(entry));
        Ok(index)
    }

    /// Writes a skip marker, reserving the next index as a hole. Used when
    /// compaction rewrites a segment without one of its entries.
    pub(crate) fn append_hole(&mut self, term: Term) -> Result<()> {
        if self.is_full() {
            return Err(Error::IllegalState("segment is full".into()));
        }
        self.write_frame(term, TYPE_SKIP, |_| {})?;
        self.slots.push(None);
        Ok(())
    }

    fn write_frame(
        &mut self,
        term: Term,
        type_id: u8,
        encode: impl FnOnce(&mut BytesMut),
    ) -> Result<()> {
        let mut body = BytesMut::with_capacity(32);
        body.put_u64(term);
        body.put_u8(type_id);
        encode(&mut body);

        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        self.file.write_all(&frame)?;

        self.offsets.push(self.size);
        self.size += frame.len() as u64;
        Ok(())
    }

    pub(crate) fn get(&self, index: Index) -> Option<&Entry> {
        let slot = index.checked_sub(self.first_index)?;
        self.slots.get(slot as usize)?.as_ref()
    }

    pub(crate) fn contains(&self, index: Index) -> bool {
        self.get(index).is_some()
    }

    /// Whether `index` falls inside this segment's assigned range, hole or not.
    pub(crate) fn covers(&self, index: Index) -> bool {
        index >= self.first_index && index < self.next_index()
    }

    /// Discards all entries above `index`, shrinking the file to match.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<()> {
        if index + 1 < self.first_index {
            return Err(Error::IllegalArgument(format!(
                "cannot truncate segment starting at {} to {}",
                self.first_index, index
            )));
        }
        let keep = (index + 1 - self.first_index) as usize;
        if keep >= self.slots.len() {
            return Ok(());
        }
        let new_size = self.offsets[keep];
        self.file.set_len(new_size)?;
        self.file.seek(SeekFrom::Start(new_size))?;
        self.slots.truncate(keep);
        self.offsets.truncate(keep);
        self.size = new_size;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn delete(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Record;

    fn noop(index: Index, term: Term) -> Entry {
        Entry::new(index, term, Record::NoOp)
    }

    fn command(index: Index, payload: &'static [u8]) -> Entry {
        Entry::new(
            index,
            1,
            Record::Command {
                session: 1,
                sequence: index,
                timestamp: 0,
                operation: Bytes::from_static(payload),
            },
        )
    }

    #[test]
    fn should_append_and_read_back_entries() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1, 1, 16, 0).unwrap();

        // when
        segment.append(noop(1, 1)).unwrap();
        segment.append(command(2, b"a")).unwrap();

        // then
        assert_eq!(segment.last_index(), Some(2));
        assert!(segment.contains(1));
        assert_eq!(segment.get(2), Some(&command(2, b"a")));
        assert!(segment.get(3).is_none());
    }

    #[test]
    fn should_reject_non_contiguous_append() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1, 1, 16, 0).unwrap();
        segment.append(noop(1, 1)).unwrap();

        // when
        let result = segment.append(noop(5, 1));

        // then
        assert!(matches!(result, Err(Error::IllegalState(_))));
    }

    #[test]
    fn should_rebuild_index_on_reopen() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut segment = Segment::create(dir.path(), 3, 10, 16, 777).unwrap();
            segment.append(noop(10, 2)).unwrap();
            segment.append(command(11, b"x")).unwrap();
            segment.append_hole(2).unwrap();
            segment.append(command(13, b"y")).unwrap();
            segment.flush().unwrap();
            segment.path().to_path_buf()
        };

        // when
        let segment = Segment::open(&path).unwrap();

        // then
        assert_eq!(segment.id(), 3);
        assert_eq!(segment.first_index(), 10);
        assert_eq!(segment.timestamp, 777);
        assert_eq!(segment.last_index(), Some(13));
        assert!(segment.contains(10));
        assert!(!segment.contains(12));
        assert!(segment.covers(12));
        assert_eq!(segment.get(13), Some(&command(13, b"y")));
    }

    #[test]
    fn should_truncate_entries_and_file() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1, 1, 16, 0).unwrap();
        for i in 1..=5 {
            segment.append(command(i, b"p")).unwrap();
        }

        // when
        segment.truncate(2).unwrap();

        // then
        assert_eq!(segment.last_index(), Some(2));
        assert!(!segment.contains(3));

        // and appends continue from the truncation point
        segment.append(command(3, b"q")).unwrap();
        assert_eq!(segment.get(3), Some(&command(3, b"q")));

        // and the truncation survives reopen
        let path = segment.path().to_path_buf();
        segment.flush().unwrap();
        drop(segment);
        let reopened = Segment::open(&path).unwrap();
        assert_eq!(reopened.last_index(), Some(3));
        assert_eq!(reopened.get(3), Some(&command(3, b"q")));
    }

    #[test]
    fn should_report_full_at_capacity() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1, 1, 2, 0).unwrap();
        segment.append(noop(1, 1)).unwrap();
        segment.append(noop(2, 1)).unwrap();

        // then
        assert!(segment.is_full());
        assert!(matches!(
            segment.append(noop(3, 1)),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn should_discard_torn_tail_on_open() {
        // given: a segment whose last frame is half-written
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut segment = Segment::create(dir.path(), 1, 1, 16, 0).unwrap();
            segment.append(command(1, b"keep")).unwrap();
            segment.flush().unwrap();
            segment.path().to_path_buf()
        };
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 9]).unwrap();
        drop(file);

        // when
        let segment = Segment::open(&path).unwrap();

        // then
        assert_eq!(segment.last_index(), Some(1));
        assert_eq!(segment.get(1), Some(&command(1, b"keep")));
    }
}
