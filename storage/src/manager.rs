//! Segment set management: rolling, lookup, truncation, compaction swaps.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::entry::{Entry, Index};
use crate::error::{Error, Result};
use crate::segment::Segment;

/// A point-in-time copy of one sealed segment, handed to the compactor so
/// it can rewrite the segment without holding the log lock.
pub(crate) struct SegmentSnapshot {
    pub(crate) first_index: Index,
    pub(crate) entries: Vec<Option<Entry>>,
}

pub(crate) struct SegmentManager {
    dir: PathBuf,
    /// Segments keyed by their first index; contiguous by construction.
    segments: BTreeMap<Index, Segment>,
    next_segment_id: u64,
    capacity: usize,
}

impl SegmentManager {
    pub(crate) fn open(dir: &Path, capacity: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut segments = BTreeMap::new();
        let mut max_id = 0;
        for dirent in std::fs::read_dir(dir)? {
            let path = dirent?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.starts_with("segment-") || !name.ends_with(".log") {
                continue;
            }
            let segment = Segment::open(&path)?;
            max_id = max_id.max(segment.id());
            segments.insert(segment.first_index(), segment);
        }

        let mut manager = Self {
            dir: dir.to_path_buf(),
            segments,
            next_segment_id: max_id + 1,
            capacity,
        };

        if manager.segments.is_empty() {
            let id = manager.allocate_id();
            let segment = Segment::create(&manager.dir, id, 1, capacity, 0)?;
            manager.segments.insert(1, segment);
        } else {
            manager.check_contiguous()?;
        }
        Ok(manager)
    }

    fn check_contiguous(&self) -> Result<()> {
        let mut expected = None;
        for segment in self.segments.values() {
            if let Some(expected) = expected {
                if segment.first_index() != expected {
                    return Err(Error::Corruption(format!(
                        "segment gap: expected first index {}, found {}",
                        expected,
                        segment.first_index()
                    )));
                }
            }
            expected = Some(segment.next_index());
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    fn active(&self) -> &Segment {
        self.segments
            .values()
            .next_back()
            .expect("segment set is never empty")
    }

    fn active_mut(&mut self) -> &mut Segment {
        self.segments
            .values_mut()
            .next_back()
            .expect("segment set is never empty")
    }

    /// First index the log covers (holes included).
    pub(crate) fn first_index(&self) -> Index {
        self.segments
            .values()
            .next()
            .expect("segment set is never empty")
            .first_index()
    }

    /// Highest assigned index, or 0 if the log is empty.
    pub(crate) fn last_index(&self) -> Index {
        self.active().next_index() - 1
    }

    pub(crate) fn next_index(&self) -> Index {
        self.active().next_index()
    }

    pub(crate) fn append(&mut self, entry: Entry, timestamp: i64) -> Result<Index> {
        if entry.index != self.next_index() {
            return Err(Error::IllegalState(format!(
                "entry index {} does not follow log tail {}",
                entry.index,
                self.last_index()
            )));
        }
        self.roll_if_full(timestamp)?;
        self.active_mut().append(entry)
    }

    /// Writes hole markers until the next append lands at `index`. Used by
    /// replicas receiving a batch that starts above their tail because the
    /// leader already compacted the gap away.
    pub(crate) fn skip_until(&mut self, index: Index, timestamp: i64) -> Result<()> {
        while self.next_index() < index {
            self.roll_if_full(timestamp)?;
            self.active_mut().append_hole(0)?;
        }
        Ok(())
    }

    fn roll_if_full(&mut self, timestamp: i64) -> Result<()> {
        if !self.active().is_full() {
            return Ok(());
        }
        self.active_mut().flush()?;
        let first_index = self.active().next_index();
        let id = self.allocate_id();
        let segment = Segment::create(&self.dir, id, first_index, self.capacity, timestamp)?;
        self.segments.insert(first_index, segment);
        Ok(())
    }

    fn segment_for(&self, index: Index) -> Option<&Segment> {
        self.segments
            .range(..=index)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.covers(index))
    }

    pub(crate) fn get(&self, index: Index) -> Option<&Entry> {
        self.segment_for(index)?.get(index)
    }

    pub(crate) fn contains(&self, index: Index) -> bool {
        self.segment_for(index).is_some_and(|s| s.contains(index))
    }

    pub(crate) fn truncate(&mut self, index: Index) -> Result<()> {
        if index >= self.last_index() {
            return Ok(());
        }
        let mut trailing: Vec<Index> = self
            .segments
            .range(index + 1..)
            .map(|(first, _)| *first)
            .collect();
        // Never drop the segment containing index + 1 itself; truncate it.
        if let Some(first) = trailing.first().copied() {
            if first <= index + 1 {
                trailing.remove(0);
            }
        }
        for first in trailing {
            let segment = self
                .segments
                .remove(&first)
                .expect("trailing segment present");
            segment.delete()?;
        }
        self.active_mut().truncate(index)?;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.active_mut().flush()
    }

    pub(crate) fn delete(self) -> Result<()> {
        for (_, segment) in self.segments {
            segment.delete()?;
        }
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Sealed segments whose whole index range is at or below `watermark`.
    /// The active segment is never eligible.
    pub(crate) fn compactable(&self, watermark: Index) -> Vec<Index> {
        let active_first = self.active().first_index();
        self.segments
            .values()
            .filter(|s| s.first_index() != active_first)
            .filter(|s| s.last_index().is_some_and(|last| last <= watermark))
            .map(|s| s.first_index())
            .collect()
    }

    pub(crate) fn snapshot(&self, first_index: Index) -> Option<SegmentSnapshot> {
        let segment = self.segments.get(&first_index)?;
        let last_index = segment.last_index()?;
        let entries = (first_index..=last_index)
            .map(|i| segment.get(i).cloned())
            .collect();
        Some(SegmentSnapshot {
            first_index,
            entries,
        })
    }

    pub(crate) fn create_detached(&mut self, first_index: Index, timestamp: i64) -> Result<Segment> {
        let id = self.allocate_id();
        Segment::create(&self.dir, id, first_index, self.capacity, timestamp)
    }

    /// Atomically replaces the sealed segment at `first_index` with its
    /// rewritten successor. Fails if the original disappeared (e.g. a
    /// truncation raced the rewrite), in which case the caller discards the
    /// replacement.
    pub(crate) fn replace(&mut self, first_index: Index, replacement: Segment) -> Result<()> {
        let matches = self
            .segments
            .get(&first_index)
            .is_some_and(|old| old.last_index() == replacement.last_index());
        if !matches {
            replacement.delete()?;
            return Err(Error::IllegalState(format!(
                "segment at {} changed during compaction",
                first_index
            )));
        }
        let old = self
            .segments
            .insert(first_index, replacement)
            .expect("segment presence checked above");
        old.delete()?;
        Ok(())
    }

    /// Number of live entries across all segments, for observability.
    pub(crate) fn live_entries(&self) -> usize {
        self.segments.values().map(|s| s.live_entries()).sum()
    }
}
