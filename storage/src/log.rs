//! The log facade shared between the consensus loop and the compactor.

use std::sync::{Arc, RwLock};

use common::clock::{Clock, SystemClock};

use crate::config::StorageConfig;
use crate::entry::{Entry, Index, Term};
use crate::error::{Error, Result};
use crate::manager::SegmentManager;

/// Handle to the segmented log.
///
/// Cloning is cheap; all clones address the same segment set. The consensus
/// loop performs appends, reads, and truncation; the compactor clones the
/// handle and rewrites sealed segments in the background. Lock scopes are
/// short: no IO-free caller ever blocks on a compaction pass, and the active
/// segment is excluded from compaction so appends never contend with a
/// rewrite.
#[derive(Clone)]
pub struct Log {
    inner: Arc<RwLock<SegmentManager>>,
    clock: Arc<dyn Clock>,
}

impl Log {
    /// Opens or creates the log under the configured directory.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: &StorageConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let manager = SegmentManager::open(&config.dir, config.max_segment_entries)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(manager)),
            clock,
        })
    }

    /// Index the next appended entry must carry.
    pub fn next_index(&self) -> Index {
        self.read().next_index()
    }

    pub fn first_index(&self) -> Index {
        self.read().first_index()
    }

    /// Highest assigned index, or 0 for an empty log.
    pub fn last_index(&self) -> Index {
        self.read().last_index()
    }

    /// Term of the last assigned entry, 0 for an empty log.
    pub fn last_term(&self) -> Term {
        let inner = self.read();
        let last = inner.last_index();
        if last == 0 {
            0
        } else {
            inner.get(last).map(|e| e.term).unwrap_or(0)
        }
    }

    /// Appends an entry at the tail, rolling segments at capacity.
    pub fn append(&self, entry: Entry) -> Result<Index> {
        let timestamp = self.clock.unix_millis();
        self.write().append(entry, timestamp)
    }

    /// Reserves hole slots up to (but excluding) `index`, so a batch whose
    /// leading entries were compacted away on the sender still lands at the
    /// right positions.
    pub fn skip_until(&self, index: Index) -> Result<()> {
        let timestamp = self.clock.unix_millis();
        self.write().skip_until(index, timestamp)
    }

    /// Returns the entry at `index`, or `None` for holes and out-of-range
    /// indexes.
    pub fn get(&self, index: Index) -> Option<Entry> {
        self.read().get(index).cloned()
    }

    /// True iff `index` is assigned and was not compacted out.
    pub fn contains(&self, index: Index) -> bool {
        self.read().contains(index)
    }

    pub fn term_of(&self, index: Index) -> Option<Term> {
        self.read().get(index).map(|e| e.term)
    }

    /// Copies up to `max` live entries starting at `from`, for replication.
    pub fn entries_from(&self, from: Index, max: usize) -> Vec<Entry> {
        let inner = self.read();
        let last = inner.last_index();
        let mut entries = Vec::new();
        let mut index = from.max(inner.first_index());
        while index <= last && entries.len() < max {
            if let Some(entry) = inner.get(index) {
                entries.push(entry.clone());
            }
            index += 1;
        }
        entries
    }

    /// Discards all entries with index greater than `index`.
    pub fn truncate(&self, index: Index) -> Result<()> {
        self.write().truncate(index)
    }

    pub fn flush(&self) -> Result<()> {
        self.write().flush()
    }

    /// Number of live (non-hole) entries, for tests and observability.
    pub fn live_entries(&self) -> usize {
        self.read().live_entries()
    }

    /// Removes the log from disk. Fails while other handles are alive.
    pub fn delete(self) -> Result<()> {
        let Self { inner, .. } = self;
        let manager = Arc::try_unwrap(inner)
            .map_err(|_| Error::IllegalState("cannot delete log while handles are open".into()))?
            .into_inner()
            .expect("lock poisoned");
        manager.delete()
    }

    pub(crate) fn read(&self) -> std::sync::RwLockReadGuard<'_, SegmentManager> {
        self.inner.read().expect("lock poisoned")
    }

    pub(crate) fn write(&self) -> std::sync::RwLockWriteGuard<'_, SegmentManager> {
        self.inner.write().expect("lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Record;
    use bytes::Bytes;

    fn open_log(dir: &std::path::Path, max_segment_entries: usize) -> Log {
        let config = StorageConfig {
            dir: dir.to_path_buf(),
            max_segment_entries,
            ..Default::default()
        };
        Log::open(&config).unwrap()
    }

    fn command(index: Index, payload: &str) -> Entry {
        Entry::new(
            index,
            1,
            Record::Command {
                session: 1,
                sequence: index,
                timestamp: 0,
                operation: Bytes::copy_from_slice(payload.as_bytes()),
            },
        )
    }

    #[test]
    fn should_start_empty_with_first_index_one() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 8);

        // then
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.next_index(), 1);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn should_roll_segments_at_capacity() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 3);

        // when: append across the segment boundary
        for i in 1..=7 {
            log.append(command(i, "v")).unwrap();
        }

        // then
        assert_eq!(log.last_index(), 7);
        assert!(log.contains(1));
        assert!(log.contains(7));
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 3);
    }

    #[test]
    fn should_recover_entries_after_reopen() {
        // given
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(dir.path(), 3);
            for i in 1..=5 {
                log.append(command(i, "v")).unwrap();
            }
            log.flush().unwrap();
        }

        // when
        let log = open_log(dir.path(), 3);

        // then
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.get(4), Some(command(4, "v")));
        assert_eq!(log.next_index(), 6);
    }

    #[test]
    fn should_reject_out_of_order_append() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 8);
        log.append(command(1, "v")).unwrap();

        // when
        let result = log.append(command(5, "v"));

        // then
        assert!(matches!(result, Err(Error::IllegalState(_))));
    }

    #[test]
    fn should_truncate_across_segments() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 2);
        for i in 1..=6 {
            log.append(command(i, "v")).unwrap();
        }

        // when
        log.truncate(3).unwrap();

        // then
        assert_eq!(log.last_index(), 3);
        assert!(!log.contains(4));
        assert_eq!(log.next_index(), 4);

        // and the log accepts appends from the new tail
        log.append(command(4, "w")).unwrap();
        assert_eq!(log.get(4), Some(command(4, "w")));
    }

    #[test]
    fn should_skip_holes_in_replication_batches() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 8);
        log.skip_until(4).unwrap();
        log.append(command(4, "v")).unwrap();

        // then
        assert_eq!(log.last_index(), 4);
        assert!(!log.contains(2));
        assert_eq!(log.entries_from(1, 10), vec![command(4, "v")]);
    }
}
