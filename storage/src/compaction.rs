//! Two-tier background compaction.
//!
//! A single compactor task wakes on the minor interval and runs one pass at
//! a time: minor by default, upgraded to major once the major interval has
//! elapsed since the previous major pass. Watermarks (the commit index for
//! minor passes, the global index for major passes) arrive over watch
//! channels so the consensus loop never blocks on compaction.
//!
//! A pass snapshots each eligible sealed segment, asks the installed
//! [`EntryFilter`] about every live entry, rewrites survivors into a fresh
//! segment file (holes become skip frames), and swaps the replacement in
//! under the log lock. A swap is abandoned if the original segment changed
//! while the rewrite ran.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::StorageConfig;
use crate::entry::{Entry, Index};
use crate::error::Result;
use crate::log::Log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionKind {
    /// Safe up to the commit index; drops entries the filter rejects.
    Minor,
    /// Safe up to the global index; may also drop session bookkeeping.
    Major,
}

/// Context passed to filters during a pass.
#[derive(Debug, Clone, Copy)]
pub struct Compaction {
    pub kind: CompactionKind,
    /// Entries at or below this index are eligible.
    pub index: Index,
}

/// Decides which entries survive a compaction pass.
#[async_trait]
pub trait EntryFilter: Send + Sync {
    /// Returns true to keep `entry`, false to discard it.
    async fn keep(&self, entry: &Entry, compaction: &Compaction) -> bool;
}

/// Handle owned by the server: feeds watermarks, stops the task on close.
pub struct CompactorHandle {
    minor_tx: watch::Sender<Index>,
    major_tx: watch::Sender<Index>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl CompactorHandle {
    /// Raises the minor watermark (the commit index). Never decreases.
    pub fn set_minor_index(&self, index: Index) {
        let _ = self.minor_tx.send_if_modified(|current| {
            if index > *current {
                *current = index;
                true
            } else {
                false
            }
        });
    }

    /// Raises the major watermark (the global index). Never decreases.
    pub fn set_major_index(&self, index: Index) {
        let _ = self.major_tx.send_if_modified(|current| {
            if index > *current {
                *current = index;
                true
            } else {
                false
            }
        });
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

pub struct Compactor;

impl Compactor {
    /// Spawns the background compaction task for `log`.
    pub fn start(log: Log, filter: Arc<dyn EntryFilter>, config: &StorageConfig) -> CompactorHandle {
        let (minor_tx, minor_rx) = watch::channel(0);
        let (major_tx, major_rx) = watch::channel(0);
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(
            log,
            filter,
            config.minor_compaction_interval,
            config.major_compaction_interval,
            minor_rx,
            major_rx,
            stop.clone(),
        ));
        CompactorHandle {
            minor_tx,
            major_tx,
            stop,
            task,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    log: Log,
    filter: Arc<dyn EntryFilter>,
    minor_interval: Duration,
    major_interval: Duration,
    minor_rx: watch::Receiver<Index>,
    major_rx: watch::Receiver<Index>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(minor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();
    let mut last_major = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let compaction = if last_major.elapsed() >= major_interval {
                    last_major = Instant::now();
                    Compaction { kind: CompactionKind::Major, index: *major_rx.borrow() }
                } else {
                    Compaction { kind: CompactionKind::Minor, index: *minor_rx.borrow() }
                };
                if compaction.index == 0 {
                    continue;
                }
                match compact(&log, filter.as_ref(), &compaction).await {
                    Ok(discarded) if discarded > 0 => {
                        tracing::debug!(
                            "{:?} compaction discarded {} entries up to index {}",
                            compaction.kind, discarded, compaction.index
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("compaction pass failed: {}", e),
                }
            }
            _ = stop.cancelled() => break,
        }
    }
}

/// Runs one compaction pass over every eligible sealed segment.
///
/// Returns the number of entries discarded. Exposed so tests and operators
/// can force a pass without waiting for the ticker.
pub async fn compact(log: &Log, filter: &dyn EntryFilter, compaction: &Compaction) -> Result<usize> {
    let candidates = log.read().compactable(compaction.index);
    let mut discarded_total = 0;

    for first_index in candidates {
        let Some(snapshot) = log.read().snapshot(first_index) else {
            continue;
        };

        // Decide fates without holding the log lock; filters may hop to the
        // state machine context.
        let mut fates = Vec::with_capacity(snapshot.entries.len());
        let mut discarded = 0;
        for slot in &snapshot.entries {
            let keep = match slot {
                Some(entry) => filter.keep(entry, compaction).await,
                None => false,
            };
            if !keep && slot.is_some() {
                discarded += 1;
            }
            fates.push(keep);
        }
        if discarded == 0 {
            continue;
        }

        let mut replacement = log.write().create_detached(first_index, 0)?;
        for (slot, keep) in snapshot.entries.into_iter().zip(fates) {
            match slot {
                Some(entry) if keep => {
                    replacement.append(entry)?;
                }
                Some(entry) => replacement.append_hole(entry.term)?,
                None => replacement.append_hole(0)?,
            }
        }
        replacement.flush()?;

        match log.write().replace(first_index, replacement) {
            Ok(()) => discarded_total += discarded,
            Err(e) => {
                tracing::debug!(
                    "abandoning compaction of segment at {}: {}",
                    first_index, e
                );
            }
        }
    }

    Ok(discarded_total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Record, SessionId};
    use bytes::Bytes;

    struct PayloadFilter;

    #[async_trait]
    impl EntryFilter for PayloadFilter {
        async fn keep(&self, entry: &Entry, _compaction: &Compaction) -> bool {
            match &entry.record {
                Record::Command { operation, .. } => operation.as_ref() != b"noop",
                _ => true,
            }
        }
    }

    struct DropNothing;

    #[async_trait]
    impl EntryFilter for DropNothing {
        async fn keep(&self, _entry: &Entry, _compaction: &Compaction) -> bool {
            true
        }
    }

    fn command(index: Index, session: SessionId, payload: &str) -> Entry {
        Entry::new(
            index,
            1,
            Record::Command {
                session,
                sequence: index,
                timestamp: 0,
                operation: Bytes::copy_from_slice(payload.as_bytes()),
            },
        )
    }

    fn open_log(dir: &std::path::Path, max_segment_entries: usize) -> Log {
        let config = StorageConfig {
            dir: dir.to_path_buf(),
            max_segment_entries,
            ..Default::default()
        };
        Log::open(&config).unwrap()
    }

    #[tokio::test]
    async fn should_discard_filtered_entries_and_keep_the_rest() {
        // given: 10 commands in 5-entry segments, every second one "noop"
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 5);
        for i in 1..=10 {
            let payload = if i % 2 == 0 { "noop" } else { "keep" };
            log.append(command(i, 1, payload)).unwrap();
        }
        // roll so the second segment is sealed too
        log.append(command(11, 1, "tail")).unwrap();

        // when: minor compaction up to index 10
        let compaction = Compaction {
            kind: CompactionKind::Minor,
            index: 10,
        };
        let discarded = compact(&log, &PayloadFilter, &compaction).await.unwrap();

        // then
        assert_eq!(discarded, 5);
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 11);
        for i in (1..=10).step_by(2) {
            assert_eq!(log.get(i), Some(command(i, 1, "keep")));
        }
        for i in (2..=10).step_by(2) {
            assert_eq!(log.get(i), None);
            assert!(!log.contains(i));
        }
    }

    #[tokio::test]
    async fn should_not_touch_the_active_segment() {
        // given: one sealed segment of noops and an active segment
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 3);
        for i in 1..=4 {
            log.append(command(i, 1, "noop")).unwrap();
        }

        // when: compaction watermark covers everything
        let compaction = Compaction {
            kind: CompactionKind::Minor,
            index: 4,
        };
        compact(&log, &PayloadFilter, &compaction).await.unwrap();

        // then: the sealed segment was compacted, the active one kept
        assert!(!log.contains(1));
        assert!(!log.contains(3));
        assert!(log.contains(4));
    }

    #[tokio::test]
    async fn should_skip_segments_above_the_watermark() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 2);
        for i in 1..=6 {
            log.append(command(i, 1, "noop")).unwrap();
        }

        // when: only the first segment is below the watermark
        let compaction = Compaction {
            kind: CompactionKind::Minor,
            index: 2,
        };
        compact(&log, &PayloadFilter, &compaction).await.unwrap();

        // then
        assert!(!log.contains(1));
        assert!(!log.contains(2));
        assert!(log.contains(3));
        assert!(log.contains(4));
    }

    #[tokio::test]
    async fn should_leave_segments_alone_when_nothing_is_discarded() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), 2);
        for i in 1..=4 {
            log.append(command(i, 1, "keep")).unwrap();
        }
        let files_before = std::fs::read_dir(dir.path()).unwrap().count();

        // when
        let compaction = Compaction {
            kind: CompactionKind::Minor,
            index: 4,
        };
        let discarded = compact(&log, &DropNothing, &compaction).await.unwrap();

        // then: no rewrite happened
        assert_eq!(discarded, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), files_before);
    }

    #[tokio::test]
    async fn should_survive_reopen_after_compaction() {
        // given
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(dir.path(), 4);
            for i in 1..=4 {
                let payload = if i <= 2 { "noop" } else { "keep" };
                log.append(command(i, 1, payload)).unwrap();
            }
            log.append(command(5, 1, "tail")).unwrap();
            let compaction = Compaction {
                kind: CompactionKind::Minor,
                index: 4,
            };
            compact(&log, &PayloadFilter, &compaction).await.unwrap();
            log.flush().unwrap();
        }

        // when
        let log = open_log(dir.path(), 4);

        // then: holes and survivors both round-trip through the files
        assert!(!log.contains(1));
        assert!(!log.contains(2));
        assert_eq!(log.get(3), Some(command(3, 1, "keep")));
        assert_eq!(log.get(4), Some(command(4, 1, "keep")));
        assert_eq!(log.last_index(), 5);
    }
}
