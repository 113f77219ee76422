//! Configuration for opening a [`Log`](crate::Log).

use std::path::PathBuf;
use std::time::Duration;

/// Settings for the segmented log and its compactor.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding segment files. Created if missing.
    pub dir: PathBuf,

    /// Maximum number of entries per segment.
    ///
    /// When the active segment reaches this capacity the log rolls to a new
    /// segment. Sealed segments are the unit of compaction, so a smaller
    /// capacity compacts sooner at the cost of more files.
    pub max_segment_entries: usize,

    /// Interval between compaction passes.
    pub minor_compaction_interval: Duration,

    /// Minimum time between major compaction passes.
    ///
    /// The compactor runs on the minor interval; a pass is upgraded to major
    /// once this much time has elapsed since the previous major pass.
    pub major_compaction_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("raft-log"),
            max_segment_entries: 1024,
            minor_compaction_interval: Duration::from_secs(60),
            major_compaction_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl StorageConfig {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}
