//! Segmented append-only log with two-tier compaction.
//!
//! The log is the durable heart of the replication protocol: an ordered
//! sequence of entries partitioned into fixed-capacity segments, each backed
//! by a single file of length-prefixed frames. An in-memory slot index per
//! segment is rebuilt on open by scanning the file.
//!
//! # Compaction
//!
//! Instead of snapshots, the log is compacted incrementally in two tiers:
//!
//! - **Minor** passes cover segments wholly below the commit index and drop
//!   entries the installed [`EntryFilter`] no longer wants.
//! - **Major** passes cover segments wholly below the global index (the
//!   index replicated to *every* active member) and may additionally discard
//!   session bookkeeping and tombstone-like state.
//!
//! Compacted-out entries leave holes: [`Log::get`] returns `None` for them
//! while surrounding indexes stay addressable. The active segment is never
//! compacted, so appends proceed concurrently with a pass.
//!
//! # Example
//!
//! ```ignore
//! use storage::{Log, StorageConfig, Entry, Record};
//!
//! let log = Log::open(StorageConfig::with_dir("/var/lib/raft"))?;
//! let index = log.append(Entry::new(log.next_index(), 1, Record::NoOp))?;
//! assert!(log.contains(index));
//! ```

mod compaction;
mod config;
mod entry;
mod error;
mod log;
mod manager;
mod segment;

pub use compaction::{Compaction, CompactionKind, Compactor, CompactorHandle, EntryFilter};
pub use config::StorageConfig;
pub use entry::{Entry, Index, Record, SessionId, Term};
pub use error::{Error, Result};
pub use log::Log;
