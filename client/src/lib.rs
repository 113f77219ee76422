//! Session client.
//!
//! Registers a session with the cluster, keeps it alive at half the session
//! timeout, and routes commands and queries to the current leader. Command
//! sequences are assigned once and resent verbatim after a leader change;
//! the cluster deduplicates, so a retried command applies at most once.
//! Server-pushed events arrive in sequence order on the channel returned by
//! [`RaftClient::events`]; gaps trigger the resend protocol transparently.

mod client;

pub use client::{ClientConfig, RaftClient};
pub use protocol::{Consistency, Error, Result};
