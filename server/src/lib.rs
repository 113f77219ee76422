//! Consensus server: role state machine, sessions, and the two-loop
//! execution model.
//!
//! A server owns a segmented replicated log and drives it through the
//! Follower / Candidate / Leader / Passive / Join / Leave role machine.
//! Committed entries are applied to a user-provided [`StateMachine`] on a
//! dedicated task, in strict log order, with per-session at-most-once
//! command semantics and ordered event delivery.
//!
//! # Example
//!
//! ```ignore
//! use server::{RaftServer, ServerConfig};
//!
//! let server = RaftServer::start(
//!     ServerConfig::default(),
//!     member,
//!     initial_members,
//!     transport,
//!     Box::new(MyStateMachine::new()),
//! )
//! .await?;
//! ```

mod cluster;
mod config;
mod connections;
mod context;
mod roles;
mod session;
mod state_machine;

pub use config::ServerConfig;
pub use context::{RaftServer, ServerStatus, State};
pub use state_machine::{Commit, SessionHandle, StateMachine};
