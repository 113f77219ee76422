//! RPC request and response types.
//!
//! Every request carries the sender's term where the protocol needs it;
//! membership-changing requests share one request/response shape
//! ([`ConfigureRequest`]/[`ConfigureResponse`]) parameterized by the
//! operation, since they differ only in how the leader edits the member
//! sets.

use bytes::Bytes;
use common::{Member, MemberId};
use storage::{Entry, Index, SessionId, Term};

use crate::error::Error;

#[derive(Debug, Clone)]
pub enum Request {
    Vote(VoteRequest),
    Poll(PollRequest),
    Append(AppendRequest),
    Sync(SyncRequest),
    Register(RegisterRequest),
    KeepAlive(KeepAliveRequest),
    Join(ConfigureRequest),
    Leave(ConfigureRequest),
    Promote(ConfigureRequest),
    Demote(ConfigureRequest),
    Command(CommandRequest),
    Query(QueryRequest),
    Publish(PublishRequest),
}

impl Request {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Vote(_) => "Vote",
            Request::Poll(_) => "Poll",
            Request::Append(_) => "Append",
            Request::Sync(_) => "Sync",
            Request::Register(_) => "Register",
            Request::KeepAlive(_) => "KeepAlive",
            Request::Join(_) => "Join",
            Request::Leave(_) => "Leave",
            Request::Promote(_) => "Promote",
            Request::Demote(_) => "Demote",
            Request::Command(_) => "Command",
            Request::Query(_) => "Query",
            Request::Publish(_) => "Publish",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    Vote(VoteResponse),
    Poll(PollResponse),
    Append(AppendResponse),
    Sync(SyncResponse),
    Register(RegisterResponse),
    KeepAlive(KeepAliveResponse),
    Join(ConfigureResponse),
    Leave(ConfigureResponse),
    Promote(ConfigureResponse),
    Demote(ConfigureResponse),
    Command(CommandResponse),
    Query(QueryResponse),
    Publish(PublishResponse),
}

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

/// Pre-vote probe: same shape as [`VoteRequest`], but a grant persists
/// nothing on the voter.
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Debug, Clone)]
pub struct PollResponse {
    pub term: Term,
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: MemberId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub commit_index: Index,
    pub global_index: Index,
}

#[derive(Debug, Clone)]
pub struct AppendResponse {
    pub term: Term,
    pub succeeded: bool,
    /// On failure, the replica's last log index: a hint for the leader's
    /// next-index walk-back.
    pub log_index: Index,
}

/// Relaxed replication for passive members: no prior-entry consistency
/// check, entries land by their own indexes.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub term: Term,
    pub leader: MemberId,
    pub entries: Vec<Entry>,
    pub commit_index: Index,
    pub global_index: Index,
}

#[derive(Debug, Clone)]
pub struct SyncResponse {
    pub term: Term,
    pub succeeded: bool,
    pub log_index: Index,
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// The client's connection id, recorded in the Register entry so the
    /// session can be bound back to a live connection.
    pub connection: u64,
    /// Session timeout the client would like, in milliseconds. The cluster
    /// enforces its own configured timeout; this is advisory.
    pub timeout_millis: u64,
}

#[derive(Debug, Clone)]
pub struct RegisterResponse {
    pub session: SessionId,
    pub leader: Option<MemberId>,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone)]
pub struct KeepAliveRequest {
    pub session: SessionId,
    /// Highest command sequence whose response the client has received;
    /// responses at or below it may be dropped.
    pub command_sequence: u64,
    /// Highest event sequence the client has observed in order.
    pub event_sequence: u64,
}

#[derive(Debug, Clone)]
pub struct KeepAliveResponse {
    pub leader: Option<MemberId>,
    pub members: Vec<Member>,
}

/// Membership change request: join, leave, promote, or demote `member`,
/// depending on the enclosing [`Request`] variant.
#[derive(Debug, Clone)]
pub struct ConfigureRequest {
    pub member: Member,
}

#[derive(Debug, Clone)]
pub struct ConfigureResponse {
    /// Index of the configuration entry that applied the change.
    pub version: Index,
    pub active: Vec<Member>,
    pub passive: Vec<Member>,
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub session: SessionId,
    pub sequence: u64,
    pub operation: Bytes,
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub index: Index,
    pub result: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Read at the commit point, released only after the leader confirms it
    /// still holds a quorum.
    Linearizable,
    /// Read from local applied state; what passive members may serve.
    Sequential,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub session: SessionId,
    /// The client's current command sequence; the query waits until that
    /// command has applied, preserving read-your-writes.
    pub sequence: u64,
    pub operation: Bytes,
    pub consistency: Consistency,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub index: Index,
    pub result: Bytes,
}

/// Server-to-client event delivery.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub session: SessionId,
    pub event_sequence: u64,
    pub message: Bytes,
}

#[derive(Debug, Clone)]
pub struct PublishResponse {
    /// False when the client detected a sequence gap and needs a resend.
    pub succeeded: bool,
    /// Highest event sequence the client has received in order.
    pub event_sequence: u64,
}

macro_rules! expect_response {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(self) -> Result<$ty, Error> {
            match self {
                Response::$variant(inner) => Ok(inner),
                other => Err(Error::Internal(format!(
                    concat!("expected ", stringify!($variant), " response, got {:?}"),
                    std::mem::discriminant(&other)
                ))),
            }
        }
    };
}

impl Response {
    expect_response!(into_vote, Vote, VoteResponse);
    expect_response!(into_poll, Poll, PollResponse);
    expect_response!(into_append, Append, AppendResponse);
    expect_response!(into_sync, Sync, SyncResponse);
    expect_response!(into_register, Register, RegisterResponse);
    expect_response!(into_keep_alive, KeepAlive, KeepAliveResponse);
    expect_response!(into_command, Command, CommandResponse);
    expect_response!(into_query, Query, QueryResponse);
    expect_response!(into_publish, Publish, PublishResponse);

    /// Extracts any of the four membership responses.
    pub fn into_configure(self) -> Result<ConfigureResponse, Error> {
        match self {
            Response::Join(inner)
            | Response::Leave(inner)
            | Response::Promote(inner)
            | Response::Demote(inner) => Ok(inner),
            other => Err(Error::Internal(format!(
                "expected configure response, got {:?}",
                std::mem::discriminant(&other)
            ))),
        }
    }
}
