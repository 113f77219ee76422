//! Wire protocol: RPC types, error taxonomy, and the transport interface.
//!
//! The consensus core is transport-agnostic. Servers and clients speak
//! through the narrow [`Transport`]/[`Connection`] traits; any
//! connection-oriented request/response transport can implement them. The
//! in-process [`LocalNetwork`] implementation backs multi-node tests and
//! supports partition injection.

mod error;
mod local;
mod message;
mod transport;

pub use error::{Error, Result};
pub use local::{LocalNetwork, LocalTransport};
pub use message::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, ConfigureRequest,
    ConfigureResponse, Consistency, KeepAliveRequest, KeepAliveResponse, PollRequest,
    PollResponse, PublishRequest, PublishResponse, QueryRequest, QueryResponse, RegisterRequest,
    RegisterResponse, Request, Response, SyncRequest, SyncResponse, VoteRequest, VoteResponse,
};
pub use transport::{Connection, ConnectionId, Duplex, Inbound, ReplySender, Transport};
